//! Relay Engine
//!
//! Owns the configuration, the outbound connector and the relay table, and
//! runs one tunnel pump at a time.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut engine = RelayEngine::new(EngineConfig::default())?;
//! engine.start(tunnel)?;
//!
//! println!("{}", engine.stats().format());
//!
//! // Closes every relay and the tunnel's write side
//! engine.stop().await?;
//! ```

use crate::config::{ConfigError, EngineConfig};
use crate::connector::{Connector, DirectConnector};
use crate::pump::TunnelPump;
use crate::relay::RelayContext;
use crate::stats::EngineStats;
use crate::table::RelayTable;
use crate::tunnel::TunnelWriter;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tunnel read failed: {0}")]
    TunnelRead(#[source] std::io::Error),

    #[error("Engine task failed: {0}")]
    Task(String),
}

/// A pump that has been started and not yet joined
struct Running {
    stop: watch::Sender<bool>,
    pump: JoinHandle<Result<(), EngineError>>,
}

/// Interception engine bound to one tunnel per run
pub struct RelayEngine {
    config: Arc<EngineConfig>,
    connector: Arc<dyn Connector>,
    stats: Arc<EngineStats>,
    table: RelayTable,
    running: Option<Running>,
}

impl RelayEngine {
    /// Create an engine that dials real destinations
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        Ok(Self {
            config: Arc::new(config),
            connector: Arc::new(DirectConnector),
            stats: Arc::new(EngineStats::new()),
            table: RelayTable::new(),
            running: None,
        })
    }

    /// Replace the outbound connector
    pub fn with_connector<C: Connector>(mut self, connector: C) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Live relays of the current run
    pub fn table(&self) -> &RelayTable {
        &self.table
    }

    /// Counters accumulated over every run of this engine
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Check if a pump is running
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.pump.is_finished())
    }

    /// Start relaying on a bidirectional tunnel handle
    pub fn start<T>(&mut self, tunnel: T) -> Result<(), EngineError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(tunnel);
        self.start_split(reader, writer)
    }

    /// Start relaying on separate read and write handles of one tunnel
    pub fn start_split<R, W>(&mut self, reader: R, writer: W) -> Result<(), EngineError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        if self.is_running() {
            return Err(EngineError::AlreadyRunning);
        }
        if let Some(previous) = self.running.take() {
            debug!("Discarding finished run");
            previous.pump.abort();
        }

        self.table.clear();
        let ctx = Arc::new(RelayContext {
            config: self.config.clone(),
            connector: self.connector.clone(),
            tunnel: TunnelWriter::new(writer, self.stats.clone()),
            table: self.table.clone(),
            stats: self.stats.clone(),
        });

        let (stop, stop_rx) = watch::channel(false);
        let pump = tokio::spawn(TunnelPump::new(reader, ctx, stop_rx).run());
        self.running = Some(Running { stop, pump });

        info!(
            "Relay engine started (intercepting ports {:?})",
            self.config.intercept_ports
        );
        Ok(())
    }

    /// Stop the pump and wait for every relay to be released.
    ///
    /// Returns the error that ended the run, if the tunnel failed first.
    /// Stopping an engine that is not running is a no-op.
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        info!("Stopping relay engine");
        running.stop.send_replace(true);
        Self::finish(running).await
    }

    /// Wait for the pump to end on its own (tunnel closed or failed)
    pub async fn join(&mut self) -> Result<(), EngineError> {
        match self.running.take() {
            Some(running) => Self::finish(running).await,
            None => Ok(()),
        }
    }

    async fn finish(running: Running) -> Result<(), EngineError> {
        let result = running
            .pump
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?;
        info!("Relay engine stopped");
        result
    }
}

impl Drop for RelayEngine {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.stop.send_replace(true);
        }
    }
}

impl std::fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine")
            .field("config", &self.config)
            .field("table", &self.table)
            .field("running", &self.is_running())
            .finish()
    }
}
