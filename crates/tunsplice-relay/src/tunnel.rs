//! Tunnel write path
//!
//! Relays inject packets concurrently. Each packet is written with one
//! `write_all` while holding the writer lock, so no packet is ever split
//! by another relay's bytes.

use crate::stats::EngineStats;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared handle to the write side of the tunnel device
#[derive(Clone)]
pub struct TunnelWriter {
    inner: Arc<Mutex<Option<BoxedWriter>>>,
    stats: Arc<EngineStats>,
}

impl TunnelWriter {
    pub fn new<W>(writer: W, stats: Arc<EngineStats>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(writer)))),
            stats,
        }
    }

    /// Write one complete packet
    pub async fn write_packet(&self, packet: &[u8]) -> Result<(), TunnelError> {
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(TunnelError::Closed)?;

        let result = async {
            writer.write_all(packet).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                self.stats.record_injected();
                Ok(())
            }
            Err(e) => {
                self.stats.record_tunnel_write_error();
                Err(TunnelError::Io(e))
            }
        }
    }

    /// Close the write side. Later writes fail with [`TunnelError::Closed`].
    pub async fn shutdown(&self) {
        let writer = self.inner.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("Tunnel writer shutdown: {}", e);
            }
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

/// Tunnel write errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Tunnel closed")]
    Closed,

    #[error("Tunnel write failed: {0}")]
    Io(#[from] std::io::Error),
}
