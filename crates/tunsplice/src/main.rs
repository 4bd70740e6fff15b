//! tunsplice: TUN traffic interception daemon
//!
//! Attaches the relay engine to an already-open tunnel descriptor handed
//! over by the parent process and runs until interrupted or the tunnel
//! closes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use tunsplice_relay::{EngineConfig, RelayEngine};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Relay TCP flows read from a tunnel device over ordinary sockets
#[derive(Parser)]
#[command(name = "tunsplice")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Inherited tunnel file descriptor
    #[arg(long)]
    fd: Option<i32>,

    /// Intercepted destination port (repeatable, overrides the config)
    #[arg(short, long = "port")]
    ports: Vec<u16>,

    /// Seconds between statistics lines (0 disables)
    #[arg(long, default_value = "60")]
    stats_interval: u64,

    /// Print the final statistics as JSON on exit
    #[arg(long)]
    stats_json: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if !cli.ports.is_empty() {
        config.intercept_ports = cli.ports.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Split an inherited descriptor into independent read and write handles
#[cfg(unix)]
fn open_tunnel(fd: i32) -> Result<(tokio::fs::File, tokio::fs::File)> {
    use std::os::fd::{FromRawFd, OwnedFd};

    if fd < 0 {
        bail!("Invalid tunnel descriptor {}", fd);
    }

    // SAFETY: the descriptor is handed over by the parent process and owned
    // by this process from here on.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    let reader = std::fs::File::from(owned);
    let writer = reader
        .try_clone()
        .context("Failed to duplicate tunnel descriptor")?;

    Ok((
        tokio::fs::File::from_std(reader),
        tokio::fs::File::from_std(writer),
    ))
}

#[cfg(not(unix))]
fn open_tunnel(_fd: i32) -> Result<(tokio::fs::File, tokio::fs::File)> {
    bail!("Inherited tunnel descriptors are only supported on Unix")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if cli.print_config {
        print!("{}", config.to_toml());
        return Ok(());
    }

    init_logging(cli.verbose);
    info!("tunsplice starting");

    let Some(fd) = cli.fd else {
        bail!("No tunnel descriptor given (use --fd)");
    };
    let (reader, writer) = open_tunnel(fd)?;

    let mut engine = RelayEngine::new(config)?;
    engine.start_split(reader, writer)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut seconds = 0u64;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                if !engine.is_running() {
                    warn!("Tunnel pump ended");
                    break;
                }
                seconds += 1;
                if cli.stats_interval > 0 && seconds % cli.stats_interval == 0 {
                    info!("{} (active relays: {})", engine.stats().format(), engine.table().len());
                }
            }
        }
    }

    let result = engine.stop().await;
    let snapshot = engine.stats().snapshot();
    info!("Final {}", snapshot.format());
    if cli.stats_json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    result.context("Relay engine failed")?;
    info!("tunsplice stopped");
    Ok(())
}
