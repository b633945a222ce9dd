//! linevault server binary

use clap::Parser;
use linevault::{KeyValueServer, MemoryStore, ServerConfig, WriteAheadLog};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Config file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Journal mutations to this file and replay it on startup
    #[arg(long)]
    wal: Option<PathBuf>,

    /// Responses buffered per client before new ones are dropped
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Command-line flags override the config file, which overrides defaults
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(wal) = self.wal {
            config.wal_path = Some(wal);
        }
        if let Some(capacity) = self.queue_capacity {
            config.outbound_queue_capacity = capacity;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if self.verbose {
            config.log_level = "debug".to_string();
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(format!("linevault={}", config.log_level))
        .init();

    let store = match &config.wal_path {
        Some(path) => {
            info!("Restoring state from WAL: {}", path.display());
            let store = MemoryStore::open(WriteAheadLog::open(path)?)?;
            info!("Restored {} keys from WAL", store.len());
            store
        }
        None => MemoryStore::new(),
    };

    let port = config.port;
    let mut server = KeyValueServer::new(store, config);
    if let Err(e) = server.start(port).await {
        error!("linevault server could not be started: {}", e);
        return Err(e.into());
    }

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    server.stop();
    server.wait().await;

    info!(
        active = server.active_count(),
        dropped = server.dropped_count(),
        "Server stopped"
    );
    Ok(())
}
