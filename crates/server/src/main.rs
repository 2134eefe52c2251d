use anyhow::Context;
use clap::Parser;
use server::{Config, Server};
use std::path::PathBuf;
use std::sync::Arc;
use storage::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "redrock", about = "Redis-compatible server on RocksDB")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Open the storage read-only
    #[arg(long)]
    read_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => Config::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let storage = Arc::new(Storage::new(config.storage.clone()));
    if args.read_only {
        storage.open_for_read_only()?;
    } else {
        storage.open()?;
    }

    let srv = Server::new(config, storage.clone());
    tokio::select! {
        result = srv.clone().serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("[server] received interrupt, shutting down");
        }
    }
    storage.close();
    Ok(())
}
