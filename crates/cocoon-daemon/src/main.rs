//! cocoond - cocoon platform daemon
//!
//! Loads the TOML configuration, assembles the [`Platform`], and serves
//! the control API on a Unix socket until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cocoon_core::config::PlatformConfig;
use cocoon_daemon::archive::FsObjectStore;
use cocoon_daemon::launcher::{Launcher, LogLauncher, TcpLauncher};
use cocoon_daemon::{Platform, SqliteStore, server};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// cocoond - cocoon platform daemon
#[derive(Parser, Debug)]
#[command(name = "cocoond")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the platform configuration file
    #[arg(short, long, default_value = "cocoond.toml")]
    config: PathBuf,

    /// Override the store database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Override the control socket path
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = if args.config.exists() {
        PlatformConfig::from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        PlatformConfig::default()
    };
    if let Some(db) = args.db {
        config.store.db_path = db;
    }
    if let Some(socket) = args.socket {
        config.api.socket_path = socket;
    }

    let store = SqliteStore::open(&config.store.db_path, &config.store)
        .with_context(|| format!("opening store at {}", config.store.db_path.display()))?;
    let archive = FsObjectStore::new(config.archive.dir.clone())
        .with_context(|| format!("preparing archive dir {}", config.archive.dir.display()))?;

    let launcher: Box<dyn Launcher> = if config.launcher.address.is_empty() {
        Box::new(LogLauncher)
    } else {
        Box::new(TcpLauncher::new(config.launcher.address.clone()))
    };

    let socket_path = config.api.socket_path.clone();
    let platform = Arc::new(Platform::new(store, Box::new(archive), launcher, config));

    let listener = server::bind(&socket_path)
        .with_context(|| format!("binding control socket {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "control API listening");

    tokio::select! {
        result = server::serve(listener, platform) => {
            result.context("control API accept loop failed")?;
        },
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        },
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}
