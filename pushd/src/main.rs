//! Push-notification dispatch daemon.
//!
//! Tells remote agents over a presence-based messaging channel when they
//! have work queued for them, pings them to track liveness, and reaps the
//! ones that stop answering.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use push_common::config::DispatcherConfig;
use pushd::identity::{DispatcherIdentity, DISPATCHER_RESOURCE, DISPATCHER_USERNAME};
use pushd::runner::Runner;
use pushd::store::ClientStore;

#[derive(Parser, Debug)]
#[command(name = "pushd", version = "0.1.0")]
#[command(about = "Push-notification dispatch daemon")]
struct Cli {
    /// Path to pushd.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Messaging server address (host:port), overrides the config file
    #[arg(long)]
    server: Option<String>,

    /// Path to the client/action store, overrides the config file
    #[arg(long)]
    database: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

/// Dispatcher hostname recorded in the registration row: the configured
/// messaging host when one is set, the local hostname otherwise.
fn registration_hostname(config: &DispatcherConfig) -> String {
    let host = config.server.split(':').next().unwrap_or("");
    if !host.is_empty() {
        return host.to_string();
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let mut config = DispatcherConfig::load(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(database) = cli.database {
        config.database = database;
    }
    if config.notify_threshold.is_none() {
        warn!("no notify_threshold configured; notification fan-out is unlimited");
    }

    let mut store = ClientStore::open(&config.database)
        .with_context(|| format!("open client store {}", config.database.display()))?;
    let identity = DispatcherIdentity::resolve(&mut store, DISPATCHER_USERNAME, DISPATCHER_RESOURCE)
        .context("resolve dispatcher identity")?;

    let hostname = registration_hostname(&config);
    info!(server = %config.server, database = %config.database.display(), "pushd starting");

    let mut runner = Runner::new(store, config, identity, hostname);
    tokio::select! {
        result = runner.run() => result,
        _ = signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    }
}
