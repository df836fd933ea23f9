//! CLI entry point for the listupdate tool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use listupdate_core::protocol::format_list;
use listupdate_core::{HttpTransport, MemoryStore, ProtocolManager, StorageDelegate};
use tracing::{debug, info};

mod app_config;
mod cli;

use app_config::FileConfig;
use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let file = FileConfig::load(&args.config)?;
    let protocol = file
        .protocol_config()
        .context("Invalid protocol settings in config file")?;
    let transport = HttpTransport::with_timeouts(file.timeouts.connect_secs, file.timeouts.read_secs)
        .context("Failed to build HTTP client")?;
    let store = Arc::new(MemoryStore::new(file.lists.clone()));

    info!(
        prefix = protocol.url_prefix(),
        lists = file.lists.len(),
        "listupdate starting"
    );

    let manager = ProtocolManager::spawn(
        protocol,
        store.clone(),
        Arc::new(transport),
        file.manager_options(),
    );
    if let Some(query) = args.additional_query.or(file.additional_query) {
        manager.set_additional_query(query);
    }

    if args.once {
        run_once(manager, &store).await
    } else {
        run_until_interrupted(manager).await
    }
}

async fn run_once(manager: ProtocolManager, store: &MemoryStore) -> Result<()> {
    let mut summary = store.subscribe();
    manager.force_update(Duration::ZERO);
    let success = summary
        .wait_for(|s| s.completed > 0)
        .await
        .map(|s| s.last_success == Some(true))
        .context("Update manager stopped unexpectedly")?;
    manager.shutdown().await;

    if !success {
        bail!("Update failed; see log output for details");
    }
    for coverage in store.get_chunks().await? {
        print!("{}", format_list(&coverage));
    }
    Ok(())
}

async fn run_until_interrupted(manager: ProtocolManager) -> Result<()> {
    manager.start();
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("interrupted, shutting down");
    manager.shutdown().await;
    Ok(())
}
