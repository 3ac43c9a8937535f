// src/main.rs

//! Process entry point: parses the small
//! set of CLI flags, loads and validates the TOML config, wires up
//! `tracing-subscriber` with a reloadable `EnvFilter`, and runs the
//! coordinator to completion.

use anyhow::Result;
use hypercache::config::Config;
use hypercache::server;
use std::env;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = run_app().await {
        error!(error = %e, "fatal startup failure");
        eprintln!("hypercache: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--version") {
        println!("hypercache {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let node_id_override = args
        .iter()
        .position(|a| a == "--node-id")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let port_override = args
        .iter()
        .position(|a| a == "--port")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.parse::<u16>())
        .transpose()
        .map_err(|_| anyhow::anyhow!("--port requires a valid u16"))?;

    if let Some(i) = args.iter().position(|a| a == "--protocol") {
        match args.get(i + 1).map(String::as_str) {
            Some("resp2") => {}
            other => {
                anyhow::bail!("--protocol only supports 'resp2', got {:?}", other);
            }
        }
    }

    let config = Config::from_file(&config_path)
        .map_err(|e| anyhow::anyhow!("failed to load configuration from {config_path:?}: {e}"))?
        .with_node_id_override(node_id_override)
        .with_port_override(port_override);

    let initial_log_level =
        env::var("RUST_LOG").unwrap_or_else(|_| config.node.log_level.clone());
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    server::run(config).await
}
