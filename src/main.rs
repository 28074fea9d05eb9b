//! Tessera server entry point
//!
//! Usage: `tessera-server [CONFIG]`. The config path may also come from
//! `TESSERA_CONFIG`; without either, defaults and environment overrides
//! apply.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use log::info;
use tessera::compositor::HeadlessCompositor;
use tessera::config::{ServerConfig, CONFIG_ENV};
use tessera::server::Server;

fn main() -> anyhow::Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from);

    // The config decides the default log filter, so it is read first.
    let config = ServerConfig::load(path.as_deref());
    let filter = config
        .as_ref()
        .ok()
        .and_then(|c| c.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let config = config.context("Failed to load configuration")?;
    info!("Starting tessera server");

    let mut server = Server::start(config, Arc::new(HeadlessCompositor::new()))
        .context("Failed to start server")?;
    server
        .watch_signals()
        .context("Failed to install signal handlers")?;
    server.run().context("Server stopped with an error")?;

    Ok(())
}
