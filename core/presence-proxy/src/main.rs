//! presence-proxy entrypoint.
//!
//! Takes over the rich presence socket, serves until a termination signal,
//! then puts the real service's socket back.

use std::env;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use presence_proxy::{shutdown_channel, ProxyConfig, ProxyState};

fn main() {
    init_logging();

    let config = match ProxyConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load proxy config");
            std::process::exit(1);
        }
    };

    // Signals are routed before the takeover so one arriving mid-setup still
    // ends in a restore.
    let (shutdown, wake) = match shutdown_channel() {
        Ok(channel) => channel,
        Err(err) => {
            error!(error = %err, "Failed to create shutdown channel");
            std::process::exit(1);
        }
    };
    if let Err(err) = shutdown.register_signals() {
        error!(error = %err, "Failed to install signal handlers");
        std::process::exit(1);
    }

    let mut proxy = match ProxyState::start(&config, wake) {
        Ok(proxy) => proxy,
        Err(err) => {
            error!(error = %err, "Failed to start presence proxy");
            std::process::exit(1);
        }
    };

    info!(
        path = %proxy.paths().canonical.display(),
        upstream_active = proxy.upstream_active(),
        "Presence proxy started"
    );

    if let Err(err) = proxy.run() {
        error!(error = %err, "Presence proxy event loop failed");
        std::process::exit(1);
    }

    for entry in proxy.presence().snapshot() {
        tracing::debug!(
            pid = entry.pid,
            state = ?entry.state,
            details = ?entry.details,
            recorded_at = %entry.recorded_at.to_rfc3339(),
            "Final presence"
        );
    }
    info!("Presence proxy stopped");
}

fn init_logging() {
    let debug_enabled = env::var("PRESENCE_PROXY_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
