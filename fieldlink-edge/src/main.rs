//! Fieldlink edge translator binary.
//!
//! Blocks until a valid configuration is fetched, then runs the translator
//! until a termination signal or a reload request arrives. Reloads re-enter
//! the start routine in place without exiting the process.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use fieldlink_common::config::{LoggingConfig, MqttConfig};
use fieldlink_common::sparkplug::DEFAULT_NAMESPACE;
use fieldlink_edge::config::AgentConfig;
use fieldlink_edge::drivers::DriverRegistry;
use fieldlink_edge::supervisor::{self, ShutdownReason};
use fieldlink_edge::translator::{NodeIdentity, Translator};

/// Polls field devices and publishes them to the bus.
#[derive(Parser, Debug)]
#[command(name = "fieldlink-edge")]
#[command(about = "Polls field devices and publishes them to the bus")]
#[command(version)]
struct Args {
    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} is not set in the environment", key))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_config = LoggingConfig {
        level: args.log_level.unwrap_or_else(|| "info".to_string()),
        ..LoggingConfig::default()
    };
    fieldlink_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting fieldlink-edge {}", env!("CARGO_PKG_VERSION"));

    // Required environment surface. A missing value is a fatal startup
    // error, not a retryable one.
    let config_url = require_env("CONFIG_URL")?;
    let group = require_env("NODE_GROUP")?;
    let node = require_env("NODE_ID")?;
    let mqtt_url = require_env("MQTT_URL")?;
    let username = require_env("MQTT_USERNAME")?;
    let password = require_env("MQTT_PASSWORD")?;

    let namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
    let fetch_interval_secs: u64 = std::env::var("POLL_INTERVAL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    let mqtt = MqttConfig::from_url(&mqtt_url)
        .map_err(|e| anyhow::anyhow!("{}", e))?
        .with_credentials(username, password);
    let identity = NodeIdentity::new(namespace, group, node);

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    loop {
        let fetch_interval = Duration::from_secs(fetch_interval_secs);
        let raw = tokio::select! {
            raw = supervisor::poll(
                || supervisor::fetch_config(&config_url),
                AgentConfig::is_valid,
                fetch_interval,
            ) => raw,
            _ = sigterm.recv() => break,
            _ = tokio::signal::ctrl_c() => break,
        };
        let config = AgentConfig::from_value(&raw)
            .context("Configuration failed to parse after validation")?;

        let mut translator =
            Translator::new(identity.clone(), mqtt.clone(), DriverRegistry::default());
        translator
            .start(&config, None)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start translator: {}", e))?;

        let reason = tokio::select! {
            _ = sigterm.recv() => ShutdownReason::Signal,
            _ = tokio::signal::ctrl_c() => ShutdownReason::Signal,
            _ = translator.reload_requested() => ShutdownReason::ConfigReload,
        };
        translator.stop(reason).await;

        match reason {
            ShutdownReason::Signal => break,
            ShutdownReason::ConfigReload => info!("Restarting with fresh configuration"),
        }
    }

    info!("Edge translator exited");
    Ok(())
}
