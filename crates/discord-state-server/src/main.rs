use std::env;
use std::sync::Arc;

use anyhow::Context;
use discord_state::{DiscordClient, Gateway, RestClient, StateManager};
use discord_state_server::config::loader::{DEFAULT_CONFIG_FILE, load_config};
use discord_state_server::{create_kv_client, observability};

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From DISCORD_STATE_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (discord-state.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (DISCORD_STATE_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(
            e,
            dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound
        ) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    // Initialize tracing early with the default level
    observability::init_tracing();

    let (config_path, source) = resolve_config_path();
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    tracing::info!(
        path = %config_path,
        source = %source,
        "Configuration loaded"
    );

    observability::apply_logging_level(&cfg.logging.level);
    observability::init_metrics(&cfg.metrics).map_err(anyhow::Error::msg)?;

    let kv = create_kv_client(&cfg.redis).await;
    let rest = RestClient::new(cfg.discord.rest_config())
        .context("failed to build Discord REST client")?;
    let (gateway, events, gateway_task) = Gateway::spawn(cfg.discord.gateway_config());

    let state = StateManager::with_ttl(
        kv,
        Arc::new(DiscordClient::new(rest, gateway.clone())),
        cfg.cache.ttl_policy(),
    );
    let listener_task = state.invalidation_listener().spawn(events);

    tracing::info!(
        backend = state.kv().mode(),
        intents = cfg.discord.intents,
        "discord-state cache running"
    );

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = gateway.closed() => {
            tracing::error!("gateway client stopped unexpectedly");
        }
    }

    // Stopping the gateway closes the event channel, which ends the listener.
    gateway.shutdown();
    gateway_task.await.context("gateway task panicked")?;
    listener_task.await.context("listener task panicked")?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

fn resolve_config_path() -> (String, ConfigSource) {
    // 1. Check CLI: --config <path>
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return (path, ConfigSource::CliArgument);
            }
        }
    }

    // 2. Check environment variable
    if let Ok(path) = env::var("DISCORD_STATE_CONFIG") {
        if !path.is_empty() {
            return (path, ConfigSource::EnvironmentVariable);
        }
    }

    // 3. Default to discord-state.toml
    (DEFAULT_CONFIG_FILE.to_string(), ConfigSource::Default)
}
