mod alert;
mod api;
mod auth;
mod capacity;
mod config;
mod db;
mod error;
mod panel;
mod plans;
mod stripe;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::alert::SlackAlerter;
use crate::api::{create_router, AppState};
use crate::auth::{AuthService, JwtService};
use crate::capacity::{CapacityCache, CapacityRefresher};
use crate::config::{load_config, Config, DEFAULT_CONFIG_PATH};
use crate::db::Store;
use crate::panel::{PanelClient, Provisioner};
use crate::plans::PlanCatalog;

/// Hosting orchestrator: storefront API, panel provisioning, and node
/// telemetry for a Minecraft hosting fleet.
#[derive(Parser)]
#[command(name = "crafthost-orchestrator", version, about)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// A bare invocation runs the daemon.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator daemon.
    Run {
        /// Override the configured listen host.
        #[arg(long)]
        host: Option<String>,

        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate the configuration and plan catalog, then exit.
    CheckConfig,

    /// Rebuild the capacity snapshot from the panel once.
    RefreshCapacity,

    /// Purge stale telemetry and long-expired refresh tokens.
    Purge,

    /// Manage telemetry nodes.
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },

    /// Manage regional proxies.
    Proxy {
        #[command(subcommand)]
        command: ProxyCommand,
    },

    /// Print store counters.
    Status,
}

#[derive(Subcommand)]
enum NodeCommand {
    /// Register a node and print its telemetry token.
    Create {
        name: String,
        region: String,
        #[arg(long)]
        ip_address: Option<String>,
    },
    List,
}

#[derive(Subcommand)]
enum ProxyCommand {
    /// Register a regional proxy and print its API token.
    Create {
        name: String,
        region: String,
        endpoint: String,
    },
    List,
}

/// Telemetry rows older than this are purged.
const TELEMETRY_RETENTION_HOURS: i64 = 24;

/// Expired refresh tokens are kept this long for audit before deletion.
const TOKEN_RETENTION_DAYS: i64 = 90;

/// How often the daemon runs the purge pass.
const PURGE_INTERVAL_SECS: u64 = 3600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = cli.config;
    let config = load_config(config_path.as_deref()).context("Failed to load configuration")?;

    let command = cli.command.unwrap_or(Command::Run {
        host: None,
        port: None,
    });

    match command {
        Command::Run { host, port } => run(config, host, port).await,
        Command::CheckConfig => check_config(config_path.as_deref(), config),
        Command::RefreshCapacity => refresh_capacity(config).await,
        Command::Purge => {
            let store = open_store(&config).await?;
            run_purge(&store).await
        }
        Command::Node { command } => {
            let store = open_store(&config).await?;
            node_command(&store, command).await
        }
        Command::Proxy { command } => {
            let store = open_store(&config).await?;
            proxy_command(&store, command).await
        }
        Command::Status => {
            let store = open_store(&config).await?;
            let metrics = store.metrics().await?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);

            let cache = CapacityCache::new(&config.capacity.snapshot_path);
            if cache.load_from_disk().await? {
                if let Some(snapshot) = cache.snapshot().await {
                    println!(
                        "Capacity snapshot from {} ({} locations)",
                        snapshot.generated_at,
                        snapshot.locations.len()
                    );
                }
            } else {
                println!("No capacity snapshot yet");
            }
            Ok(())
        }
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Store> {
    Store::new(&config.database.path)
        .await
        .context("Failed to open database")
}

async fn run(config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = config;
    if let Some(host) = host {
        config.api.listen_host = host;
    }
    if let Some(port) = port {
        config.api.listen_port = port;
    }

    let addr = config.api.socket_addr()?;
    let catalog = Arc::new(
        PlanCatalog::from_file(&config.plans.path).context("Failed to load plan catalog")?,
    );

    let store = open_store(&config).await?;
    let jwt = JwtService::new(
        &config.auth.jwt_secret,
        config.auth.access_ttl_minutes,
        config.auth.refresh_ttl_minutes,
    )
    .context("Failed to initialise JWT signing")?;
    let auth = AuthService::new(store.clone(), jwt);

    let panel = PanelClient::new(&config.panel)?;
    let alerter = SlackAlerter::new(config.slack.webhook_url.clone());
    let provisioner = Provisioner::new(
        store.clone(),
        panel.clone(),
        catalog.clone(),
        alerter,
        config.panel.curse_api_key.clone(),
    );

    let cache = CapacityCache::new(&config.capacity.snapshot_path);
    if let Err(e) = cache.load_from_disk().await {
        warn!(error = %e, "Could not load capacity snapshot, starting empty");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let refresher = CapacityRefresher::new(
        panel.clone(),
        cache.clone(),
        config.capacity.refresh_interval_secs,
        shutdown_rx.clone(),
    );
    let refresher_handle = tokio::spawn(refresher.run());

    let purge_handle = tokio::spawn(purge_loop(store.clone(), shutdown_rx));

    let state = AppState {
        config: Arc::new(config),
        store,
        auth,
        catalog,
        capacity: cache,
        panel,
        provisioner,
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "Orchestrator listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = refresher_handle.await;
    let _ = purge_handle.await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

async fn purge_loop(store: Store, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(PURGE_INTERVAL_SECS));
    // The first tick fires immediately; skip it so startup stays quick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_purge(&store).await {
                    error!(error = %e, "Purge pass failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_purge(store: &Store) -> anyhow::Result<()> {
    let now = Utc::now();

    let (node_rows, server_rows) = store
        .purge_stale_telemetry(now - Duration::hours(TELEMETRY_RETENTION_HOURS))
        .await?;
    let tokens = store
        .purge_expired_auth_tokens(now - Duration::days(TOKEN_RETENTION_DAYS))
        .await?;

    info!(
        node_samples = node_rows,
        server_samples = server_rows,
        tokens,
        "Purge pass complete"
    );
    Ok(())
}

fn check_config(config_path: Option<&std::path::Path>, config: Config) -> anyhow::Result<()> {
    config.validate()?;

    match PlanCatalog::from_file(&config.plans.path) {
        Ok(catalog) => {
            println!(
                "Configuration OK ({} plans, {} locations)",
                catalog.plans.len(),
                catalog.locations.len()
            );
        }
        Err(e) => {
            let path = config_path.unwrap_or(std::path::Path::new(DEFAULT_CONFIG_PATH));
            anyhow::bail!(
                "Config at {} is valid but plan catalog failed: {e}",
                path.display()
            );
        }
    }

    Ok(())
}

async fn refresh_capacity(config: Config) -> anyhow::Result<()> {
    let panel = PanelClient::new(&config.panel)?;
    let cache = CapacityCache::new(&config.capacity.snapshot_path);

    let snapshot = capacity::refresh_once(&panel, &cache).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn node_command(store: &Store, command: NodeCommand) -> anyhow::Result<()> {
    match command {
        NodeCommand::Create {
            name,
            region,
            ip_address,
        } => {
            let (token, node) = store
                .create_node(&name, &region, ip_address.as_deref())
                .await?;
            println!("Node ID:    {}", node.id);
            println!("Region:     {}", node.region);
            // The raw token is printed once and never recoverable.
            println!("Token:      {token}");
        }
        NodeCommand::List => {
            for node in store.list_nodes().await? {
                println!(
                    "{}  {}  {}  last_active={}",
                    node.id,
                    node.name,
                    node.region,
                    node.last_active_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
        }
    }
    Ok(())
}

async fn proxy_command(store: &Store, command: ProxyCommand) -> anyhow::Result<()> {
    match command {
        ProxyCommand::Create {
            name,
            region,
            endpoint,
        } => {
            let (token, proxy) = store.create_proxy(&name, &region, &endpoint).await?;
            println!("Proxy ID:   {}", proxy.id);
            println!("Region:     {}", proxy.region);
            println!("Token:      {token}");
        }
        ProxyCommand::List => {
            for proxy in store.list_proxies().await? {
                println!("{}  {}  {}  {}", proxy.id, proxy.name, proxy.region, proxy.endpoint);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_invocation_runs_daemon() {
        let cli = Cli::try_parse_from(["crafthost-orchestrator"]).unwrap();
        assert!(cli.command.is_none());

        let cli =
            Cli::try_parse_from(["crafthost-orchestrator", "run", "--port", "9000"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Run { port: Some(9000), .. })
        ));
    }
}
