// Copyright (c) 2026 Strata Contributors. MIT License.
// See LICENSE for details.

//! # Strata Vault Node
//!
//! Entry point for the `strata-node` binary. Parses CLI arguments, sets up
//! logging and metrics, loads the vault registry from disk, and serves the
//! HTTP/WS API.
//!
//! - `run`     : start the node
//! - `init`    : create the data directory and an admin keypair
//! - `status`  : query a running node's `/status`
//! - `version` : print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use strata_contracts::VaultRegistry;
use strata_protocol::config::VaultParams;
use strata_protocol::crypto::{Keypair, Pubkey};
use strata_protocol::epoch::{Clock, Phase, SystemClock};
use strata_protocol::exchange::SimulatedExchange;
use strata_protocol::storage::VaultDB;

use cli::{Commands, MarketListing, StrataNodeCli};
use logging::LogFormat;
use metrics::NodeMetrics;

const ADMIN_KEY_FILE: &str = "admin.key";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = StrataNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Opens the registry and serves the API and metrics until shutdown.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        logging::NODE_FILTER,
        LogFormat::from_str_lossy(&args.log_format),
    );

    tracing::info!(
        rpc_port = args.rpc_port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        network = %args.network,
        "starting strata-node"
    );

    match load_admin_key(&args.data_dir)? {
        Some(admin) => tracing::info!(admin = %admin.pubkey(), "admin key loaded"),
        None => tracing::warn!("no admin key in data directory; run `strata-node init` first"),
    }

    // --- Persistent storage ---
    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = VaultDB::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    // --- Registry & venue ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(
        VaultRegistry::open(
            db.clone(),
            SimulatedExchange::new(),
            clock,
            VaultParams::default(),
        )
        .context("failed to load vault registry")?,
    );
    list_markets(&registry, &args.markets)?;

    // --- Metrics & application state ---
    let node_metrics = Arc::new(NodeMetrics::new());
    let app_state = api::AppState::new(
        format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            strata_protocol::config::PROTOCOL_VERSION,
        ),
        args.network.clone(),
        Arc::clone(&registry),
        Arc::clone(&node_metrics),
    );

    // --- API server ---
    let api_router = api::create_router(app_state.clone());
    let api_addr = format!("0.0.0.0:{}", args.rpc_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind RPC listener on {}", api_addr))?;
    tracing::info!("RPC/API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Registry sweep ---
    let sweep_state = app_state.clone();
    let period = Duration::from_secs(args.sweep_interval_secs.max(1));
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            sweep(&sweep_state);
        }
    });

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    sweeper.abort();
    db.flush().context("failed to flush database")?;
    tracing::info!("strata-node stopped");
    Ok(())
}

/// Refreshes gauges and flags vaults whose epoch has ended without a
/// rollover.
fn sweep(state: &api::AppState) {
    state.refresh_gauges();
    let now = state.registry.now();
    for summary in state.registry.list() {
        if summary.phase != Phase::Stale {
            continue;
        }
        let behind = state
            .registry
            .vault(&summary.name)
            .map(|v| v.rollovers_behind(now))
            .unwrap_or(0);
        tracing::info!(
            vault = %summary.name,
            end_epoch = summary.epoch.end_epoch,
            rollovers_behind = behind,
            "vault awaiting rollover"
        );
    }
}

/// Creates the data directory and writes a fresh admin key into it.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("strata_node=info", LogFormat::Pretty);

    let (admin, key_path) = write_admin_key(&args.data_dir, args.force)?;
    tracing::info!(admin = %admin, key_path = %key_path.display(), "admin keypair generated");

    println!("Node initialized successfully.");
    println!("  Data directory : {}", args.data_dir.display());
    println!("  Admin key      : {}", key_path.display());
    println!("  Admin pubkey   : {}", admin);
    Ok(())
}

/// Generates an admin keypair and stores its secret, hex encoded, under
/// `data_dir`. Refuses to replace an existing key unless `force`.
fn write_admin_key(data_dir: &Path, force: bool) -> Result<(Pubkey, PathBuf)> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let key_path = data_dir.join(ADMIN_KEY_FILE);
    if key_path.exists() && !force {
        bail!(
            "{} already exists; pass --force to replace it",
            key_path.display()
        );
    }

    let keypair = Keypair::generate();
    std::fs::write(&key_path, keypair.secret_key_hex())
        .with_context(|| format!("failed to write admin key to {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok((keypair.pubkey(), key_path))
}

/// Reads the admin key written by `init`, if there is one.
fn load_admin_key(data_dir: &Path) -> Result<Option<Keypair>> {
    let key_path = data_dir.join(ADMIN_KEY_FILE);
    if !key_path.exists() {
        return Ok(None);
    }
    let hex = std::fs::read_to_string(&key_path)
        .with_context(|| format!("failed to read {}", key_path.display()))?;
    let keypair = Keypair::from_hex(hex.trim())
        .with_context(|| format!("malformed admin key in {}", key_path.display()))?;
    Ok(Some(keypair))
}

/// Fetches `/status` from a running node and prints the body.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let body = http_get(&args.rpc_url, "/status").await?;
    println!("{}", body);
    Ok(())
}

/// Splits `http://host:port/prefix` into `(host, port, prefix)`.
fn split_endpoint(url: &str) -> Result<(String, u16, String)> {
    if url.starts_with("https://") {
        bail!("https endpoints are not supported: {url}");
    }
    let rest = url.strip_prefix("http://").unwrap_or(url);
    let (authority, prefix) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].trim_end_matches('/')),
        None => (rest, ""),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>()
                .with_context(|| format!("bad port in {url}"))?,
        ),
        None => (authority, 80),
    };
    if host.is_empty() {
        bail!("missing host in {url}");
    }
    Ok((host.to_string(), port, prefix.to_string()))
}

/// A plain HTTP/1.1 GET over a tokio TCP stream. Returns the body.
async fn http_get(base_url: &str, path: &str) -> Result<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (host, port, prefix) = split_endpoint(base_url)?;
    let addr = format!("{host}:{port}");
    let mut stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;

    let request =
        format!("GET {prefix}{path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);

    let (head, body) = response
        .split_once("\r\n\r\n")
        .context("malformed HTTP response")?;
    let status_line = head.lines().next().unwrap_or_default();
    if !status_line.contains(" 200 ") {
        bail!("{addr} answered {status_line}");
    }
    Ok(body.to_string())
}

fn print_version() {
    println!("strata-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol    {}", strata_protocol::config::PROTOCOL_VERSION);
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Lists each market the venue does not already carry. Listings restored
/// from disk are kept as they are.
fn list_markets(registry: &api::NodeRegistry, listings: &[MarketListing]) -> Result<()> {
    for listing in listings {
        let (key, fresh) = registry
            .with_venue(|venue| {
                Ok(
                    match venue.find_market(listing.kind, listing.strike, listing.expiry) {
                        Some(key) => (key, false),
                        None => (
                            venue.list_market(listing.kind, listing.strike, listing.expiry),
                            true,
                        ),
                    },
                )
            })
            .context("failed to list market")?;
        tracing::info!(
            market = %key,
            kind = ?listing.kind,
            strike = listing.strike,
            expiry = listing.expiry,
            fresh,
            "market listed"
        );
    }
    Ok(())
}
