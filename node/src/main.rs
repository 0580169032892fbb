// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Mesh Relay Node
//!
//! Entry point for the `meshrelay-node` binary. Parses CLI arguments,
//! initializes logging and metrics, wires the routing engine to a TCP
//! transport, and serves the HTTP/WS API.
//!
//! The binary supports three subcommands:
//!
//! - `run`     — start the relay node
//! - `init`    — initialize data directory and generate a node identity key
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;

use meshrelay_protocol::config::RouterConfig;
use meshrelay_protocol::crypto::{sha256_array, NodeKeypair};
use meshrelay_protocol::endpoint::Endpoint;
use meshrelay_protocol::identity::NodeId;
use meshrelay_protocol::notify::NotifyService;
use meshrelay_protocol::reqresp::ReqRespService;
use meshrelay_protocol::router::Router;

use cli::{Commands, MeshRelayCli};
use logging::LogFormat;
use metrics::NodeMetrics;
use transport::TcpEndpoint;

/// Broadcast channel capacity for live delivered-message streaming.
/// 256 is large enough to absorb short bursts without dropping events for
/// connected WebSocket clients.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = MeshRelayCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run — Full relay node startup sequence
// ---------------------------------------------------------------------------

/// Starts the full relay node: API server, metrics endpoint, and the
/// GossipSub router.
///
/// Startup sequence:
/// 1.  Parse CLI args (already done)
/// 2.  Initialize logging
/// 3.  Resolve data directory, load or generate the node identity keypair
/// 4.  Load `RouterConfig` (defaults, overlaid by an optional TOML file)
/// 5.  Bind the TCP endpoint
/// 6.  Construct the `Router`, the request/response and notify services,
///     and start them all
/// 7.  Subscribe to startup topics
/// 8.  Dial configured peers
/// 9.  Start the metrics and API servers
/// 10. Await shutdown signal
/// 11. Graceful shutdown
async fn run_node(args: cli::RunArgs) -> Result<()> {
    // --- 1. Resolve paths ---
    let data_dir = cli::resolve_data_dir(&args.data_dir);

    if !cli::validate_log_level(&args.log_level) {
        anyhow::bail!("invalid --log-level: {}", args.log_level);
    }
    let log_filter = format!(
        "meshrelay_node={level},meshrelay_protocol={level},tower_http=debug",
        level = args.log_level
    );

    // --- 2. Initialize logging ---
    logging::init_logging(&log_filter, LogFormat::Pretty);

    tracing::info!(
        p2p_port = args.p2p_port,
        rpc_port = args.rpc_port,
        metrics_port = args.metrics_port,
        data_dir = %data_dir.display(),
        topics = ?args.topics,
        "starting meshrelay-node"
    );

    // --- 3. Load or generate the node identity keypair ---
    let keypair = if let Some(hex_key) = &args.node_key {
        let bytes = hex::decode(hex_key).context("invalid --node-key: not valid hex")?;
        NodeKeypair::from_ed25519_secret_bytes(&bytes)
            .map_err(|e| anyhow::anyhow!("invalid --node-key: {e}"))?
    } else {
        load_or_generate_keypair(&data_dir)?
    };

    let node_id = NodeId::from_bytes(sha256_array(&keypair.public_key_bytes()));
    tracing::info!(node_id = %node_id.to_hex(), "node identity resolved");

    // --- 4. Load RouterConfig ---
    let config = load_router_config(&args, &data_dir)?;

    // --- 5. Bind the TCP endpoint ---
    let listen_addr = format!("0.0.0.0:{}", args.p2p_port);
    let endpoint = TcpEndpoint::bind(
        node_id,
        listen_addr.parse().with_context(|| format!("invalid listen address {listen_addr}"))?,
    )
    .await
    .with_context(|| format!("failed to bind p2p listener on {listen_addr}"))?;
    tracing::info!(addr = %endpoint.local_addr(), "p2p listener bound");

    // --- 6. Construct the Router, request/response, and notify services ---
    let router = Router::new(endpoint.clone(), config, Some(keypair));
    router.start();

    let reqresp = ReqRespService::new(endpoint.clone());
    let node_id_hex = node_id.to_hex();
    reqresp.set_handler(Arc::new(move |peer, payload| {
        tracing::debug!(peer = %peer, bytes = payload.len(), "reqresp request received");
        format!("pong:{node_id_hex}").into_bytes()
    }));
    reqresp.start();

    let notify = NotifyService::new(endpoint.clone());
    notify.set_handler(Arc::new(|peer, payload| {
        tracing::debug!(peer = %peer, bytes = payload.len(), "notify frame received");
    }));
    notify.start();

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new());

    // --- Event broadcast ---
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    // --- 7. Subscribe to startup topics ---
    for topic in &args.topics {
        spawn_topic_drain(Arc::clone(&router), topic.clone(), event_tx.clone());
        tracing::info!(topic = %topic, "subscribed at startup");
    }

    // --- 8. Dial configured peers ---
    for peer_spec in &args.peers {
        match cli::parse_peer_spec(peer_spec) {
            Ok((peer_id, addr)) => {
                endpoint.add_known_peer(peer_id, addr);
                match endpoint.connect(&peer_id).await {
                    Ok(_) => tracing::info!(peer = %peer_id.to_hex(), %addr, "connected to known peer"),
                    Err(e) => tracing::warn!(peer = %peer_id.to_hex(), %addr, error = %e, "failed to connect to known peer"),
                }
            }
            Err(e) => tracing::warn!(spec = %peer_spec, error = %e, "invalid --peer spec, skipping"),
        }
    }

    // --- Application state ---
    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        router: Arc::clone(&router),
        event_tx,
        metrics: Arc::clone(&node_metrics),
    };

    // --- 9. Start the metrics and API servers ---
    let api_router = api::create_router(app_state);
    let rpc_addr = format!("0.0.0.0:{}", args.rpc_port);
    let api_listener = tokio::net::TcpListener::bind(&rpc_addr)
        .await
        .with_context(|| format!("failed to bind RPC listener on {rpc_addr}"))?;
    tracing::info!("RPC/API server listening on {}", rpc_addr);

    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    print_startup_banner(&node_id.to_hex(), &rpc_addr, &listen_addr, &data_dir.to_string_lossy());

    // --- 10. Await shutdown signal ---
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
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    // --- 11. Graceful shutdown ---
    router.stop();
    tracing::info!("meshrelay-node stopped");
    Ok(())
}

/// Spawns a task that subscribes to `topic` and forwards every delivered
/// message into the shared event broadcast channel for the lifetime of the
/// process.
fn spawn_topic_drain(router: Arc<Router>, topic: String, event_tx: broadcast::Sender<api::DeliveredMessage>) {
    let mut subscription = router.subscribe(&topic);
    tokio::spawn(async move {
        while let Some(message) = subscription.receiver.recv().await {
            let _ = event_tx.send(api::DeliveredMessage {
                topic: subscription.topic.clone(),
                from: message.from.to_hex(),
                seq: message.seq,
                data_len: message.data.len(),
            });
        }
    });
}

/// Loads `RouterConfig` defaults and overlays a TOML file if one is
/// configured, either explicitly via `--config` or found at
/// `{data_dir}/config.toml`.
fn load_router_config(args: &cli::RunArgs, data_dir: &std::path::Path) -> Result<RouterConfig> {
    let config_path = args.config.clone().unwrap_or_else(|| data_dir.join("config.toml"));

    if !config_path.exists() {
        tracing::debug!(path = %config_path.display(), "no config file found, using defaults");
        return Ok(RouterConfig::default());
    }

    let contents = std::fs::read_to_string(&config_path)
        .with_context(|| format!("failed to read config file {}", config_path.display()))?;
    let config: RouterConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", config_path.display()))?;
    tracing::info!(path = %config_path.display(), "loaded router config");
    Ok(config)
}

// ---------------------------------------------------------------------------
// init — Data directory initialization
// ---------------------------------------------------------------------------

/// Initializes a new node data directory and generates a node identity
/// keypair.
///
/// Creates the directory structure:
/// ```text
/// {data_dir}/
///     keys/       — node identity keypair
///     config.toml — default router configuration (commented reference)
/// ```
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("meshrelay_node=info", LogFormat::Pretty);

    let data_dir = cli::resolve_data_dir(&args.data_dir);
    tracing::info!(data_dir = %data_dir.display(), "initializing node");

    let keys_dir = data_dir.join("keys");
    let key_path = keys_dir.join("node.key");

    if key_path.exists() {
        anyhow::bail!(
            "data directory already initialized at {}. Remove {} to reinitialize.",
            data_dir.display(),
            key_path.display()
        );
    }

    std::fs::create_dir_all(&keys_dir)
        .with_context(|| format!("failed to create keys directory: {}", keys_dir.display()))?;

    let keypair = NodeKeypair::generate_ed25519();
    let node_id = NodeId::from_bytes(sha256_array(&keypair.public_key_bytes()));

    let secret_hex = hex::encode(keypair.secret_key_bytes());
    std::fs::write(&key_path, &secret_hex)
        .with_context(|| format!("failed to write node key to {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(
        node_id = %node_id.to_hex(),
        key_path = %key_path.display(),
        "node identity keypair generated"
    );

    println!();
    println!("Node initialized successfully.");
    println!();
    println!("  Data directory : {}", data_dir.display());
    println!("  Node identity  : {}", node_id.to_hex());
    println!("  Key file       : {}", key_path.display());
    println!();
    println!("Run `meshrelay-node run -d {}` to start the node.", data_dir.display());

    Ok(())
}

// ---------------------------------------------------------------------------
// version
// ---------------------------------------------------------------------------

/// Prints version information to stdout.
fn print_version() {
    println!("meshrelay-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc           {}", rustc_version());
    if let Some(commit) = option_env!("GIT_COMMIT") {
        println!("commit          {}", commit);
    }
    if let Some(ts) = option_env!("BUILD_TIMESTAMP") {
        println!("built           {}", ts);
    }
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

// ---------------------------------------------------------------------------
// Keypair persistence
// ---------------------------------------------------------------------------

/// Loads a node keypair from `{data_dir}/keys/node.key`, or generates and
/// saves a new one if the key file does not exist.
///
/// The key file is hex-encoded (64 hex characters = 32 bytes secret scalar).
/// File permissions are restricted to owner-only (0o600) on Unix.
fn load_or_generate_keypair(data_dir: &std::path::Path) -> Result<NodeKeypair> {
    let keys_dir = data_dir.join("keys");
    let key_path = keys_dir.join("node.key");

    if key_path.exists() {
        let hex_str = std::fs::read_to_string(&key_path)
            .with_context(|| format!("failed to read node key from {}", key_path.display()))?;
        let bytes = hex::decode(hex_str.trim()).context("node key file contains invalid hex")?;
        let keypair = NodeKeypair::from_ed25519_secret_bytes(&bytes)
            .map_err(|e| anyhow::anyhow!("invalid node key: {e}"))?;
        tracing::info!(key_path = %key_path.display(), "loaded node keypair from disk");
        Ok(keypair)
    } else {
        std::fs::create_dir_all(&keys_dir)
            .with_context(|| format!("failed to create keys directory: {}", keys_dir.display()))?;

        let keypair = NodeKeypair::generate_ed25519();
        let secret_hex = hex::encode(keypair.secret_key_bytes());
        std::fs::write(&key_path, &secret_hex)
            .with_context(|| format!("failed to write node key to {}", key_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(key_path = %key_path.display(), "generated and saved new node keypair");
        Ok(keypair)
    }
}

// ---------------------------------------------------------------------------
// Startup banner
// ---------------------------------------------------------------------------

/// Prints the node startup banner with configuration summary.
fn print_startup_banner(node_id: &str, rpc_addr: &str, p2p_addr: &str, data_dir: &str) {
    let node_id_short = if node_id.len() > 20 { format!("{}...", &node_id[..20]) } else { node_id.to_string() };

    let lines = [
        format!("  Node ID:    {}", node_id_short),
        format!("  RPC:        http://{}", rpc_addr),
        format!("  P2P:        {}", p2p_addr),
        format!("  Data:       {}", data_dir),
    ];

    let title = format!("  Mesh Relay Node v{}", env!("CARGO_PKG_VERSION"));

    let max_width = lines.iter().map(|l| l.len()).chain(std::iter::once(title.len())).max().unwrap_or(50) + 4;

    let border = "\u{2550}".repeat(max_width);

    println!();
    println!("\u{2554}{}\u{2557}", border);
    println!("\u{2551}  {:<width$}  \u{2551}", title.trim(), width = max_width - 4);
    println!("\u{2560}{}\u{2563}", border);
    for line in &lines {
        println!("\u{2551}  {:<width$}  \u{2551}", line.trim(), width = max_width - 4);
    }
    println!("\u{255A}{}\u{255D}", border);
    println!();
}

// ---------------------------------------------------------------------------
// Shutdown signal
// ---------------------------------------------------------------------------

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_save_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys_dir = dir.path().join("keys");
        std::fs::create_dir_all(&keys_dir).unwrap();

        let keypair = NodeKeypair::generate_ed25519();
        let key_path = keys_dir.join("node.key");
        let secret_hex = hex::encode(keypair.secret_key_bytes());
        std::fs::write(&key_path, &secret_hex).unwrap();

        let loaded_hex = std::fs::read_to_string(&key_path).unwrap();
        let loaded_bytes = hex::decode(loaded_hex.trim()).unwrap();
        let loaded = NodeKeypair::from_ed25519_secret_bytes(&loaded_bytes).unwrap();
        assert_eq!(keypair.public_key_bytes(), loaded.public_key_bytes());
    }

    #[test]
    fn load_or_generate_creates_new_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().join("meshrelay-keygen-test");
        std::fs::create_dir_all(&data_dir).unwrap();

        let keypair = load_or_generate_keypair(&data_dir).unwrap();

        let key_path = data_dir.join("keys").join("node.key");
        assert!(key_path.exists(), "node.key should have been created");

        let loaded = load_or_generate_keypair(&data_dir).unwrap();
        assert_eq!(
            keypair.public_key_bytes(),
            loaded.public_key_bytes(),
            "second load should return the same keypair"
        );
    }

    #[test]
    fn startup_banner_does_not_panic() {
        print_startup_banner(
            "abababababababababababababababababababababababababababababababab",
            "0.0.0.0:9741",
            "0.0.0.0:9740",
            "/home/user/.meshrelay",
        );
    }

    #[test]
    fn load_router_config_defaults_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let args = cli::RunArgs {
            config: None,
            data_dir: dir.path().to_path_buf(),
            p2p_port: 9740,
            metrics_port: 9742,
            rpc_port: 9741,
            log_level: "info".to_string(),
            topics: vec![],
            peers: vec![],
            node_key: None,
        };
        let config = load_router_config(&args, dir.path()).unwrap();
        assert_eq!(config.mesh_d, RouterConfig::default().mesh_d);
    }

    #[test]
    fn load_router_config_overlays_toml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("config.toml");
        let default_json = serde_json::to_value(RouterConfig::default()).unwrap();
        let mut overridden = default_json.as_object().unwrap().clone();
        overridden.insert("mesh_d".to_string(), serde_json::json!(3));
        let toml_str = toml::to_string(&serde_json::Value::Object(overridden)).unwrap();
        std::fs::write(&config_path, toml_str).unwrap();

        let args = cli::RunArgs {
            config: Some(config_path),
            data_dir: dir.path().to_path_buf(),
            p2p_port: 9740,
            metrics_port: 9742,
            rpc_port: 9741,
            log_level: "info".to_string(),
            topics: vec![],
            peers: vec![],
            node_key: None,
        };
        let config = load_router_config(&args, dir.path()).unwrap();
        assert_eq!(config.mesh_d, 3);
    }
}
