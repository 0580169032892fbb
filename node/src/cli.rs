//! # CLI Interface
//!
//! Defines the command-line argument structure for `meshrelay-node` using
//! `clap` derive. Supports three subcommands: `run`, `init`, and `version`.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use meshrelay_protocol::identity::NodeId;

/// Mesh relay node.
///
/// A GossipSub v1.1-style pub/sub relay: joins topics, gossips messages
/// through a scored peer mesh, and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "meshrelay-node",
    about = "Mesh relay pub/sub node",
    version,
    propagate_version = true
)]
pub struct MeshRelayCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the mesh relay node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the relay node.
    Run(RunArgs),
    /// Initialize a new node — creates the data directory and generates a
    /// fresh node identity keypair.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node configuration file (TOML), overlaying
    /// `RouterConfig`'s defaults.
    ///
    /// When omitted, the node looks for `config.toml` in the data directory.
    #[arg(long, short = 'c', env = "MESHRELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the node data directory where the node identity key is stored.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "MESHRELAY_DATA_DIR", default_value = "~/.meshrelay")]
    pub data_dir: PathBuf,

    /// Port for P2P gossip connections with other nodes.
    #[arg(long, env = "MESHRELAY_P2P_PORT", default_value_t = 9740)]
    pub p2p_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "MESHRELAY_METRICS_PORT", default_value_t = 9742)]
    pub metrics_port: u16,

    /// Port for the REST/WebSocket API.
    #[arg(long, env = "MESHRELAY_RPC_PORT", default_value_t = 9741)]
    pub rpc_port: u16,

    /// Tracing filter applied when `RUST_LOG` is not set, e.g. "info" or
    /// "debug".
    #[arg(long, env = "MESHRELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Topics to subscribe to immediately on startup (may be repeated).
    #[arg(long = "topic")]
    pub topics: Vec<String>,

    /// Known peer to dial at startup, as `nodeid_hex@host:port` (may be
    /// repeated).
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Hex-encoded node identity private key.
    ///
    /// If not provided, the node reads the key from the data directory.
    /// **Never pass this flag in production** — use a key file instead.
    #[arg(long, env = "MESHRELAY_NODE_KEY")]
    pub node_key: Option<String>,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Path to the data directory to initialize.
    #[arg(long, short = 'd', env = "MESHRELAY_DATA_DIR", default_value = "~/.meshrelay")]
    pub data_dir: PathBuf,
}

/// Expands a leading `~` to the user's home directory. Paths without a
/// leading `~` are returned unchanged.
pub fn resolve_data_dir(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    } else if path_str == "~" {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home);
        }
    }
    path.to_path_buf()
}

/// Validates a tracing filter's top-level level name. Accepts the standard
/// `tracing` levels; anything else (including full directive strings with
/// per-target overrides) is considered invalid for this simple check — it's
/// only used to sanity-check the `--log-level` flag before startup, not to
/// fully parse `EnvFilter` syntax.
pub fn validate_log_level(level: &str) -> bool {
    matches!(level.to_lowercase().as_str(), "trace" | "debug" | "info" | "warn" | "error")
}

/// Parses a `--peer` value of the form `nodeid_hex@host:port`.
pub fn parse_peer_spec(spec: &str) -> Result<(NodeId, SocketAddr), String> {
    let (id_hex, addr_str) =
        spec.split_once('@').ok_or_else(|| format!("peer spec missing '@': {spec}"))?;

    let id_bytes = hex::decode(id_hex).map_err(|e| format!("invalid hex node id: {e}"))?;
    let id = NodeId::try_from_slice(&id_bytes)
        .ok_or_else(|| format!("node id must be 32 bytes, got {}", id_bytes.len()))?;

    let addr: SocketAddr =
        addr_str.parse().map_err(|e| format!("invalid peer address '{addr_str}': {e}"))?;

    Ok((id, addr))
}
