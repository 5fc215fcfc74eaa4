//! Daemon configuration: a TOML file merged with a few command-line
//! overrides, frozen into one immutable struct before anything starts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vigil_chain::Network;
use vigil_mempool::MempoolConfig;
use vigil_net::{AuthMode, NetConfig};
use vigil_node::BroadcastConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VigildConfig {
    /// The Bitcoin network to track.
    pub network: Network,
    /// Where clients connect.
    pub listen_addr: String,
    /// The node's JSON-RPC endpoint.
    pub node_rpc_url: String,
    pub node_rpc_user: String,
    pub node_rpc_password: String,
    /// Mempool poll cadence for the RPC intake path, milliseconds.
    pub node_poll_interval_ms: u64,
    /// One-way: clients verify us only. Two-way: we verify clients too.
    pub client_auth: AuthMode,
    /// Where the daemon drops its own public key for local front-ends.
    pub cookie_path: PathBuf,
    /// Authorized client keys (hex), used in two-way mode.
    pub authorized_clients: Vec<String>,

    pub mempool: MempoolConfig,
    pub net: NetConfig,
    pub broadcast: BroadcastConfig,
}

impl Default for VigildConfig {
    fn default() -> Self {
        VigildConfig {
            network: Network::Mainnet,
            listen_addr: "127.0.0.1:9581".to_owned(),
            node_rpc_url: "http://127.0.0.1:8332".to_owned(),
            node_rpc_user: String::new(),
            node_rpc_password: String::new(),
            node_poll_interval_ms: 2_000,
            client_auth: AuthMode::OneWay,
            cookie_path: PathBuf::from("./vigild.cookie"),
            authorized_clients: Vec::new(),
            mempool: MempoolConfig::default(),
            net: NetConfig::default(),
            broadcast: BroadcastConfig {
                // the daemon's intake is the explicit RPC path
                rpc_only: true,
                ..BroadcastConfig::default()
            },
        }
    }
}

impl VigildConfig {
    pub fn load(path: &Path) -> Result<VigildConfig, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_toml() {
        let config = VigildConfig::default();
        let rendered = toml::to_string(&config).unwrap();
        let parsed: VigildConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.network, config.network);
        assert_eq!(parsed.listen_addr, config.listen_addr);
        assert!(parsed.broadcast.rpc_only);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let parsed: VigildConfig = toml::from_str(
            r#"
                network = "regtest"
                node_rpc_url = "http://127.0.0.1:18443"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.network, Network::Regtest);
        assert_eq!(parsed.node_rpc_url, "http://127.0.0.1:18443");
        assert_eq!(parsed.listen_addr, VigildConfig::default().listen_addr);
    }
}
