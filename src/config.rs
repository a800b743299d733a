//! Configuration for the payment watcher service

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// General service settings
    pub service: ServiceConfig,

    /// API server configuration
    pub api: ApiConfig,

    /// One entry per supported network
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// How often each network polls its wallet daemon for transfers (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// How often balance/sync snapshots are refreshed (seconds)
    #[serde(default = "default_summary_interval")]
    pub summary_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_summary_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// Listen address for the API server
    #[serde(default = "default_api_listen")]
    pub listen: String,

    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// API authentication token (required for all endpoints except health)
    /// If empty, authentication is disabled
    #[serde(default)]
    pub token: String,
}

fn default_api_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8092
}

/// Configuration for one Zano-like network.
///
/// A network missing `daemon_uri` or `wallet_daemon_uri` is disabled at
/// startup with a warning rather than treated as an error.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Crypto code, e.g. "ZANO"
    pub crypto_code: String,

    /// Node daemon JSON-RPC URI
    #[serde(default)]
    pub daemon_uri: Option<String>,

    /// Wallet daemon JSON-RPC URI
    #[serde(default)]
    pub wallet_daemon_uri: Option<String>,

    /// Optional secondary wallet daemon used for operator float
    #[serde(default)]
    pub cashcow_wallet_daemon_uri: Option<String>,

    /// Directory the wallet daemon keeps wallet files in
    #[serde(default = "default_wallet_dir")]
    pub wallet_dir: PathBuf,

    /// Daemon RPC username (if auth enabled)
    #[serde(default)]
    pub rpc_user: Option<String>,

    /// Daemon RPC password (if auth enabled)
    #[serde(default)]
    pub rpc_password: Option<String>,

    /// Password of the wallet file itself
    #[serde(default)]
    pub wallet_password: String,

    /// Blocks required before an incoming transfer is considered final
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u64,

    /// Mainnet networks refuse dev-only operations such as block generation
    #[serde(default = "default_mainnet")]
    pub mainnet: bool,

    /// Per-call RPC timeout (seconds)
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

fn default_wallet_dir() -> PathBuf {
    PathBuf::from("/var/lib/payment-watcher/wallets")
}

fn default_required_confirmations() -> u64 {
    10
}

fn default_mainnet() -> bool {
    true
}

fn default_rpc_timeout() -> u64 {
    20
}

impl NetworkConfig {
    /// Both daemon URIs must be present for the network to run
    pub fn is_configured(&self) -> bool {
        self.daemon_uri.is_some() && self.wallet_daemon_uri.is_some()
    }

    /// Wallet file name derived from the crypto code
    pub fn wallet_filename(&self) -> String {
        format!("{}-wallet", self.crypto_code.to_lowercase())
    }

    /// Basic-auth credentials for the daemon endpoints, if configured
    pub fn rpc_auth(&self) -> Option<(String, String)> {
        match (&self.rpc_user, &self.rpc_password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &str) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env();
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Network keys are prefixed by the crypto code, e.g. ZANO_DAEMON_URI.
    pub fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("WATCHER_LOG_LEVEL") {
            self.service.log_level = val;
        }
        if let Ok(val) = std::env::var("WATCHER_API_PORT") {
            if let Ok(port) = val.parse() {
                self.api.port = port;
            }
        }
        if let Ok(val) = std::env::var("WATCHER_API_TOKEN") {
            self.api.token = val;
        }

        for network in &mut self.networks {
            let code = network.crypto_code.to_uppercase();

            if let Ok(val) = std::env::var(format!("{code}_DAEMON_URI")) {
                network.daemon_uri = Some(val);
            }
            if let Ok(val) = std::env::var(format!("{code}_WALLET_DAEMON_URI")) {
                network.wallet_daemon_uri = Some(val);
            }
            if let Ok(val) = std::env::var(format!("{code}_CASHCOW_WALLET_DAEMON_URI")) {
                network.cashcow_wallet_daemon_uri = Some(val);
            }
            if let Ok(val) = std::env::var(format!("{code}_WALLET_DAEMON_WALLETDIR")) {
                network.wallet_dir = PathBuf::from(val);
            }
            if let Ok(val) = std::env::var(format!("{code}_DAEMON_USERNAME")) {
                network.rpc_user = Some(val);
            }
            if let Ok(val) = std::env::var(format!("{code}_DAEMON_PASSWORD")) {
                network.rpc_password = Some(val);
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                poll_interval_secs: default_poll_interval(),
                summary_interval_secs: default_summary_interval(),
                log_level: default_log_level(),
            },
            api: ApiConfig {
                listen: default_api_listen(),
                port: default_api_port(),
                token: String::new(),
            },
            networks: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_network_section() {
        let raw = r#"
            [service]
            poll_interval_secs = 3

            [api]
            port = 9000

            [[networks]]
            crypto_code = "ZANO"
            daemon_uri = "http://127.0.0.1:11211"
            wallet_daemon_uri = "http://127.0.0.1:11233"
        "#;

        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.service.poll_interval_secs, 3);
        assert_eq!(config.service.summary_interval_secs, 30);
        assert_eq!(config.api.port, 9000);

        let network = &config.networks[0];
        assert!(network.is_configured());
        assert_eq!(network.wallet_filename(), "zano-wallet");
        assert_eq!(network.required_confirmations, 10);
        assert!(network.mainnet);
        assert!(network.rpc_auth().is_none());
    }

    #[test]
    fn network_without_wallet_daemon_is_unconfigured() {
        let raw = r#"
            [service]
            [api]

            [[networks]]
            crypto_code = "ZANO"
            daemon_uri = "http://127.0.0.1:11211"
        "#;

        let config: Config = toml::from_str(raw).unwrap();
        assert!(!config.networks[0].is_configured());
    }

    #[test]
    fn rpc_auth_requires_both_credentials() {
        let raw = r#"
            [service]
            [api]

            [[networks]]
            crypto_code = "ZANO"
            rpc_user = "rpc"
        "#;

        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.networks[0].rpc_auth().is_none());
    }
}
