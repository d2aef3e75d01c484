use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid address in `{field}`: {value}")]
    InvalidAddress { field: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Explorer networks by name (`polygon`, `sepolia`, ...).
    #[serde(default = "default_networks")]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(default)]
    pub explorer: ExplorerConfig,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Etherscan-compatible API endpoint, e.g. https://api.polygonscan.com/api
    pub endpoint: String,
    /// API key - loaded from env <NAME>_SCAN_API_KEY
    #[serde(default)]
    pub api_key: String,
    /// Explorer rate limit for this key.
    #[serde(default = "default_calls_per_sec")]
    pub calls_per_sec: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplorerConfig {
    /// Records per page on list endpoints.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Attempts per call before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GovernanceConfig {
    /// Token name reserved for governance NFTs.
    #[serde(default = "default_governance_token")]
    pub token_name: String,
    /// Contract issuing governance NFTs.
    #[serde(default = "default_governance_contract")]
    pub contract: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Label for native token amounts in the report.
    #[serde(default = "default_native_symbol")]
    pub native_symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_networks() -> BTreeMap<String, NetworkConfig> {
    let mut networks = BTreeMap::new();
    networks.insert(
        "polygon".to_string(),
        NetworkConfig {
            endpoint: "https://api.polygonscan.com/api".to_string(),
            api_key: String::new(),
            calls_per_sec: default_calls_per_sec(),
        },
    );
    networks.insert(
        "sepolia".to_string(),
        NetworkConfig {
            endpoint: "https://api-sepolia.etherscan.io/api".to_string(),
            api_key: String::new(),
            calls_per_sec: default_calls_per_sec(),
        },
    );
    networks
}
fn default_calls_per_sec() -> u32 {
    5
}
fn default_page_size() -> usize {
    100
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_governance_token() -> String {
    crate::ledger::nft::GOVERNANCE_TOKEN_NAME.to_string()
}
fn default_governance_contract() -> String {
    crate::explorer::types::to_hex(crate::ledger::nft::GOVERNANCE_CONTRACT)
}
fn default_native_symbol() -> String {
    "POL".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            token_name: default_governance_token(),
            contract: default_governance_contract(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            native_symbol: default_native_symbol(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Env var carrying the API key of `network`, e.g. POLYGON_SCAN_API_KEY.
pub fn api_key_var(network: &str) -> String {
    format!("{}_SCAN_API_KEY", network.to_uppercase().replace('-', "_"))
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.overlay_env();
        Ok(config)
    }

    /// Default networks with env-only API keys (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config {
            networks: default_networks(),
            explorer: ExplorerConfig::default(),
            governance: GovernanceConfig::default(),
            report: ReportConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.overlay_env();
        config
    }

    // Override secrets from environment variables (never store in config file)
    fn overlay_env(&mut self) {
        for (name, network) in self.networks.iter_mut() {
            if let Ok(key) = std::env::var(api_key_var(name)) {
                network.api_key = key;
            }
        }
    }

    /// Resolve a `--network` selection: a configured name, or `all`.
    pub fn select_networks(&self, selection: &str) -> Option<Vec<String>> {
        if selection == "all" {
            return Some(self.networks.keys().cloned().collect());
        }
        self.networks
            .contains_key(selection)
            .then(|| vec![selection.to_string()])
    }
}
