use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub valkey: ValkeyConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Chain data API base URL
    #[serde(default = "default_chain_url")]
    pub base_url: String,
    /// API key - loaded from env CHAIN_API_KEY
    #[serde(default)]
    pub api_key: String,
    /// Page size for paginated upstream queries
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot API base URL
    #[serde(default = "default_telegram_url")]
    pub base_url: String,
    /// Bot token - loaded from env TELEGRAM_BOT_TOKEN
    #[serde(default)]
    pub bot_token: String,
    /// Long-poll timeout for getUpdates, seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValkeyConfig {
    /// Valkey/Redis connection URL - overridable from env VALKEY_URL
    #[serde(default = "default_valkey_url")]
    pub url: String,
    /// Key namespace prefix (multiple instances can share one Valkey)
    #[serde(default = "default_valkey_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Subscribers per upstream batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Transaction check interval, seconds
    #[serde(default = "default_tx_interval")]
    pub tx_interval_secs: u64,
    /// Reward check interval, seconds
    #[serde(default = "default_reward_interval")]
    pub reward_interval_secs: u64,
    /// Retiring-pool check interval, seconds
    #[serde(default = "default_pool_interval")]
    pub pool_interval_secs: u64,
    /// Governance vote check interval, seconds
    #[serde(default = "default_vote_interval")]
    pub vote_interval_secs: u64,
    /// New-proposal check interval, seconds
    #[serde(default = "default_proposal_interval")]
    pub proposal_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Token policy that grants subscription slots, one slot per unit held
    #[serde(default)]
    pub token_policy_id: String,
    /// Asset name (hex) of the qualifying token under the policy
    #[serde(default)]
    pub token_asset_name: String,
    /// Stake addresses delegated to this pool bypass the quota entirely
    #[serde(default)]
    pub operator_pool_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    /// Skip the payload budget and let the platform reject oversized messages
    #[serde(default)]
    pub allow_oversized: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Worker pool size for command execution and outbound sends
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Soft timeout for inbound command execution, seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Soft timeout for outbound notification sends, seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// Interval for the dispatch counter summary log, seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_chain_url() -> String {
    "https://api.koios.rest/api/v1".to_string()
}
fn default_telegram_url() -> String {
    "https://api.telegram.org".to_string()
}
fn default_valkey_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_valkey_prefix() -> String {
    "stakewatch".to_string()
}
fn default_page_limit() -> usize {
    500
}
fn default_request_timeout() -> u64 {
    30
}
fn default_poll_timeout() -> u64 {
    30
}
fn default_batch_size() -> usize {
    50
}
fn default_tx_interval() -> u64 {
    120
}
fn default_reward_interval() -> u64 {
    3600
}
fn default_pool_interval() -> u64 {
    3600
}
fn default_vote_interval() -> u64 {
    600
}
fn default_proposal_interval() -> u64 {
    600
}
fn default_pool_size() -> usize {
    50
}
fn default_command_timeout() -> u64 {
    30
}
fn default_send_timeout() -> u64 {
    15
}
fn default_stats_interval() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            base_url: default_chain_url(),
            api_key: String::new(),
            page_limit: default_page_limit(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            base_url: default_telegram_url(),
            bot_token: String::new(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

impl Default for ValkeyConfig {
    fn default() -> Self {
        Self {
            url: default_valkey_url(),
            prefix: default_valkey_prefix(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            tx_interval_secs: default_tx_interval(),
            reward_interval_secs: default_reward_interval(),
            pool_interval_secs: default_pool_interval(),
            vote_interval_secs: default_vote_interval(),
            proposal_interval_secs: default_proposal_interval(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            token_policy_id: String::new(),
            token_asset_name: String::new(),
            operator_pool_id: String::new(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            allow_oversized: false,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            command_timeout_secs: default_command_timeout(),
            send_timeout_secs: default_send_timeout(),
            stats_interval_secs: default_stats_interval(),
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

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.overlay_env();
        Ok(config)
    }

    /// Load a default config with env-only secrets (no file needed).
    pub fn from_env() -> Self {
        let mut config = Config {
            chain: ChainConfig {
                base_url: std::env::var("CHAIN_API_URL").unwrap_or_else(|_| default_chain_url()),
                ..ChainConfig::default()
            },
            telegram: TelegramConfig::default(),
            valkey: ValkeyConfig::default(),
            sync: SyncConfig::default(),
            quota: QuotaConfig::default(),
            render: RenderConfig::default(),
            dispatch: DispatchConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.overlay_env();
        config
    }

    /// Override secrets from environment variables (never store in config file)
    fn overlay_env(&mut self) {
        if let Ok(key) = std::env::var("CHAIN_API_KEY") {
            self.chain.api_key = key;
        }
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Ok(url) = std::env::var("VALKEY_URL") {
            self.valkey.url = url;
        }
    }

    pub fn has_bot_token(&self) -> bool {
        !self.telegram.bot_token.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.dispatch.pool_size, 50);
        assert!(!config.render.allow_oversized);
        assert_eq!(config.valkey.prefix, "stakewatch");
    }

    #[test]
    fn test_partial_override() {
        let config: Config = toml::from_str(
            r#"
            [sync]
            batch_size = 10

            [render]
            allow_oversized = true
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.batch_size, 10);
        assert!(config.render.allow_oversized);
        assert_eq!(config.sync.tx_interval_secs, 120);
    }
}
