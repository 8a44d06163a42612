//! Agent configuration
//!
//! Loaded from a TOML file or from `PIGEON_<SECTION>_<KEY>` environment
//! variables layered over the defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

const ENV_PREFIX: &str = "PIGEON_";

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub wallet: WalletConfig,
    pub dispatch: DispatchConfig,
    pub outbound: OutboundConfig,
    pub logging: LoggingConfig,
}

/// Identity of this agent as advertised to peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Label placed in invitations and DID exchange requests
    pub label: String,

    /// Service endpoint peers deliver to when no mediator is in use
    pub endpoint: String,

    /// Tenant that owns the agent's own keys and acts as mediator
    pub base_tenant: String,
}

/// How tenant data is laid out in storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WalletMode {
    /// One backend per tenant
    PerTenant,
    /// All tenants share one backend, records carry a tenant tag
    SingleWallet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub mode: WalletMode,
    pub backend: BackendKind,

    /// Directory holding SQLite databases
    pub data_dir: PathBuf,

    /// How long profile removal waits for in-flight operations
    #[serde(with = "humantime_serde")]
    pub remove_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Message type URI prefixes accepted on inbound messages
    pub accepted_prefixes: Vec<String>,

    /// Prefix used when emitting message types
    pub emit_prefix: String,

    /// Inbound messages processed concurrently
    pub max_concurrent_inbound: usize,

    /// Recently seen message ids remembered for duplicate suppression
    pub seen_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Delivery attempts per message before it is reported failed
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Per-destination queue depth
    pub lane_capacity: usize,

    /// A lane with nothing to send for this long is shut down
    #[serde(with = "humantime_serde")]
    pub lane_idle_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            label: "pigeon".to_string(),
            endpoint: "http://localhost:8020".to_string(),
            base_tenant: "base".to_string(),
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            mode: WalletMode::PerTenant,
            backend: BackendKind::Memory,
            data_dir: PathBuf::from("./data"),
            remove_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            accepted_prefixes: vec![
                "https://didcomm.org/".to_string(),
                "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/".to_string(),
            ],
            emit_prefix: "https://didcomm.org/".to_string(),
            max_concurrent_inbound: 64,
            seen_capacity: 4096,
        }
    }
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            lane_capacity: 256,
            lane_idle_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json_format: false, with_timestamp: true, with_target: true }
    }
}

impl FromStr for WalletMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-tenant" => Ok(WalletMode::PerTenant),
            "single-wallet" => Ok(WalletMode::SingleWallet),
            other => Err(format!("expected per-tenant or single-wallet, got '{}'", other)),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(BackendKind::Memory),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => Err(format!("expected memory or sqlite, got '{}'", other)),
        }
    }
}

/// Read `PIGEON_<key>` and parse it into `target` when present
fn override_from_env<T, E>(key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr<Err = E>,
    E: ToString,
{
    let var = format!("{}{}", ENV_PREFIX, key);
    if let Ok(raw) = env::var(&var) {
        *target = raw.parse().map_err(|e: E| ConfigError::InvalidEnv { var, reason: e.to_string() })?;
    }
    Ok(())
}

fn duration_from_env(key: &str, target: &mut Duration) -> Result<(), ConfigError> {
    let var = format!("{}{}", ENV_PREFIX, key);
    if let Ok(raw) = env::var(&var) {
        *target = humantime_serde::re::humantime::parse_duration(&raw)
            .map_err(|e| ConfigError::InvalidEnv { var, reason: e.to_string() })?;
    }
    Ok(())
}

impl Config {
    /// Defaults overridden by environment variables
    ///
    /// Example: `PIGEON_WALLET_BACKEND=sqlite`, `PIGEON_OUTBOUND_MAX_BACKOFF=1m`.
    /// List values are comma separated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        override_from_env("AGENT_LABEL", &mut config.agent.label)?;
        override_from_env("AGENT_ENDPOINT", &mut config.agent.endpoint)?;
        override_from_env("AGENT_BASE_TENANT", &mut config.agent.base_tenant)?;

        override_from_env("WALLET_MODE", &mut config.wallet.mode)?;
        override_from_env("WALLET_BACKEND", &mut config.wallet.backend)?;
        override_from_env("WALLET_DATA_DIR", &mut config.wallet.data_dir)?;
        duration_from_env("WALLET_REMOVE_TIMEOUT", &mut config.wallet.remove_timeout)?;

        if let Ok(prefixes) = env::var(format!("{}DISPATCH_ACCEPTED_PREFIXES", ENV_PREFIX)) {
            config.dispatch.accepted_prefixes = prefixes
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        override_from_env("DISPATCH_EMIT_PREFIX", &mut config.dispatch.emit_prefix)?;
        override_from_env("DISPATCH_MAX_CONCURRENT_INBOUND", &mut config.dispatch.max_concurrent_inbound)?;
        override_from_env("DISPATCH_SEEN_CAPACITY", &mut config.dispatch.seen_capacity)?;

        override_from_env("OUTBOUND_MAX_ATTEMPTS", &mut config.outbound.max_attempts)?;
        duration_from_env("OUTBOUND_INITIAL_BACKOFF", &mut config.outbound.initial_backoff)?;
        duration_from_env("OUTBOUND_MAX_BACKOFF", &mut config.outbound.max_backoff)?;
        override_from_env("OUTBOUND_LANE_CAPACITY", &mut config.outbound.lane_capacity)?;

        override_from_env("LOG_LEVEL", &mut config.logging.level)?;
        override_from_env("LOG_JSON", &mut config.logging.json_format)?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.base_tenant.is_empty() {
            return Err(ConfigError::ValidationFailed("base_tenant must not be empty".to_string()));
        }

        if self.dispatch.accepted_prefixes.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one accepted message type prefix is required".to_string(),
            ));
        }
        if !self.dispatch.accepted_prefixes.contains(&self.dispatch.emit_prefix) {
            return Err(ConfigError::ValidationFailed(format!(
                "emit prefix '{}' is not among the accepted prefixes",
                self.dispatch.emit_prefix
            )));
        }
        if self.dispatch.max_concurrent_inbound == 0 || self.dispatch.seen_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "dispatch limits must be greater than 0".to_string(),
            ));
        }

        if self.outbound.max_attempts == 0
            || self.outbound.lane_capacity == 0
            || self.outbound.lane_idle_timeout.is_zero()
        {
            return Err(ConfigError::ValidationFailed(
                "outbound limits must be greater than 0".to_string(),
            ));
        }
        if self.outbound.initial_backoff > self.outbound.max_backoff {
            return Err(ConfigError::ValidationFailed(
                "initial_backoff exceeds max_backoff".to_string(),
            ));
        }

        if self.logging.level.parse::<crate::logging::LogLevel>().is_err() {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.wallet.mode, WalletMode::PerTenant);
        assert!(config.dispatch.accepted_prefixes.contains(&config.dispatch.emit_prefix));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.dispatch.emit_prefix = "https://example.org/".to_string();
        assert!(config.validate().is_err());

        config = Config::default();
        config.outbound.initial_backoff = Duration::from_secs(60);
        assert!(config.validate().is_err());

        config = Config::default();
        config.logging.level = "chatty".to_string();
        assert!(config.validate().is_err());

        config = Config::default();
        config.dispatch.max_concurrent_inbound = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pigeon.toml");

        let mut config = Config::default();
        config.wallet.mode = WalletMode::SingleWallet;
        config.wallet.backend = BackendKind::Sqlite;
        config.outbound.max_backoff = Duration::from_secs(90);
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[wallet]\nmode = \"single-wallet\"\nremove_timeout = \"250ms\"\n")
            .unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.wallet.mode, WalletMode::SingleWallet);
        assert_eq!(loaded.wallet.remove_timeout, Duration::from_millis(250));
        assert_eq!(loaded.agent, AgentConfig::default());
    }

    // Both cases live in one test since the process environment is shared.
    #[test]
    fn test_env_overrides() {
        env::set_var("PIGEON_WALLET_BACKEND", "sqlite");
        env::set_var("PIGEON_OUTBOUND_MAX_ATTEMPTS", "9");
        env::set_var("PIGEON_OUTBOUND_INITIAL_BACKOFF", "20ms");
        let config = Config::from_env();

        env::set_var("PIGEON_WALLET_MODE", "sideways");
        let rejected = Config::from_env();

        for var in [
            "PIGEON_WALLET_BACKEND",
            "PIGEON_OUTBOUND_MAX_ATTEMPTS",
            "PIGEON_OUTBOUND_INITIAL_BACKOFF",
            "PIGEON_WALLET_MODE",
        ] {
            env::remove_var(var);
        }

        let config = config.unwrap();
        assert_eq!(config.wallet.backend, BackendKind::Sqlite);
        assert_eq!(config.outbound.max_attempts, 9);
        assert_eq!(config.outbound.initial_backoff, Duration::from_millis(20));
        assert!(matches!(rejected, Err(ConfigError::InvalidEnv { .. })));
    }
}
