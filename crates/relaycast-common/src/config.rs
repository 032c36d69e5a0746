//! Configuration for Relaycast

use crate::types::normalize_carrier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Dispatch loop configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Server health thresholds
    #[serde(default)]
    pub health: HealthConfig,

    /// Server selection tuning
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-carrier send rate limits
    #[serde(default = "default_rate_limits")]
    pub rate_limits: CarrierTable<RateLimitEntry>,

    /// Outbound SMTP gateway settings
    #[serde(default)]
    pub smtp: SmtpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            dispatch: DispatchConfig::default(),
            health: HealthConfig::default(),
            selection: SelectionConfig::default(),
            retry: RetryConfig::default(),
            rate_limits: default_rate_limits(),
            smtp: SmtpConfig::default(),
        }
    }
}

/// A per-carrier configuration table with a mandatory `default` entry.
///
/// Keys are normalized with [`normalize_carrier`] on load, so `"AT&T"` and
/// `"att"` address the same entry. Deserialization fails when the `default`
/// entry is missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, T>",
    into = "BTreeMap<String, T>",
    bound(serialize = "T: Serialize + Clone", deserialize = "T: Deserialize<'de>")
)]
pub struct CarrierTable<T> {
    default: T,
    carriers: BTreeMap<String, T>,
}

impl<T> CarrierTable<T> {
    /// Key of the fallback entry
    pub const DEFAULT_KEY: &'static str = "default";

    /// Create a table from a default entry and carrier overrides
    pub fn new(default: T, carriers: impl IntoIterator<Item = (String, T)>) -> Self {
        Self {
            default,
            carriers: carriers
                .into_iter()
                .map(|(name, value)| (normalize_carrier(&name), value))
                .collect(),
        }
    }

    /// Look up a carrier, falling back to the default entry for unknown or
    /// empty carriers
    pub fn get(&self, carrier: &str) -> &T {
        let key = normalize_carrier(carrier);
        if key.is_empty() {
            return &self.default;
        }
        self.carriers.get(&key).unwrap_or(&self.default)
    }

    /// The default entry
    pub fn default_entry(&self) -> &T {
        &self.default
    }

    /// Whether the carrier has its own entry
    pub fn contains(&self, carrier: &str) -> bool {
        self.carriers.contains_key(&normalize_carrier(carrier))
    }

    /// Iterate over all entries including the default
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        std::iter::once((Self::DEFAULT_KEY, &self.default))
            .chain(self.carriers.iter().map(|(k, v)| (k.as_str(), v)))
    }
}

impl<T> TryFrom<BTreeMap<String, T>> for CarrierTable<T> {
    type Error = String;

    fn try_from(mut entries: BTreeMap<String, T>) -> Result<Self, Self::Error> {
        let default = entries
            .remove(Self::DEFAULT_KEY)
            .ok_or_else(|| "carrier table is missing the required 'default' entry".to_string())?;
        Ok(Self::new(default, entries))
    }
}

impl<T> From<CarrierTable<T>> for BTreeMap<String, T> {
    fn from(table: CarrierTable<T>) -> Self {
        let mut map = table.carriers;
        map.insert(CarrierTable::<T>::DEFAULT_KEY.to_string(), table.default);
        map
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Dispatch loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of worker tasks per campaign
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Pending messages fetched per dispatch pass
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Pause between passes when nothing is due (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Transport send timeout (seconds)
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Send delay used when a campaign has no custom window (seconds)
    #[serde(default = "default_min_delay")]
    pub default_min_delay_secs: f64,

    #[serde(default = "default_max_delay")]
    pub default_max_delay_secs: f64,

    /// Processed messages between optimization reviews
    #[serde(default = "default_optimization_interval")]
    pub optimization_interval: u64,

    /// Local hour at which the timezone send window opens
    #[serde(default = "default_window_start")]
    pub send_window_start_hour: u32,

    /// Local hour at which the timezone send window closes
    #[serde(default = "default_window_end")]
    pub send_window_end_hour: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval(),
            send_timeout_secs: default_send_timeout(),
            default_min_delay_secs: default_min_delay(),
            default_max_delay_secs: default_max_delay(),
            optimization_interval: default_optimization_interval(),
            send_window_start_hour: default_window_start(),
            send_window_end_hour: default_window_end(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_batch_size() -> i64 {
    100
}

fn default_poll_interval() -> u64 {
    5
}

fn default_send_timeout() -> u64 {
    30
}

fn default_min_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    5.0
}

fn default_optimization_interval() -> u64 {
    100
}

fn default_window_start() -> u32 {
    8
}

fn default_window_end() -> u32 {
    21
}

/// Server health thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Number of recent outcomes kept per server
    #[serde(default = "default_health_window")]
    pub window_size: usize,

    /// Outcomes required before a server can be marked unhealthy
    #[serde(default = "default_health_min_samples")]
    pub min_samples: usize,

    /// Recent success rate below which a server is unhealthy
    #[serde(default = "default_success_floor")]
    pub success_floor: f64,

    /// Average response ceiling for proxies (milliseconds)
    #[serde(default = "default_proxy_ceiling")]
    pub proxy_max_response_ms: u64,

    /// Average response ceiling for relays (milliseconds)
    #[serde(default = "default_relay_ceiling")]
    pub relay_max_response_ms: u64,

    /// Seconds an unhealthy server is left alone before trial sends are
    /// admitted again
    #[serde(default = "default_recovery_cooldown")]
    pub recovery_cooldown_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: default_health_window(),
            min_samples: default_health_min_samples(),
            success_floor: default_success_floor(),
            proxy_max_response_ms: default_proxy_ceiling(),
            relay_max_response_ms: default_relay_ceiling(),
            recovery_cooldown_secs: default_recovery_cooldown(),
        }
    }
}

fn default_health_window() -> usize {
    50
}

fn default_health_min_samples() -> usize {
    10
}

fn default_success_floor() -> f64 {
    0.7
}

fn default_proxy_ceiling() -> u64 {
    5_000
}

fn default_relay_ceiling() -> u64 {
    10_000
}

fn default_recovery_cooldown() -> u64 {
    300
}

/// Server selection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Minimum samples before a carrier performance entry is trusted
    #[serde(default = "default_selection_min_samples")]
    pub min_samples: i64,

    /// Minimum success rate for a carrier-optimal pair
    #[serde(default = "default_selection_min_rate")]
    pub min_success_rate: f64,

    /// How long an optimal pair stays cached per carrier (seconds)
    #[serde(default = "default_pair_cache_ttl")]
    pub pair_cache_ttl_secs: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_samples: default_selection_min_samples(),
            min_success_rate: default_selection_min_rate(),
            pair_cache_ttl_secs: default_pair_cache_ttl(),
        }
    }
}

fn default_selection_min_samples() -> i64 {
    10
}

fn default_selection_min_rate() -> f64 {
    0.8
}

fn default_pair_cache_ttl() -> u64 {
    300
}

/// Retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Upper bound for any computed backoff (seconds)
    #[serde(default = "default_max_retry_delay")]
    pub max_delay_secs: f64,

    /// Relative jitter applied to backoff delays (0.2 = ±20%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Per-carrier retry parameters
    #[serde(default = "default_carrier_retry")]
    pub carriers: CarrierTable<CarrierRetryConfig>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_delay_secs: default_max_retry_delay(),
            jitter: default_jitter(),
            carriers: default_carrier_retry(),
        }
    }
}

fn default_max_retry_delay() -> f64 {
    86_400.0
}

fn default_jitter() -> f64 {
    0.2
}

/// Retry parameters for one carrier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CarrierRetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub multiplier: f64,
    /// Flat delay used when the failure reports throttling
    pub rate_limit_delay_secs: f64,
}

impl CarrierRetryConfig {
    pub const fn new(
        max_attempts: u32,
        base_delay_secs: f64,
        multiplier: f64,
        rate_limit_delay_secs: f64,
    ) -> Self {
        Self {
            max_attempts,
            base_delay_secs,
            multiplier,
            rate_limit_delay_secs,
        }
    }
}

fn default_carrier_retry() -> CarrierTable<CarrierRetryConfig> {
    CarrierTable::new(
        CarrierRetryConfig::new(3, 60.0, 2.0, 300.0),
        [
            ("verizon".to_string(), CarrierRetryConfig::new(3, 60.0, 2.0, 300.0)),
            ("at&t".to_string(), CarrierRetryConfig::new(3, 120.0, 2.0, 300.0)),
            ("t-mobile".to_string(), CarrierRetryConfig::new(4, 45.0, 1.5, 180.0)),
            ("sprint".to_string(), CarrierRetryConfig::new(3, 90.0, 2.5, 240.0)),
        ],
    )
}

/// Send rate limit for one carrier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitEntry {
    /// Sends allowed in any trailing minute
    pub messages_per_minute: u32,
    /// Minimum spacing between two sends on the same key (seconds)
    pub min_delay_secs: f64,
}

impl RateLimitEntry {
    pub const fn new(messages_per_minute: u32, min_delay_secs: f64) -> Self {
        Self {
            messages_per_minute,
            min_delay_secs,
        }
    }
}

fn default_rate_limits() -> CarrierTable<RateLimitEntry> {
    CarrierTable::new(
        RateLimitEntry::new(20, 3.0),
        [
            ("verizon".to_string(), RateLimitEntry::new(30, 2.0)),
            ("at&t".to_string(), RateLimitEntry::new(25, 2.5)),
            ("t-mobile".to_string(), RateLimitEntry::new(40, 1.5)),
            ("sprint".to_string(), RateLimitEntry::new(20, 3.0)),
        ],
    )
}

/// Outbound SMTP gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Envelope sender used when a relay has no username
    #[serde(default = "default_from_address")]
    pub from_address: String,

    /// SMTP command timeout in seconds
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            from_address: default_from_address(),
            timeout_secs: default_smtp_timeout(),
        }
    }
}

fn default_from_address() -> String {
    "noreply@localhost".to_string()
}

fn default_smtp_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML document
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `RELAYCAST_CONFIG` or the default locations
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var("RELAYCAST_CONFIG") {
            return Self::from_file(&PathBuf::from(path));
        }

        let paths = [
            PathBuf::from("./relaycast.toml"),
            PathBuf::from("/etc/relaycast/relaycast.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> crate::Result<()> {
        let fail = |msg: String| Err(crate::Error::Config(msg));

        if self.dispatch.workers == 0 {
            return fail("dispatch.workers must be at least 1".into());
        }
        if self.dispatch.batch_size <= 0 {
            return fail("dispatch.batch_size must be positive".into());
        }
        if self.dispatch.default_min_delay_secs < 0.0
            || self.dispatch.default_max_delay_secs < self.dispatch.default_min_delay_secs
        {
            return fail("dispatch default delay window is invalid".into());
        }
        if self.dispatch.send_window_start_hour > 23 || self.dispatch.send_window_end_hour > 24 {
            return fail("dispatch send window hours must be within 0..=24".into());
        }
        if !(0.0..=1.0).contains(&self.health.success_floor) {
            return fail("health.success_floor must be within 0..=1".into());
        }
        if self.health.window_size == 0 {
            return fail("health.window_size must be at least 1".into());
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return fail("retry.jitter must be within 0..1".into());
        }
        if self.retry.max_delay_secs < 0.0 {
            return fail("retry.max_delay_secs must not be negative".into());
        }

        for (carrier, entry) in self.retry.carriers.iter() {
            if entry.max_attempts == 0
                || entry.base_delay_secs < 0.0
                || entry.multiplier < 1.0
                || entry.rate_limit_delay_secs < 0.0
            {
                return fail(format!("retry.carriers.{} has invalid values", carrier));
            }
        }

        for (carrier, entry) in self.rate_limits.iter() {
            if entry.messages_per_minute == 0 || entry.min_delay_secs < 0.0 {
                return fail(format!("rate_limits.{} has invalid values", carrier));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.workers, 4);
        assert_eq!(config.health.success_floor, 0.7);
        assert_eq!(config.retry.max_delay_secs, 86_400.0);
    }

    #[test]
    fn test_carrier_table_fallback() {
        let config = Config::default();
        let sprint = config.retry.carriers.get("Sprint");
        assert_eq!(sprint.base_delay_secs, 90.0);
        assert_eq!(sprint.multiplier, 2.5);

        let att = config.retry.carriers.get("AT&T");
        assert_eq!(att.rate_limit_delay_secs, 300.0);

        let unknown = config.rate_limits.get("Unknown Mobile");
        assert_eq!(unknown, config.rate_limits.default_entry());
        assert_eq!(config.rate_limits.get(""), config.rate_limits.default_entry());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
backend = "memory"

[dispatch]
workers = 8
batch_size = 50

[rate_limits.default]
messages_per_minute = 10
min_delay_secs = 1.0

[rate_limits.Verizon]
messages_per_minute = 60
min_delay_secs = 0.5

[retry.carriers.default]
max_attempts = 2
base_delay_secs = 30.0
multiplier = 2.0
rate_limit_delay_secs = 120.0
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.database.backend, "memory");
        assert_eq!(config.dispatch.workers, 8);
        assert_eq!(config.rate_limits.get("verizon").messages_per_minute, 60);
        assert_eq!(config.rate_limits.get("sprint").messages_per_minute, 10);
        assert_eq!(config.retry.carriers.get("sprint").max_attempts, 2);
    }

    #[test]
    fn test_missing_default_entry_rejected() {
        let toml = r#"
[rate_limits.verizon]
messages_per_minute = 60
min_delay_secs = 0.5
"#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn test_invalid_multiplier_rejected() {
        let toml = r#"
[retry.carriers.default]
max_attempts = 3
base_delay_secs = 30.0
multiplier = 0.5
rate_limit_delay_secs = 120.0
"#;
        assert!(Config::from_toml(toml).is_err());
    }
}
