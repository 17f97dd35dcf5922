//! Configuration management for Warden.
//!
//! A configuration picks a backend for each subsystem once, at
//! construction time. Driver names are case-insensitive and trimmed;
//! durations accept plain seconds (`30`, `0.5`) or unit strings
//! (`"50ms"`, `"2m30s"`).

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WardenError};

/// Backend selector shared by the limiter and the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Driver {
    /// In-process state, single node only.
    Memory,
    /// Shared key-value store, safe across nodes.
    Redis,
}

impl Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::Memory => "memory",
            Driver::Redis => "redis",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Driver {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase();
        match normalized.as_str() {
            "" => Err(WardenError::Config("driver is required".to_string())),
            "memory" => Ok(Driver::Memory),
            "redis" => Ok(Driver::Redis),
            other => Err(WardenError::Config(format!(
                "unsupported driver: {} (must be memory or redis)",
                other
            ))),
        }
    }
}

/// Main configuration for Warden.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Connection to the shared store
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Lock manager configuration
    #[serde(default)]
    pub lock: LockConfig,
}

impl WardenConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: WardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate an already-decoded map, e.g. a section handed over by a host application.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let mut config: WardenConfig = if value.is_null() {
            WardenConfig::default()
        } else {
            serde_json::from_value(value)
                .map_err(|e| WardenError::Config(format!("Failed to parse config: {}", e)))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional file, overridden by `WARDEN__`-prefixed environment variables.
    ///
    /// Nested keys are separated by a double underscore, e.g.
    /// `WARDEN__LOCK__DRIVER=redis`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("WARDEN")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: WardenConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WardenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Normalize driver names and check every section.
    pub fn validate(&mut self) -> Result<()> {
        self.store.validate()?;
        self.limiter.validate()?;
        self.lock.validate()?;
        Ok(())
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Shared store connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_host")]
    pub host: String,

    #[serde(default = "default_store_port")]
    pub port: u16,

    #[serde(default)]
    pub password: String,

    /// Logical database index (0-15)
    #[serde(default)]
    pub db: u8,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_store_host(),
            port: default_store_port(),
            password: String::new(),
            db: 0,
        }
    }
}

fn default_store_host() -> String {
    "localhost".to_string()
}

fn default_store_port() -> u16 {
    6379
}

impl StoreConfig {
    /// Connection URL for the store.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            )
        }
    }

    pub fn validate(&mut self) -> Result<()> {
        self.host = self.host.trim().to_string();
        if self.host.is_empty() {
            return Err(WardenError::Config("store host is required".to_string()));
        }
        if self.port == 0 {
            return Err(WardenError::Config("store port must be positive".to_string()));
        }
        if self.db > 15 {
            return Err(WardenError::Config(
                "db must be between 0 and 15".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Prefix for counter keys in the shared store
    #[serde(default = "default_limiter_prefix")]
    pub key_prefix: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            key_prefix: default_limiter_prefix(),
        }
    }
}

fn default_driver() -> String {
    "memory".to_string()
}

fn default_limiter_prefix() -> String {
    "limiter:".to_string()
}

impl LimiterConfig {
    /// Normalize the driver name in place and return the selected driver.
    pub fn validate(&mut self) -> Result<Driver> {
        let driver: Driver = self.driver.parse()?;
        self.driver = driver.as_str().to_string();
        Ok(driver)
    }
}

/// Lock manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Prefix for lock keys in the shared store
    #[serde(default = "default_lock_prefix")]
    pub key_prefix: String,

    /// How often a blocked distributed `lock` retries
    #[serde(default = "default_retry_interval", with = "duration_serde")]
    pub retry_interval: Duration,

    /// Release distributed locks only while they still hold our token
    #[serde(default)]
    pub verify_owner: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            key_prefix: default_lock_prefix(),
            retry_interval: default_retry_interval(),
            verify_owner: false,
        }
    }
}

fn default_lock_prefix() -> String {
    "lock:".to_string()
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(50)
}

impl LockConfig {
    /// Normalize the driver name in place and return the selected driver.
    pub fn validate(&mut self) -> Result<Driver> {
        let driver: Driver = self.driver.parse()?;
        self.driver = driver.as_str().to_string();
        if self.retry_interval.is_zero() {
            return Err(WardenError::Config(
                "retry_interval must be positive".to_string(),
            ));
        }
        Ok(driver)
    }
}

/// Parse `"120"`, `"0.5"`, `"500ms"`, `"2m30s"` and similar into a duration.
///
/// Bare numbers are seconds. Supported units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(WardenError::Config("duration cannot be empty".to_string()));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    if let Ok(secs) = s.parse::<f64>() {
        return seconds_f64(secs);
    }

    let invalid = || WardenError::Config(format!("invalid duration: {}", input));
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return Err(invalid());
        }
        let number = &rest[..number_end];
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let nanos_per_unit: u64 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(invalid()),
        };

        let part = match number.parse::<u64>() {
            Ok(whole) => whole
                .checked_mul(nanos_per_unit)
                .map(Duration::from_nanos)
                .ok_or_else(invalid)?,
            Err(_) => {
                let value: f64 = number.parse().map_err(|_| invalid())?;
                seconds_f64(value * nanos_per_unit as f64 / 1e9)?
            }
        };
        total = total.checked_add(part).ok_or_else(invalid)?;
    }
    Ok(total)
}

fn seconds_f64(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(WardenError::Config(format!(
            "duration must be a non-negative number of seconds, got {}",
            secs
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| WardenError::Config(format!("duration out of range: {}", e)))
}

/// Serde adapter for durations written as seconds or unit strings.
mod duration_serde {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("seconds as a number, or a string such as \"50ms\" or \"2m30s\"")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom(format!("duration cannot be negative: {}", v)))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            super::seconds_f64(v).map_err(E::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(E::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = WardenConfig::default();
        assert_eq!(config.limiter.driver, "memory");
        assert_eq!(config.limiter.key_prefix, "limiter:");
        assert_eq!(config.lock.driver, "memory");
        assert_eq!(config.lock.key_prefix, "lock:");
        assert_eq!(config.lock.retry_interval, Duration::from_millis(50));
        assert!(!config.lock.verify_owner);
        assert_eq!(config.store.host, "localhost");
        assert_eq!(config.store.port, 6379);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_driver_is_normalized() {
        let mut limiter = LimiterConfig {
            driver: "  REDIS  ".to_string(),
            ..Default::default()
        };
        assert_eq!(limiter.validate().unwrap(), Driver::Redis);
        assert_eq!(limiter.driver, "redis");
    }

    #[test]
    fn test_driver_required() {
        let mut lock = LockConfig {
            driver: "   ".to_string(),
            ..Default::default()
        };
        let err = lock.validate().unwrap_err();
        assert!(err.to_string().contains("driver is required"));
    }

    #[test]
    fn test_unsupported_driver() {
        let mut limiter = LimiterConfig {
            driver: "mysql".to_string(),
            ..Default::default()
        };
        let err = limiter.validate().unwrap_err();
        assert!(err.to_string().contains("unsupported driver"));
        assert!(err.to_string().contains("mysql"));
    }

    #[test]
    fn test_zero_retry_interval_rejected() {
        let mut lock = LockConfig {
            retry_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(lock.validate().is_err());
    }

    #[test]
    fn test_db_out_of_range() {
        let yaml = r#"
store:
  db: 16
"#;
        let err = WardenConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("db must be between 0 and 15"));
    }

    #[test]
    fn test_store_url() {
        let mut store = StoreConfig::default();
        assert_eq!(store.url(), "redis://localhost:6379/0");

        store.password = "secret".to_string();
        store.db = 2;
        assert_eq!(store.url(), "redis://:secret@localhost:6379/2");
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
logging:
  level: debug
  json: true
store:
  host: "  redis.example.com  "
  port: 6380
  password: pass123
  db: 2
limiter:
  driver: Redis
  key_prefix: "rl:"
lock:
  driver: redis
  retry_interval: 100ms
  verify_owner: true
"#;
        let config = WardenConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.store.host, "redis.example.com");
        assert_eq!(config.store.port, 6380);
        assert_eq!(config.store.db, 2);
        assert_eq!(config.limiter.driver, "redis");
        assert_eq!(config.limiter.key_prefix, "rl:");
        assert_eq!(config.lock.retry_interval, Duration::from_millis(100));
        assert!(config.lock.verify_owner);
    }

    #[test]
    fn test_from_value_null_uses_defaults() {
        let config = WardenConfig::from_value(serde_json::Value::Null).unwrap();
        assert_eq!(config.limiter.driver, "memory");
    }

    #[test]
    fn test_from_value_map() {
        let config = WardenConfig::from_value(json!({
            "limiter": { "driver": "  MEMORY  " },
            "lock": { "driver": "redis", "retry_interval": 2 },
        }))
        .unwrap();
        assert_eq!(config.limiter.driver, "memory");
        assert_eq!(config.lock.driver, "redis");
        assert_eq!(config.lock.retry_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir()
            .join(format!("warden-config-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "limiter:\n  driver: redis\nlock:\n  retry_interval: \"250ms\"\n",
        )
        .unwrap();

        let config = WardenConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.limiter.driver, "redis");
        assert_eq!(config.lock.retry_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("120").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration(" 0.5 ").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("50ms").unwrap(), Duration::from_millis(50));
        assert_eq!(parse_duration("2m30s").unwrap(), Duration::from_secs(150));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("   ").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("10parsecs").is_err());
        assert!(parse_duration("-5").is_err());
    }
}
