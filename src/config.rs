use clap::Parser;
use serde::{Deserialize, Deserializer, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::error::{Result, ThrottlerError};
use crate::keys::{default_store_path, validate_table_name, DEFAULT_TABLE};
use crate::kv::StoreUri;

pub const DEFAULT_RULE_ID: &str = "per-profile-throttle";
pub const DEFAULT_LOCK_EXPIRY: Duration = Duration::from_secs(5);

/// Options for one throttle policy instance.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Requests allowed per calendar hour; unlimited when absent.
    #[validate(range(min = 1))]
    pub per_hour: Option<u64>,

    /// Requests allowed per calendar day; unlimited when absent.
    #[validate(range(min = 1))]
    pub per_day: Option<u64>,

    /// When false the counters live in process memory only.
    pub persistent: bool,

    /// Namespace of this policy's records within a shared table.
    #[validate(length(min = 1))]
    pub rule_id: String,

    #[serde(alias = "db-uri")]
    pub store_uri: Option<String>,

    #[serde(alias = "db-table")]
    pub store_table: Option<String>,

    /// Age after which another holder may take over an entity's lock.
    #[serde(
        rename = "lock_expiry_seconds",
        alias = "lock_expiry",
        alias = "expiry_secs",
        serialize_with = "humantime_serde::serialize",
        deserialize_with = "deserialize_expiry"
    )]
    #[validate(custom(function = "validate_expiry"))]
    pub lock_expiry: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            per_hour: None,
            per_day: None,
            persistent: true,
            rule_id: DEFAULT_RULE_ID.to_string(),
            store_uri: None,
            store_table: None,
            lock_expiry: DEFAULT_LOCK_EXPIRY,
        }
    }
}

impl ThrottleConfig {
    pub fn new(rule_id: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            ..Self::default()
        }
    }

    pub fn with_per_hour(mut self, limit: u64) -> Self {
        self.per_hour = Some(limit);
        self
    }

    pub fn with_per_day(mut self, limit: u64) -> Self {
        self.per_day = Some(limit);
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_store_uri(mut self, uri: impl Into<String>) -> Self {
        self.store_uri = Some(uri.into());
        self
    }

    pub fn with_store_table(mut self, table: impl Into<String>) -> Self {
        self.store_table = Some(table.into());
        self
    }

    pub fn with_lock_expiry(mut self, expiry: Duration) -> Self {
        self.lock_expiry = expiry;
        self
    }

    /// Checks limits, rule id, expiry and table name.
    pub fn check(&self) -> Result<()> {
        self.validate()?;
        validate_table_name(self.table())?;
        Ok(())
    }

    pub fn table(&self) -> &str {
        self.store_table.as_deref().unwrap_or(DEFAULT_TABLE)
    }

    /// Store location after applying the persistence switch and defaults.
    pub fn resolved_store_uri(&self) -> Result<StoreUri> {
        if !self.persistent {
            return Ok(StoreUri::Memory);
        }

        match &self.store_uri {
            Some(uri) => uri.parse(),
            None => Ok(StoreUri::Sqlite(default_store_path(&self.rule_id))),
        }
    }
}

fn validate_expiry(expiry: &Duration) -> std::result::Result<(), ValidationError> {
    if expiry.is_zero() {
        return Err(ValidationError::new("lock_expiry_must_be_positive"));
    }
    Ok(())
}

/// Accepts either a number of seconds or a humantime string such as "5s".
fn deserialize_expiry<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Expiry {
        Seconds(f64),
        Text(#[serde(with = "humantime_serde")] Duration),
    }

    match Expiry::deserialize(deserializer)? {
        Expiry::Seconds(secs) if secs.is_finite() && secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
        Expiry::Seconds(secs) => Err(serde::de::Error::custom(format!(
            "lock expiry must be a non-negative number of seconds, got {}",
            secs
        ))),
        Expiry::Text(duration) => Ok(duration),
    }
}

/// Service configuration, read from flags with environment fallbacks.
#[derive(Debug, Clone, Parser)]
#[command(name = "quota-throttler", version, about = "Per-entity quota throttling service")]
pub struct ServerConfig {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Log level for the quota_throttler target
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "THROTTLE_PER_HOUR")]
    pub per_hour: Option<u64>,

    #[arg(long, env = "THROTTLE_PER_DAY")]
    pub per_day: Option<u64>,

    #[arg(long, env = "THROTTLE_PERSISTENT", default_value_t = true, action = clap::ArgAction::Set)]
    pub persistent: bool,

    #[arg(long, env = "THROTTLE_RULE_ID", default_value = DEFAULT_RULE_ID)]
    pub rule_id: String,

    /// sqlite:<path>, redis://host[:port][/db] or memory:
    #[arg(long, env = "THROTTLE_STORE_URI")]
    pub store_uri: Option<String>,

    #[arg(long, env = "THROTTLE_STORE_TABLE")]
    pub store_table: Option<String>,

    /// Lock staleness threshold, e.g. "5s" or "1500ms"
    #[arg(long, env = "THROTTLE_LOCK_EXPIRY", default_value = "5s", value_parser = humantime::parse_duration)]
    pub lock_expiry: Duration,
}

impl ServerConfig {
    /// Load configuration from `.env`, the environment and command-line flags
    pub fn load() -> std::result::Result<Self, clap::Error> {
        dotenv::dotenv().ok();
        Self::try_parse()
    }

    pub fn throttle_config(&self) -> ThrottleConfig {
        ThrottleConfig {
            per_hour: self.per_hour,
            per_day: self.per_day,
            persistent: self.persistent,
            rule_id: self.rule_id.clone(),
            store_uri: self.store_uri.clone(),
            store_table: self.store_table.clone(),
            lock_expiry: self.lock_expiry,
        }
    }
}

impl TryFrom<&ServerConfig> for ThrottleConfig {
    type Error = ThrottlerError;

    fn try_from(server: &ServerConfig) -> Result<Self> {
        let config = server.throttle_config();
        config.check()?;
        Ok(config)
    }
}
