//! Configuration for gnmi-cache
//!
//! CLI arguments and environment variable handling using clap, plus a
//! serde-deserialisable [`CacheConfig`] for callers that embed the cache and
//! load their configuration from a file.

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{CacheError, Result};

/// gnmi-cache - replicated gNMI telemetry cache
#[derive(Parser, Debug, Clone)]
#[command(name = "gnmi-cache")]
#[command(about = "Path-indexed gNMI telemetry cache replicated over NATS, JetStream or Redis")]
pub struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Seconds between cache content summaries in the log (0 disables)
    #[arg(long, env = "SUMMARY_INTERVAL_SECS", default_value = "30")]
    pub summary_interval_secs: u64,

    /// JSON file with a cache configuration; overrides the cache flags below
    #[arg(long, env = "CACHE_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Cache backend configuration
    #[command(flatten)]
    pub cache: CacheArgs,
}

/// Backend selection and connection flags
#[derive(Parser, Debug, Clone)]
pub struct CacheArgs {
    /// Cache backend
    #[arg(long = "cache-type", env = "CACHE_TYPE", value_enum, default_value = "oc")]
    pub kind: CacheKind,

    /// Broker/store address; NATS backends boot an embedded server when unset
    #[arg(long = "cache-address", env = "CACHE_ADDRESS")]
    pub address: Option<String>,

    /// Username (optional)
    #[arg(long = "cache-username", env = "CACHE_USERNAME")]
    pub username: Option<String>,

    /// Password (optional)
    #[arg(long = "cache-password", env = "CACHE_PASSWORD")]
    pub password: Option<String>,

    /// Per-publish timeout in milliseconds
    #[arg(long = "cache-timeout-ms", env = "CACHE_TIMEOUT_MS", default_value = "10000")]
    pub timeout_ms: u64,

    /// Entries older than this are hidden from reads (0 disables)
    #[arg(long = "cache-expiration-secs", env = "CACHE_EXPIRATION_SECS", default_value = "60")]
    pub expiration_secs: u64,

    /// JetStream: maximum messages retained per subscription stream
    #[arg(long = "cache-max-msgs-per-subscription", env = "CACHE_MAX_MSGS_PER_SUBSCRIPTION", default_value = "1000000")]
    pub max_msgs_per_subscription: i64,

    /// JetStream: maximum bytes retained per subscription stream
    #[arg(long = "cache-max-bytes", env = "CACHE_MAX_BYTES", default_value = "1073741824")]
    pub max_bytes: i64,

    /// JetStream: maximum record age in seconds (0 = unlimited)
    #[arg(long = "cache-max-age-secs", env = "CACHE_MAX_AGE_SECS", default_value = "0")]
    pub max_age_secs: u64,

    /// JetStream: where new consumers start reading
    #[arg(long = "cache-deliver-policy", env = "CACHE_DELIVER_POLICY", value_enum, default_value = "new")]
    pub deliver_policy: DeliverPolicy,

    /// Push accepted writes to live subscribers
    #[arg(long = "cache-live-tail", env = "CACHE_LIVE_TAIL", default_value = "false")]
    pub live_tail: bool,

    /// nats-server binary used for the embedded broker
    #[arg(long, env = "NATS_SERVER_BIN", default_value = "nats-server")]
    pub nats_server_bin: String,

    /// Listen address of the embedded broker
    #[arg(long, env = "EMBEDDED_NATS_LISTEN", default_value = "127.0.0.1:4222")]
    pub embedded_listen: String,
}

/// Replication backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// Local path-indexed cache only
    #[default]
    Oc,
    /// NATS core pub/sub, no retention
    Nats,
    /// NATS JetStream, bounded retention
    Jetstream,
    /// Redis pub/sub, no retention
    Redis,
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Oc => "oc",
            Self::Nats => "nats",
            Self::Jetstream => "jetstream",
            Self::Redis => "redis",
        })
    }
}

/// Where a JetStream consumer starts reading a subscription stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliverPolicy {
    /// Only records published after the consumer was created
    #[default]
    New,
    /// Everything still retained in the stream
    All,
}

/// Cache backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "type")]
    pub kind: CacheKind,
    pub address: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
    pub expiration_secs: u64,
    pub max_msgs_per_subscription: i64,
    pub max_bytes: i64,
    pub max_age_secs: u64,
    pub deliver_policy: DeliverPolicy,
    pub live_tail: bool,
    pub nats_server_bin: String,
    pub embedded_listen: String,
    /// Fixed delay between connection/stream/consumer attempts
    pub retry_delay_ms: u64,
    /// Period after which subscriptions are announced again
    pub announce_reset_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::Oc,
            address: None,
            username: None,
            password: None,
            timeout_ms: 10_000,
            expiration_secs: 60,
            max_msgs_per_subscription: 1_000_000,
            max_bytes: 1024 * 1024 * 1024, // 1 GiB
            max_age_secs: 0,
            deliver_policy: DeliverPolicy::New,
            live_tail: false,
            nats_server_bin: "nats-server".to_string(),
            embedded_listen: "127.0.0.1:4222".to_string(),
            retry_delay_ms: 2_000,
            announce_reset_secs: 60,
        }
    }
}

impl From<&CacheArgs> for CacheConfig {
    fn from(args: &CacheArgs) -> Self {
        Self {
            kind: args.kind,
            address: args.address.clone().filter(|a| !a.trim().is_empty()),
            username: args.username.clone(),
            password: args.password.clone(),
            timeout_ms: args.timeout_ms,
            expiration_secs: args.expiration_secs,
            max_msgs_per_subscription: args.max_msgs_per_subscription,
            max_bytes: args.max_bytes,
            max_age_secs: args.max_age_secs,
            deliver_policy: args.deliver_policy,
            live_tail: args.live_tail,
            nats_server_bin: args.nats_server_bin.clone(),
            embedded_listen: args.embedded_listen.clone(),
            ..Self::default()
        }
    }
}

impl CacheConfig {
    /// Local-only cache with the given expiration window
    pub fn local(expiration: Duration) -> Self {
        Self {
            expiration_secs: expiration.as_secs(),
            ..Self::default()
        }
    }

    /// Load from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CacheError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Zero disables read-time filtering
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn announce_reset(&self) -> Duration {
        Duration::from_secs(self.announce_reset_secs)
    }

    /// Configured address, ignoring blank strings
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref().map(str::trim).filter(|a| !a.is_empty())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(CacheError::Config("timeout must be greater than zero".into()));
        }
        if self.retry_delay_ms == 0 {
            return Err(CacheError::Config("retry delay must be greater than zero".into()));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(CacheError::Config(
                "username and password must be set together".into(),
            ));
        }

        match self.kind {
            CacheKind::Oc => {}
            CacheKind::Nats | CacheKind::Jetstream => {
                if self.address().is_none() && self.nats_server_bin.trim().is_empty() {
                    return Err(CacheError::Config(format!(
                        "{} cache needs an address or a nats-server binary",
                        self.kind
                    )));
                }
                if self.address().is_none() && self.embedded_listen.rsplit_once(':').is_none() {
                    return Err(CacheError::Config(format!(
                        "embedded listen address {} is not host:port",
                        self.embedded_listen
                    )));
                }
            }
            CacheKind::Redis => {
                if self.address().is_none() {
                    return Err(CacheError::Config("redis cache requires an address".into()));
                }
            }
        }

        if self.kind == CacheKind::Jetstream {
            if self.max_msgs_per_subscription == 0 {
                return Err(CacheError::Config(
                    "max-msgs-per-subscription must be positive or -1 for unlimited".into(),
                ));
            }
            if self.max_bytes == 0 {
                return Err(CacheError::Config(
                    "max-bytes must be positive or -1 for unlimited".into(),
                ));
            }
        }

        Ok(())
    }
}

impl Args {
    /// Effective cache configuration: the config file when given, else flags
    pub fn cache_config(&self) -> Result<CacheConfig> {
        let config = match &self.config_file {
            Some(path) => CacheConfig::from_file(path)?,
            None => CacheConfig::from(&self.cache),
        };
        config.validate()?;
        Ok(config)
    }
}
