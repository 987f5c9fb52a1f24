//! NATS client wrapper
//!
//! Provides connection setup with credentials, publish with a per-call
//! deadline, and JetStream context access. The underlying client reconnects
//! on its own once the first connection has succeeded.

use async_nats::{jetstream, Client, ConnectOptions, HeaderMap};
use bytes::Bytes;
use std::time::Duration;
use tracing::info;

use crate::config::CacheConfig;
use crate::types::{CacheError, Result};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Initial connection timeout, each attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Header naming the instance that published a record
pub const ORIGIN_HEADER: &str = "Gnmi-Cache-Origin";

/// NATS client wrapper with JetStream support
#[derive(Clone)]
pub struct NatsClient {
    /// Underlying NATS client
    client: Client,
    /// Deadline applied to each publish
    timeout: Duration,
}

impl NatsClient {
    /// Connect once; callers wrap this in a retry loop
    pub async fn connect(url: &str, config: &CacheConfig, name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(CONNECT_TIMEOUT);

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(url)
            .await
            .map_err(|e| CacheError::Nats(format!("Failed to connect: {}", e)))?;

        info!(name, "Connected to NATS at {}", url);

        Ok(Self {
            client,
            timeout: config.timeout(),
        })
    }

    /// JetStream context over this connection
    pub fn jetstream(&self) -> jetstream::Context {
        jetstream::new(self.client.clone())
    }

    /// Publish deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Publish a message to a subject
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        tokio::time::timeout(
            self.timeout,
            self.client.publish(subject.to_string(), payload),
        )
        .await
        .map_err(|_| CacheError::Nats(format!("Publish to {} timed out", subject)))?
        .map_err(|e| CacheError::Nats(format!("Publish failed: {}", e)))
    }

    /// Publish a message tagged with the origin instance
    pub async fn publish_from(&self, origin: &str, subject: &str, payload: Bytes) -> Result<()> {
        tokio::time::timeout(
            self.timeout,
            self.client
                .publish_with_headers(subject.to_string(), origin_headers(origin), payload),
        )
        .await
        .map_err(|_| CacheError::Nats(format!("Publish to {} timed out", subject)))?
        .map_err(|e| CacheError::Nats(format!("Publish failed: {}", e)))
    }

    /// Subscribe to a subject
    pub async fn subscribe(&self, subject: &str) -> Result<async_nats::Subscriber> {
        self.client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| CacheError::Nats(format!("Subscribe to {} failed: {}", subject, e)))
    }

    /// Flush pending messages
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| CacheError::Nats(format!("Flush failed: {}", e)))
    }
}

/// Headers carrying the publishing instance id
pub fn origin_headers(origin: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ORIGIN_HEADER, origin);
    headers
}

/// Whether a received record was published by `instance`
pub fn is_own_record(headers: Option<&HeaderMap>, instance: &str) -> bool {
    headers
        .and_then(|h| h.get(ORIGIN_HEADER))
        .is_some_and(|v| v.as_str() == instance)
}
