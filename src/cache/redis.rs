//! Redis pub/sub replication
//!
//! Writes are published whole with `PUBLISH <subscription>.<target>` and
//! subscription names are announced on the control channel. Peers
//! `PSUBSCRIBE <subscription>.*` for each announced name. Redis messages
//! carry no headers, so an instance also receives its own records; merging
//! them again is harmless since the local engine is last-write-wins.

use async_trait::async_trait;
use futures_util::StreamExt;
use ::redis::aio::{MultiplexedConnection, PubSub};
use ::redis::{AsyncCommands, Client, ConnectionInfo, IntoConnectionInfo};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tracing::{debug, info, warn, Instrument, Span};

use super::address::{sanitize, target_address};
use super::discovery::{parse_announcement, Discovery};
use super::local::LocalCache;
use super::nats::apply_record;
use super::retry::{retry_forever, wait_shutdown};
use super::{Cache, ReadOptions, SpanCell, SubscriptionUpdate, CONTROL_CHANNEL};
use crate::config::{CacheConfig, CacheKind};
use crate::proto::{encode_record, Notification, SubscribeResponse};
use crate::types::{CacheError, Result};

/// Redis-replicated cache
pub struct RedisCache {
    inner: Arc<Inner>,
}

struct Inner {
    local: LocalCache,
    config: CacheConfig,
    client: Client,
    /// Publishing connection, installed once connected
    conn: RwLock<Option<MultiplexedConnection>>,
    /// Signalled by a write whose publish lost the connection
    reconnect: Notify,
    discovery: Arc<Discovery>,
    shutdown_tx: watch::Sender<bool>,
    span: SpanCell,
}

/// Connection info from the configured address and credentials
///
/// A bare `host:port` gets the `redis://` scheme.
pub fn connection_info(config: &CacheConfig) -> Result<ConnectionInfo> {
    let address = config
        .address()
        .ok_or_else(|| CacheError::Config("redis cache requires an address".to_string()))?;
    let url = if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{}", address)
    };

    let mut info = url
        .as_str()
        .into_connection_info()
        .map_err(|e| CacheError::Config(format!("invalid redis address {}: {}", address, e)))?;
    if let Some(user) = &config.username {
        info.redis.username = Some(user.clone());
    }
    if let Some(pass) = &config.password {
        info.redis.password = Some(pass.clone());
    }
    Ok(info)
}

/// Pattern matching every channel of a subscription
///
/// Glob metacharacters in the name are escaped so they match literally.
pub fn subscription_pattern(subscription: &str) -> String {
    let mut pattern = String::new();
    for c in sanitize(subscription).chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str(".*");
    pattern
}

impl RedisCache {
    /// Create the cache and spawn its connection and discovery tasks
    pub fn start(config: CacheConfig) -> Result<Self> {
        let client = Client::open(connection_info(&config)?)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            local: LocalCache::new(&config),
            discovery: Discovery::new(config.announce_reset()),
            client,
            conn: RwLock::new(None),
            reconnect: Notify::new(),
            shutdown_tx,
            span: SpanCell::new(CacheKind::Redis),
            config,
        });

        inner.discovery.spawn_reset_task(shutdown_rx, inner.span.clone());
        tokio::spawn(inner.span.follow(run_connection(Arc::clone(&inner))));
        tokio::spawn(inner.span.follow(run_control(Arc::clone(&inner))));

        info!("Redis cache started");
        Ok(Self { inner })
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.conn.read().await.is_some()
    }

    pub fn mirrored_count(&self) -> usize {
        self.inner.discovery.mirrored_count()
    }
}

impl Inner {
    async fn connect(&self) -> Result<MultiplexedConnection> {
        let conn = tokio::time::timeout(
            self.config.timeout(),
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| CacheError::Redis("connect timed out".to_string()))??;
        Ok(conn)
    }

    /// Pub/sub connection subscribed to a channel or pattern
    async fn pubsub(&self, channel: &str, pattern: bool) -> Result<PubSub> {
        let mut pubsub = tokio::time::timeout(self.config.timeout(), self.client.get_async_pubsub())
            .await
            .map_err(|_| CacheError::Redis("pubsub connect timed out".to_string()))??;
        if pattern {
            pubsub.psubscribe(channel).await?;
        } else {
            pubsub.subscribe(channel).await?;
        }
        Ok(pubsub)
    }

    async fn publish(&self, conn: &mut MultiplexedConnection, channel: &str, payload: Vec<u8>) -> Result<()> {
        tokio::time::timeout(self.config.timeout(), conn.publish::<_, _, ()>(channel, payload))
            .await
            .map_err(|_| CacheError::Redis(format!("publish to {} timed out", channel)))??;
        Ok(())
    }

    async fn write(&self, subscription: &str, notification: &Notification) {
        let Some(accepted) = self.local.write_notification(subscription, notification).await
        else {
            return;
        };
        if self.local.is_stopped() {
            return;
        }
        let Some(mut conn) = self.conn.read().await.clone() else {
            debug!(subscription, "Not connected yet, write kept local");
            return;
        };

        let channel = target_address(subscription, accepted.target());
        if let Err(e) = self
            .publish(&mut conn, &channel, encode_record(&accepted).to_vec())
            .await
        {
            warn!(subscription, channel = %channel, error = %e, "Replication publish failed");
            self.reconnect.notify_one();
            return;
        }

        if self.discovery.should_announce(subscription) {
            match self
                .publish(&mut conn, CONTROL_CHANNEL, subscription.as_bytes().to_vec())
                .await
            {
                Ok(()) => debug!(subscription, "Announced subscription"),
                Err(e) => {
                    warn!(subscription, error = %e, "Announcement failed");
                    self.discovery.retract(subscription);
                }
            }
        }
    }
}

/// Keep a publishing connection installed, replacing it when a write fails
async fn run_connection(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let delay = inner.config.retry_delay();

    loop {
        let Some(conn) = retry_forever("Redis connect", delay, &mut shutdown, || inner.connect()).await
        else {
            break;
        };
        info!("Connected to Redis");
        *inner.conn.write().await = Some(conn);

        tokio::select! {
            _ = inner.reconnect.notified() => {
                warn!("Redis connection lost, reconnecting");
                inner.conn.write().await.take();
            }
            _ = wait_shutdown(&mut shutdown) => break,
        }
    }

    inner.conn.write().await.take();
    info!("Redis cache stopped");
}

/// Follow the control channel and start a mirror per announced name
async fn run_control(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let delay = inner.config.retry_delay();

    loop {
        let Some(pubsub) = retry_forever("control subscribe", delay, &mut shutdown, || {
            inner.pubsub(CONTROL_CHANNEL, false)
        })
        .await
        else {
            return;
        };
        info!("Listening for subscription announcements on {}", CONTROL_CHANNEL);
        let mut announcements = pubsub.into_on_message();

        loop {
            tokio::select! {
                msg = announcements.next() => match msg {
                    Some(msg) => match parse_announcement(msg.get_payload_bytes()) {
                        Some(name) => {
                            if inner.discovery.start_mirroring(&name) {
                                info!(subscription = %name, "Discovered subscription");
                                spawn_mirror(&inner, name);
                            }
                        }
                        None => warn!("Ignoring malformed subscription announcement"),
                    },
                    None => {
                        warn!("Control channel closed, resubscribing");
                        break;
                    }
                },
                _ = wait_shutdown(&mut shutdown) => return,
            }
        }
    }
}

fn spawn_mirror(inner: &Arc<Inner>, subscription: String) {
    let inner = Arc::clone(inner);
    let span = inner.span.clone();
    tokio::spawn(span.follow(async move {
        mirror(&inner, &subscription).await;
        inner.discovery.stop_mirroring(&subscription);
    }));
}

async fn mirror(inner: &Inner, subscription: &str) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let pattern = subscription_pattern(subscription);
    let delay = inner.config.retry_delay();

    loop {
        let Some(pubsub) = retry_forever("subscription psubscribe", delay, &mut shutdown, || {
            inner.pubsub(&pattern, true)
        })
        .await
        else {
            return;
        };
        info!(subscription, pattern = %pattern, "Mirroring subscription");
        let mut records = pubsub.into_on_message();

        loop {
            tokio::select! {
                msg = records.next() => match msg {
                    Some(msg) => {
                        apply_record(&inner.local, "", subscription, None, msg.get_payload_bytes()).await;
                    }
                    None => {
                        warn!(subscription, "Pattern subscription closed, resubscribing");
                        break;
                    }
                },
                _ = wait_shutdown(&mut shutdown) => return,
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_shutdown(&mut shutdown) => return,
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn write(&self, subscription: &str, response: &SubscribeResponse) {
        let Some(notification) = response.notification() else {
            return;
        };
        self.inner
            .write(subscription, notification)
            .instrument(self.inner.span.get())
            .await;
    }

    async fn read(&self, opts: &ReadOptions) -> Result<HashMap<String, Vec<Notification>>> {
        self.inner.local.read(opts).await
    }

    async fn subscribe(&self, opts: &ReadOptions) -> mpsc::Receiver<SubscriptionUpdate> {
        self.inner.local.subscribe(opts).await
    }

    fn stop(&self) {
        self.inner.local.stop();
        self.inner.shutdown_tx.send_replace(true);
    }

    fn set_span(&self, span: Span) {
        self.inner.local.set_span(span.clone());
        self.inner.span.set(span);
    }
}

impl Drop for RedisCache {
    fn drop(&mut self) {
        self.inner.shutdown_tx.send_replace(true);
    }
}
