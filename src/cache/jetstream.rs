//! JetStream replication with bounded retention
//!
//! Each subscription name gets its own in-memory stream over
//! `<subscription>.>`, bounded by message count, bytes and age, discarding
//! the oldest records first. Writes are split into single-field records and
//! published under their full path address, so the stream holds recent
//! history per leaf. Discovery reuses the core NATS control subject.

use async_nats::jetstream::{self, consumer::PullConsumer, stream::Stream};
use async_trait::async_trait;
use dashmap::DashSet;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn, Instrument, Span};

use super::address::{address_for, sanitize, split_notification, subscription_wildcard};
use super::discovery::Discovery;
use super::local::LocalCache;
use super::nats::{announce, apply_record, connect, control_loop, embedded_server};
use super::retry::{retry_forever, wait_shutdown};
use super::{Cache, ReadOptions, SpanCell, SubscriptionUpdate};
use crate::config::{CacheConfig, CacheKind, DeliverPolicy};
use crate::nats::client::origin_headers;
use crate::nats::{EmbeddedServer, NatsClient};
use crate::proto::{encode_record, Notification, SubscribeResponse};
use crate::types::{CacheError, Result};

/// Prefix of every stream this cache creates
pub const STREAM_PREFIX: &str = "GNMI_CACHE_";

/// Prefix of durable consumer names
pub const CONSUMER_NAME_PREFIX: &str = "gnmi_cache";

/// Idle time after which the server removes a consumer; every start uses a
/// fresh instance id, so consumers of stopped instances are never reused
pub const CONSUMER_INACTIVE_THRESHOLD: Duration = Duration::from_secs(300);

/// JetStream-replicated cache
pub struct JetStreamCache {
    inner: Arc<Inner>,
}

struct Inner {
    local: LocalCache,
    config: CacheConfig,
    instance_id: String,
    client: RwLock<Option<NatsClient>>,
    /// Subscriptions whose stream is known to exist
    streams: DashSet<String>,
    discovery: Arc<Discovery>,
    shutdown_tx: watch::Sender<bool>,
    server: Option<EmbeddedServer>,
    span: SpanCell,
}

/// Stream name for a subscription; stream names cannot hold `.`, `*`, `>`,
/// path separators or whitespace
pub fn stream_name(subscription: &str) -> String {
    let token: String = sanitize(subscription)
        .chars()
        .map(|c| match c {
            '*' | '>' | '/' | '\\' => '_',
            c => c,
        })
        .collect();
    format!("{}{}", STREAM_PREFIX, token)
}

/// Bounded, discard-oldest stream for one subscription
pub fn stream_config(subscription: &str, config: &CacheConfig) -> jetstream::stream::Config {
    jetstream::stream::Config {
        name: stream_name(subscription),
        subjects: vec![subscription_wildcard(subscription)],
        max_messages: config.max_msgs_per_subscription,
        max_bytes: config.max_bytes,
        max_age: config.max_age(),
        discard: jetstream::stream::DiscardPolicy::Old,
        storage: jetstream::stream::StorageType::Memory,
        ..Default::default()
    }
}

/// Durable, explicitly acknowledged consumer private to one instance
pub fn consumer_config(
    subscription: &str,
    instance_id: &str,
    policy: DeliverPolicy,
) -> jetstream::consumer::pull::Config {
    let durable = format!("{}_{}_{}", CONSUMER_NAME_PREFIX, stream_name(subscription), instance_id);
    jetstream::consumer::pull::Config {
        durable_name: Some(durable),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        deliver_policy: match policy {
            DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
            DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
        },
        filter_subject: subscription_wildcard(subscription),
        inactive_threshold: CONSUMER_INACTIVE_THRESHOLD,
        ..Default::default()
    }
}

impl JetStreamCache {
    /// Create the cache and spawn its connection and discovery tasks
    pub fn start(config: CacheConfig) -> Result<Self> {
        let server = embedded_server(&config, true)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            local: LocalCache::new(&config),
            discovery: Discovery::new(config.announce_reset()),
            instance_id: uuid::Uuid::new_v4().to_string(),
            client: RwLock::new(None),
            streams: DashSet::new(),
            shutdown_tx,
            server,
            span: SpanCell::new(CacheKind::Jetstream),
            config,
        });

        inner.discovery.spawn_reset_task(shutdown_rx, inner.span.clone());
        tokio::spawn(inner.span.follow(run(Arc::clone(&inner))));

        info!(
            instance = %inner.instance_id,
            max_msgs = inner.config.max_msgs_per_subscription,
            max_bytes = inner.config.max_bytes,
            "JetStream cache started"
        );
        Ok(Self { inner })
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.client.read().await.is_some()
    }
}

async fn run(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();

    if let Some(client) = connect(
        &inner.config,
        inner.server.as_ref(),
        &inner.instance_id,
        &mut shutdown,
    )
    .await
    {
        *inner.client.write().await = Some(client.clone());

        let spawner = Arc::clone(&inner);
        control_loop(
            &client,
            &inner.discovery,
            inner.config.retry_delay(),
            &mut shutdown,
            move |name| spawn_consumer(&spawner, name),
        )
        .await;
    }

    inner.client.write().await.take();
    if let Some(server) = &inner.server {
        server.shutdown().await;
    }
    info!("JetStream cache stopped");
}

fn spawn_consumer(inner: &Arc<Inner>, subscription: String) {
    let inner = Arc::clone(inner);
    let span = inner.span.clone();
    tokio::spawn(span.follow(async move {
        consume(&inner, &subscription).await;
        inner.discovery.stop_mirroring(&subscription);
    }));
}

async fn consume(inner: &Inner, subscription: &str) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let delay = inner.config.retry_delay();
    let name = stream_name(subscription);

    loop {
        let Some(client) = inner.client.read().await.clone() else {
            return;
        };
        let js = client.jetstream();

        let Some(stream) = retry_forever("stream lookup", delay, &mut shutdown, || {
            let (js, name) = (&js, &name);
            async move {
                js.get_stream(name)
                    .await
                    .map_err(|e| CacheError::Nats(format!("Stream {} unavailable: {}", name, e)))
            }
        })
        .await
        else {
            return;
        };

        let Some(consumer) = retry_forever("consumer create", delay, &mut shutdown, || {
            ensure_consumer(&stream, subscription, &inner.instance_id, inner.config.deliver_policy)
        })
        .await
        else {
            return;
        };

        let Some(mut messages) = retry_forever("consumer messages", delay, &mut shutdown, || {
            let consumer = &consumer;
            async move {
                consumer
                    .messages()
                    .await
                    .map_err(|e| CacheError::Nats(format!("Failed to open message stream: {}", e)))
            }
        })
        .await
        else {
            return;
        };
        info!(subscription, stream = %name, "Consuming subscription stream");

        loop {
            tokio::select! {
                msg = messages.next() => match msg {
                    Some(Ok(msg)) => {
                        // ack first, a malformed record would otherwise be redelivered forever
                        if let Err(e) = msg.ack().await {
                            warn!(subscription, error = %e, "Ack failed");
                        }
                        apply_record(
                            &inner.local,
                            &inner.instance_id,
                            subscription,
                            msg.headers.as_ref(),
                            &msg.payload,
                        )
                        .await;
                    }
                    Some(Err(e)) => warn!(subscription, error = %e, "Error receiving record"),
                    None => {
                        warn!(subscription, "Consumer stream ended, recreating");
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

async fn ensure_consumer(
    stream: &Stream,
    subscription: &str,
    instance_id: &str,
    policy: DeliverPolicy,
) -> Result<PullConsumer> {
    let config = consumer_config(subscription, instance_id, policy);
    let durable = config.durable_name.clone().unwrap_or_default();
    let consumer = stream
        .get_or_create_consumer(&durable, config)
        .await
        .map_err(|e| CacheError::Nats(format!("Failed to create consumer: {}", e)))?;
    debug!(consumer = %durable, "Using consumer");
    Ok(consumer)
}

impl Inner {
    /// Create the subscription's stream once, retrying until it exists
    async fn ensure_stream(&self, js: &jetstream::Context, subscription: &str) -> bool {
        if self.streams.contains(subscription) {
            return true;
        }
        let mut shutdown = self.shutdown_tx.subscribe();
        let config = stream_config(subscription, &self.config);
        let created = retry_forever(
            "stream create",
            self.config.retry_delay(),
            &mut shutdown,
            || {
                let config = config.clone();
                async move {
                    js.get_or_create_stream(config)
                        .await
                        .map_err(|e| CacheError::Nats(format!("Failed to create stream: {}", e)))
                }
            },
        )
        .await;

        match created {
            Some(_) => {
                info!(subscription, stream = %config.name, "Using stream");
                self.streams.insert(subscription.to_string());
                true
            }
            None => false,
        }
    }

    async fn publish(&self, js: &jetstream::Context, subject: String, notification: &Notification) -> Result<()> {
        let ack = js
            .publish_with_headers(subject, origin_headers(&self.instance_id), encode_record(notification))
            .await
            .map_err(|e| CacheError::Nats(format!("Failed to publish record: {}", e)))?;
        ack.await
            .map_err(|e| CacheError::Nats(format!("Failed to confirm publish: {}", e)))?;
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
        let Some(client) = self.client.read().await.clone() else {
            debug!(subscription, "Not connected yet, write kept local");
            return;
        };
        let js = client.jetstream();
        if !self.ensure_stream(&js, subscription).await {
            return;
        }

        let target = accepted.target().to_string();
        let mut published = 0usize;
        for fragment in split_notification(&accepted) {
            let subject = address_for(subscription, &target, &fragment);
            match tokio::time::timeout(client.timeout(), self.publish(&js, subject.clone(), &fragment)).await {
                Ok(Ok(())) => published += 1,
                Ok(Err(e)) => warn!(subscription, subject = %subject, error = %e, "Replication publish failed"),
                Err(_) => warn!(subscription, subject = %subject, "Replication publish timed out"),
            }
        }

        if published > 0 {
            announce(&client, &self.discovery, subscription).await;
        }
    }
}

#[async_trait]
impl Cache for JetStreamCache {
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

impl Drop for JetStreamCache {
    fn drop(&mut self) {
        self.inner.shutdown_tx.send_replace(true);
    }
}
