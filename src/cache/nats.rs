//! NATS pub/sub replication
//!
//! Every accepted write is published whole under `<subscription>.<target>`.
//! Peers learn subscription names from the control subject and mirror
//! `<subscription>.>` into their own local cache. Core NATS keeps no
//! history, so an instance joining late only sees future writes.
//!
//! ```text
//! disconnected -> connecting -> connected -> listener per subscription
//! ```

use async_trait::async_trait;
use async_nats::HeaderMap;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn, Instrument, Span};

use super::address::{subscription_wildcard, target_address};
use super::discovery::{parse_announcement, Discovery};
use super::local::LocalCache;
use super::retry::{retry_forever, wait_shutdown};
use super::{Cache, ReadOptions, SpanCell, SubscriptionUpdate, CONTROL_CHANNEL};
use crate::config::{CacheConfig, CacheKind};
use crate::nats::client::is_own_record;
use crate::nats::{EmbeddedServer, NatsClient};
use crate::proto::{decode_record, encode_record, Notification, SubscribeResponse};
use crate::types::Result;

/// NATS-replicated cache
pub struct NatsCache {
    inner: Arc<Inner>,
}

struct Inner {
    local: LocalCache,
    config: CacheConfig,
    instance_id: String,
    /// Installed by the connect task once connected
    client: RwLock<Option<NatsClient>>,
    discovery: Arc<Discovery>,
    shutdown_tx: watch::Sender<bool>,
    server: Option<EmbeddedServer>,
    span: SpanCell,
}

impl NatsCache {
    /// Create the cache and spawn its connection and discovery tasks
    pub fn start(config: CacheConfig) -> Result<Self> {
        let server = embedded_server(&config, false)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            local: LocalCache::new(&config),
            discovery: Discovery::new(config.announce_reset()),
            instance_id: uuid::Uuid::new_v4().to_string(),
            client: RwLock::new(None),
            shutdown_tx,
            server,
            span: SpanCell::new(CacheKind::Nats),
            config,
        });

        inner.discovery.spawn_reset_task(shutdown_rx, inner.span.clone());
        tokio::spawn(inner.span.follow(run(Arc::clone(&inner))));

        info!(instance = %inner.instance_id, "NATS cache started");
        Ok(Self { inner })
    }

    /// Id carried in the origin header of every record this instance publishes
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Whether the broker connection has been established
    pub async fn is_connected(&self) -> bool {
        self.inner.client.read().await.is_some()
    }

    /// Names this instance is mirroring from peers
    pub fn mirrored_count(&self) -> usize {
        self.inner.discovery.mirrored_count()
    }
}

/// Embedded broker when no address is configured
pub(crate) fn embedded_server(config: &CacheConfig, jetstream: bool) -> Result<Option<EmbeddedServer>> {
    match config.address() {
        Some(_) => Ok(None),
        None => EmbeddedServer::new(&config.nats_server_bin, &config.embedded_listen, jetstream)
            .map(Some),
    }
}

/// Boot the embedded broker if any, then connect, both retried forever
pub(crate) async fn connect(
    config: &CacheConfig,
    server: Option<&EmbeddedServer>,
    instance_id: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<NatsClient> {
    let delay = config.retry_delay();
    let url = match server {
        Some(server) => {
            if !server.start(delay, shutdown).await {
                return None;
            }
            server.url()
        }
        None => config.address().unwrap_or_default().to_string(),
    };

    let name = format!("gnmi-cache-{}", instance_id);
    retry_forever("NATS connect", delay, shutdown, || {
        NatsClient::connect(&url, config, &name)
    })
    .await
}

/// Follow the control subject, calling `on_discover` for each new name
pub(crate) async fn control_loop<F>(
    client: &NatsClient,
    discovery: &Discovery,
    delay: std::time::Duration,
    shutdown: &mut watch::Receiver<bool>,
    mut on_discover: F,
) where
    F: FnMut(String),
{
    loop {
        let Some(mut announcements) = retry_forever("control subscribe", delay, shutdown, || {
            client.subscribe(CONTROL_CHANNEL)
        })
        .await
        else {
            return;
        };
        info!("Listening for subscription announcements on {}", CONTROL_CHANNEL);

        loop {
            tokio::select! {
                msg = announcements.next() => match msg {
                    Some(msg) => match parse_announcement(&msg.payload) {
                        Some(name) => {
                            if discovery.start_mirroring(&name) {
                                info!(subscription = %name, "Discovered subscription");
                                on_discover(name);
                            }
                        }
                        None => warn!("Ignoring malformed subscription announcement"),
                    },
                    None => {
                        warn!("Control subscription closed, resubscribing");
                        break;
                    }
                },
                _ = wait_shutdown(shutdown) => return,
            }
        }
    }
}

/// Announce a subscription name unless already announced since the last reset
pub(crate) async fn announce(client: &NatsClient, discovery: &Discovery, subscription: &str) {
    if !discovery.should_announce(subscription) {
        return;
    }
    match client
        .publish(CONTROL_CHANNEL, Bytes::from(subscription.to_string()))
        .await
    {
        Ok(()) => debug!(subscription, "Announced subscription"),
        Err(e) => {
            warn!(subscription, error = %e, "Announcement failed");
            discovery.retract(subscription);
        }
    }
}

/// Decode a peer record and merge it into the local cache
pub(crate) async fn apply_record(
    local: &LocalCache,
    instance_id: &str,
    subscription: &str,
    headers: Option<&HeaderMap>,
    payload: &[u8],
) -> bool {
    if is_own_record(headers, instance_id) {
        return false;
    }
    match decode_record(payload) {
        Ok(notification) => local
            .write_notification(subscription, &notification)
            .await
            .is_some(),
        Err(e) => {
            warn!(subscription, error = %e, "Dropping malformed record");
            false
        }
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
            move |name| spawn_mirror(&spawner, name),
        )
        .await;

        if let Err(e) = client.flush().await {
            debug!(error = %e, "Flush on shutdown failed");
        }
    }

    inner.client.write().await.take();
    if let Some(server) = &inner.server {
        server.shutdown().await;
    }
    info!("NATS cache stopped");
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
    let subject = subscription_wildcard(subscription);
    let delay = inner.config.retry_delay();

    loop {
        let Some(client) = inner.client.read().await.clone() else {
            return;
        };
        let Some(mut records) =
            retry_forever("subscription subscribe", delay, &mut shutdown, || {
                client.subscribe(&subject)
            })
            .await
        else {
            return;
        };
        info!(subscription, subject = %subject, "Mirroring subscription");

        loop {
            tokio::select! {
                msg = records.next() => match msg {
                    Some(msg) => {
                        apply_record(
                            &inner.local,
                            &inner.instance_id,
                            subscription,
                            msg.headers.as_ref(),
                            &msg.payload,
                        )
                        .await;
                    }
                    None => {
                        warn!(subscription, "Subscription closed, resubscribing");
                        break;
                    }
                },
                _ = wait_shutdown(&mut shutdown) => return,
            }
        }
    }
}

impl Inner {
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

        let subject = target_address(subscription, accepted.target());
        if let Err(e) = client
            .publish_from(&self.instance_id, &subject, encode_record(&accepted))
            .await
        {
            warn!(subscription, subject = %subject, error = %e, "Replication publish failed");
            return;
        }
        announce(&client, &self.discovery, subscription).await;
    }
}

#[async_trait]
impl Cache for NatsCache {
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

impl Drop for NatsCache {
    fn drop(&mut self) {
        self.inner.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nats::client::origin_headers;
    use crate::proto::{parse_xpath, Path, Update};

    fn record(target: &str) -> Notification {
        Notification {
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap(),
            prefix: Some(Path::default().with_target(target)),
            update: vec![Update::new(parse_xpath("/x").unwrap(), 1i64)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_apply_record_mirrors_peer_writes() {
        let local = LocalCache::new(&CacheConfig::local(std::time::Duration::ZERO));
        let payload = encode_record(&record("t1"));
        let peer = origin_headers("peer");
        assert!(apply_record(&local, "me", "s1", Some(&peer), &payload).await);
        let read = local.query(&ReadOptions::subscription("s1")).await.unwrap();
        assert_eq!(read["s1"][0].target(), "t1");
    }

    #[tokio::test]
    async fn test_apply_record_skips_own_and_malformed() {
        let local = LocalCache::new(&CacheConfig::local(std::time::Duration::ZERO));
        let own = origin_headers("me");
        let payload = encode_record(&record("t1"));
        assert!(!apply_record(&local, "me", "s1", Some(&own), &payload).await);
        assert!(!apply_record(&local, "me", "s1", None, b"\x0a\xff").await);
        assert!(!apply_record(&local, "me", "s1", None, &encode_record(&record(""))).await);
        assert_eq!(local.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_write_stays_local_until_connected() {
        let config = CacheConfig {
            kind: CacheKind::Nats,
            // nothing listens here; the connect task keeps retrying
            address: Some("nats://127.0.0.1:1".into()),
            expiration_secs: 0,
            retry_delay_ms: 50,
            ..Default::default()
        };
        let cache = NatsCache::start(config).unwrap();
        cache
            .write("s1", &SubscribeResponse::from_notification(record("t1")))
            .await;
        assert!(!cache.is_connected().await);
        let read = cache.read(&ReadOptions::default()).await.unwrap();
        assert_eq!(read["s1"].len(), 1);
        cache.stop();
        cache.stop();
    }

    #[test]
    fn test_embedded_server_only_without_address() {
        let config = CacheConfig {
            kind: CacheKind::Nats,
            address: Some("nats://broker:4222".into()),
            ..Default::default()
        };
        assert!(embedded_server(&config, false).unwrap().is_none());
        let config = CacheConfig {
            kind: CacheKind::Nats,
            ..Default::default()
        };
        let server = embedded_server(&config, false).unwrap().unwrap();
        assert_eq!(server.url(), "nats://127.0.0.1:4222");
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_injected_span_reaches_connect_retries() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let config = CacheConfig {
            kind: CacheKind::Nats,
            address: Some("nats://127.0.0.1:1".into()),
            retry_delay_ms: 50,
            ..Default::default()
        };
        let cache = NatsCache::start(config).unwrap();
        cache.set_span(tracing::info_span!("injected"));
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        cache.stop();

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let retries: Vec<&str> = output
            .lines()
            .filter(|l| l.contains("NATS connect failed"))
            .collect();
        assert!(!retries.is_empty(), "no retry lines in:\n{}", output);
        assert!(retries.iter().all(|l| l.contains("injected")), "{}", output);
    }
}
