//! Local cache engine
//!
//! One [`SubscriptionTree`] per subscription name, created on first write.
//! All structural mutation happens under a single engine-wide lock; reads
//! take it only long enough to snapshot the trees, then traverse each tree
//! in its own task and funnel results through one unbounded queue.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tracing::{debug, warn, Instrument, Span};

use super::retry::wait_shutdown;
use super::tree::{QueryFilter, SubscriptionTree};
use super::{Cache, ReadOptions, SpanCell, SubscriptionUpdate, SUBSCRIBE_BUFFER};
use crate::config::{CacheConfig, CacheKind};
use crate::proto::{Notification, SubscribeResponse};
use crate::types::{CacheError, Result};

/// Capacity of the live-tail broadcast before slow subscribers lag
const LIVE_TAIL_CAPACITY: usize = 4096;

type SharedTree = Arc<RwLock<SubscriptionTree>>;

/// In-memory, path-indexed cache
pub struct LocalCache {
    trees: Mutex<HashMap<String, SharedTree>>,
    expiration_ns: i64,
    live: Option<broadcast::Sender<SubscriptionUpdate>>,
    shutdown_tx: watch::Sender<bool>,
    span: SpanCell,
}

impl LocalCache {
    pub fn new(config: &CacheConfig) -> Self {
        let live = config
            .live_tail
            .then(|| broadcast::channel(LIVE_TAIL_CAPACITY).0);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            trees: Mutex::new(HashMap::new()),
            expiration_ns: i64::try_from(config.expiration().as_nanos()).unwrap_or(i64::MAX),
            live,
            shutdown_tx,
            span: SpanCell::new(CacheKind::Oc),
        }
    }

    /// Merge a notification, returning what was stored
    ///
    /// The returned notification has unset-value updates removed; `None`
    /// means nothing was stored (missing target or empty after filtering).
    pub async fn write_notification(
        &self,
        subscription: &str,
        notification: &Notification,
    ) -> Option<Notification> {
        let target = notification.target();
        if target.is_empty() {
            warn!(subscription, "Notification without target, dropping");
            return None;
        }

        let mut accepted = notification.clone();
        accepted.update.retain(|u| u.has_value());
        if accepted.is_empty() {
            debug!(subscription, target, "Empty notification, nothing to store");
            return None;
        }

        {
            let mut trees = self.trees.lock().await;
            let tree = trees.entry(subscription.to_string()).or_insert_with(|| {
                debug!(subscription, "Created subscription tree");
                Arc::new(RwLock::new(SubscriptionTree::new()))
            });
            let mut tree = tree.write().await;
            if !tree.has_target(target) {
                debug!(subscription, target, "New target");
            }
            tree.merge(target, &accepted);
        }

        if let Some(live) = &self.live {
            // no receivers is fine
            let _ = live.send(SubscriptionUpdate {
                subscription: subscription.to_string(),
                notification: accepted.clone(),
            });
        }

        Some(accepted)
    }

    /// Oldest timestamp still visible, or `i64::MIN` when expiration is off
    fn min_timestamp(&self) -> i64 {
        if self.expiration_ns == 0 {
            return i64::MIN;
        }
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        now.saturating_sub(self.expiration_ns)
    }

    /// Scatter/gather query across every matching subscription tree
    pub async fn query(&self, opts: &ReadOptions) -> Result<HashMap<String, Vec<Notification>>> {
        let snapshot: Vec<(String, SharedTree)> = {
            let trees = self.trees.lock().await;
            trees
                .iter()
                .filter(|(name, _)| opts.matches_subscription(name))
                .map(|(name, tree)| (name.clone(), Arc::clone(tree)))
                .collect()
        };

        let filter = Arc::new(opts.filter());
        let min_timestamp = self.min_timestamp();
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Notification)>();

        let collector = tokio::spawn(async move {
            let mut out: HashMap<String, Vec<Notification>> = HashMap::new();
            while let Some((name, notification)) = rx.recv().await {
                out.entry(name).or_default().push(notification);
            }
            out
        });

        let mut traversals = Vec::with_capacity(snapshot.len());
        for (name, tree) in snapshot {
            let tx = tx.clone();
            let filter = Arc::clone(&filter);
            traversals.push(tokio::spawn(async move {
                let tree = tree.read().await;
                let result = tree.query(&filter, min_timestamp, |n| {
                    tx.send((name.clone(), n))
                        .map_err(|_| CacheError::Query("result queue closed".into()))
                });
                (name, result)
            }));
        }
        drop(tx);

        for traversal in traversals {
            match traversal.await {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => warn!(subscription = %name, error = %e, "Query failed"),
                Err(e) => warn!(error = %e, "Query task failed"),
            }
        }

        Ok(collector.await?)
    }

    /// Live tail of accepted writes matching `opts`
    pub fn live_tail(&self, opts: &ReadOptions) -> mpsc::Receiver<SubscriptionUpdate> {
        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        let Some(live) = &self.live else {
            return rx;
        };

        let mut updates = live.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        let filter: QueryFilter = opts.filter();
        let opts = opts.clone();

        tokio::spawn(self.span.follow(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Ok(update) => {
                            if !opts.matches_subscription(&update.subscription)
                                || !filter.matches_notification(&update.notification)
                            {
                                continue;
                            }
                            if tx.send(update).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Live subscriber lagging, updates dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = wait_shutdown(&mut shutdown) => break,
                }
            }
            debug!("Live subscriber closed");
        }));
        rx
    }

    /// Number of subscription trees
    pub async fn subscription_count(&self) -> usize {
        self.trees.lock().await.len()
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

#[async_trait]
impl Cache for LocalCache {
    async fn write(&self, subscription: &str, response: &SubscribeResponse) {
        let Some(notification) = response.notification() else {
            return;
        };
        self.write_notification(subscription, notification)
            .instrument(self.span.get())
            .await;
    }

    async fn read(&self, opts: &ReadOptions) -> Result<HashMap<String, Vec<Notification>>> {
        self.query(opts).instrument(self.span.get()).await
    }

    async fn subscribe(&self, opts: &ReadOptions) -> mpsc::Receiver<SubscriptionUpdate> {
        self.live_tail(opts)
    }

    fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn set_span(&self, span: Span) {
        self.span.set(span);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::address::split_notification;
    use crate::proto::{parse_xpath, Path, TypedValue, Update};
    use std::time::Duration;

    fn now() -> i64 {
        chrono::Utc::now().timestamp_nanos_opt().unwrap()
    }

    fn notif(target: &str, ts: i64, updates: &[(&str, i64)]) -> Notification {
        Notification {
            timestamp: ts,
            prefix: Some(Path::default().with_target(target)),
            update: updates
                .iter()
                .map(|(p, v)| Update::new(parse_xpath(p).unwrap(), *v))
                .collect(),
            ..Default::default()
        }
    }

    fn values(read: &HashMap<String, Vec<Notification>>, sub: &str) -> Vec<(String, String, i64)> {
        let mut out: Vec<_> = read
            .get(sub)
            .into_iter()
            .flatten()
            .map(|n| {
                let u = &n.update[0];
                let value = match u.val.as_ref().and_then(|v| v.value.clone()) {
                    Some(crate::proto::typed_value::Value::IntVal(i)) => i,
                    _ => panic!("unexpected value"),
                };
                (n.target().to_string(), u.path.as_ref().unwrap().to_xpath(), value)
            })
            .collect();
        out.sort();
        out
    }

    fn cache(expiration: Duration) -> LocalCache {
        LocalCache::new(&CacheConfig::local(expiration))
    }

    #[tokio::test]
    async fn test_missing_target_rejected() {
        let cache = cache(Duration::ZERO);
        let n = notif("", now(), &[("/x", 1)]);
        assert!(cache.write_notification("s1", &n).await.is_none());
        assert_eq!(cache.subscription_count().await, 0);
        assert!(cache.query(&ReadOptions::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unset_values_elided() {
        let cache = cache(Duration::ZERO);
        let n = Notification {
            timestamp: now(),
            prefix: Some(Path::default().with_target("t1")),
            update: vec![
                Update {
                    path: Some(parse_xpath("/x").unwrap()),
                    val: None,
                    duplicates: 0,
                },
                Update {
                    path: Some(parse_xpath("/y").unwrap()),
                    val: Some(TypedValue::default()),
                    duplicates: 0,
                },
            ],
            ..Default::default()
        };
        assert!(cache.write_notification("s1", &n).await.is_none());
        assert!(cache.query(&ReadOptions::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_unset_values_filtered() {
        let cache = cache(Duration::ZERO);
        let mut n = notif("t1", now(), &[("/x", 1)]);
        n.update.push(Update {
            path: Some(parse_xpath("/y").unwrap()),
            val: None,
            duplicates: 0,
        });
        let stored = cache.write_notification("s1", &n).await.unwrap();
        assert_eq!(stored.update.len(), 1);
        let read = cache.query(&ReadOptions::default()).await.unwrap();
        assert_eq!(values(&read, "s1"), vec![("t1".into(), "/x".into(), 1)]);
    }

    #[tokio::test]
    async fn test_last_write_wins_ignores_timestamp() {
        // an older sample written later replaces a newer one
        let cache = cache(Duration::ZERO);
        let ts = now();
        cache.write_notification("s1", &notif("t1", ts, &[("/x", 1)])).await;
        cache.write_notification("s1", &notif("t1", ts - 1_000, &[("/x", 2)])).await;
        let read = cache.query(&ReadOptions::default()).await.unwrap();
        assert_eq!(values(&read, "s1"), vec![("t1".into(), "/x".into(), 2)]);
    }

    #[tokio::test]
    async fn test_expiration_applies_at_read_time() {
        let cache = cache(Duration::from_secs(60));
        let stale = now() - Duration::from_secs(600).as_nanos() as i64;
        assert!(cache
            .write_notification("s1", &notif("t1", stale, &[("/old", 1)]))
            .await
            .is_some());
        cache.write_notification("s1", &notif("t1", now(), &[("/new", 2)])).await;

        let read = cache.query(&ReadOptions::default()).await.unwrap();
        assert_eq!(values(&read, "s1"), vec![("t1".into(), "/new".into(), 2)]);

        // the stale entry is still resident
        let trees = cache.trees.lock().await;
        assert_eq!(trees["s1"].read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_expiration_disabled_returns_everything() {
        let cache = cache(Duration::ZERO);
        cache.write_notification("s1", &notif("t1", 1, &[("/ancient", 1)])).await;
        let read = cache.query(&ReadOptions::default()).await.unwrap();
        assert_eq!(read["s1"].len(), 1);
    }

    #[tokio::test]
    async fn test_read_merges_all_subscriptions() {
        let cache = cache(Duration::ZERO);
        for (sub, target) in [("s1", "t1"), ("s2", "t2"), ("s3", "t3")] {
            cache.write_notification(sub, &notif(target, now(), &[("/a", 1), ("/b", 2)])).await;
        }
        let read = cache.query(&ReadOptions::default()).await.unwrap();
        assert_eq!(read.len(), 3);
        assert!(read.values().all(|v| v.len() == 2));

        let read = cache
            .query(&ReadOptions::default().with_target("t2"))
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert!(read.contains_key("s2"));
    }

    #[tokio::test]
    async fn test_split_round_trip() {
        let original = Notification {
            timestamp: now(),
            prefix: Some(parse_xpath("/interfaces").unwrap().with_target("t1")),
            update: vec![
                Update::new(parse_xpath("/interface[name=eth0]/mtu").unwrap(), 1500i64),
                Update::new(parse_xpath("/interface[name=eth1]/mtu").unwrap(), 9000i64),
            ],
            delete: vec![parse_xpath("/interface[name=eth2]").unwrap()],
            atomic: false,
        };
        let seed = notif("t1", now(), &[("/interfaces/interface[name=eth2]/mtu", 1)]);

        let whole = cache(Duration::ZERO);
        whole.write_notification("s1", &seed).await;
        whole.write_notification("s1", &original).await;

        let pieces = cache(Duration::ZERO);
        pieces.write_notification("s1", &seed).await;
        for fragment in split_notification(&original) {
            pieces.write_notification("s1", &fragment).await;
        }

        let a = whole.query(&ReadOptions::default()).await.unwrap();
        let b = pieces.query(&ReadOptions::default()).await.unwrap();
        assert_eq!(values(&a, "s1"), values(&b, "s1"));
        assert_eq!(values(&a, "s1").len(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_disabled_is_closed() {
        let cache = cache(Duration::ZERO);
        let mut rx = cache.subscribe(&ReadOptions::default()).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_live_tail() {
        let config = CacheConfig {
            live_tail: true,
            expiration_secs: 0,
            ..Default::default()
        };
        let cache = LocalCache::new(&config);
        let mut rx = cache.subscribe(&ReadOptions::subscription("s1").with_target("t1")).await;

        cache.write_notification("s2", &notif("t1", now(), &[("/x", 1)])).await;
        cache.write_notification("s1", &notif("t9", now(), &[("/x", 1)])).await;
        cache.write_notification("s1", &notif("t1", now(), &[("/x", 3)])).await;

        let update = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.subscription, "s1");
        assert_eq!(update.notification.target(), "t1");

        cache.stop();
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let cache = cache(Duration::ZERO);
        cache.stop();
        cache.stop();
        assert!(cache.is_stopped());
    }

    #[test]
    fn test_write_through_trait_ignores_sync_response() {
        tokio_test::block_on(async {
            let cache = cache(Duration::ZERO);
            let sync = SubscribeResponse {
                response: Some(crate::proto::subscribe_response::Response::SyncResponse(true)),
            };
            cache.write("s1", &sync).await;
            assert_eq!(cache.subscription_count().await, 0);
        });
    }
}
