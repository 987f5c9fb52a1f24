//! Broker-backed replication tests
//!
//! Need a running broker; run with
//! `NATS_URL=nats://127.0.0.1:4222 REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.
//! The NATS server must have JetStream enabled for the JetStream test.

use std::future::Future;
use std::time::Duration;

use gnmi_cache::cache::{JetStreamCache, NatsCache, RedisCache, CONTROL_CHANNEL};
use gnmi_cache::config::DeliverPolicy;
use gnmi_cache::proto::{parse_xpath, Notification, Path, SubscribeResponse, Update};
use gnmi_cache::{Cache, CacheConfig, CacheKind, ReadOptions};

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn unique_subscription() -> String {
    format!("sub-{}", uuid::Uuid::new_v4().simple())
}

fn config(kind: CacheKind, address: String) -> CacheConfig {
    CacheConfig {
        kind,
        address: Some(address),
        expiration_secs: 0,
        retry_delay_ms: 100,
        announce_reset_secs: 1,
        ..Default::default()
    }
}

fn response(target: &str, path: &str, value: i64) -> SubscribeResponse {
    SubscribeResponse::from_notification(Notification {
        timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap(),
        prefix: Some(Path::default().with_target(target)),
        update: vec![Update::new(parse_xpath(path).unwrap(), value)],
        ..Default::default()
    })
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Keep writing on `a` until `b` has the value; the first records can be
/// missed while `b` is still discovering the subscription
async fn converge(a: &dyn Cache, b: &dyn Cache, subscription: &str) -> bool {
    let opts = ReadOptions::subscription(subscription);
    eventually(|| async {
        a.write(subscription, &response("router1", "/system/state/uptime", 42))
            .await;
        let read = b.read(&opts).await.unwrap();
        read.get(subscription)
            .is_some_and(|n| n.iter().any(|n| n.target() == "router1"))
    })
    .await
}

#[tokio::test]
#[ignore]
async fn test_nats_convergence() {
    let url = env_or("NATS_URL", "nats://127.0.0.1:4222");
    let a = NatsCache::start(config(CacheKind::Nats, url.clone())).unwrap();
    let b = NatsCache::start(config(CacheKind::Nats, url)).unwrap();
    assert!(eventually(|| async { a.is_connected().await && b.is_connected().await }).await);

    let subscription = unique_subscription();
    assert!(converge(&a, &b, &subscription).await);
    assert!(b.mirrored_count() >= 1);

    a.stop();
    b.stop();
}

#[tokio::test]
#[ignore]
async fn test_jetstream_convergence_and_bounded_retention() {
    let url = env_or("NATS_URL", "nats://127.0.0.1:4222");
    let subscription = unique_subscription();
    let bounded = CacheConfig {
        max_msgs_per_subscription: 5,
        ..config(CacheKind::Jetstream, url.clone())
    };
    let a = JetStreamCache::start(bounded.clone()).unwrap();
    let b = JetStreamCache::start(bounded).unwrap();
    assert!(eventually(|| async { a.is_connected().await && b.is_connected().await }).await);

    assert!(converge(&a, &b, &subscription).await);

    for i in 0..20 {
        a.write(
            &subscription,
            &response("router1", &format!("/interfaces/interface[name=eth{}]/state/mtu", i), 1500),
        )
        .await;
    }

    let client = async_nats::connect(url.as_str()).await.unwrap();
    let js = async_nats::jetstream::new(client);
    let mut stream = js
        .get_stream(gnmi_cache::cache::jetstream::stream_name(&subscription))
        .await
        .unwrap();
    let info = stream.info().await.unwrap();
    assert!(info.state.messages <= 5, "stream holds {}", info.state.messages);

    // a late joiner replaying from the start sees only the retained tail
    let replay = JetStreamCache::start(CacheConfig {
        deliver_policy: DeliverPolicy::All,
        max_msgs_per_subscription: 5,
        ..config(CacheKind::Jetstream, url.clone())
    })
    .unwrap();
    assert!(eventually(|| replay.is_connected()).await);

    let client = async_nats::connect(url.as_str()).await.unwrap();
    let opts = ReadOptions::subscription(subscription.as_str());
    let replayed = eventually(|| async {
        // the control subject is how peers learn names; no write needed
        client
            .publish(CONTROL_CHANNEL, subscription.clone().into())
            .await
            .unwrap();
        client.flush().await.unwrap();
        let read = replay.read(&opts).await.unwrap();
        read.get(&subscription).is_some_and(|n| n.len() >= 5)
    })
    .await;
    assert!(replayed);

    let read = replay.read(&opts).await.unwrap();
    let mut leaves: Vec<String> = read[&subscription]
        .iter()
        .filter_map(|n| n.update.first()?.path.as_ref().map(|p| p.to_xpath()))
        .collect();
    leaves.sort();
    let mut expected: Vec<String> = (15..20)
        .map(|i| format!("/interfaces/interface[name=eth{}]/state/mtu", i))
        .collect();
    expected.sort();
    assert_eq!(leaves, expected);

    a.stop();
    b.stop();
    replay.stop();
}

#[tokio::test]
#[ignore]
async fn test_redis_convergence() {
    let url = env_or("REDIS_URL", "redis://127.0.0.1:6379");
    let a = RedisCache::start(config(CacheKind::Redis, url.clone())).unwrap();
    let b = RedisCache::start(config(CacheKind::Redis, url)).unwrap();
    assert!(eventually(|| async { a.is_connected().await && b.is_connected().await }).await);

    let subscription = unique_subscription();
    assert!(converge(&a, &b, &subscription).await);

    a.stop();
    b.stop();
}
