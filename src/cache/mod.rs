//! Telemetry cache facade
//!
//! Every backend implements [`Cache`]. The local engine ([`LocalCache`]) is
//! always present; the replication backends wrap it, publish each accepted
//! local write and mirror the writes of their peers back into it.
//!
//! ## Backends
//!
//! - `oc`: local path-indexed cache only
//! - `nats`: NATS core pub/sub, embedded broker when no address is given
//! - `jetstream`: bounded per-subscription streams with replayable history
//! - `redis`: Redis `PUBLISH`/`PSUBSCRIBE`
//!
//! ## Discovery
//!
//! Subscription names are announced on a control channel the first time an
//! instance publishes them, and again after every announcement reset period.
//! Peers start one mirroring listener per announced name.

pub mod address;
pub mod discovery;
pub mod jetstream;
pub mod local;
pub mod nats;
pub mod redis;
pub mod retry;
pub mod tree;

pub use address::{address_for, split_notification, subscription_wildcard, target_address};
pub use discovery::Discovery;
pub use jetstream::JetStreamCache;
pub use local::LocalCache;
pub use nats::NatsCache;
pub use self::redis::RedisCache;
pub use tree::{QueryFilter, SubscriptionTree};

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, Span};

use crate::config::{CacheConfig, CacheKind};
use crate::proto::{Notification, Path, SubscribeResponse};
use crate::types::Result;

/// Control subject/channel carrying subscription name announcements
pub const CONTROL_CHANNEL: &str = "_gnmi_cache.subscriptions";

/// Buffer of each live-tail receiver
pub const SUBSCRIBE_BUFFER: usize = 1024;

/// How a read is meant to be served; only `Once` differs in the local engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    #[default]
    Once,
    Stream,
    Poll,
}

/// Read and subscribe query
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Restrict to one subscription name
    pub subscription: Option<String>,
    /// Target pattern, `*` for all
    pub target: String,
    /// Path prefixes to return; empty for everything
    pub paths: Vec<Path>,
    pub mode: ReadMode,
    pub sample_interval: Option<Duration>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            subscription: None,
            target: "*".to_string(),
            paths: Vec::new(),
            mode: ReadMode::Once,
            sample_interval: None,
        }
    }
}

impl ReadOptions {
    /// Everything under one subscription
    pub fn subscription(name: impl Into<String>) -> Self {
        Self {
            subscription: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_path(mut self, path: Path) -> Self {
        self.paths.push(path);
        self
    }

    pub fn matches_subscription(&self, name: &str) -> bool {
        self.subscription.as_deref().map_or(true, |s| s == name)
    }

    pub fn filter(&self) -> QueryFilter {
        QueryFilter::new(&self.target, &self.paths)
    }
}

/// One notification pushed to a live subscriber
#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub subscription: String,
    pub notification: Notification,
}

/// Uniform cache contract shared by the local engine and every backend
#[async_trait]
pub trait Cache: Send + Sync {
    /// Store a response under a subscription name and replicate it.
    /// Errors are logged, never returned.
    async fn write(&self, subscription: &str, response: &SubscribeResponse);

    /// Every visible notification, grouped by subscription name
    async fn read(&self, opts: &ReadOptions) -> Result<HashMap<String, Vec<Notification>>>;

    /// Live tail of accepted writes; closed immediately when disabled
    async fn subscribe(&self, opts: &ReadOptions) -> mpsc::Receiver<SubscriptionUpdate>;

    /// Cancel background tasks and close connections; idempotent
    fn stop(&self);

    /// Emit subsequent log events inside `span`
    fn set_span(&self, span: Span);
}

/// Build the backend selected by `config`
///
/// Configuration errors are returned here; connection problems are not, the
/// backends retry them in the background.
pub async fn new_cache(config: &CacheConfig) -> Result<Arc<dyn Cache>> {
    config.validate()?;
    info!(kind = %config.kind, "Creating cache");

    let cache: Arc<dyn Cache> = match config.kind {
        CacheKind::Oc => Arc::new(LocalCache::new(config)),
        CacheKind::Nats => Arc::new(NatsCache::start(config.clone())?),
        CacheKind::Jetstream => Arc::new(JetStreamCache::start(config.clone())?),
        CacheKind::Redis => Arc::new(RedisCache::start(config.clone())?),
    };
    Ok(cache)
}

/// Replaceable span used for logger injection
///
/// Clones share one slot, so a long-running task holding a clone picks up
/// a span set after it was spawned.
#[derive(Debug, Clone)]
pub(crate) struct SpanCell(Arc<RwLock<Span>>);

impl SpanCell {
    pub(crate) fn new(kind: CacheKind) -> Self {
        Self(Arc::new(RwLock::new(tracing::info_span!("cache", kind = %kind))))
    }

    pub(crate) fn get(&self) -> Span {
        match self.0.read() {
            Ok(span) => span.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set(&self, span: Span) {
        match self.0.write() {
            Ok(mut guard) => *guard = span,
            Err(poisoned) => *poisoned.into_inner() = span,
        }
    }

    /// Run `future` inside the span held by the cell at each poll
    pub(crate) fn follow<F: Future>(&self, future: F) -> FollowSpan<F> {
        FollowSpan {
            cell: self.clone(),
            future: Box::pin(future),
        }
    }
}

/// Future returned by [`SpanCell::follow`]
pub(crate) struct FollowSpan<F> {
    cell: SpanCell,
    future: Pin<Box<F>>,
}

impl<F: Future> Future for FollowSpan<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let span = this.cell.get();
        let _entered = span.enter();
        this.future.as_mut().poll(cx)
    }
}
