//! gnmi-cache - replicated gNMI telemetry cache
//!
//! Stores the latest value of every leaf reported by gNMI subscriptions in a
//! path-indexed tree per subscription name, and keeps several instances in
//! sync by publishing accepted writes over a message bus.
//!
//! ## Backends
//!
//! - **oc**: local cache only
//! - **nats**: NATS pub/sub, with an embedded `nats-server` when no address is set
//! - **jetstream**: JetStream streams with bounded per-subscription history
//! - **redis**: Redis pub/sub
//!
//! All backends serve reads from the local engine, so a read never touches
//! the network.

pub mod cache;
pub mod config;
pub mod nats;
pub mod proto;
pub mod types;

pub use cache::{new_cache, Cache, ReadMode, ReadOptions, SubscriptionUpdate};
pub use config::{Args, CacheConfig, CacheKind};
pub use types::{CacheError, Result};
