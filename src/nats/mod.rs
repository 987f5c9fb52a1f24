//! NATS connectivity shared by the `nats` and `jetstream` backends
//!
//! A thin client wrapper plus an embedded broker used when no external
//! address is configured.

pub mod client;
pub mod server;

pub use client::NatsClient;
pub use server::EmbeddedServer;
