//! Shared types for gnmi-cache

pub mod error;

pub use error::{CacheError, Result};
