//! Fixed-delay, unbounded retry
//!
//! Connectivity failures in the replication layer are never surfaced to the
//! caller. Every connect, subscribe, stream and consumer call goes through
//! [`retry_forever`], which only gives up when the backend is stopped.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, warn};

use crate::types::Result;

/// Whether the shutdown signal has fired (or its sender is gone)
pub fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Resolve once shutdown is signalled
pub async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run `op` until it succeeds, sleeping `delay` between attempts
///
/// Returns `None` when shutdown fires before an attempt succeeds.
pub async fn retry_forever<T, F, Fut>(
    what: &str,
    delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
    mut op: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u64 = 0;
    loop {
        if is_shutdown(shutdown) {
            return None;
        }
        attempt += 1;

        tokio::select! {
            result = op() => match result {
                Ok(value) => return Some(value),
                Err(e) if e.is_connectivity() => {
                    warn!(attempt, error = %e, "{} failed, retrying in {:?}", what, delay)
                }
                Err(e) => error!(attempt, error = %e, "{} failed, retrying in {:?}", what, delay),
            },
            _ = wait_shutdown(shutdown) => return None,
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_shutdown(shutdown) => return None,
        }
    }
}
