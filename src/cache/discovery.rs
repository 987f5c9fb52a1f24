//! Subscription discovery state
//!
//! Per-backend record of which subscription names this instance has
//! announced and which ones it is mirroring. The announced set is cleared
//! periodically so names get announced again, letting peers that joined or
//! reconnected late find them.

use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::retry::wait_shutdown;
use super::SpanCell;

#[derive(Debug)]
pub struct Discovery {
    announced: DashSet<String>,
    mirrored: DashSet<String>,
    reset_period: Duration,
}

impl Discovery {
    pub fn new(reset_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            announced: DashSet::new(),
            mirrored: DashSet::new(),
            reset_period,
        })
    }

    /// True the first time a name is seen since the last reset
    pub fn should_announce(&self, subscription: &str) -> bool {
        self.announced.insert(subscription.to_string())
    }

    /// Forget an announcement that failed to go out
    pub fn retract(&self, subscription: &str) {
        self.announced.remove(subscription);
    }

    /// True when no listener exists yet for this name
    pub fn start_mirroring(&self, subscription: &str) -> bool {
        self.mirrored.insert(subscription.to_string())
    }

    /// Listener for this name has exited
    pub fn stop_mirroring(&self, subscription: &str) {
        self.mirrored.remove(subscription);
    }

    pub fn is_mirrored(&self, subscription: &str) -> bool {
        self.mirrored.contains(subscription)
    }

    pub fn mirrored_count(&self) -> usize {
        self.mirrored.len()
    }

    /// Clear the announced set, returning how many names it held
    pub fn reset_announcements(&self) -> usize {
        let count = self.announced.len();
        self.announced.clear();
        count
    }

    /// Spawn the periodic reset task; it runs until shutdown
    pub(crate) fn spawn_reset_task(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        span: SpanCell,
    ) -> JoinHandle<()> {
        let discovery = Arc::clone(self);
        let period = self.reset_period;

        tokio::spawn(span.follow(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cleared = discovery.reset_announcements();
                        debug!(cleared, "Cleared subscription announcements");
                    }
                    _ = wait_shutdown(&mut shutdown) => break,
                }
            }
            info!("Announcement reset task stopped");
        }))
    }
}

/// Validate a control-channel payload as a subscription name
pub fn parse_announcement(payload: &[u8]) -> Option<String> {
    let name = std::str::from_utf8(payload).ok()?.trim();
    let valid = !name.is_empty() && !name.chars().any(|c| c == '*' || c == '>');
    valid.then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheKind;

    #[test]
    fn test_announce_once_until_reset() {
        let discovery = Discovery::new(Duration::from_secs(60));
        assert!(discovery.should_announce("s1"));
        assert!(!discovery.should_announce("s1"));
        assert_eq!(discovery.reset_announcements(), 1);
        assert!(discovery.should_announce("s1"));
    }

    #[test]
    fn test_retract() {
        let discovery = Discovery::new(Duration::from_secs(60));
        assert!(discovery.should_announce("s1"));
        discovery.retract("s1");
        assert!(discovery.should_announce("s1"));
    }

    #[test]
    fn test_mirroring_dedup() {
        let discovery = Discovery::new(Duration::from_secs(60));
        assert!(discovery.start_mirroring("s1"));
        assert!(!discovery.start_mirroring("s1"));
        assert!(discovery.is_mirrored("s1"));
        // resetting announcements leaves listeners alone
        discovery.reset_announcements();
        assert_eq!(discovery.mirrored_count(), 1);
        discovery.stop_mirroring("s1");
        assert!(discovery.start_mirroring("s1"));
    }

    #[test]
    fn test_parse_announcement() {
        assert_eq!(parse_announcement(b"sub1"), Some("sub1".to_string()));
        assert_eq!(parse_announcement(b" sub1\n"), Some("sub1".to_string()));
        assert_eq!(parse_announcement(b""), None);
        assert_eq!(parse_announcement(b"my sub"), Some("my sub".to_string()));
        assert_eq!(parse_announcement(b"a.>"), None);
        assert_eq!(parse_announcement(&[0xff, 0xfe]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_task_clears_periodically() {
        let discovery = Discovery::new(Duration::from_secs(10));
        let (tx, rx) = watch::channel(false);
        let handle = discovery.spawn_reset_task(rx, SpanCell::new(CacheKind::Oc));

        assert!(discovery.should_announce("s1"));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(discovery.should_announce("s1"));

        tx.send_replace(true);
        handle.await.unwrap();
    }
}
