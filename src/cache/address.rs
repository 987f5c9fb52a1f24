//! Replication addressing and notification splitting
//!
//! Addresses are dot-delimited hierarchical names usable as NATS subjects
//! and Redis channels:
//!
//! ```text
//! <subscription>.<target>.<prefix segments>.<first update/delete segments>
//! ```
//!
//! A segment is the element name followed by its keys as `{key=value}`,
//! keys sorted. Dots inside a token become [`DOT_SUBSTITUTE`] and
//! whitespace becomes [`SPACE_SUBSTITUTE`] so one path element always maps
//! to exactly one token. The subscription name is sanitized the same way:
//! it is always the first token, so `a.b` never lands under `a.>`.
//! Announcements on the control channel carry the raw name.

use crate::proto::{Notification, PathElem};

/// Replaces `.` inside address tokens
pub const DOT_SUBSTITUTE: char = '^';

/// Replaces whitespace inside address tokens
pub const SPACE_SUBSTITUTE: char = '~';

/// Address of a whole notification for one target, used by backends that
/// publish without splitting
pub fn target_address(subscription: &str, target: &str) -> String {
    format!("{}.{}", sanitize(subscription), sanitize(target))
}

/// Wildcard covering every address under a subscription
pub fn subscription_wildcard(subscription: &str) -> String {
    format!("{}.>", sanitize(subscription))
}

/// Full address for a notification, keyed by its first update or delete path
pub fn address_for(subscription: &str, target: &str, notification: &Notification) -> String {
    let mut tokens = vec![sanitize(subscription), sanitize(target)];

    if let Some(prefix) = &notification.prefix {
        tokens.extend(prefix.elems().iter().map(segment));
    }

    let first = notification
        .update
        .first()
        .and_then(|u| u.path.as_ref())
        .or_else(|| notification.delete.first());
    if let Some(path) = first {
        tokens.extend(path.elems().iter().map(segment));
    }

    tokens.retain(|t| !t.is_empty());
    tokens.join(".")
}

/// Decompose a notification into one notification per update or delete
///
/// Each fragment keeps the timestamp, prefix and atomic flag. Deletes come
/// first, matching the order a single notification is applied in.
pub fn split_notification(notification: &Notification) -> Vec<Notification> {
    let shell = || Notification {
        timestamp: notification.timestamp,
        prefix: notification.prefix.clone(),
        update: Vec::new(),
        delete: Vec::new(),
        atomic: notification.atomic,
    };

    let deletes = notification.delete.iter().map(|d| {
        let mut n = shell();
        n.delete.push(d.clone());
        n
    });
    let updates = notification.update.iter().map(|u| {
        let mut n = shell();
        n.update.push(u.clone());
        n
    });
    deletes.chain(updates).collect()
}

fn segment(elem: &PathElem) -> String {
    let mut out = sanitize(&elem.name);
    // BTreeMap iterates in key order
    for (k, v) in &elem.key {
        out.push('{');
        out.push_str(&sanitize(k));
        out.push('=');
        out.push_str(&sanitize(v));
        out.push('}');
    }
    out
}

/// Single address token for a name that may hold dots or whitespace
pub fn sanitize(token: &str) -> String {
    token
        .chars()
        .map(|c| match c {
            '.' => DOT_SUBSTITUTE,
            c if c.is_whitespace() => SPACE_SUBSTITUTE,
            c => c,
        })
        .collect()
}
