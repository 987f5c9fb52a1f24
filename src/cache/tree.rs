//! Path-indexed tree for one subscription
//!
//! Every target owns a sub-tree whose nodes are keyed by the canonical
//! element string (`name[k=v]`). A leaf holds a single-update notification
//! with the timestamp and prefix of the write that produced it.

use std::collections::BTreeMap;

use crate::proto::{Notification, Path, PathElem};
use crate::types::Result;

#[derive(Debug, Default)]
struct Node {
    leaf: Option<Notification>,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn descend_mut(&mut self, elems: &[PathElem]) -> &mut Node {
        let mut node = self;
        for elem in elems {
            node = node.children.entry(elem.to_string()).or_default();
        }
        node
    }

    /// Drop the node at `elems` together with everything below it
    fn remove(&mut self, elems: &[PathElem]) -> usize {
        match elems.split_first() {
            None => {
                let removed = self.count();
                self.leaf = None;
                self.children.clear();
                removed
            }
            Some((head, [])) => self
                .children
                .remove(&head.to_string())
                .map(|n| n.count())
                .unwrap_or(0),
            Some((head, rest)) => {
                let key = head.to_string();
                let Some(child) = self.children.get_mut(&key) else {
                    return 0;
                };
                let removed = child.remove(rest);
                if child.leaf.is_none() && child.children.is_empty() {
                    self.children.remove(&key);
                }
                removed
            }
        }
    }

    fn count(&self) -> usize {
        self.leaf.is_some() as usize + self.children.values().map(Node::count).sum::<usize>()
    }

    fn walk<F>(&self, f: &mut F) -> Result<()>
    where
        F: FnMut(&Notification) -> Result<()>,
    {
        if let Some(leaf) = &self.leaf {
            f(leaf)?;
        }
        for child in self.children.values() {
            child.walk(f)?;
        }
        Ok(())
    }
}

/// Target and path filter applied during traversal
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// `*` (or empty) matches every target
    pub target: String,
    /// Leaf must sit at or below one of these; empty matches everything
    pub paths: Vec<Vec<PathElem>>,
}

impl QueryFilter {
    pub fn new(target: &str, paths: &[Path]) -> Self {
        Self {
            target: target.to_string(),
            paths: paths.iter().map(Path::elems).collect(),
        }
    }

    pub fn matches_target(&self, target: &str) -> bool {
        self.target.is_empty() || self.target == "*" || self.target == target
    }

    /// Whether a full leaf path falls under one of the filter paths
    pub fn matches_path(&self, leaf: &[PathElem]) -> bool {
        self.paths.is_empty() || self.paths.iter().any(|p| prefix_matches(p, leaf))
    }

    /// Whether any update or delete of a notification passes the filter
    pub fn matches_notification(&self, notification: &Notification) -> bool {
        if !self.matches_target(notification.target()) {
            return false;
        }
        if self.paths.is_empty() {
            return true;
        }
        let prefix = notification.prefix.as_ref().map(Path::elems).unwrap_or_default();
        let full = |p: &Path| {
            let mut elems = prefix.clone();
            elems.extend(p.elems());
            elems
        };
        notification
            .update
            .iter()
            .filter_map(|u| u.path.as_ref())
            .chain(notification.delete.iter())
            .any(|p| self.matches_path(&full(p)))
    }
}

fn prefix_matches(filter: &[PathElem], leaf: &[PathElem]) -> bool {
    if filter.len() > leaf.len() {
        return false;
    }
    filter.iter().zip(leaf).all(|(f, l)| {
        (f.name == "*" || f.name == l.name)
            && f.key.iter().all(|(k, v)| v == "*" || l.key.get(k) == Some(v))
    })
}

/// Full element path of a stored leaf: prefix followed by the update path
pub fn leaf_path(leaf: &Notification) -> Vec<PathElem> {
    let mut elems = leaf.prefix.as_ref().map(Path::elems).unwrap_or_default();
    if let Some(path) = leaf.update.first().and_then(|u| u.path.as_ref()) {
        elems.extend(path.elems());
    }
    elems
}

/// All targets stored under one subscription name
#[derive(Debug, Default)]
pub struct SubscriptionTree {
    targets: BTreeMap<String, Node>,
}

impl SubscriptionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_target(&self, target: &str) -> bool {
        self.targets.contains_key(target)
    }

    /// Number of stored leaves
    pub fn len(&self) -> usize {
        self.targets.values().map(Node::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge a notification whose updates all carry values
    ///
    /// Deletes are applied first, then each update overwrites its leaf.
    /// Timestamps are not compared: the last write wins.
    pub fn merge(&mut self, target: &str, notification: &Notification) -> usize {
        let root = self.targets.entry(target.to_string()).or_default();
        let prefix = notification.prefix.as_ref().map(Path::elems).unwrap_or_default();

        for delete in &notification.delete {
            let mut elems = prefix.clone();
            elems.extend(delete.elems());
            root.remove(&elems);
        }

        let mut written = 0;
        for update in &notification.update {
            let mut elems = prefix.clone();
            if let Some(path) = &update.path {
                elems.extend(path.elems());
            }
            let node = root.descend_mut(&elems);
            node.leaf = Some(Notification {
                timestamp: notification.timestamp,
                prefix: notification.prefix.clone(),
                update: vec![update.clone()],
                delete: Vec::new(),
                atomic: notification.atomic,
            });
            written += 1;
        }
        written
    }

    /// Visit every leaf passing the filter with a timestamp at or after
    /// `min_timestamp`. An error from the visitor stops the traversal.
    pub fn query<F>(&self, filter: &QueryFilter, min_timestamp: i64, mut visit: F) -> Result<()>
    where
        F: FnMut(Notification) -> Result<()>,
    {
        for (target, root) in &self.targets {
            if !filter.matches_target(target) {
                continue;
            }
            root.walk(&mut |leaf: &Notification| {
                if leaf.timestamp < min_timestamp {
                    return Ok(());
                }
                if !filter.matches_path(&leaf_path(leaf)) {
                    return Ok(());
                }
                visit(leaf.clone())
            })?;
        }
        Ok(())
    }
}
