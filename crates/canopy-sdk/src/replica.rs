//! Thread-safe replica handle.

use crate::error::{Result, SdkError};
use crate::subscription::SubscriptionHub;
use canopy_tree::{
    AccessPolicy, Action, MergeReport, NodeEvent, NodeId, NodeType, ReplicaId, Scalar,
    SyncReport, TidyReport, Tree, TreeError,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use ulid::Ulid;

/// Configuration for a replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Identity stamped on every local write.
    pub replica_id: ReplicaId,
    /// Check the tree shape after each merge and refuse results that fail.
    pub validate_after_merge: bool,
    /// Consult the access policy before local mutations.
    pub enforce_access: bool,
    /// Undelivered events buffered per subscriber.
    pub subscriber_capacity: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            replica_id: ReplicaId::new(format!("replica-{}", Ulid::new())),
            validate_after_merge: true,
            enforce_access: false,
            subscriber_capacity: 64,
        }
    }
}

/// Builder for replica configuration.
pub struct ReplicaConfigBuilder {
    config: ReplicaConfig,
}

impl ReplicaConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ReplicaConfig::default(),
        }
    }

    pub fn replica_id(mut self, id: impl Into<ReplicaId>) -> Self {
        self.config.replica_id = id.into();
        self
    }

    pub fn validate_after_merge(mut self, enabled: bool) -> Self {
        self.config.validate_after_merge = enabled;
        self
    }

    pub fn enforce_access(mut self, enabled: bool) -> Self {
        self.config.enforce_access = enabled;
        self
    }

    pub fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.config.subscriber_capacity = capacity;
        self
    }

    pub fn build(self) -> ReplicaConfig {
        self.config
    }
}

impl Default for ReplicaConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    config: ReplicaConfig,
    tree: RwLock<Tree>,
    policy: RwLock<AccessPolicy>,
    hub: Arc<SubscriptionHub>,
    closed: AtomicBool,
}

/// Access decision for one mutation, taken under the tree lock.
struct Gate<'a> {
    replica: &'a ReplicaId,
    policy: &'a AccessPolicy,
    enforce: bool,
}

impl Gate<'_> {
    fn check(&self, tree: &Tree, action: Action, node: &NodeId) -> Result<()> {
        if !self.enforce || self.policy.is_allowed(tree, self.replica, action, node) {
            return Ok(());
        }
        Err(SdkError::AccessDenied {
            replica: self.replica.clone(),
            action,
            node: node.clone(),
        })
    }
}

/// A replica of a canopy tree.
///
/// Cloning the handle is cheap; clones share the same tree. All access is
/// serialized through a read/write lock, and local mutations are stamped
/// with the configured replica id.
///
/// # Example
///
/// ```rust
/// use canopy_sdk::{Replica, ReplicaConfigBuilder};
///
/// let alice = Replica::new(ReplicaConfigBuilder::new().replica_id("alice").build());
/// let bob = Replica::new(ReplicaConfigBuilder::new().replica_id("bob").build());
///
/// alice.import_json(br#"{"title": "draft"}"#).unwrap();
/// bob.sync_with(&alice).unwrap();
/// bob.set_value("/title", "final").unwrap();
/// alice.sync_with(&bob).unwrap();
///
/// assert_eq!(alice.get("/title").unwrap(), serde_json::json!("final"));
/// ```
#[derive(Clone)]
pub struct Replica {
    inner: Arc<Inner>,
}

impl Replica {
    /// Create a replica holding an empty tree.
    pub fn new(config: ReplicaConfig) -> Self {
        Self::with_tree(config, Tree::new())
    }

    /// Wrap an existing tree.
    pub fn with_tree(config: ReplicaConfig, mut tree: Tree) -> Self {
        let hub = Arc::new(SubscriptionHub::new(config.subscriber_capacity));
        tree.set_event_sink(hub.clone());
        tracing::debug!(replica = %config.replica_id, nodes = tree.node_count(), "opened replica");
        Self {
            inner: Arc::new(Inner {
                config,
                tree: RwLock::new(tree),
                policy: RwLock::new(AccessPolicy::new()),
                hub,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Load a tree saved with [`Replica::save_to`] or [`Tree::save`].
    pub fn open(config: ReplicaConfig, path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let tree = Tree::load(&raw)?;
        Ok(Self::with_tree(config, tree))
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let saved = self.inner.tree.read().save()?;
        std::fs::write(path, saved)?;
        Ok(())
    }

    pub fn id(&self) -> &ReplicaId {
        &self.inner.config.replica_id
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.inner.config
    }

    /// Run `f` against the tree under a read lock.
    pub fn read<R>(&self, f: impl FnOnce(&Tree) -> R) -> R {
        f(&self.inner.tree.read())
    }

    /// A detached copy of the current tree.
    pub fn snapshot(&self) -> Tree {
        self.inner.tree.read().clone()
    }

    pub fn policy(&self) -> AccessPolicy {
        self.inner.policy.read().clone()
    }

    pub fn set_policy(&self, policy: AccessPolicy) {
        *self.inner.policy.write() = policy;
    }

    pub fn get(&self, path: &str) -> Result<Value> {
        Ok(self.inner.tree.read().get_value_by_path(path)?)
    }

    pub fn node_at(&self, path: &str) -> Result<NodeId> {
        let tree = self.inner.tree.read();
        Ok(tree.get_node_by_path(path)?.id().clone())
    }

    pub fn export_json(&self) -> Result<Vec<u8>> {
        Ok(self.inner.tree.read().export_json()?)
    }

    /// Import a JSON document under the root.
    pub fn import_json(&self, raw: &[u8]) -> Result<NodeId> {
        self.mutate(|tree, gate| {
            let root = tree.root_id().clone();
            gate.check(tree, Action::Add, &root)?;
            Ok(tree.import_json(raw, gate.replica)?)
        })
    }

    /// Import a JSON value under `parent`, see [`Tree::import_json_at`].
    pub fn import_json_at(
        &self,
        raw: &[u8],
        parent: &NodeId,
        label: &str,
        index: Option<usize>,
    ) -> Result<NodeId> {
        self.mutate(|tree, gate| {
            gate.check(tree, Action::Add, parent)?;
            Ok(tree.import_json_at(raw, Some(parent), label, index, gate.replica)?)
        })
    }

    pub fn create_node(&self, label: &str, node_type: NodeType, parent: &NodeId) -> Result<NodeId> {
        self.mutate(|tree, gate| {
            gate.check(tree, Action::Add, parent)?;
            Ok(tree.create_attached_node(label, node_type, parent, gate.replica)?)
        })
    }

    /// Overwrite the literal at `path`.
    pub fn set_value(&self, path: &str, value: impl Into<Scalar>) -> Result<()> {
        self.mutate(|tree, gate| {
            let id = tree.get_node_by_path(path)?.id().clone();
            gate.check(tree, Action::Modify, &id)?;
            Ok(tree.set_literal(&id, value, gate.replica)?)
        })
    }

    /// Set `key` in `map`. Updating an existing entry needs `modify` on
    /// the entry, creating one needs `add` on the map.
    pub fn set_key(&self, map: &NodeId, key: &str, value: impl Into<Scalar>) -> Result<NodeId> {
        self.mutate(|tree, gate| {
            match tree.node_for_key(map, key)?.map(|n| n.id().clone()) {
                Some(existing) => gate.check(tree, Action::Modify, &existing)?,
                None => gate.check(tree, Action::Add, map)?,
            }
            Ok(tree.set_key_value(map, key, value, gate.replica)?)
        })
    }

    pub fn remove_key(&self, map: &NodeId, key: &str) -> Result<()> {
        self.mutate(|tree, gate| {
            gate.check(tree, Action::Remove, map)?;
            Ok(tree.remove_key_value(map, key, gate.replica)?)
        })
    }

    /// Tombstone a node.
    pub fn delete(&self, id: &NodeId) -> Result<()> {
        self.mutate(|tree, gate| {
            gate.check(tree, Action::Remove, id)?;
            Ok(tree.mark_deleted(id, gate.replica)?)
        })
    }

    pub fn tidy(&self) -> Result<TidyReport> {
        self.ensure_open()?;
        Ok(self.inner.tree.write().tidy())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Tree, &Gate<'_>) -> Result<R>) -> Result<R> {
        self.ensure_open()?;
        let mut tree = self.inner.tree.write();
        let policy = self.inner.policy.read();
        let gate = Gate {
            replica: self.id(),
            policy: &policy,
            enforce: self.inner.config.enforce_access,
        };
        f(&mut tree, &gate)
    }

    /// Merge a remote tree into this replica.
    ///
    /// The merge runs on a copy that replaces the live tree only when it
    /// succeeds (and validates, when configured).
    pub fn merge_from(&self, remote: &Tree) -> Result<MergeReport> {
        self.ensure_open()?;
        let mut tree = self.inner.tree.write();
        let mut merged = tree.clone();
        let report = merged.merge(remote)?;
        self.check_merged(&merged)?;
        tree.replace_state(merged);
        Ok(report)
    }

    /// Two-way sync with another replica. Either both replicas take the
    /// converged state or neither changes. Syncing a replica with itself
    /// is a no-op.
    pub fn sync_with(&self, other: &Replica) -> Result<SyncReport> {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return Ok(SyncReport::default());
        }
        self.ensure_open()?;
        other.ensure_open()?;

        // Lock in address order so two opposite syncs cannot deadlock.
        let self_first = Arc::as_ptr(&self.inner) < Arc::as_ptr(&other.inner);
        let (mut local, mut remote) = if self_first {
            let local = self.inner.tree.write();
            (local, other.inner.tree.write())
        } else {
            let remote = other.inner.tree.write();
            (self.inner.tree.write(), remote)
        };

        let mut local_next = local.clone();
        let mut remote_next = remote.clone();
        let report = local_next.sync_with(&mut remote_next)?;
        self.check_merged(&local_next)?;
        other.check_merged(&remote_next)?;

        local.replace_state(local_next);
        remote.replace_state(remote_next);
        tracing::info!(local = %self.id(), remote = %other.id(), %report.pulled, "synced replicas");
        Ok(report)
    }

    fn check_merged(&self, tree: &Tree) -> Result<()> {
        if !self.inner.config.validate_after_merge {
            return Ok(());
        }
        tree.validate_attached().map_err(|err| {
            tracing::warn!(replica = %self.id(), error = %err, "merged tree failed validation");
            SdkError::Tree(TreeError::from(err))
        })
    }

    /// Receive events for every node at or below `prefix`.
    pub fn subscribe(&self, prefix: &str) -> Result<mpsc::Receiver<NodeEvent>> {
        self.ensure_open()?;
        Ok(self.inner.hub.subscribe(prefix))
    }

    /// Refuse further mutations and end every subscription stream.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.tree.write().clear_event_sink();
        self.inner.hub.close();
        tracing::debug!(replica = %self.id(), "closed replica");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SdkError::Closed(self.id().clone()));
        }
        Ok(())
    }
}
