//! The tree and its local operations.
//!
//! Every mutation is stamped with the acting replica and a version derived
//! from the target node's clock, then checked by the conflict resolver
//! before it is applied. Nodes are only ever removed by [`Tree::tidy`].

use crate::digest::Digest;
use crate::error::{Result, TreeError};
use crate::events::{EventSink, NodeEvent, NodeEventKind};
use crate::node::{Edge, Node, NodeId, NodeKind, NodeType, Scalar};
use canopy_core::{Position, ReplicaId};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A replica's copy of the document.
///
/// Not internally synchronized: wrap it in a lock to share it between
/// threads.
pub struct Tree {
    pub(crate) root: NodeId,
    pub(crate) nodes: BTreeMap<NodeId, Node>,
    sink: Option<Arc<dyn EventSink>>,
}

/// Outcome of a [`Tree::tidy`] pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TidyReport {
    pub removed_nodes: usize,
    pub removed_edges: usize,
}

impl Tree {
    /// Create a tree holding only its root.
    pub fn new() -> Self {
        let root = Node::root();
        let id = root.id.clone();
        let mut nodes = BTreeMap::new();
        nodes.insert(id.clone(), root);
        Tree {
            root: id,
            nodes,
            sink: None,
        }
    }

    pub(crate) fn from_parts(root: NodeId, nodes: BTreeMap<NodeId, Node>) -> Self {
        Tree {
            root,
            nodes,
            sink: None,
        }
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root
    }

    pub fn root(&self) -> Result<&Node> {
        self.require(&self.root)
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of nodes in the table, tombstones and orphans included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub(crate) fn require(&self, id: &NodeId) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| TreeError::NodeNotFound(id.clone()))
    }

    pub(crate) fn node_mut(&mut self, id: &NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| TreeError::NodeNotFound(id.clone()))
    }

    fn require_ordered(&self, id: &NodeId) -> Result<&Node> {
        let node = self.require(id)?;
        if !node.is_ordered() {
            return Err(TreeError::TypeMismatch {
                node: id.clone(),
                expected: "array or root",
                found: node.node_type(),
            });
        }
        Ok(node)
    }

    /// Route change events to `sink`. Replaces any previous sink.
    pub fn set_event_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sink = Some(sink);
    }

    pub fn clear_event_sink(&mut self) {
        self.sink = None;
    }

    /// Path of `id`, computed only when somebody is listening.
    pub(crate) fn path_for_event(&self, id: &NodeId) -> Option<String> {
        self.sink.as_ref().and_then(|_| self.path_of(id))
    }

    pub(crate) fn emit(&self, kind: NodeEventKind, id: &NodeId) {
        let path = self.path_for_event(id);
        self.emit_at(kind, id, path);
    }

    pub(crate) fn emit_at(&self, kind: NodeEventKind, id: &NodeId, path: Option<String>) {
        if let (Some(sink), Some(path)) = (&self.sink, path) {
            sink.notify(NodeEvent {
                kind,
                node_id: id.clone(),
                path,
            });
        }
    }

    /// Create a detached node at version 1 owned by `replica`.
    pub fn create_node(
        &mut self,
        label: &str,
        node_type: NodeType,
        replica: &ReplicaId,
    ) -> Result<NodeId> {
        if node_type == NodeType::Root {
            return Err(TreeError::UnsupportedOperation(
                "a tree has exactly one root".to_string(),
            ));
        }
        let id = NodeId::generate(label);
        let node = Node::new(id.clone(), NodeKind::empty(node_type), replica.clone(), 1);
        self.nodes.insert(id.clone(), node);
        tracing::debug!(node_id = %id, %replica, %node_type, "created node");
        Ok(id)
    }

    pub(crate) fn create_literal_node(
        &mut self,
        label: &str,
        value: Scalar,
        replica: &ReplicaId,
    ) -> NodeId {
        let id = NodeId::generate(label);
        let kind = NodeKind::Literal(value.normalized());
        self.nodes
            .insert(id.clone(), Node::new(id.clone(), kind, replica.clone(), 1));
        id
    }

    /// The node `id`, created as a `null` literal at version 1 owned by
    /// `replica` when it does not exist yet.
    pub(crate) fn get_or_create_node(&mut self, id: &NodeId, replica: &ReplicaId) -> &mut Node {
        self.nodes.entry(id.clone()).or_insert_with(|| {
            tracing::debug!(node_id = %id, %replica, "created node on first reference");
            Node::new(id.clone(), NodeKind::empty(NodeType::Literal), replica.clone(), 1)
        })
    }

    /// Take over the node table of `other`, keeping this tree's event sink.
    /// No events are emitted for the swap.
    pub fn replace_state(&mut self, other: Tree) {
        self.root = other.root;
        self.nodes = other.nodes;
    }

    /// Create a node and attach it under `parent`. Under a map the label
    /// doubles as the key.
    pub fn create_attached_node(
        &mut self,
        label: &str,
        node_type: NodeType,
        parent: &NodeId,
        replica: &ReplicaId,
    ) -> Result<NodeId> {
        let edge_label = if self.require(parent)?.is_map() { label } else { "" };
        let id = self.create_node(label, node_type, replica)?;
        if let Err(err) = self.add_edge(parent, &id, edge_label, replica) {
            self.nodes.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// The node holding an edge to `id`, if any.
    pub fn parent_of(&self, id: &NodeId) -> Option<&NodeId> {
        self.nodes
            .values()
            .find(|node| node.has_edge_to(id))
            .map(|node| &node.id)
    }

    /// True when `target` can be reached from `start` by following edges.
    pub(crate) fn is_reachable(&self, start: &NodeId, target: &NodeId) -> bool {
        let mut stack = vec![start];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                stack.extend(node.edges.iter().map(|e| &e.to));
            }
        }
        false
    }

    /// True when `node` lies strictly below `ancestor`.
    pub fn is_descendant(&self, ancestor: &NodeId, node: &NodeId) -> bool {
        ancestor != node && self.is_reachable(ancestor, node)
    }

    pub(crate) fn reachable_from_root(&self) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.root.clone()];
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.edges.iter().map(|e| e.to.clone()));
            }
        }
        seen
    }

    /// Children of `node` that exist and are not tombstoned, in sibling order.
    pub(crate) fn visible_children<'a>(
        &'a self,
        node: &'a Node,
    ) -> impl Iterator<Item = (&'a Edge, &'a Node)> + 'a {
        node.edges.iter().filter_map(move |edge| {
            self.nodes
                .get(&edge.to)
                .filter(|child| !child.deleted)
                .map(|child| (edge, child))
        })
    }

    /// Visible children of `parent` in sibling order.
    pub fn children(&self, parent: &NodeId) -> Result<Vec<&Node>> {
        let node = self.require(parent)?;
        Ok(self.visible_children(node).map(|(_, child)| child).collect())
    }

    /// The `index`-th visible child of `parent`.
    pub fn get_sibling(&self, parent: &NodeId, index: usize) -> Result<&Node> {
        let children = self.children(parent)?;
        let length = children.len();
        children
            .into_iter()
            .nth(index)
            .ok_or(TreeError::IndexOutOfBounds { index, length })
    }

    /// Reject attachments that would break the single-parent tree shape.
    pub(crate) fn check_attachment(&self, from: &NodeId, to: &NodeId) -> Result<()> {
        if from == to {
            return Err(TreeError::SelfAttachment(from.clone()));
        }
        let parent = self.require(from)?;
        self.require(to)?;

        if parent.is_literal() {
            return Err(TreeError::TypeMismatch {
                node: from.clone(),
                expected: "map, array or root",
                found: NodeType::Literal,
            });
        }
        if to == &self.root {
            return Err(TreeError::UnsupportedOperation(
                "the root cannot be attached below another node".to_string(),
            ));
        }
        if parent.has_edge_to(to) {
            return Err(TreeError::DuplicateEdge {
                from: from.clone(),
                to: to.clone(),
            });
        }
        if let Some(existing) = self.parent_of(to) {
            return Err(TreeError::AlreadyAttached {
                node: to.clone(),
                parent: existing.clone(),
            });
        }
        if self.is_reachable(to, from) {
            return Err(TreeError::CycleDetected {
                from: from.clone(),
                to: to.clone(),
            });
        }
        Ok(())
    }

    /// Attach `to` under `from`. Ordered parents append, maps add an
    /// unordered labeled edge.
    pub fn add_edge(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        label: &str,
        replica: &ReplicaId,
    ) -> Result<()> {
        let version = self.require(from)?.clock.get(replica.as_str()) + 1;
        self.add_edge_with_version(from, to, label, replica, version)
    }

    /// [`Tree::add_edge`] with an explicit version for the writer's entry.
    pub fn add_edge_with_version(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        label: &str,
        replica: &ReplicaId,
        version: u64,
    ) -> Result<()> {
        self.check_attachment(from, to)?;
        let parent = self.require(from)?;
        let position = if parent.is_ordered() {
            let last = parent
                .edges
                .last()
                .map(|e| e.position.clone())
                .unwrap_or_default();
            Position::between(&last, &Position::upper_bound())
        } else {
            Position::empty()
        };
        let edge = Edge::new(from.clone(), to.clone(), label, position);
        self.attach(from, edge, replica, version)
    }

    fn attach(&mut self, from: &NodeId, edge: Edge, replica: &ReplicaId, version: u64) -> Result<()> {
        let to = edge.to.clone();
        let parent = self.node_mut(from)?;
        if !parent.stamp_edge_write(replica, version) {
            tracing::debug!(node_id = %from, child = %to, %replica, version, "edge write lost conflict resolution");
            return Err(TreeError::ConflictLost { node: from.clone() });
        }
        parent.edges.push(edge);
        parent.sort_edges();
        tracing::debug!(node_id = %from, child = %to, %replica, version, "attached edge");
        self.emit(NodeEventKind::Added, &to);
        Ok(())
    }

    /// Attach a child built inside the same detached import. Fresh nodes
    /// have no parent and cannot close a cycle, so the attachment checks
    /// are skipped. No event fires while the subtree is detached.
    pub(crate) fn attach_fresh(&mut self, from: &NodeId, edge: Edge, replica: &ReplicaId) -> Result<()> {
        let parent = self.node_mut(from)?;
        let version = parent.clock.get(replica.as_str()) + 1;
        if !parent.stamp_edge_write(replica, version) {
            return Err(TreeError::ConflictLost { node: from.clone() });
        }
        parent.edges.push(edge);
        Ok(())
    }

    /// Attach `to` under an ordered parent at an explicit position.
    pub(crate) fn insert_positioned(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        label: &str,
        position: Position,
        replica: &ReplicaId,
        version: u64,
    ) -> Result<()> {
        self.require_ordered(from)?;
        self.check_attachment(from, to)?;
        let edge = Edge::new(from.clone(), to.clone(), label, position);
        self.attach(from, edge, replica, version)
    }

    fn insert_between(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        label: &str,
        left: &Position,
        right: &Position,
        replica: &ReplicaId,
    ) -> Result<()> {
        let position = Position::between(left, right);
        let version = self.require(from)?.clock.get(replica.as_str()) + 1;
        self.insert_positioned(from, to, label, position, replica, version)
    }

    /// Attach `to` after the last sibling.
    pub fn append_edge(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        label: &str,
        replica: &ReplicaId,
    ) -> Result<()> {
        let left = self
            .require_ordered(from)?
            .edges
            .last()
            .map(|e| e.position.clone())
            .unwrap_or_default();
        self.insert_between(from, to, label, &left, &Position::upper_bound(), replica)
    }

    /// Attach `to` before the first sibling.
    pub fn prepend_edge(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        label: &str,
        replica: &ReplicaId,
    ) -> Result<()> {
        let right = self
            .require_ordered(from)?
            .edges
            .first()
            .map(|e| e.position.clone())
            .unwrap_or_else(Position::upper_bound);
        self.insert_between(from, to, label, &Position::empty(), &right, replica)
    }

    /// Positions immediately around `sibling`: (before it, it, after it).
    fn sibling_window(
        &self,
        from: &NodeId,
        sibling: &NodeId,
    ) -> Result<(Position, Position, Position)> {
        let parent = self.require_ordered(from)?;
        let index = parent
            .edges
            .iter()
            .position(|e| &e.to == sibling)
            .ok_or_else(|| TreeError::SiblingNotFound {
                parent: from.clone(),
                sibling: sibling.clone(),
            })?;
        let before = index
            .checked_sub(1)
            .map(|i| parent.edges[i].position.clone())
            .unwrap_or_default();
        let at = parent.edges[index].position.clone();
        let after = parent
            .edges
            .get(index + 1)
            .map(|e| e.position.clone())
            .unwrap_or_else(Position::upper_bound);
        Ok((before, at, after))
    }

    /// Attach `to` immediately before `sibling`.
    pub fn insert_edge_left(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        label: &str,
        sibling: &NodeId,
        replica: &ReplicaId,
    ) -> Result<()> {
        let (before, at, _) = self.sibling_window(from, sibling)?;
        self.insert_between(from, to, label, &before, &at, replica)
    }

    /// Attach `to` immediately after `sibling`.
    pub fn insert_edge_right(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        label: &str,
        sibling: &NodeId,
        replica: &ReplicaId,
    ) -> Result<()> {
        let (_, at, after) = self.sibling_window(from, sibling)?;
        self.insert_between(from, to, label, &at, &after, replica)
    }

    /// Attach `to` so that it becomes the `index`-th visible child.
    /// `index == len` appends.
    pub fn insert_edge_at(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        label: &str,
        index: usize,
        replica: &ReplicaId,
    ) -> Result<()> {
        let siblings: Vec<NodeId> = self
            .children(from)?
            .into_iter()
            .map(|n| n.id.clone())
            .collect();
        match siblings.get(index) {
            Some(sibling) => self.insert_edge_left(from, to, label, sibling, replica),
            None if index == siblings.len() => self.append_edge(from, to, label, replica),
            None => Err(TreeError::IndexOutOfBounds {
                index,
                length: siblings.len(),
            }),
        }
    }

    /// Detach `to` from `from`. The child stays in the node table.
    pub fn remove_edge(&mut self, from: &NodeId, to: &NodeId, replica: &ReplicaId) -> Result<()> {
        let version = self.require(from)?.clock.get(replica.as_str()) + 1;
        self.remove_edge_with_version(from, to, replica, version)
    }

    pub fn remove_edge_with_version(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        replica: &ReplicaId,
        version: u64,
    ) -> Result<()> {
        if !self.require(from)?.has_edge_to(to) {
            return Err(TreeError::EdgeNotFound {
                from: from.clone(),
                to: to.clone(),
            });
        }
        let path = self.path_for_event(to);

        let parent = self.node_mut(from)?;
        if !parent.stamp_edge_write(replica, version) {
            tracing::debug!(node_id = %from, child = %to, %replica, version, "edge removal lost conflict resolution");
            return Err(TreeError::ConflictLost { node: from.clone() });
        }
        parent.edges.retain(|e| &e.to != to);
        tracing::debug!(node_id = %from, child = %to, %replica, "removed edge");
        self.emit_at(NodeEventKind::Removed, to, path);
        Ok(())
    }

    /// Overwrite a literal. The version is one past the highest entry of the
    /// node's clock, so a local write always wins.
    pub fn set_literal(
        &mut self,
        id: &NodeId,
        value: impl Into<Scalar>,
        replica: &ReplicaId,
    ) -> Result<()> {
        let version = self.require(id)?.clock.max_version() + 1;
        self.set_literal_with_version(id, value, replica, version)
    }

    /// Overwrite a literal with an explicit version, subject to
    /// last-writer-wins against the current state.
    pub fn set_literal_with_version(
        &mut self,
        id: &NodeId,
        value: impl Into<Scalar>,
        replica: &ReplicaId,
        version: u64,
    ) -> Result<()> {
        let value = value.into().normalized();
        let node = self.node_mut(id)?;
        if !node.is_literal() {
            return Err(TreeError::TypeMismatch {
                node: id.clone(),
                expected: "literal",
                found: node.node_type(),
            });
        }
        if !node.stamp_literal_write(replica, version) {
            tracing::debug!(node_id = %id, %replica, version, "literal write lost conflict resolution");
            return Err(TreeError::ConflictLost { node: id.clone() });
        }
        node.kind = NodeKind::Literal(value);
        tracing::debug!(node_id = %id, %replica, version, "set literal");
        self.emit(NodeEventKind::Updated, id);
        Ok(())
    }

    /// Value of a literal node.
    pub fn literal(&self, id: &NodeId) -> Result<&Scalar> {
        let node = self.require(id)?;
        node.literal().ok_or(TreeError::TypeMismatch {
            node: id.clone(),
            expected: "literal",
            found: node.node_type(),
        })
    }

    /// Visible child of a map under `key`.
    ///
    /// When concurrent writers created the same key, the first edge in
    /// sibling order (lowest child id) wins.
    pub fn node_for_key(&self, map: &NodeId, key: &str) -> Result<Option<&Node>> {
        let node = self.require(map)?;
        if !node.is_map() {
            return Err(TreeError::TypeMismatch {
                node: map.clone(),
                expected: "map",
                found: node.node_type(),
            });
        }
        Ok(self
            .visible_children(node)
            .find(|(edge, _)| edge.label == key)
            .map(|(_, child)| child))
    }

    /// Set `key` on a map to a literal, creating the entry if needed.
    /// Returns the literal's node id.
    pub fn set_key_value(
        &mut self,
        map: &NodeId,
        key: &str,
        value: impl Into<Scalar>,
        replica: &ReplicaId,
    ) -> Result<NodeId> {
        let value = value.into();
        if let Some(existing) = self.node_for_key(map, key)?.map(|n| n.id.clone()) {
            self.set_literal(&existing, value, replica)?;
            return Ok(existing);
        }

        let child = self.create_literal_node(key, value, replica);
        if let Err(err) = self.add_edge(map, &child, key, replica) {
            self.nodes.remove(&child);
            return Err(err);
        }
        Ok(child)
    }

    /// Detach every visible entry stored under `key`.
    pub fn remove_key_value(&mut self, map: &NodeId, key: &str, replica: &ReplicaId) -> Result<()> {
        let node = self.require(map)?;
        let targets: Vec<NodeId> = self
            .visible_children(node)
            .filter(|(edge, _)| edge.label == key)
            .map(|(edge, _)| edge.to.clone())
            .collect();
        if targets.is_empty() {
            return Err(TreeError::KeyNotFound(key.to_string()));
        }
        for target in &targets {
            self.remove_edge(map, target, replica)?;
        }
        Ok(())
    }

    /// Hide a node from export and path lookups. It stays in the node table
    /// until [`Tree::tidy`].
    pub fn mark_deleted(&mut self, id: &NodeId, replica: &ReplicaId) -> Result<()> {
        if id == &self.root {
            return Err(TreeError::UnsupportedOperation(
                "the root cannot be deleted".to_string(),
            ));
        }
        let path = self.path_for_event(id);
        let node = self.node_mut(id)?;
        if node.deleted {
            return Ok(());
        }
        node.deleted = true;
        node.clock.increment(replica);
        tracing::debug!(node_id = %id, %replica, "marked node deleted");
        self.emit_at(NodeEventKind::MarkedDeleted, id, path);
        Ok(())
    }

    /// Drop edges to tombstoned nodes, then every node unreachable from root.
    ///
    /// Only safe once no concurrent replica can still reference the removed
    /// nodes.
    pub fn tidy(&mut self) -> TidyReport {
        let tombstones: HashSet<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.deleted)
            .map(|n| n.id.clone())
            .collect();

        let mut report = TidyReport::default();
        for node in self.nodes.values_mut() {
            let before = node.edges.len();
            node.edges.retain(|e| !tombstones.contains(&e.to));
            report.removed_edges += before - node.edges.len();
        }

        let reachable = self.reachable_from_root();
        let before = self.nodes.len();
        self.nodes.retain(|id, _| reachable.contains(id));
        report.removed_nodes = before - self.nodes.len();

        tracing::info!(
            removed_nodes = report.removed_nodes,
            removed_edges = report.removed_edges,
            "tidied tree"
        );
        report
    }

    pub(crate) fn normalize(&mut self) {
        for node in self.nodes.values_mut() {
            node.sort_edges();
        }
    }

    /// Structural equality: same nodes, kinds, values, tombstones and
    /// children in the same order. Clocks, owners and LSEQ digits are
    /// ignored.
    pub fn semantically_eq(&self, other: &Tree) -> bool {
        self.root == other.root
            && self.nodes.len() == other.nodes.len()
            && self.nodes.iter().all(|(id, node)| {
                other
                    .nodes
                    .get(id)
                    .map_or(false, |theirs| same_shape(node, theirs))
            })
    }

    /// SHA-256 hex of the exported document.
    pub fn semantic_version(&self) -> Result<String> {
        let value = self.export_value()?;
        Ok(Digest::of(&[value.to_string().as_bytes()]).to_hex())
    }
}

fn same_shape(a: &Node, b: &Node) -> bool {
    a.kind == b.kind
        && a.deleted == b.deleted
        && a.edges.len() == b.edges.len()
        && a
            .edges
            .iter()
            .zip(&b.edges)
            .all(|(x, y)| x.to == y.to && x.label == y.label)
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

/// Deep copy of the node table. The clone is detached: event sinks are not
/// carried over.
impl Clone for Tree {
    fn clone(&self) -> Self {
        Tree::from_parts(self.root.clone(), self.nodes.clone())
    }
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("root", &self.root)
            .field("nodes", &self.nodes)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}
