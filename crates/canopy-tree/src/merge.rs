//! Merging a remote replica into the local tree.
//!
//! Remote nodes are visited in id order. For each one the engine:
//!
//! 1. adopts the node if it is unknown locally (edges follow in step 3),
//! 2. replays the remote literal through last-writer-wins,
//! 3. merges the remote edges (union for maps, position-preserving inserts
//!    for ordered parents, promotion when two replicas each gave the root a
//!    different single child),
//! 4. joins the clocks and keeps the lower of the two owners.
//!
//! When the remote parent's clock strictly dominates the local one, the
//! remote edge list is authoritative: local edges it no longer holds are
//! dropped before any edge is merged, and edges both sides hold take the
//! remote position. This is how removals, moves and promotions reach the
//! replica that did not perform them.
//!
//! A child that concurrent moves left under two different parents stays
//! with the parent whose id sorts lower.
//!
//! All merge-time position allocation uses a generator seeded from the
//! child id, so both merge directions pick the same digits.

use crate::digest::Digest;
use crate::error::{Result, TreeError};
use crate::events::NodeEventKind;
use crate::node::{Edge, Node, NodeId, NodeKind};
use crate::tree::Tree;
use canopy_core::{Position, ReplicaId};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::fmt;

/// Counters describing what a merge did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub nodes_added: usize,
    pub edges_added: usize,
    /// Local edges dropped because the remote replica had removed or moved
    /// them.
    pub edges_removed: usize,
    /// Remote edges already present locally.
    pub edges_skipped: usize,
    pub promotions: usize,
    pub literals_applied: usize,
    /// Remote writes that lost conflict resolution.
    pub conflicts_lost: usize,
    /// Remote edges that would have broken the local tree shape.
    pub rejected: usize,
}

impl MergeReport {
    /// True when the merge did not change the local structure or values.
    pub fn is_noop(&self) -> bool {
        self.nodes_added == 0
            && self.edges_added == 0
            && self.edges_removed == 0
            && self.promotions == 0
            && self.literals_applied == 0
    }
}

impl fmt::Display for MergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{} nodes, +{} edges, -{} edges ({} skipped, {} rejected), {} promotions, {} literals applied, {} conflicts lost",
            self.nodes_added,
            self.edges_added,
            self.edges_removed,
            self.edges_skipped,
            self.rejected,
            self.promotions,
            self.literals_applied,
            self.conflicts_lost
        )
    }
}

/// Outcome of a two-way [`Tree::sync_with`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Remote changes merged into `self`.
    pub pulled: MergeReport,
    /// Local changes merged into the other tree.
    pub pushed: MergeReport,
}

/// Where an incoming edge goes under its local parent.
enum Placement {
    Union,
    IdOrder,
    Promote,
    LikeRemote,
}

/// Deterministic generator for positions allocated on behalf of `child`.
fn seeded_rng(child: &NodeId) -> StdRng {
    let digest = Digest::of(&[child.as_str().as_bytes()]);
    StdRng::from_seed(*digest.as_bytes())
}

impl Tree {
    /// Merge `remote` into this tree.
    ///
    /// Merge mutates in place and is not atomic: on error the local tree may
    /// hold part of the remote state. Use [`Tree::sync_with`] or merge into a
    /// clone when all-or-nothing semantics are needed.
    pub fn merge(&mut self, remote: &Tree) -> Result<MergeReport> {
        let mut report = MergeReport::default();
        let mut promoted: HashSet<NodeId> = HashSet::new();

        // Drop superseded edges first so moved children are free to attach
        // wherever the remote replica put them, whatever the visiting order.
        for remote_node in remote.nodes.values() {
            self.drop_superseded_edges(remote_node, &mut report)?;
        }

        for (id, remote_node) in &remote.nodes {
            if !self.nodes.contains_key(id) {
                self.adopt(remote_node);
                report.nodes_added += 1;
            }

            let (merged_clock, merged_owner, remote_is_newer) = {
                let local = self.require(id)?;
                (
                    local.clock.merged_with(&remote_node.clock),
                    ReplicaId::lowest(&local.owner, &remote_node.owner).clone(),
                    remote_node.clock.dominates(&local.clock),
                )
            };

            self.merge_literal(remote_node, &mut report)?;
            for edge in &remote_node.edges {
                let incoming = Incoming {
                    remote,
                    parent: remote_node,
                    edge,
                    remote_is_newer,
                };
                self.merge_edge(incoming, &mut promoted, &mut report)?;
            }

            let newly_deleted = remote_node.deleted && !self.require(id)?.deleted;
            let path = if newly_deleted {
                self.path_for_event(id)
            } else {
                None
            };
            let local = self.node_mut(id)?;
            local.clock = merged_clock;
            local.owner = merged_owner;
            local.deleted |= remote_node.deleted;
            if newly_deleted {
                self.emit_at(NodeEventKind::MarkedDeleted, id, path);
            }
        }

        self.normalize();
        tracing::info!(
            nodes_added = report.nodes_added,
            edges_added = report.edges_added,
            edges_removed = report.edges_removed,
            promotions = report.promotions,
            literals_applied = report.literals_applied,
            conflicts_lost = report.conflicts_lost,
            rejected = report.rejected,
            "merged remote tree"
        );
        Ok(report)
    }

    /// Two-way sync: merge `other` into a copy of `self`, then that result
    /// into a copy of `other`. Both trees are replaced only when both merges
    /// succeed. Event sinks stay in place but see no events for the sync.
    pub fn sync_with(&mut self, other: &mut Tree) -> Result<SyncReport> {
        let mut local = self.clone();
        let pulled = local.merge(other)?;
        let mut remote = other.clone();
        let pushed = remote.merge(&local)?;

        self.replace_state(local);
        other.replace_state(remote);
        tracing::info!(%pulled, %pushed, "synced trees");
        Ok(SyncReport { pulled, pushed })
    }

    /// Copy a remote node's state, without its edges.
    fn adopt(&mut self, remote_node: &Node) {
        let node = self.get_or_create_node(&remote_node.id, &remote_node.owner);
        node.kind = remote_node.kind.clone();
        node.clock = remote_node.clock.clone();
        node.owner = remote_node.owner.clone();
        node.deleted = remote_node.deleted;
        node.nonce = remote_node.nonce.clone();
        node.signature = remote_node.signature.clone();
        tracing::debug!(node_id = %remote_node.id, owner = %remote_node.owner, "adopted remote node");
    }

    /// Replay a remote literal as a write by its owner at its owner's version.
    fn merge_literal(&mut self, remote_node: &Node, report: &mut MergeReport) -> Result<()> {
        let Some(value) = remote_node.literal() else {
            return Ok(());
        };
        if self.require(&remote_node.id)?.literal() == Some(value) {
            return Ok(());
        }

        let owner = &remote_node.owner;
        let version = remote_node.clock.get(owner.as_str());
        match self.set_literal_with_version(&remote_node.id, value.clone(), owner, version) {
            Ok(()) => {
                let local = self.node_mut(&remote_node.id)?;
                local.nonce = remote_node.nonce.clone();
                local.signature = remote_node.signature.clone();
                report.literals_applied += 1;
                Ok(())
            }
            Err(TreeError::ConflictLost { .. }) => {
                report.conflicts_lost += 1;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn merge_edge(
        &mut self,
        incoming: Incoming<'_>,
        promoted: &mut HashSet<NodeId>,
        report: &mut MergeReport,
    ) -> Result<()> {
        let Incoming {
            remote,
            parent: remote_parent,
            edge,
            remote_is_newer,
        } = incoming;
        let parent = &remote_parent.id;
        let remote_child = remote.nodes.get(&edge.to).ok_or_else(|| TreeError::DanglingEdge {
            from: parent.clone(),
            to: edge.to.clone(),
        })?;
        if !self.nodes.contains_key(&edge.to) {
            self.adopt(remote_child);
            report.nodes_added += 1;
        }

        let local_parent = self.node_mut(parent)?;
        if let Some(existing) = local_parent.edges.iter_mut().find(|e| e.to == edge.to) {
            if remote_is_newer && existing.position != edge.position {
                tracing::debug!(node_id = %parent, child = %edge.to, "realigned edge position");
                existing.position = edge.position.clone();
            }
            report.edges_skipped += 1;
            return Ok(());
        }
        if let Err(err) = self.check_attachment(parent, &edge.to) {
            if !self.take_from_higher_parent(parent, &edge.to, &err) {
                tracing::warn!(node_id = %parent, child = %edge.to, error = %err, "rejected remote edge");
                report.rejected += 1;
                return Ok(());
            }
            report.edges_removed += 1;
        }

        let writer = &remote_parent.owner;
        let local_parent = self.require(parent)?;
        let version = local_parent.clock.get(writer.as_str()) + 1;

        let placement = match local_parent.kind {
            NodeKind::Map => Placement::Union,
            _ if promoted.contains(parent) => Placement::IdOrder,
            NodeKind::Root if contested_single_child(local_parent, remote_parent) => {
                Placement::Promote
            }
            _ => Placement::LikeRemote,
        };

        let result = match placement {
            Placement::Union => {
                self.add_edge_with_version(parent, &edge.to, &edge.label, writer, version)
            }
            Placement::IdOrder => self.insert_in_id_order(edge, writer, version),
            Placement::Promote => {
                let outcome = self.promote(edge, writer, version);
                if outcome.is_ok() {
                    promoted.insert(parent.clone());
                    report.promotions += 1;
                }
                outcome
            }
            Placement::LikeRemote => self.insert_like_remote(remote_parent, edge, writer, version),
        };

        match result {
            Ok(()) => {
                report.edges_added += 1;
                Ok(())
            }
            Err(TreeError::ConflictLost { .. }) => {
                tracing::debug!(node_id = %parent, child = %edge.to, "remote edge lost conflict resolution");
                report.conflicts_lost += 1;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Remove local edges of a node whose remote clock strictly dominates
    /// the local one when the remote node no longer holds them.
    fn drop_superseded_edges(&mut self, remote_node: &Node, report: &mut MergeReport) -> Result<()> {
        let stale: Vec<NodeId> = match self.nodes.get(&remote_node.id) {
            Some(local) if remote_node.clock.dominates(&local.clock) => local
                .edges
                .iter()
                .filter(|edge| !remote_node.has_edge_to(&edge.to))
                .map(|edge| edge.to.clone())
                .collect(),
            _ => return Ok(()),
        };

        for child in stale {
            let path = self.path_for_event(&child);
            self.node_mut(&remote_node.id)?
                .edges
                .retain(|edge| edge.to != child);
            tracing::debug!(node_id = %remote_node.id, %child, "dropped edge removed remotely");
            self.emit_at(NodeEventKind::Removed, &child, path);
            report.edges_removed += 1;
        }
        Ok(())
    }

    /// Resolve concurrent moves: when `child` already sits under a parent
    /// with a greater id than `parent`, detach it there so it can move.
    /// Returns false when the attachment must be rejected.
    fn take_from_higher_parent(&mut self, parent: &NodeId, child: &NodeId, err: &TreeError) -> bool {
        let TreeError::AlreadyAttached { parent: existing, .. } = err else {
            return false;
        };
        if parent >= existing || self.is_reachable(child, parent) {
            return false;
        }

        let path = self.path_for_event(child);
        if let Some(node) = self.nodes.get_mut(existing) {
            node.edges.retain(|edge| &edge.to != child);
        }
        tracing::debug!(node_id = %parent, %child, from = %existing, "moved child to lower parent");
        self.emit_at(NodeEventKind::Removed, child, path);
        true
    }

    /// Turn a single-child root into an ordered pair sorted by child id.
    fn promote(&mut self, edge: &Edge, writer: &ReplicaId, version: u64) -> Result<()> {
        let parent = &edge.from;
        let node = self.node_mut(parent)?;
        if !node.stamp_edge_write(writer, version) {
            return Err(TreeError::ConflictLost {
                node: parent.clone(),
            });
        }

        let positions = Position::evenly_spaced(2);
        let incoming_first = node
            .edges
            .first()
            .map_or(true, |existing| edge.to < existing.to);
        let (existing_at, incoming_at) = if incoming_first { (1, 0) } else { (0, 1) };

        if let Some(existing) = node.edges.first_mut() {
            existing.position = positions[existing_at].clone();
        }
        node.edges.push(Edge::new(
            parent.clone(),
            edge.to.clone(),
            edge.label.clone(),
            positions[incoming_at].clone(),
        ));
        node.sort_edges();

        tracing::debug!(node_id = %parent, child = %edge.to, "promoted single child to ordered pair");
        self.emit(NodeEventKind::Added, &edge.to);
        Ok(())
    }

    /// Insert before the first sibling with a greater id, else append.
    fn insert_in_id_order(&mut self, edge: &Edge, writer: &ReplicaId, version: u64) -> Result<()> {
        let parent = self.require(&edge.from)?;
        let (left, right) = match parent.edges.iter().position(|e| e.to > edge.to) {
            Some(index) => (
                index
                    .checked_sub(1)
                    .map(|i| parent.edges[i].position.clone())
                    .unwrap_or_default(),
                parent.edges[index].position.clone(),
            ),
            None => (
                parent
                    .edges
                    .last()
                    .map(|e| e.position.clone())
                    .unwrap_or_default(),
                Position::upper_bound(),
            ),
        };
        let position = Position::between_with_rng(&left, &right, &mut seeded_rng(&edge.to));
        self.insert_positioned(&edge.from, &edge.to, &edge.label, position, writer, version)
    }

    /// Insert into an ordered parent where the remote replica has it.
    ///
    /// The remote position is adopted as is. Edges without one are placed
    /// right of their remote left sibling when that sibling exists locally,
    /// otherwise at the front.
    fn insert_like_remote(
        &mut self,
        remote_parent: &Node,
        edge: &Edge,
        writer: &ReplicaId,
        version: u64,
    ) -> Result<()> {
        if !edge.position.is_empty() {
            return self.insert_positioned(
                &edge.from,
                &edge.to,
                &edge.label,
                edge.position.clone(),
                writer,
                version,
            );
        }

        let mut remote_siblings: Vec<&Edge> = remote_parent.edges.iter().collect();
        remote_siblings.sort_by(|a, b| a.sibling_cmp(b));
        let left_sibling = remote_siblings
            .iter()
            .take_while(|e| e.to != edge.to)
            .last()
            .map(|e| &e.to);

        let local = self.require(&edge.from)?;
        let anchor = left_sibling.and_then(|id| local.edges.iter().position(|e| &e.to == id));
        let (left, right) = match anchor {
            Some(index) => (
                local.edges[index].position.clone(),
                local
                    .edges
                    .get(index + 1)
                    .map(|e| e.position.clone())
                    .unwrap_or_else(Position::upper_bound),
            ),
            None => (
                Position::empty(),
                local
                    .edges
                    .first()
                    .map(|e| e.position.clone())
                    .unwrap_or_else(Position::upper_bound),
            ),
        };
        let position = Position::between_with_rng(&left, &right, &mut seeded_rng(&edge.to));
        self.insert_positioned(&edge.from, &edge.to, &edge.label, position, writer, version)
    }
}

/// A remote edge together with the context needed to place it.
struct Incoming<'a> {
    remote: &'a Tree,
    parent: &'a Node,
    edge: &'a Edge,
    remote_is_newer: bool,
}

/// The local parent has exactly one child and the remote parent does not
/// know it: each side attached a different single child.
fn contested_single_child(local: &Node, remote: &Node) -> bool {
    match local.edges.as_slice() {
        [only] => !remote.has_edge_to(&only.to),
        _ => false,
    }
}
