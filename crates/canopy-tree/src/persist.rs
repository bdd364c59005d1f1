//! Full-state save and load.
//!
//! The persisted form is a JSON object `{ "root": <id>, "nodes": { <id>:
//! <node> } }`. Nodes are keyed in id order and edges are stored in sibling
//! order, so converged replicas save byte-identical documents.

use crate::error::{Result, TreeError};
use crate::node::{Edge, Node, NodeId, NodeKind, NodeType, Scalar};
use crate::tree::Tree;
use canopy_core::{ReplicaId, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize)]
struct PersistedTree {
    #[serde(default)]
    root: Option<NodeId>,
    #[serde(default)]
    nodes: Option<BTreeMap<NodeId, PersistedNode>>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<NodeId>,
    #[serde(default)]
    is_root: bool,
    #[serde(default)]
    is_map: bool,
    #[serde(default)]
    is_array: bool,
    #[serde(default)]
    is_literal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    literal_value: Option<Scalar>,
    #[serde(default)]
    owner: ReplicaId,
    #[serde(default)]
    clock: VectorClock,
    #[serde(default)]
    edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "is_false")]
    deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

impl From<&Node> for PersistedNode {
    fn from(node: &Node) -> Self {
        let node_type = node.node_type();
        PersistedNode {
            id: Some(node.id.clone()),
            is_root: node_type == NodeType::Root,
            is_map: node_type == NodeType::Map,
            is_array: node_type == NodeType::Array,
            is_literal: node_type == NodeType::Literal,
            literal_value: node.literal().cloned(),
            owner: node.owner.clone(),
            clock: node.clock.clone(),
            edges: node.edges.clone(),
            deleted: node.deleted,
            nonce: node.nonce.clone(),
            signature: node.signature.clone(),
        }
    }
}

impl PersistedNode {
    fn kind(&self, id: &NodeId) -> Result<NodeKind> {
        let flagged: Vec<NodeType> = [
            (self.is_root, NodeType::Root),
            (self.is_map, NodeType::Map),
            (self.is_array, NodeType::Array),
            (self.is_literal, NodeType::Literal),
        ]
        .into_iter()
        .filter_map(|(set, node_type)| set.then_some(node_type))
        .collect();

        match flagged.as_slice() {
            [NodeType::Literal] => {
                let value = self.literal_value.clone().unwrap_or_default();
                Ok(NodeKind::Literal(value.normalized()))
            }
            [node_type] => Ok(NodeKind::empty(*node_type)),
            other => Err(TreeError::MalformedNode {
                node: id.clone(),
                reason: format!("expected exactly one kind flag, found {}", other.len()),
            }),
        }
    }
}

impl Tree {
    /// Serialize the full state, clocks and tombstones included.
    pub fn save(&self) -> Result<String> {
        let persisted = PersistedTree {
            root: Some(self.root.clone()),
            nodes: Some(
                self.nodes
                    .iter()
                    .map(|(id, node)| (id.clone(), PersistedNode::from(node)))
                    .collect(),
            ),
        };
        Ok(serde_json::to_string_pretty(&persisted)?)
    }

    /// Rebuild a tree from [`Tree::save`] output.
    ///
    /// Edges are attached in a second pass once every node exists. On error
    /// nothing is returned; partial state is discarded.
    pub fn load(raw: &str) -> Result<Tree> {
        let persisted: PersistedTree = serde_json::from_str(raw)?;
        let root = persisted.root.ok_or(TreeError::MissingField("root"))?;
        let entries = persisted.nodes.ok_or(TreeError::MissingField("nodes"))?;

        let mut nodes = BTreeMap::new();
        let mut pending = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            if entry.id.as_ref().map_or(false, |stored| stored != &id) {
                return Err(TreeError::MalformedNode {
                    node: id,
                    reason: "stored id does not match its key".to_string(),
                });
            }
            let kind = entry.kind(&id)?;
            if matches!(kind, NodeKind::Literal(_)) && !entry.edges.is_empty() {
                return Err(TreeError::MalformedNode {
                    node: id,
                    reason: "literal node has edges".to_string(),
                });
            }
            let node = Node {
                id: id.clone(),
                kind,
                edges: Vec::new(),
                clock: entry.clock,
                owner: entry.owner,
                deleted: entry.deleted,
                nonce: entry.nonce,
                signature: entry.signature,
            };
            nodes.insert(id.clone(), node);
            pending.push((id, entry.edges));
        }

        for (id, edges) in pending {
            for edge in &edges {
                if edge.from != id {
                    return Err(TreeError::MalformedNode {
                        node: id,
                        reason: format!("edge to {} claims to start at {}", edge.to, edge.from),
                    });
                }
                if !nodes.contains_key(&edge.to) {
                    return Err(TreeError::DanglingEdge {
                        from: id,
                        to: edge.to.clone(),
                    });
                }
            }
            if let Some(node) = nodes.get_mut(&id) {
                node.edges = edges;
                node.sort_edges();
            }
        }

        let root_node = nodes
            .get(&root)
            .ok_or_else(|| TreeError::NodeNotFound(root.clone()))?;
        if !root_node.is_root() {
            return Err(TreeError::MalformedNode {
                node: root.clone(),
                reason: format!("root id names a {} node", root_node.node_type()),
            });
        }

        tracing::debug!(root = %root, nodes = nodes.len(), "loaded tree");
        Ok(Tree::from_parts(root, nodes))
    }
}
