//! Nodes, edges and literal values.

use canopy_core::{resolve, Position, ReplicaId, ResolveMode, VectorClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use ulid::Ulid;

/// Id of the root node of every tree.
pub const ROOT_ID: &str = "root";

/// Globally unique node identifier: a human-readable label plus a ULID.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// Generate a fresh id seeded with `label`.
    pub fn generate(label: &str) -> Self {
        NodeId(format!("{}-{}", label, Ulid::new()))
    }

    pub fn root() -> Self {
        NodeId(ROOT_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

/// A literal value stored in a leaf node.
///
/// Numbers are normalized on construction: integral floats that fit in an
/// `i64` become [`Scalar::Int`], so `1` and `1.0` compare equal, while other
/// values keep their exact representation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Scalar {
    /// Convert a JSON scalar. Returns `None` for arrays and objects.
    pub fn from_json(value: &Value) -> Option<Scalar> {
        match value {
            Value::Null => Some(Scalar::Null),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::String(s) => Some(Scalar::String(s.clone())),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Scalar::Int(i))
                } else {
                    n.as_f64().map(Scalar::from_f64)
                }
            }
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Normalizing constructor for floating point values.
    pub fn from_f64(f: f64) -> Scalar {
        if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
            Scalar::Int(f as i64)
        } else {
            Scalar::Float(f)
        }
    }

    pub fn normalized(self) -> Scalar {
        match self {
            Scalar::Float(f) => Scalar::from_f64(f),
            other => other,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::from(*i),
            Scalar::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Scalar::String(s) => Value::String(s.clone()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::String(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::String(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<f64> for Scalar {
    fn from(f: f64) -> Self {
        Scalar::from_f64(f)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// Payload-free node type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    Root,
    Map,
    Array,
    Literal,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Root => "root",
            NodeType::Map => "map",
            NodeType::Array => "array",
            NodeType::Literal => "literal",
        };
        f.write_str(name)
    }
}

/// What a node holds. Exactly one kind per node.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Root,
    Map,
    Array,
    Literal(Scalar),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Root => NodeType::Root,
            NodeKind::Map => NodeType::Map,
            NodeKind::Array => NodeType::Array,
            NodeKind::Literal(_) => NodeType::Literal,
        }
    }

    /// The kind a freshly created node of type `node_type` starts with.
    pub fn empty(node_type: NodeType) -> NodeKind {
        match node_type {
            NodeType::Root => NodeKind::Root,
            NodeType::Map => NodeKind::Map,
            NodeType::Array => NodeKind::Array,
            NodeType::Literal => NodeKind::Literal(Scalar::Null),
        }
    }
}

/// A directed, labeled arc from a parent to one of its children.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    /// Map key; empty for array and root links.
    #[serde(default)]
    pub label: String,
    #[serde(rename = "lseqposition", default)]
    pub position: Position,
}

impl Edge {
    pub fn new(from: NodeId, to: NodeId, label: impl Into<String>, position: Position) -> Self {
        Edge {
            from,
            to,
            label: label.into(),
            position,
        }
    }

    /// Sibling order: LSEQ position, then child id.
    pub fn sibling_cmp(&self, other: &Edge) -> Ordering {
        self.position
            .cmp(&other.position)
            .then_with(|| self.to.cmp(&other.to))
    }
}

/// A node of the tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) edges: Vec<Edge>,
    pub(crate) clock: VectorClock,
    pub(crate) owner: ReplicaId,
    pub(crate) deleted: bool,
    pub(crate) nonce: Option<String>,
    pub(crate) signature: Option<String>,
}

impl Node {
    /// Create a node owned by `owner` at `version`.
    pub fn new(id: NodeId, kind: NodeKind, owner: ReplicaId, version: u64) -> Self {
        Node {
            id,
            kind,
            edges: Vec::new(),
            clock: VectorClock::single(owner.clone(), version),
            owner,
            deleted: false,
            nonce: None,
            signature: None,
        }
    }

    pub(crate) fn root() -> Self {
        Node {
            id: NodeId::root(),
            kind: NodeKind::Root,
            edges: Vec::new(),
            clock: VectorClock::new(),
            owner: ReplicaId::default(),
            deleted: false,
            nonce: None,
            signature: None,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, NodeKind::Root)
    }

    pub fn is_map(&self) -> bool {
        matches!(self.kind, NodeKind::Map)
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, NodeKind::Array)
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.kind, NodeKind::Literal(_))
    }

    /// True for node kinds whose children are ordered by position.
    pub fn is_ordered(&self) -> bool {
        matches!(self.kind, NodeKind::Array | NodeKind::Root)
    }

    pub fn literal(&self) -> Option<&Scalar> {
        match &self.kind {
            NodeKind::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Outgoing edges in sibling order, tombstoned children included.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn owner(&self) -> &ReplicaId {
        &self.owner
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn edge_to(&self, to: &NodeId) -> Option<&Edge> {
        self.edges.iter().find(|e| &e.to == to)
    }

    pub fn has_edge_to(&self, to: &NodeId) -> bool {
        self.edge_to(to).is_some()
    }

    pub(crate) fn sort_edges(&mut self) {
        self.edges.sort_by(Edge::sibling_cmp);
    }

    /// Stamp an edge-set write by `replica` at `version`.
    ///
    /// The candidate clock is the current clock with the writer's entry set
    /// to `version`. Returns false, leaving the node untouched, when the
    /// candidate loses against the current state.
    pub(crate) fn stamp_edge_write(&mut self, replica: &ReplicaId, version: u64) -> bool {
        let mut candidate = self.clock.clone();
        candidate.set(replica.clone(), version);
        self.install_if_winning(candidate, replica)
    }

    /// Stamp a literal write by `replica` at `version`. The candidate clock
    /// holds only the writer's entry.
    pub(crate) fn stamp_literal_write(&mut self, replica: &ReplicaId, version: u64) -> bool {
        let candidate = VectorClock::single(replica.clone(), version);
        self.install_if_winning(candidate, replica)
    }

    fn install_if_winning(&mut self, candidate: VectorClock, replica: &ReplicaId) -> bool {
        let resolution = resolve(
            &self.clock,
            &candidate,
            &self.owner,
            replica,
            ResolveMode::Overwrite,
        );
        if !resolution.is_won_by(&candidate, replica) {
            return false;
        }
        self.clock = candidate;
        self.owner = replica.clone();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_ids_carry_label() {
        let id = NodeId::generate("map");
        assert!(id.as_str().starts_with("map-"));
        assert_ne!(id, NodeId::generate("map"));
    }

    #[test]
    fn test_number_normalization() {
        assert_eq!(Scalar::from_json(&json!(1)), Some(Scalar::Int(1)));
        assert_eq!(Scalar::from_json(&json!(1.0)), Some(Scalar::Int(1)));
        assert_eq!(Scalar::from_json(&json!(1.5)), Some(Scalar::Float(1.5)));
        assert_eq!(Scalar::from(2.0), Scalar::Int(2));
        assert_eq!(Scalar::from_json(&json!(u64::MAX)), Some(Scalar::Float(u64::MAX as f64)));
        assert_eq!(Scalar::from_json(&json!([1])), None);
    }

    #[test]
    fn test_scalar_json_round_trip() {
        for value in [json!(null), json!(true), json!(-4), json!(2.25), json!("x")] {
            let scalar = Scalar::from_json(&value).unwrap();
            assert_eq!(scalar.to_json(), value);
        }
    }

    #[test]
    fn test_scalar_untagged_serde() {
        let values: Vec<Scalar> = serde_json::from_str(r#"[null, false, 3, 0.5, "s"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                Scalar::Null,
                Scalar::Bool(false),
                Scalar::Int(3),
                Scalar::Float(0.5),
                Scalar::String("s".into())
            ]
        );
    }

    #[test]
    fn test_sibling_order_breaks_ties_by_id() {
        let a = Edge::new("p".into(), "a".into(), "", Position::new(vec![3]));
        let b = Edge::new("p".into(), "b".into(), "", Position::new(vec![3]));
        let c = Edge::new("p".into(), "c".into(), "", Position::new(vec![2, 9]));
        let mut edges = vec![b.clone(), a.clone(), c.clone()];
        edges.sort_by(Edge::sibling_cmp);
        assert_eq!(edges, vec![c, a, b]);
    }

    #[test]
    fn test_stamp_edge_write() {
        let alice = ReplicaId::from("alice");
        let bob = ReplicaId::from("bob");
        let mut node = Node::new("n".into(), NodeKind::Map, alice.clone(), 1);

        assert!(node.stamp_edge_write(&bob, 1));
        assert_eq!(node.owner(), &bob);
        assert_eq!(node.clock().get("alice"), 1);
        assert_eq!(node.clock().get("bob"), 1);

        // A stale version from alice is dominated by the current clock.
        assert!(!node.stamp_edge_write(&alice, 0));
        assert_eq!(node.owner(), &bob);
    }

    #[test]
    fn test_stamp_literal_write_uses_last_writer_wins() {
        let alice = ReplicaId::from("alice");
        let bob = ReplicaId::from("bob");
        let mut node = Node::new("n".into(), NodeKind::Literal(Scalar::Null), alice.clone(), 2);

        assert!(!node.stamp_literal_write(&bob, 1));
        assert!(node.stamp_literal_write(&bob, 3));
        assert_eq!(node.owner(), &bob);
        assert_eq!(node.clock(), &VectorClock::single(bob, 3));
    }
}
