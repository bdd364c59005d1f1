//! Error types for tree operations.

use crate::node::{NodeId, NodeType};
use crate::validate::ValidationError;
use thiserror::Error;

/// Errors that can occur while mutating, merging or (de)serializing a tree.
///
/// Every variant leaves the tree unchanged except where a merge or load is
/// documented as discarding partial state.
#[derive(Error, Debug, Clone)]
pub enum TreeError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node {sibling} is not a child of {parent}")]
    SiblingNotFound { parent: NodeId, sibling: NodeId },

    #[error("Edge not found: {from} -> {to}")]
    EdgeNotFound { from: NodeId, to: NodeId },

    #[error("Edge already exists: {from} -> {to}")]
    DuplicateEdge { from: NodeId, to: NodeId },

    #[error("Cannot attach node {0} to itself")]
    SelfAttachment(NodeId),

    #[error("Attaching {to} under {from} would create a cycle")]
    CycleDetected { from: NodeId, to: NodeId },

    #[error("Node {node} already has parent {parent}")]
    AlreadyAttached { node: NodeId, parent: NodeId },

    #[error("Type mismatch on {node}: expected {expected}, found {found}")]
    TypeMismatch {
        node: NodeId,
        expected: &'static str,
        found: NodeType,
    },

    #[error("Invalid index: {index} (length: {length})")]
    IndexOutOfBounds { index: usize, length: usize },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Write to {node} lost conflict resolution")]
    ConflictLost { node: NodeId },

    #[error("Edge {from} -> {to} points to a missing node")]
    DanglingEdge { from: NodeId, to: NodeId },

    #[error("Missing field in persisted tree: {0}")]
    MissingField(&'static str),

    #[error("Malformed node {node}: {reason}")]
    MalformedNode { node: NodeId, reason: String },

    #[error("Tree has no document to export")]
    EmptyTree,

    #[error("Cycle detected during export at {0}")]
    ExportCycle(NodeId),

    #[error("Node {0} carries no signature")]
    Unsigned(NodeId),

    #[error("Signature on {0} does not match its owner")]
    SignatureMismatch(NodeId),

    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for TreeError {
    fn from(err: serde_json::Error) -> Self {
        TreeError::Json(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TreeError>;
