//! Error types for the canopy SDK.

use canopy_tree::{Action, NodeId, ReplicaId, TreeError};
use thiserror::Error;

/// Error type for SDK operations.
#[derive(Error, Debug)]
pub enum SdkError {
    /// The underlying tree rejected the operation.
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("Replica {replica} may not {action} node {node}")]
    AccessDenied {
        replica: ReplicaId,
        action: Action,
        node: NodeId,
    },

    /// The replica was closed.
    #[error("Replica {0} is closed")]
    Closed(ReplicaId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;
