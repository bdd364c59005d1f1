//! Change notifications emitted by tree mutations.
//!
//! The tree computes the JSON-Pointer path of every touched node and hands a
//! [`NodeEvent`] to an optional [`EventSink`]. Delivery policy (fan-out,
//! backpressure) belongs to the sink.

use crate::node::NodeId;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeEventKind {
    Added,
    Removed,
    Updated,
    MarkedDeleted,
}

impl fmt::Display for NodeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeEventKind::Added => "added",
            NodeEventKind::Removed => "removed",
            NodeEventKind::Updated => "updated",
            NodeEventKind::MarkedDeleted => "marked-deleted",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub node_id: NodeId,
    /// Path of the node at the time of the mutation, e.g. `/friends/1/name`.
    pub path: String,
}

/// Receiver of tree change events. Must not block.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: NodeEvent);
}
