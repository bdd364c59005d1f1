//! canopy SDK - thread-safe replicas of the canopy tree CRDT
//!
//! A [`Replica`] wraps one [`Tree`](canopy_tree::Tree) behind a lock, stamps
//! local edits with its replica id, optionally checks an
//! [`AccessPolicy`](canopy_tree::AccessPolicy) before each mutation and
//! publishes change events to path subscribers.
//!
//! # Quick Start
//!
//! ```rust
//! use canopy_sdk::{Replica, ReplicaConfigBuilder};
//!
//! let config = ReplicaConfigBuilder::new().replica_id("alice").build();
//! let replica = Replica::new(config);
//!
//! replica.import_json(br#"{"todo": ["write docs"]}"#).unwrap();
//! let todo = replica.node_at("/todo").unwrap();
//! replica.import_json_at(br#""ship it""#, &todo, "", None).unwrap();
//!
//! assert_eq!(
//!     replica.get("/todo").unwrap(),
//!     serde_json::json!(["write docs", "ship it"])
//! );
//! ```
//!
//! # Architecture
//!
//! - [`replica`] - The replica handle, its configuration and replication calls
//! - [`subscription`] - Path-scoped event fan-out over bounded channels
//! - [`error`] - Error types

pub mod error;
pub mod replica;
pub mod subscription;

pub use error::{Result, SdkError};
pub use replica::{Replica, ReplicaConfig, ReplicaConfigBuilder};
pub use subscription::{path_matches, SubscriptionHub};

pub use canopy_tree::{
    AccessPolicy, Action, Grant, MergeReport, NodeEvent, NodeEventKind, NodeId, NodeType,
    ReplicaId, SyncReport, Tree,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::SdkError;
    pub use crate::replica::{Replica, ReplicaConfig, ReplicaConfigBuilder};
    pub use canopy_tree::{AccessPolicy, Grant, NodeEvent, NodeEventKind, ReplicaId};
}
