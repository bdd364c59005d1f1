//! # canopy-tree
//!
//! A replicated, tree-shaped JSON document. Replicas mutate their own copy
//! without coordination and reconcile later through [`Tree::merge`].
//!
//! This crate provides:
//! - Typed nodes (root, map, array, literal) joined by labeled, LSEQ-positioned edges
//! - Local mutations stamped with the acting replica's clock
//! - Merge and two-way sync, including promotion of contested single children
//! - Structural validation (single root, single parent, acyclic)
//! - JSON import/export and JSON-Pointer style path lookups
//! - Full-state save/load, canonical node digests, access policies and change events
//!
//! ## Example
//!
//! ```rust
//! use canopy_tree::{ReplicaId, Tree};
//!
//! let alice = ReplicaId::from("alice");
//! let mut tree = Tree::new();
//! tree.import_json(br#"{"name": "Alice", "tags": ["a", "b"]}"#, &alice).unwrap();
//!
//! let mut copy = Tree::load(&tree.save().unwrap()).unwrap();
//! let bob = ReplicaId::from("bob");
//! let name = copy.get_node_by_path("/name").unwrap().id().clone();
//! copy.set_literal(&name, "Bob", &bob).unwrap();
//!
//! tree.sync_with(&mut copy).unwrap();
//! assert_eq!(tree.get_string_value_by_path("/name").unwrap(), "Bob");
//! ```

pub mod access;
pub mod digest;
pub mod error;
pub mod events;
pub mod json;
pub mod merge;
pub mod node;
pub mod path;
pub mod persist;
pub mod tree;
pub mod validate;

pub use access::{AccessPolicy, AccessRule, Action, Grant, WILDCARD};
pub use digest::{Digest, NodeSigner, SignatureVerifier};
pub use error::{Result, TreeError};
pub use events::{EventSink, NodeEvent, NodeEventKind};
pub use merge::{MergeReport, SyncReport};
pub use node::{Edge, Node, NodeId, NodeKind, NodeType, Scalar, ROOT_ID};
pub use tree::{TidyReport, Tree};
pub use validate::ValidationError;

pub use canopy_core::{ReplicaId, VectorClock};
