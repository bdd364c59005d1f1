//! # canopy-core
//!
//! Building blocks shared by every replica of a canopy tree:
//!
//! - [`clock`] - replica identifiers and vector clocks
//! - [`resolver`] - the deterministic winner rule between two writes
//! - [`lseq`] - fractional positions for ordered siblings

pub mod clock;
pub mod lseq;
pub mod resolver;

pub use clock::{ClockOrdering, ReplicaId, VectorClock};
pub use lseq::{Position, BASE};
pub use resolver::{resolve, ResolveMode, Resolution};
