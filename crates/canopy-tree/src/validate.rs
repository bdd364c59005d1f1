//! Structural invariant checks.
//!
//! [`Tree::validate`] is meant for tests, maintenance jobs and
//! post-merge assertions. It never mutates and reports the first violation.

use crate::node::{NodeId, NodeType};
use crate::tree::Tree;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// A broken structural invariant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Root node {0} is missing")]
    MissingRoot(NodeId),

    #[error("Root id {node} names a {found} node")]
    RootNotRoot { node: NodeId, found: NodeType },

    #[error("Tree has {count} root nodes")]
    MultipleRoots { count: usize },

    #[error("Root {root} has an incoming edge from {parent}")]
    RootHasParent { root: NodeId, parent: NodeId },

    #[error("Cycle detected: {from} -> {to}")]
    Cycle { from: NodeId, to: NodeId },

    #[error("Node {node} has two parents: {first} and {second}")]
    MultipleParents {
        node: NodeId,
        first: NodeId,
        second: NodeId,
    },

    #[error("Edge {from} -> {to} points to a missing node")]
    DanglingEdge { from: NodeId, to: NodeId },

    #[error("Edge stored on {owner} claims to start at {from}")]
    EdgeProvenance { owner: NodeId, from: NodeId },

    #[error("Literal node {0} has children")]
    LiteralWithChildren(NodeId),

    #[error("Node {parent} lists child {child} twice")]
    DuplicateChild { parent: NodeId, child: NodeId },

    #[error("Node {0} is unreachable from root")]
    Unreachable(NodeId),
}

enum Step<'a> {
    Enter(&'a NodeId),
    Exit(&'a NodeId),
}

impl Tree {
    /// Check every structural invariant of the tree.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.check_root()?;
        self.check_edge_lists()?;
        let visited = self.check_shape()?;

        if let Some(orphan) = self.nodes.keys().find(|id| !visited.contains(id)) {
            return Err(ValidationError::Unreachable(orphan.clone()));
        }
        Ok(())
    }

    /// Like [`Tree::validate`], but tolerates detached nodes still waiting
    /// for [`Tree::tidy`].
    pub fn validate_attached(&self) -> Result<(), ValidationError> {
        self.check_root()?;
        self.check_edge_lists()?;
        self.check_shape().map(|_| ())
    }

    fn check_root(&self) -> Result<(), ValidationError> {
        let root = self
            .nodes
            .get(&self.root)
            .ok_or_else(|| ValidationError::MissingRoot(self.root.clone()))?;
        if !root.is_root() {
            return Err(ValidationError::RootNotRoot {
                node: self.root.clone(),
                found: root.node_type(),
            });
        }
        let count = self.nodes.values().filter(|n| n.is_root()).count();
        if count > 1 {
            return Err(ValidationError::MultipleRoots { count });
        }
        Ok(())
    }

    /// Per-node checks that need no traversal.
    fn check_edge_lists(&self) -> Result<(), ValidationError> {
        for node in self.nodes.values() {
            if node.is_literal() && !node.edges.is_empty() {
                return Err(ValidationError::LiteralWithChildren(node.id.clone()));
            }
            let mut seen = HashSet::new();
            for edge in &node.edges {
                if edge.from != node.id {
                    return Err(ValidationError::EdgeProvenance {
                        owner: node.id.clone(),
                        from: edge.from.clone(),
                    });
                }
                if !self.nodes.contains_key(&edge.to) {
                    return Err(ValidationError::DanglingEdge {
                        from: node.id.clone(),
                        to: edge.to.clone(),
                    });
                }
                if edge.to == self.root {
                    return Err(ValidationError::RootHasParent {
                        root: self.root.clone(),
                        parent: node.id.clone(),
                    });
                }
                if !seen.insert(&edge.to) {
                    return Err(ValidationError::DuplicateChild {
                        parent: node.id.clone(),
                        child: edge.to.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Depth-first walk from root tracking the current ancestor chain and
    /// the parent of every visited node. Returns the visited set.
    fn check_shape(&self) -> Result<HashSet<&NodeId>, ValidationError> {
        let mut visited: HashSet<&NodeId> = HashSet::new();
        let mut ancestors: HashSet<&NodeId> = HashSet::new();
        let mut parents: HashMap<&NodeId, &NodeId> = HashMap::new();
        let mut stack = vec![Step::Enter(&self.root)];

        while let Some(step) = stack.pop() {
            let id = match step {
                Step::Exit(id) => {
                    ancestors.remove(id);
                    continue;
                }
                Step::Enter(id) => id,
            };
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            ancestors.insert(id);
            stack.push(Step::Exit(id));

            for edge in node.edges.iter().rev() {
                if ancestors.contains(&edge.to) {
                    return Err(ValidationError::Cycle {
                        from: id.clone(),
                        to: edge.to.clone(),
                    });
                }
                if let Some(first) = parents.insert(&edge.to, id) {
                    return Err(ValidationError::MultipleParents {
                        node: edge.to.clone(),
                        first: first.clone(),
                        second: id.clone(),
                    });
                }
                stack.push(Step::Enter(&edge.to));
            }
        }
        Ok(visited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Edge, NodeKind};
    use canopy_core::{Position, ReplicaId};

    fn sample() -> (Tree, NodeId, NodeId, NodeId) {
        let a = ReplicaId::from("a");
        let mut tree = Tree::new();
        let root = tree.root_id().clone();
        let map = tree.create_attached_node("map", NodeType::Map, &root, &a).unwrap();
        let arr = tree.create_attached_node("list", NodeType::Array, &map, &a).unwrap();
        let leaf = tree.set_key_value(&map, "k", "v", &a).unwrap();
        (tree, map, arr, leaf)
    }

    fn force_edge(tree: &mut Tree, from: &NodeId, to: &NodeId) {
        let edge = Edge::new(from.clone(), to.clone(), "", Position::new(vec![9]));
        tree.nodes.get_mut(from).unwrap().edges.push(edge);
    }

    #[test]
    fn test_well_formed_tree_passes() {
        let (tree, ..) = sample();
        assert_eq!(tree.validate(), Ok(()));
        assert_eq!(Tree::new().validate(), Ok(()));
    }

    #[test]
    fn test_cycle_is_reported() {
        let (mut tree, map, arr, _) = sample();
        force_edge(&mut tree, &arr, &map);
        assert_eq!(
            tree.validate(),
            Err(ValidationError::Cycle { from: arr, to: map })
        );
    }

    #[test]
    fn test_second_parent_is_reported() {
        let (mut tree, _, arr, leaf) = sample();
        force_edge(&mut tree, &arr, &leaf);
        assert!(matches!(
            tree.validate(),
            Err(ValidationError::MultipleParents { node, .. }) if node == leaf
        ));
    }

    #[test]
    fn test_literal_with_children_is_reported() {
        let (mut tree, _, arr, leaf) = sample();
        force_edge(&mut tree, &leaf, &arr);
        assert_eq!(
            tree.validate(),
            Err(ValidationError::LiteralWithChildren(leaf))
        );
    }

    #[test]
    fn test_dangling_edge_is_reported() {
        let (mut tree, _, arr, _) = sample();
        let ghost = NodeId::from("ghost");
        force_edge(&mut tree, &arr, &ghost);
        assert_eq!(
            tree.validate(),
            Err(ValidationError::DanglingEdge { from: arr, to: ghost })
        );
    }

    #[test]
    fn test_orphan_is_reported() {
        let (mut tree, ..) = sample();
        let orphan = tree
            .create_node("orphan", NodeType::Map, &ReplicaId::from("a"))
            .unwrap();
        assert_eq!(tree.validate(), Err(ValidationError::Unreachable(orphan)));
        assert_eq!(tree.validate_attached(), Ok(()));
    }

    #[test]
    fn test_root_checks() {
        let (mut tree, map, ..) = sample();
        let root = tree.root_id().clone();
        force_edge(&mut tree, &map, &root);
        assert!(matches!(
            tree.validate(),
            Err(ValidationError::RootHasParent { .. })
        ));

        let (mut tree, map, ..) = sample();
        tree.nodes.get_mut(&map).unwrap().kind = NodeKind::Root;
        assert_eq!(
            tree.validate(),
            Err(ValidationError::MultipleRoots { count: 2 })
        );

        let (mut tree, ..) = sample();
        let root = tree.root_id().clone();
        tree.nodes.remove(&root);
        assert_eq!(tree.validate(), Err(ValidationError::MissingRoot(root)));
    }
}
