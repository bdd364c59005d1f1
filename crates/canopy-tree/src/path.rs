//! JSON-Pointer style addressing.
//!
//! `/` names the document node: the root's only visible child, or the root
//! itself once it has several. Keyed segments select a map entry by label,
//! numeric segments select a visible child of an array by index. `~1` and
//! `~0` escape `/` and `~` inside keys.

use crate::error::{Result, TreeError};
use crate::node::{Node, NodeId};
use crate::tree::Tree;
use serde_json::Value;

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Array index in canonical form: `0` or digits without a leading zero.
fn parse_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if segment.len() > 1 && segment.starts_with('0') {
        return None;
    }
    segment.parse().ok()
}

fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

impl Tree {
    /// The node `/` resolves to, if the root has any visible child.
    pub fn document_id(&self) -> Option<&NodeId> {
        let root = self.nodes.get(&self.root)?;
        let mut children = self.visible_children(root);
        let (_, first) = children.next()?;
        if children.next().is_none() {
            Some(&first.id)
        } else {
            Some(&self.root)
        }
    }

    /// Resolve a path such as `/friends/1/name`.
    pub fn get_node_by_path(&self, path: &str) -> Result<&Node> {
        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| TreeError::InvalidPath(path.to_string()))?;
        let not_found = || TreeError::PathNotFound(path.to_string());

        let document = self.document_id().ok_or_else(not_found)?;
        let mut current = self.require(document)?;
        if rest.is_empty() {
            return Ok(current);
        }
        for segment in rest.split('/') {
            current = self.step(current, &unescape(segment)).ok_or_else(not_found)?;
        }
        Ok(current)
    }

    fn step<'a>(&'a self, node: &'a Node, segment: &str) -> Option<&'a Node> {
        if self.exports_as_map(node) {
            return self
                .visible_children(node)
                .find(|(edge, _)| edge.label == segment)
                .map(|(_, child)| child);
        }
        if node.is_ordered() {
            let index = parse_index(segment)?;
            return self.visible_children(node).nth(index).map(|(_, child)| child);
        }
        None
    }

    /// Export the subtree at `path`.
    pub fn get_value_by_path(&self, path: &str) -> Result<Value> {
        let node = self.get_node_by_path(path)?;
        self.export_node(&node.id)
    }

    /// The string held by the literal at `path`.
    pub fn get_string_value_by_path(&self, path: &str) -> Result<String> {
        let node = self.get_node_by_path(path)?;
        node.literal()
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .ok_or_else(|| TreeError::TypeMismatch {
                node: node.id.clone(),
                expected: "string literal",
                found: node.node_type(),
            })
    }

    /// Path of a visible node, or `None` when it is tombstoned, hidden below
    /// a tombstone or not attached to the document.
    pub fn path_of(&self, id: &NodeId) -> Option<String> {
        let document = self.document_id()?;
        let mut segments = Vec::new();
        let mut current = id;

        // Bounded walk so a corrupted parent chain cannot loop forever.
        for _ in 0..=self.nodes.len() {
            let node = self.nodes.get(current)?;
            if node.deleted {
                return None;
            }
            if current == document {
                segments.reverse();
                return Some(if segments.is_empty() {
                    "/".to_string()
                } else {
                    segments.iter().map(|s| format!("/{}", s)).collect()
                });
            }
            let parent_id = self.parent_of(current)?;
            let parent = self.nodes.get(parent_id)?;
            segments.push(self.segment_for(parent, current)?);
            current = parent_id;
        }
        None
    }

    /// The path segment that selects `child` below `parent`.
    fn segment_for(&self, parent: &Node, child: &NodeId) -> Option<String> {
        if self.exports_as_map(parent) {
            return parent.edge_to(child).map(|edge| escape(&edge.label));
        }
        if parent.is_ordered() {
            return self
                .visible_children(parent)
                .position(|(edge, _)| &edge.to == child)
                .map(|index| index.to_string());
        }
        None
    }
}
