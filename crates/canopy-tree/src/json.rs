//! JSON import and export.
//!
//! Objects become map nodes with one labeled edge per key, arrays become
//! array nodes with LSEQ-ordered edges, and scalars become literal nodes.
//! Export walks the same structure back, skipping tombstoned nodes.

use crate::error::{Result, TreeError};
use crate::node::{Edge, Node, NodeId, NodeType, Scalar};
use crate::tree::Tree;
use canopy_core::{Position, ReplicaId};
use serde_json::{Map, Value};
use std::collections::HashSet;

impl Tree {
    /// Import a JSON document under the root. Returns the id of the node
    /// holding the document.
    pub fn import_json(&mut self, raw: &[u8], replica: &ReplicaId) -> Result<NodeId> {
        self.import_json_at(raw, None, "", None, replica)
    }

    /// Import a JSON document under `parent` (the root when `None`).
    ///
    /// Under a map the document is stored at `edge_label`. Under an array or
    /// the root, `index` picks the insertion point among the visible
    /// children and `None` appends.
    pub fn import_json_at(
        &mut self,
        raw: &[u8],
        parent: Option<&NodeId>,
        edge_label: &str,
        index: Option<usize>,
        replica: &ReplicaId,
    ) -> Result<NodeId> {
        let value: Value = serde_json::from_slice(raw)?;
        self.import_value_at(&value, parent, edge_label, index, replica)
    }

    /// [`Tree::import_json_at`] for an already parsed value.
    pub fn import_value_at(
        &mut self,
        value: &Value,
        parent: Option<&NodeId>,
        edge_label: &str,
        index: Option<usize>,
        replica: &ReplicaId,
    ) -> Result<NodeId> {
        let parent = parent.cloned().unwrap_or_else(|| self.root.clone());
        self.check_import_target(&parent, index)?;

        let id = self.build_subtree(value, replica)?;
        let attached = if self.require(&parent)?.is_map() {
            self.add_edge(&parent, &id, edge_label, replica)
        } else {
            match index {
                Some(index) => self.insert_edge_at(&parent, &id, edge_label, index, replica),
                None => self.append_edge(&parent, &id, edge_label, replica),
            }
        };
        if let Err(err) = attached {
            self.discard_subtree(&id);
            return Err(err);
        }

        self.normalize();
        tracing::debug!(node_id = %id, parent = %parent, %replica, "imported JSON document");
        Ok(id)
    }

    /// Import a document into a map under `key`.
    pub fn import_json_to_map(
        &mut self,
        raw: &[u8],
        map: &NodeId,
        key: &str,
        replica: &ReplicaId,
    ) -> Result<NodeId> {
        let node = self.require(map)?;
        if !node.is_map() {
            return Err(TreeError::TypeMismatch {
                node: map.clone(),
                expected: "map",
                found: node.node_type(),
            });
        }
        self.import_json_at(raw, Some(map), key, None, replica)
    }

    /// Append a document to an array.
    pub fn import_json_to_array(
        &mut self,
        raw: &[u8],
        array: &NodeId,
        replica: &ReplicaId,
    ) -> Result<NodeId> {
        let node = self.require(array)?;
        if !node.is_array() {
            return Err(TreeError::TypeMismatch {
                node: array.clone(),
                expected: "array",
                found: node.node_type(),
            });
        }
        self.import_json_at(raw, Some(array), "", None, replica)
    }

    fn check_import_target(&self, parent: &NodeId, index: Option<usize>) -> Result<()> {
        let node = self.require(parent)?;
        if node.is_literal() {
            return Err(TreeError::TypeMismatch {
                node: parent.clone(),
                expected: "map, array or root",
                found: NodeType::Literal,
            });
        }
        if let (true, Some(index)) = (node.is_ordered(), index) {
            let length = self.visible_children(node).count();
            if index > length {
                return Err(TreeError::IndexOutOfBounds { index, length });
            }
        }
        Ok(())
    }

    /// Build a detached subtree for `value` and return its top node.
    fn build_subtree(&mut self, value: &Value, replica: &ReplicaId) -> Result<NodeId> {
        match value {
            Value::Object(entries) => {
                let map = self.create_node("map", NodeType::Map, replica)?;
                for (key, child) in entries {
                    let child = self.build_subtree(child, replica)?;
                    let edge = Edge::new(map.clone(), child, key, Position::empty());
                    self.attach_fresh(&map, edge, replica)?;
                }
                Ok(map)
            }
            Value::Array(items) => {
                let array = self.create_node("array", NodeType::Array, replica)?;
                // Spread the whole batch at once so a long array stays shallow.
                let positions = Position::evenly_spaced(items.len());
                for (item, position) in items.iter().zip(positions) {
                    let child = self.build_subtree(item, replica)?;
                    let edge = Edge::new(array.clone(), child, "", position);
                    self.attach_fresh(&array, edge, replica)?;
                }
                Ok(array)
            }
            scalar => {
                let value = Scalar::from_json(scalar).unwrap_or_default();
                Ok(self.create_literal_node("literal", value, replica))
            }
        }
    }

    /// Remove a detached subtree built by a failed import.
    fn discard_subtree(&mut self, id: &NodeId) {
        let mut stack = vec![id.clone()];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.remove(&next) {
                stack.extend(node.edges.into_iter().map(|e| e.to));
            }
        }
    }

    /// The document as a JSON value.
    pub fn export_value(&self) -> Result<Value> {
        let document = self.document_id().ok_or(TreeError::EmptyTree)?;
        self.export_node(document)
    }

    /// The document as pretty-printed JSON bytes.
    pub fn export_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.export_value()?)?)
    }

    /// Export the subtree below `id`.
    pub fn export_node(&self, id: &NodeId) -> Result<Value> {
        self.export_recursive(id, &mut HashSet::new())
    }

    /// Maps, and a root whose visible children all carry labels, export
    /// as JSON objects.
    pub(crate) fn exports_as_map(&self, node: &Node) -> bool {
        if node.is_map() {
            return true;
        }
        if !node.is_root() {
            return false;
        }
        let mut children = self.visible_children(node).peekable();
        children.peek().is_some() && children.all(|(edge, _)| !edge.label.is_empty())
    }

    fn export_recursive(&self, id: &NodeId, visiting: &mut HashSet<NodeId>) -> Result<Value> {
        let node = self.require(id)?;
        if let Some(value) = node.literal() {
            return Ok(value.to_json());
        }
        if !visiting.insert(id.clone()) {
            return Err(TreeError::ExportCycle(id.clone()));
        }

        let value = if self.exports_as_map(node) {
            let mut object = Map::new();
            for (edge, child) in self.visible_children(node) {
                // First edge in sibling order wins a contested key.
                if object.contains_key(&edge.label) {
                    continue;
                }
                let exported = self.export_recursive(&child.id, visiting)?;
                object.insert(edge.label.clone(), exported);
            }
            Value::Object(object)
        } else {
            let items = self
                .visible_children(node)
                .map(|(_, child)| self.export_recursive(&child.id, visiting))
                .collect::<Result<Vec<_>>>()?;
            Value::Array(items)
        };

        visiting.remove(id);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rid(s: &str) -> ReplicaId {
        ReplicaId::from(s)
    }

    fn import(doc: &Value) -> Tree {
        let mut tree = Tree::new();
        tree.import_json(doc.to_string().as_bytes(), &rid("alice"))
            .unwrap();
        tree
    }

    #[test]
    fn test_round_trip_nested_document() {
        let doc = json!({
            "name": "Alice",
            "age": 30,
            "score": 1.5,
            "active": true,
            "nickname": null,
            "tags": ["a", "b", ["c", "d"]],
            "friends": [{"name": "Bob", "uid": 7}, {"name": "Carol", "uid": 8}]
        });
        let tree = import(&doc);
        assert_eq!(tree.export_value().unwrap(), doc);

        let again = import(&tree.export_value().unwrap());
        assert_eq!(again.export_value().unwrap(), doc);
        assert_eq!(tree.validate(), Ok(()));
    }

    #[test]
    fn test_numbers_are_normalized() {
        let mut tree = Tree::new();
        tree.import_json(b"[1.0, 2, 2.5]", &rid("alice")).unwrap();
        assert_eq!(tree.export_value().unwrap(), json!([1, 2, 2.5]));
    }

    #[test]
    fn test_long_array_imports_with_shallow_positions() {
        let items: Vec<Value> = (0..1000).map(Value::from).collect();
        let tree = import(&Value::Array(items.clone()));
        let arr = tree.get_node_by_path("/").unwrap();
        assert_eq!(arr.edges.len(), 1000);
        assert!(arr.edges.iter().all(|e| e.position.depth() <= 3));
        assert!(arr.edges.windows(2).all(|w| w[0].position < w[1].position));
        assert_eq!(tree.export_value().unwrap(), Value::Array(items));
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn test_insert_into_imported_array() {
        let alice = rid("alice");
        let mut tree = import(&json!(["A", "B", "D"]));
        let arr = tree.get_node_by_path("/").unwrap().id().clone();
        let d = tree.get_sibling(&arr, 2).unwrap().id().clone();

        let c = tree.create_literal_node("literal", Scalar::from("C"), &alice);
        tree.insert_edge_left(&arr, &c, "", &d, &alice).unwrap();
        assert_eq!(tree.export_value().unwrap(), json!(["A", "B", "C", "D"]));
    }

    #[test]
    fn test_import_into_map_and_array() {
        let alice = rid("alice");
        let mut tree = import(&json!({"items": [1, 3], "meta": {}}));
        let items = tree.get_node_by_path("/items").unwrap().id().clone();
        let meta = tree.get_node_by_path("/meta").unwrap().id().clone();

        tree.import_json_at(b"2", Some(&items), "", Some(1), &alice)
            .unwrap();
        tree.import_json_to_array(br#"{"last": true}"#, &items, &alice)
            .unwrap();
        tree.import_json_to_map(b"[\"x\"]", &meta, "list", &alice)
            .unwrap();

        assert_eq!(
            tree.export_value().unwrap(),
            json!({"items": [1, 2, 3, {"last": true}], "meta": {"list": ["x"]}})
        );
        assert!(matches!(
            tree.import_json_to_map(b"1", &items, "k", &alice),
            Err(TreeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_import_leaves_tree_unchanged() {
        let alice = rid("alice");
        let mut tree = import(&json!([1, 2]));
        let arr = tree.get_node_by_path("/").unwrap().id().clone();
        let leaf = tree.get_node_by_path("/0").unwrap().id().clone();
        let before = tree.node_count();

        assert!(matches!(
            tree.import_json_at(b"[9]", Some(&arr), "", Some(3), &alice),
            Err(TreeError::IndexOutOfBounds { index: 3, length: 2 })
        ));
        assert!(matches!(
            tree.import_json_at(b"9", Some(&leaf), "", None, &alice),
            Err(TreeError::TypeMismatch { .. })
        ));
        assert!(matches!(
            tree.import_json_at(b"{broken", Some(&arr), "", None, &alice),
            Err(TreeError::Json(_))
        ));
        assert_eq!(tree.node_count(), before);
    }

    #[test]
    fn test_empty_tree_has_nothing_to_export() {
        assert!(matches!(Tree::new().export_value(), Err(TreeError::EmptyTree)));
    }

    #[test]
    fn test_tombstoned_elements_are_skipped() {
        let mut tree = import(&json!({"keep": 1, "drop": 2}));
        let drop = tree.get_node_by_path("/drop").unwrap().id().clone();
        tree.mark_deleted(&drop, &rid("alice")).unwrap();
        assert_eq!(tree.export_value().unwrap(), json!({"keep": 1}));
    }

    #[test]
    fn test_contested_key_exports_first_edge() {
        let alice = rid("alice");
        let mut tree = import(&json!({}));
        let map = tree.get_node_by_path("/").unwrap().id().clone();

        let first = NodeId::from("k-1");
        let second = NodeId::from("k-2");
        for (id, value) in [(&second, "second"), (&first, "first")] {
            tree.get_or_create_node(id, &alice);
            tree.set_literal(id, value, &alice).unwrap();
            tree.add_edge(&map, id, "k", &alice).unwrap();
        }
        assert_eq!(tree.export_value().unwrap(), json!({"k": "first"}));
        assert_eq!(tree.node_for_key(&map, "k").unwrap().unwrap().id(), &first);
    }

    #[test]
    fn test_root_with_several_children() {
        let alice = rid("alice");
        let mut tree = Tree::new();
        tree.import_json(b"1", &alice).unwrap();
        tree.import_json(b"2", &alice).unwrap();
        assert_eq!(tree.export_value().unwrap(), json!([1, 2]));

        let mut keyed = Tree::new();
        let root = keyed.root_id().clone();
        keyed.import_json_at(b"1", None, "a", None, &alice).unwrap();
        keyed.import_json_at(b"2", Some(&root), "b", None, &alice)
            .unwrap();
        assert_eq!(keyed.export_value().unwrap(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_export_detects_cycles() {
        let mut tree = import(&json!({"inner": {}}));
        let outer = tree.get_node_by_path("/").unwrap().id().clone();
        let inner = tree.get_node_by_path("/inner").unwrap().id().clone();
        tree.node_mut(&inner)
            .unwrap()
            .edges
            .push(Edge::new(inner.clone(), outer.clone(), "back", Position::empty()));

        assert!(matches!(
            tree.export_value(),
            Err(TreeError::ExportCycle(id)) if id == outer
        ));
    }

    #[test]
    fn test_export_json_is_pretty() {
        let tree = import(&json!({"a": [1]}));
        let text = String::from_utf8(tree.export_json().unwrap()).unwrap();
        assert!(text.contains('\n'));
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, json!({"a": [1]}));
    }
}
