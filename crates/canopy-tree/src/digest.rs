//! Canonical node digests and the signing collaborator traits.
//!
//! The digest covers only identity-relevant state: id, owner, type flags,
//! literal value, nonce and the tombstone flag. Edges and clocks change under
//! merge and are left out, so a signature stays valid across replicas.

use crate::error::{Result, TreeError};
use crate::node::{Node, NodeId};
use crate::tree::Tree;
use canopy_core::ReplicaId;
use serde_json::json;
use sha2::{Digest as _, Sha256};
use std::fmt;
use ulid::Ulid;

/// A 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// SHA-256 over `parts` fed in order.
    pub fn of(parts: &[&[u8]]) -> Self {
        let mut sha = Sha256::new();
        for part in parts {
            sha.update(part);
        }
        Digest(sha.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Produces signatures over node digests on behalf of one replica.
pub trait NodeSigner {
    fn replica_id(&self) -> &ReplicaId;
    fn sign(&self, digest: &Digest) -> String;
}

/// Recovers the signing replica from a digest and signature.
pub trait SignatureVerifier {
    fn recover(&self, digest: &Digest, signature: &str) -> Option<ReplicaId>;
}

impl Node {
    /// Digest of the node's identity-relevant fields.
    ///
    /// Fields are encoded as a JSON object with sorted keys, followed by the
    /// nonce, so equal states hash equally on every replica.
    pub fn canonical_digest(&self) -> Digest {
        let literal = self.literal().map(|v| v.to_json());
        let encoded = json!({
            "id": self.id.as_str(),
            "owner": self.owner.as_str(),
            "isroot": self.is_root(),
            "ismap": self.is_map(),
            "isarray": self.is_array(),
            "isliteral": self.is_literal(),
            "literalValue": literal,
            "nonce": self.nonce.as_deref().unwrap_or(""),
            "deleted": self.deleted,
        });

        Digest::of(&[
            encoded.to_string().as_bytes(),
            self.nonce.as_deref().unwrap_or("").as_bytes(),
        ])
    }
}

impl Tree {
    /// Attach a fresh nonce and a signature by `signer` to a node.
    pub fn sign_node(&mut self, id: &NodeId, signer: &dyn NodeSigner) -> Result<Digest> {
        let node = self.node_mut(id)?;
        node.nonce = Some(Ulid::new().to_string());
        let digest = node.canonical_digest();
        node.signature = Some(signer.sign(&digest));
        tracing::debug!(node_id = %id, signer = %signer.replica_id(), "signed node");
        Ok(digest)
    }

    /// Check that a node's signature was produced by its current owner.
    pub fn verify_node(&self, id: &NodeId, verifier: &dyn SignatureVerifier) -> Result<ReplicaId> {
        let node = self.require(id)?;
        let signature = node
            .signature
            .as_deref()
            .ok_or_else(|| TreeError::Unsigned(id.clone()))?;
        match verifier.recover(&node.canonical_digest(), signature) {
            Some(signer) if signer == node.owner => Ok(signer),
            _ => Err(TreeError::SignatureMismatch(id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeType;

    /// Toy scheme: the signature is "<replica>:<digest hex>".
    struct PlainSigner(ReplicaId);

    impl NodeSigner for PlainSigner {
        fn replica_id(&self) -> &ReplicaId {
            &self.0
        }

        fn sign(&self, digest: &Digest) -> String {
            format!("{}:{}", self.0, digest.to_hex())
        }
    }

    struct PlainVerifier;

    impl SignatureVerifier for PlainVerifier {
        fn recover(&self, digest: &Digest, signature: &str) -> Option<ReplicaId> {
            let (replica, hex) = signature.split_once(':')?;
            (hex == digest.to_hex()).then(|| ReplicaId::from(replica))
        }
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        let digest = Digest::of(&["abc".as_bytes()]);
        assert_eq!(
            digest.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(Digest::of(&["a".as_bytes(), "bc".as_bytes()]), digest);
    }

    #[test]
    fn test_digest_ignores_edges_and_clock() {
        let alice = ReplicaId::from("alice");
        let mut tree = Tree::new();
        let root = tree.root_id().clone();
        let map = tree
            .create_attached_node("map", NodeType::Map, &root, &alice)
            .unwrap();
        let before = tree.node(&map).unwrap().canonical_digest();

        tree.set_key_value(&map, "k", "v", &alice).unwrap();
        let after = tree.node(&map).unwrap().canonical_digest();
        assert_eq!(before, after);
    }

    #[test]
    fn test_digest_covers_literal_value() {
        let alice = ReplicaId::from("alice");
        let mut tree = Tree::new();
        let leaf = tree.create_node("leaf", NodeType::Literal, &alice).unwrap();
        let before = tree.node(&leaf).unwrap().canonical_digest();
        tree.set_literal(&leaf, 42i64, &alice).unwrap();
        assert_ne!(before, tree.node(&leaf).unwrap().canonical_digest());
    }

    #[test]
    fn test_sign_and_verify() {
        let alice = ReplicaId::from("alice");
        let mut tree = Tree::new();
        let leaf = tree.create_node("leaf", NodeType::Literal, &alice).unwrap();

        assert!(matches!(
            tree.verify_node(&leaf, &PlainVerifier),
            Err(TreeError::Unsigned(_))
        ));

        tree.sign_node(&leaf, &PlainSigner(alice.clone())).unwrap();
        assert_eq!(tree.verify_node(&leaf, &PlainVerifier).unwrap(), alice);

        // Changing the value invalidates the signature.
        tree.set_literal(&leaf, "tampered", &alice).unwrap();
        assert!(matches!(
            tree.verify_node(&leaf, &PlainVerifier),
            Err(TreeError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn test_signature_by_non_owner_is_rejected() {
        let alice = ReplicaId::from("alice");
        let mut tree = Tree::new();
        let leaf = tree.create_node("leaf", NodeType::Literal, &alice).unwrap();
        tree.sign_node(&leaf, &PlainSigner(ReplicaId::from("mallory"))).unwrap();
        assert!(tree.verify_node(&leaf, &PlainVerifier).is_err());
    }
}
