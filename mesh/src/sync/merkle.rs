//! Merkle tree over an entity collection
//!
//! Leaves are `(id, SHA-256(id || 0x00 || canonical content))` sorted by id, so
//! the root only depends on the set of entities and never on insertion order,
//! and the same content stored under another id is a different leaf. Parents hash
//! the concatenation of their children's hex digests; an odd trailing node is
//! hashed on its own into the next level.

use sha2::{Digest, Sha256};

/// Root reported for a collection with no entities.
pub const EMPTY_ROOT: &str = "EMPTY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleLeaf {
    pub id: String,
    pub hash: String,
}

impl MerkleLeaf {
    pub fn new(id: impl Into<String>, content: &[u8]) -> Self {
        let id = id.into();
        let hash = leaf_hash(&id, content);
        Self { id, hash }
    }
}

fn leaf_hash(id: &str, content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update([0u8]);
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    leaves: Vec<MerkleLeaf>,
    root: Option<String>,
}

impl MerkleTree {
    pub fn build(mut leaves: Vec<MerkleLeaf>) -> Self {
        leaves.sort_by(|a, b| a.id.cmp(&b.id));
        let root = compute_root(&leaves);
        Self { leaves, root }
    }

    pub fn root(&self) -> &str {
        self.root.as_deref().unwrap_or(EMPTY_ROOT)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Leaf ids in tree order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.leaves.iter().map(|leaf| leaf.id.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.leaves
            .binary_search_by(|leaf| leaf.id.as_str().cmp(id))
            .is_ok()
    }
}

fn compute_root(leaves: &[MerkleLeaf]) -> Option<String> {
    if leaves.is_empty() {
        return None;
    }

    let mut level: Vec<String> = leaves.iter().map(|leaf| leaf.hash.clone()).collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                for node in pair {
                    hasher.update(node.as_bytes());
                }
                format!("{:x}", hasher.finalize())
            })
            .collect();
    }
    level.pop()
}
