//! append-only commitment registry
//!
//! Fixed-depth binary merkle tree over device commitments. Leaf values
//! are the commitments themselves; empty positions take the level-0
//! placeholder `Z[0] = 0^32`, with `Z[i] = node_hash(Z[i-1], Z[i-1])`
//! above. Leaf indexes are assigned in insertion order and persisted
//! with the snapshot, so the root survives restarts bit-for-bit.

use crate::commitment::Commitment;
use crate::hash::{node_hash, Hash};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// snapshot document version; bump on layout changes
pub const SNAPSHOT_SCHEMA: u32 = 1;

#[derive(Error, Debug)]
pub enum MerkleError {
    #[error("registry full: all {0} leaves in use")]
    RegistryFull(u64),

    #[error("commitment not registered")]
    NotFound,

    #[error("snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("snapshot depth {found} does not match configured depth {expected}")]
    DepthMismatch { expected: usize, found: usize },

    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
}

/// outcome of an insert; `Existing` carries the original index untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    Fresh(u64),
    Existing(u64),
}

impl Inserted {
    pub fn leaf_index(&self) -> u64 {
        match *self {
            Inserted::Fresh(i) | Inserted::Existing(i) => i,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Inserted::Fresh(_))
    }
}

/// merkle inclusion proof: fold the commitment up through `siblings`
/// (bit `i` set means the current node is the right child at level `i`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub siblings: Vec<Hash>,
    pub path_bits: Vec<bool>,
    pub root: Hash,
    pub leaf_index: u64,
}

impl MerkleProof {
    /// recompute the root from the commitment and check it matches
    pub fn verify(&self, commitment: &Commitment) -> bool {
        if self.siblings.len() != self.path_bits.len() {
            return false;
        }
        let mut current = commitment.to_bytes();
        for (sibling, is_right) in self.siblings.iter().zip(&self.path_bits) {
            current = if *is_right {
                node_hash(sibling, &current)
            } else {
                node_hash(&current, sibling)
            };
        }
        current == self.root
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotDoc {
    schema: u32,
    depth: usize,
    leaves: Vec<String>,
}

/// fixed-depth commitment tree with incremental path updates
pub struct MerkleRegistry {
    depth: usize,
    /// commitments in leaf_index order; the index IS the position
    leaves: Vec<Commitment>,
    index: HashMap<Commitment, u64>,
    /// nodes[level] holds the non-empty prefix of that level, level 1..=depth;
    /// positions past the end are the zero placeholder for the level
    nodes: Vec<Vec<Hash>>,
    /// Z[0..=depth] empty-subtree placeholders
    zeros: Vec<Hash>,
}

impl MerkleRegistry {
    pub fn new(depth: usize) -> Self {
        assert!(depth >= 1 && depth <= 32, "tree depth out of range");
        let mut zeros = Vec::with_capacity(depth + 1);
        zeros.push([0u8; 32]);
        for i in 1..=depth {
            let below = zeros[i - 1];
            zeros.push(node_hash(&below, &below));
        }
        Self {
            depth,
            leaves: Vec::new(),
            index: HashMap::new(),
            nodes: vec![Vec::new(); depth + 1],
            zeros,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> u64 {
        self.leaves.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn capacity(&self) -> u64 {
        1u64 << self.depth
    }

    /// leaves in leaf_index order
    pub fn leaves(&self) -> &[Commitment] {
        &self.leaves
    }

    pub fn contains(&self, commitment: &Commitment) -> bool {
        self.index.contains_key(commitment)
    }

    pub fn leaf_index_of(&self, commitment: &Commitment) -> Option<u64> {
        self.index.get(commitment).copied()
    }

    fn node_at(&self, level: usize, idx: u64) -> Hash {
        if level == 0 {
            return self
                .leaves
                .get(idx as usize)
                .map(|c| c.to_bytes())
                .unwrap_or(self.zeros[0]);
        }
        self.nodes[level]
            .get(idx as usize)
            .copied()
            .unwrap_or(self.zeros[level])
    }

    /// recompute the `depth` internal nodes along one leaf's path
    fn update_path(&mut self, leaf_index: u64) {
        let mut idx = leaf_index;
        for level in 1..=self.depth {
            let parent = idx >> 1;
            let left = self.node_at(level - 1, parent << 1);
            let right = self.node_at(level - 1, (parent << 1) | 1);
            let hash = node_hash(&left, &right);
            let row = &mut self.nodes[level];
            if (parent as usize) >= row.len() {
                row.resize(parent as usize + 1, self.zeros[level]);
            }
            row[parent as usize] = hash;
            idx = parent;
        }
    }

    /// insert a commitment, assigning the next unused leaf index
    ///
    /// Re-inserting a known commitment is a no-op returning its original
    /// index; the tree is not touched.
    pub fn insert(&mut self, commitment: Commitment) -> Result<Inserted, MerkleError> {
        if let Some(existing) = self.index.get(&commitment) {
            return Ok(Inserted::Existing(*existing));
        }
        if self.len() >= self.capacity() {
            return Err(MerkleError::RegistryFull(self.capacity()));
        }
        let leaf_index = self.leaves.len() as u64;
        self.leaves.push(commitment);
        self.index.insert(commitment, leaf_index);
        self.update_path(leaf_index);
        Ok(Inserted::Fresh(leaf_index))
    }

    /// back out the most recent insert (persistence write failed)
    ///
    /// Only valid for the last leaf; returns false if `commitment` is
    /// not the most recently inserted one.
    pub fn revert_insert(&mut self, commitment: &Commitment) -> bool {
        match self.leaves.last() {
            Some(last) if last == commitment => {}
            _ => return false,
        }
        let leaf_index = (self.leaves.len() - 1) as u64;
        self.leaves.pop();
        self.index.remove(commitment);
        // leaf 0 at this position again; re-hash the path
        self.update_path(leaf_index);
        true
    }

    pub fn root(&self) -> Hash {
        self.node_at(self.depth, 0)
    }

    /// inclusion proof for a registered commitment
    pub fn proof_for(&self, commitment: &Commitment) -> Result<MerkleProof, MerkleError> {
        let leaf_index = *self.index.get(commitment).ok_or(MerkleError::NotFound)?;
        let mut siblings = Vec::with_capacity(self.depth);
        let mut path_bits = Vec::with_capacity(self.depth);
        let mut idx = leaf_index;
        for level in 0..self.depth {
            siblings.push(self.node_at(level, idx ^ 1));
            path_bits.push(idx & 1 == 1);
            idx >>= 1;
        }
        Ok(MerkleProof {
            siblings,
            path_bits,
            root: self.root(),
            leaf_index,
        })
    }

    /// write the ordered leaf list to `path` via temp file + rename
    pub fn snapshot(&self, path: &Path) -> Result<(), MerkleError> {
        let doc = SnapshotDoc {
            schema: SNAPSHOT_SCHEMA,
            depth: self.depth,
            leaves: self.leaves.iter().map(|c| c.to_hex()).collect(),
        };
        let json = serde_json::to_vec(&doc)
            .map_err(|e| MerkleError::SnapshotCorrupt(format!("encode: {}", e)))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// rebuild a registry from a snapshot, re-inserting leaves in
    /// ascending leaf_index order and recomputing every node
    ///
    /// The stored root is never trusted; determinism of insertion order
    /// is what guarantees the recomputed root matches.
    pub fn restore(path: &Path, depth: usize) -> Result<Self, MerkleError> {
        let bytes = fs::read(path)?;
        let doc: SnapshotDoc = serde_json::from_slice(&bytes)
            .map_err(|e| MerkleError::SnapshotCorrupt(format!("decode: {}", e)))?;
        if doc.schema != SNAPSHOT_SCHEMA {
            return Err(MerkleError::SnapshotCorrupt(format!(
                "unknown schema {}",
                doc.schema
            )));
        }
        if doc.depth != depth {
            return Err(MerkleError::DepthMismatch {
                expected: depth,
                found: doc.depth,
            });
        }
        let mut registry = Self::new(depth);
        for (i, leaf_hex) in doc.leaves.iter().enumerate() {
            let commitment = Commitment::from_hex(leaf_hex)
                .ok_or_else(|| MerkleError::SnapshotCorrupt(format!("leaf {} not hex32", i)))?;
            match registry.insert(commitment)? {
                Inserted::Fresh(idx) if idx == i as u64 => {}
                _ => {
                    return Err(MerkleError::SnapshotCorrupt(format!(
                        "duplicate leaf at index {}",
                        i
                    )))
                }
            }
        }
        Ok(registry)
    }

    /// empty-subtree placeholder for a level (test vectors, witnesses)
    pub fn zero_at(&self, level: usize) -> Hash {
        self.zeros[level]
    }
}
