//! shared commitment registry
//!
//! Thread-safe wrapper around the merkle tree with write-through
//! persistence: a fresh insert is snapshotted to disk before the call
//! returns, so a crash can never forget an assigned leaf index.

use msingi_core::{Commitment, Hash, Inserted, MerkleError, MerkleProof, MerkleRegistry};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::info;

#[derive(Clone)]
pub struct RegistryService {
    inner: Arc<RwLock<MerkleRegistry>>,
    snapshot_path: PathBuf,
}

impl RegistryService {
    /// restore from the snapshot if one exists, otherwise start empty
    ///
    /// A present-but-unreadable snapshot propagates as an error; the
    /// caller must treat that as corrupt state, not begin empty.
    pub fn open(snapshot_path: &Path, depth: usize) -> Result<Self, MerkleError> {
        let tree = if snapshot_path.exists() {
            let tree = MerkleRegistry::restore(snapshot_path, depth)?;
            info!(
                "registry restored: {} leaves, root {}",
                tree.len(),
                hex::encode(&tree.root()[..8])
            );
            tree
        } else {
            info!("registry starting empty at depth {}", depth);
            MerkleRegistry::new(depth)
        };
        Ok(Self {
            inner: Arc::new(RwLock::new(tree)),
            snapshot_path: snapshot_path.to_path_buf(),
        })
    }

    /// insert a commitment; fresh inserts hit disk before returning
    pub fn insert(&self, commitment: Commitment) -> Result<(Inserted, Hash, u64), MerkleError> {
        let mut tree = self.inner.write().unwrap();
        let outcome = tree.insert(commitment)?;
        if outcome.is_fresh() {
            if let Err(e) = tree.snapshot(&self.snapshot_path) {
                // the leaf is not durable, so it is not assigned
                tree.revert_insert(&commitment);
                return Err(e);
            }
        }
        Ok((outcome, tree.root(), tree.len()))
    }

    pub fn contains(&self, commitment: &Commitment) -> bool {
        self.inner.read().unwrap().contains(commitment)
    }

    pub fn proof_for(&self, commitment: &Commitment) -> Result<MerkleProof, MerkleError> {
        self.inner.read().unwrap().proof_for(commitment)
    }

    pub fn root(&self) -> Hash {
        self.inner.read().unwrap().root()
    }

    pub fn len(&self) -> u64 {
        self.inner.read().unwrap().len()
    }

    pub fn capacity(&self) -> u64 {
        self.inner.read().unwrap().capacity()
    }

    /// periodic/shutdown snapshot; fresh inserts already persist inline
    pub fn snapshot(&self) -> Result<(), MerkleError> {
        self.inner.read().unwrap().snapshot(&self.snapshot_path)
    }
}
