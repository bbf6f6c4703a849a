//! Fixed-depth binary Merkle tree with indexed updates, side-tagged inclusion proofs and
//! conflict-aware concurrent batch updates.
//!
//! ```
//! use merkle_batch::hashtree::binary::MerkleTree;
//! use merkle_batch::hashtree::conflict::Transaction;
//!
//! let tree: MerkleTree = MerkleTree::new(3).unwrap();
//! tree.update(5, b"hello").unwrap();
//! let proof = tree.generate_proof(5).unwrap();
//! assert!(tree.verify_proof(&proof, b"hello", &tree.root_hash()).unwrap());
//!
//! let batch = vec![Transaction::new(0, "a"), Transaction::new(1, "b")];
//! tree.batch_update(&batch, 0).unwrap();
//! assert_eq!(Some(b"b".to_vec()), tree.get(1).unwrap());
//! ```

pub mod hashtree;

pub use hashtree::binary::MerkleTree;
pub use hashtree::conflict::{Transaction, find_conflicts};
pub use hashtree::proof::Proof;
pub use hashtree::{Blake3, Error, HashTree, Hasher, Result};

/// SplitMix64 finalizer, used to derive deterministic pseudo-random leaf values.
pub fn splitmix64(x: u64) -> u64 {
  let mut z = x.wrapping_add(0x9e3779b97f4a7c15);
  z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
  z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
  z ^ (z >> 31)
}
