use std::fmt::Debug;

use thiserror::Error;

use crate::hashtree::path::Prefix;
use crate::hashtree::proof::Proof;

pub mod binary;
pub mod conflict;
pub mod path;
pub mod proof;
pub mod publisher;

/// Deepest tree supported. Every leaf is materialized, so a depth-23 tree already holds 8M leaves.
pub const MAX_DEPTH: u8 = 23;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("index {index} is out of range for capacity {capacity}")]
  IndexOutOfRange { index: u64, capacity: u64 },
  #[error("invalid tree depth: {0} (expected 1..=23)")]
  InvalidDepth(u8),
  #[error("at least {leaves} leaves do not fit in capacity {capacity}")]
  CapacityExceeded { leaves: usize, capacity: u64 },
  #[error("leaf {0} has never been written")]
  NotFound(u64),
  #[error("malformed proof: {0}")]
  MalformedProof(String),
  #[error("snapshot is not a complete tree of depth {depth}: unexpected node {prefix}")]
  DepthMismatch { depth: u8, prefix: Prefix },
  #[error("lock for ancestor {0} is poisoned")]
  LockPoisoned(Prefix),
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// Digest function `H` used both for leaves and for combining two child digests.
pub trait Hasher: Send + Sync + 'static {
  type Digest: Clone + Eq + Debug + Send + Sync + 'static;

  /// Length in bytes of every digest produced by this hasher.
  const DIGEST_LEN: usize;

  fn hash(data: &[u8]) -> Self::Digest;

  /// `H(left || right)`. Not commutative.
  fn combine(left: &Self::Digest, right: &Self::Digest) -> Self::Digest;

  fn digest_bytes(digest: &Self::Digest) -> &[u8];

  fn digest_from_slice(bytes: &[u8]) -> Option<Self::Digest>;

  /// Digest of a leaf that was never written.
  fn empty() -> Self::Digest {
    Self::hash(&[])
  }
}

/// Default hasher backed by blake3.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3;

impl Hasher for Blake3 {
  type Digest = blake3::Hash;

  const DIGEST_LEN: usize = blake3::OUT_LEN;

  fn hash(data: &[u8]) -> Self::Digest {
    blake3::hash(data)
  }

  fn combine(left: &Self::Digest, right: &Self::Digest) -> Self::Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hasher.finalize()
  }

  fn digest_bytes(digest: &Self::Digest) -> &[u8] {
    digest.as_bytes()
  }

  fn digest_from_slice(bytes: &[u8]) -> Option<Self::Digest> {
    let bytes: [u8; blake3::OUT_LEN] = bytes.try_into().ok()?;
    Some(blake3::Hash::from_bytes(bytes))
  }
}

/// Core hash tree abstraction
pub trait HashTree {
  type Digest;
  type Error;

  /// Number of leaf levels below the root
  fn depth(&self) -> u8;

  /// Fixed number of leaf slots (`2^depth`)
  fn capacity(&self) -> u64;

  /// Retrieve data by index, `None` if the slot was never written
  fn get(&self, index: u64) -> std::result::Result<Option<Vec<u8>>, Self::Error>;

  /// Get the currently published root hash
  fn root_hash(&self) -> Self::Digest;

  /// Replace the value stored at the given index
  fn update(&self, index: u64, data: &[u8]) -> std::result::Result<(), Self::Error>;

  /// Generate proof path for given index
  fn generate_proof(&self, index: u64) -> std::result::Result<Proof<Self::Digest>, Self::Error>;

  /// Verify a proof from leaf to the given root
  fn verify_proof(
    &self,
    proof: &Proof<Self::Digest>,
    data: &[u8],
    root: &Self::Digest,
  ) -> std::result::Result<bool, Self::Error>;
}
