use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::trace;

use crate::hashtree::conflict::LockTable;
use crate::hashtree::path::{Prefix, Side, capacity, encode};
use crate::hashtree::proof::{self, Proof, Sibling};
use crate::hashtree::publisher::RootPublisher;
use crate::hashtree::{Blake3, Error, HashTree, Hasher, MAX_DEPTH, Result};


#[derive(Debug, Clone)]
pub enum NodeKind<D> {
  Leaf { data: Vec<u8> },
  Branch { left: Arc<Node<D>>, right: Arc<Node<D>> },
}

/// Node representation in the hash tree. Nodes never change once built; an update creates new
/// nodes along the modified path and shares every untouched subtree.
#[derive(Debug, Clone)]
pub struct Node<D> {
  hash: D,
  prefix: Prefix,
  kind: NodeKind<D>,
}

impl<D> Node<D> {
  pub fn new_leaf<H: Hasher<Digest = D>>(prefix: Prefix, data: Vec<u8>) -> Self {
    let hash = H::hash(&data);
    Node { hash, prefix, kind: NodeKind::Leaf { data } }
  }

  pub fn new_branch<H: Hasher<Digest = D>>(prefix: Prefix, left: Arc<Node<D>>, right: Arc<Node<D>>) -> Self {
    debug_assert_eq!(prefix.child(Side::Left), left.prefix);
    debug_assert_eq!(prefix.child(Side::Right), right.prefix);
    let hash = H::combine(&left.hash, &right.hash);
    Node { hash, prefix, kind: NodeKind::Branch { left, right } }
  }

  pub fn hash(&self) -> &D {
    &self.hash
  }

  pub fn prefix(&self) -> Prefix {
    self.prefix
  }

  pub fn kind(&self) -> &NodeKind<D> {
    &self.kind
  }

  pub fn is_leaf(&self) -> bool {
    matches!(self.kind, NodeKind::Leaf { .. })
  }

  pub fn data(&self) -> Option<&[u8]> {
    match &self.kind {
      NodeKind::Leaf { data } => Some(data),
      NodeKind::Branch { .. } => None,
    }
  }

  pub fn child(&self, side: Side) -> Option<&Arc<Node<D>>> {
    match (&self.kind, side) {
      (NodeKind::Branch { left, .. }, Side::Left) => Some(left),
      (NodeKind::Branch { right, .. }, Side::Right) => Some(right),
      (NodeKind::Leaf { .. }, _) => None,
    }
  }
}

/// Build a complete tree of `2^depth` leaves bottom-up, padding the given values with empty leaves.
pub fn build<H: Hasher, I, V>(leaves: I, depth: u8) -> Result<Arc<Node<H::Digest>>>
where
  I: IntoIterator<Item = V>,
  V: Into<Vec<u8>>,
{
  if depth == 0 || depth > MAX_DEPTH {
    return Err(Error::InvalidDepth(depth));
  }
  let capacity = capacity(depth);
  let width = usize::try_from(capacity).map_err(|_| Error::InvalidDepth(depth))?;

  // Store all of the leaf nodes
  let mut leaves = leaves.into_iter();
  let mut nodes = Vec::with_capacity(width);
  let empty = H::empty();
  for i in 0..capacity {
    let prefix = encode(i, depth)?;
    let leaf = match leaves.next() {
      Some(data) => Node::new_leaf::<H>(prefix, data.into()),
      None => Node { hash: empty.clone(), prefix, kind: NodeKind::Leaf { data: Vec::new() } },
    };
    nodes.push(Arc::new(leaf));
  }
  if leaves.next().is_some() {
    return Err(Error::CapacityExceeded { leaves: width + 1, capacity });
  }

  // Store all of the branches, one level at a time
  let mut level = depth;
  while nodes.len() > 1 {
    level -= 1;
    let mut upper = Vec::with_capacity(nodes.len() / 2);
    let mut pairs = nodes.into_iter();
    while let (Some(left), Some(right)) = (pairs.next(), pairs.next()) {
      let prefix = encode(upper.len() as u64, level)?;
      upper.push(Arc::new(Node::new_branch::<H>(prefix, left, right)));
    }
    nodes = upper;
  }
  nodes.pop().ok_or(Error::InvalidDepth(depth))
}

/// One level crossed while descending: the node passed through, the subtree not taken, and the
/// side of `parent` the descent continued on.
#[derive(Debug, Clone)]
pub struct Step<D> {
  pub parent: Arc<Node<D>>,
  pub sibling: Arc<Node<D>>,
  pub side: Side,
}

/// Result of walking from a root to a leaf. `steps` are ordered top to bottom.
#[derive(Debug, Clone)]
pub struct Descent<D> {
  pub leaf: Arc<Node<D>>,
  pub steps: Vec<Step<D>>,
}

/// Walk from `root` to the leaf at `index` by narrowing the leaf range `[low, high]`.
///
/// `root` must span exactly `depth` levels; a leaf above the bottom or a branch at the bottom is a
/// [`Error::DepthMismatch`].
pub fn descend<D>(root: &Arc<Node<D>>, depth: u8, index: u64) -> Result<Descent<D>> {
  let capacity = capacity(depth);
  if index >= capacity {
    return Err(Error::IndexOutOfRange { index, capacity });
  }

  let (mut low, mut high) = (0u64, capacity - 1);
  let mut node = Arc::clone(root);
  let mut steps = Vec::with_capacity(depth as usize);
  while steps.len() < depth as usize {
    let mid = low + (high - low) / 2;
    match mid.cmp(&index) {
      Ordering::Less => {
        node = step(&mut steps, node, Side::Right, depth)?;
        low = mid + 1;
      }
      Ordering::Greater => {
        node = step(&mut steps, node, Side::Left, depth)?;
        high = mid;
      }
      Ordering::Equal => {
        // the target is the last leaf of the left half
        node = step(&mut steps, node, Side::Left, depth)?;
        while steps.len() < depth as usize {
          node = step(&mut steps, node, Side::Right, depth)?;
        }
      }
    }
  }
  if !node.is_leaf() {
    return Err(Error::DepthMismatch { depth, prefix: node.prefix });
  }
  Ok(Descent { leaf: node, steps })
}

fn step<D>(steps: &mut Vec<Step<D>>, node: Arc<Node<D>>, side: Side, depth: u8) -> Result<Arc<Node<D>>> {
  let (taken, sibling) = match (&node.kind, side) {
    (NodeKind::Branch { left, right }, Side::Left) => (Arc::clone(left), Arc::clone(right)),
    (NodeKind::Branch { left, right }, Side::Right) => (Arc::clone(right), Arc::clone(left)),
    (NodeKind::Leaf { .. }, _) => return Err(Error::DepthMismatch { depth, prefix: node.prefix }),
  };
  steps.push(Step { parent: node, sibling, side });
  Ok(taken)
}

/// Rebuild the path of `descent` bottom-up around a fresh leaf, reusing every sibling.
fn rebuild<H: Hasher>(descent: &Descent<H::Digest>, data: Vec<u8>) -> Arc<Node<H::Digest>> {
  let mut node = Arc::new(Node::new_leaf::<H>(descent.leaf.prefix, data));
  for step in descent.steps.iter().rev() {
    let sibling = Arc::clone(&step.sibling);
    let (left, right) = match step.side {
      Side::Left => (node, sibling),
      Side::Right => (sibling, node),
    };
    node = Arc::new(Node::new_branch::<H>(step.parent.prefix, left, right));
  }
  node
}

/// Fixed-depth binary hash tree shared between concurrent writers and readers.
pub struct MerkleTree<H: Hasher = Blake3> {
  depth: u8,
  capacity: u64,
  root: RootPublisher<H::Digest>,
  pub(crate) locks: LockTable,
  _hasher: PhantomData<fn() -> H>,
}

impl<H: Hasher> MerkleTree<H> {
  /// Build a tree of the given depth from the leading leaf values; the rest are empty.
  pub fn build<I, V>(leaves: I, depth: u8) -> Result<Self>
  where
    I: IntoIterator<Item = V>,
    V: Into<Vec<u8>>,
  {
    let root = build::<H, I, V>(leaves, depth)?;
    Ok(MerkleTree {
      depth,
      capacity: capacity(depth),
      root: RootPublisher::new(root),
      locks: LockTable::default(),
      _hasher: PhantomData,
    })
  }

  /// An all-empty tree of the given depth.
  pub fn new(depth: u8) -> Result<Self> {
    Self::build(std::iter::empty::<Vec<u8>>(), depth)
  }

  pub fn depth(&self) -> u8 {
    self.depth
  }

  pub fn capacity(&self) -> u64 {
    self.capacity
  }

  /// The currently published root. It stays internally consistent while held.
  pub fn snapshot(&self) -> Arc<Node<H::Digest>> {
    self.root.load()
  }

  pub fn root_hash(&self) -> H::Digest {
    self.root.load().hash.clone()
  }

  pub fn get(&self, index: u64) -> Result<Option<Vec<u8>>> {
    let descent = descend(&self.snapshot(), self.depth, index)?;
    if descent.leaf.hash == H::empty() {
      return Ok(None);
    }
    Ok(descent.leaf.data().map(<[u8]>::to_vec))
  }

  /// Install `data` at `index` and publish the recomputed root.
  pub fn update(&self, index: u64, data: &[u8]) -> Result<()> {
    let mut base = self.root.load();
    let mut retries = 0usize;
    loop {
      let descent = descend(&base, self.depth, index)?;
      let root = rebuild::<H>(&descent, data.to_vec());
      match self.root.compare_and_publish(&base, root) {
        Ok(()) => break,
        Err(current) => {
          base = current;
          retries += 1;
        }
      }
    }
    trace!(index, retries, "leaf updated");
    Ok(())
  }

  pub fn generate_proof(&self, index: u64) -> Result<Proof<H::Digest>> {
    self.generate_proof_at(&self.snapshot(), index)
  }

  /// Generate a proof against a previously pinned snapshot rather than the latest root.
  pub fn generate_proof_at(&self, snapshot: &Arc<Node<H::Digest>>, index: u64) -> Result<Proof<H::Digest>> {
    let descent = descend(snapshot, self.depth, index)?;
    let leaf = &descent.leaf;
    if leaf.hash == H::empty() {
      return Err(Error::NotFound(index));
    }
    let siblings = descent
      .steps
      .iter()
      .rev()
      .map(|step| Sibling { side: step.side.opposite(), hash: step.sibling.hash.clone() })
      .collect();
    let value = leaf.data().map(<[u8]>::to_vec).unwrap_or_default();
    Ok(Proof { value, leaf_hash: leaf.hash.clone(), siblings })
  }

  pub fn verify_proof(&self, proof: &Proof<H::Digest>, data: &[u8], root: &H::Digest) -> Result<bool> {
    proof::verify::<H>(self.depth, proof, data, root)
  }
}

impl<H: Hasher> HashTree for MerkleTree<H> {
  type Digest = H::Digest;
  type Error = Error;

  fn depth(&self) -> u8 {
    self.depth
  }

  fn capacity(&self) -> u64 {
    self.capacity
  }

  fn get(&self, index: u64) -> Result<Option<Vec<u8>>> {
    MerkleTree::get(self, index)
  }

  fn root_hash(&self) -> H::Digest {
    MerkleTree::root_hash(self)
  }

  fn update(&self, index: u64, data: &[u8]) -> Result<()> {
    MerkleTree::update(self, index, data)
  }

  fn generate_proof(&self, index: u64) -> Result<Proof<H::Digest>> {
    MerkleTree::generate_proof(self, index)
  }

  fn verify_proof(&self, proof: &Proof<H::Digest>, data: &[u8], root: &H::Digest) -> Result<bool> {
    MerkleTree::verify_proof(self, proof, data, root)
  }
}
