//! Path encoding: maps a leaf index to the bit string that names every node on its descent.
//!
//! A node at level `k` below the root is identified by the `k` most significant bits of the
//! `depth`-bit index of any leaf under it. Two leaves meet at the node named by their longest
//! common bit prefix. The identity depends only on the index and the depth, never on content.

use std::fmt::{self, Display};

use crate::hashtree::{Error, MAX_DEPTH, Result};

/// Direction taken at a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
  Left,
  Right,
}

impl Side {
  pub fn opposite(self) -> Side {
    match self {
      Side::Left => Side::Right,
      Side::Right => Side::Left,
    }
  }
}

/// Bit-string label of a node. The empty prefix is the root sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Prefix {
  len: u8,
  bits: u64,
}

impl Prefix {
  pub const ROOT: Prefix = Prefix { len: 0, bits: 0 };

  pub fn len(&self) -> u8 {
    self.len
  }

  pub fn is_root(&self) -> bool {
    self.len == 0
  }

  pub fn bits(&self) -> u64 {
    self.bits
  }

  /// The bit at `level` (0 = first branch below the root), `None` past the end.
  pub fn side_at(&self, level: u8) -> Option<Side> {
    if level >= self.len {
      return None;
    }
    let bit = (self.bits >> (self.len - 1 - level)) & 1;
    Some(if bit == 0 { Side::Left } else { Side::Right })
  }

  pub fn child(&self, side: Side) -> Prefix {
    debug_assert!(self.len < MAX_DEPTH);
    let bit = match side {
      Side::Left => 0,
      Side::Right => 1,
    };
    Prefix { len: self.len + 1, bits: (self.bits << 1) | bit }
  }

  pub fn parent(&self) -> Option<Prefix> {
    if self.is_root() { None } else { Some(Prefix { len: self.len - 1, bits: self.bits >> 1 }) }
  }

  /// Truncate to the first `len` bits.
  pub fn truncate(&self, len: u8) -> Prefix {
    if len >= self.len { *self } else { Prefix { len, bits: self.bits >> (self.len - len) } }
  }

  /// Longest common leading-bit run; the root sentinel when the first bits differ.
  pub fn common(&self, other: &Prefix) -> Prefix {
    let len = self.len.min(other.len);
    let (a, b) = (self.truncate(len), other.truncate(len));
    let diff = a.bits ^ b.bits;
    if diff == 0 {
      return a;
    }
    // bits at and below the highest differing one are dropped
    let differing = (u64::BITS - diff.leading_zeros()) as u8;
    a.truncate(len - differing)
  }

  /// True if the node named by `self` lies on the path to `other` (or is `other`).
  pub fn is_ancestor_of(&self, other: &Prefix) -> bool {
    self.len <= other.len && other.truncate(self.len) == *self
  }
}

impl Display for Prefix {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_root() {
      return f.write_str("*");
    }
    for i in (0..self.len).rev() {
      f.write_str(if (self.bits >> i) & 1 == 0 { "0" } else { "1" })?;
    }
    Ok(())
  }
}

/// `2^depth`, the number of leaves of a tree of the given depth.
pub fn capacity(depth: u8) -> u64 {
  1u64 << depth
}

/// Encode `index` as `depth` bits, most significant first.
pub fn encode(index: u64, depth: u8) -> Result<Prefix> {
  if depth > MAX_DEPTH {
    return Err(Error::InvalidDepth(depth));
  }
  let capacity = capacity(depth);
  if index >= capacity {
    return Err(Error::IndexOutOfRange { index, capacity });
  }
  Ok(Prefix { len: depth, bits: index })
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn encode_is_msb_first() {
    assert_eq!("000", encode(0, 3).unwrap().to_string());
    assert_eq!("001", encode(1, 3).unwrap().to_string());
    assert_eq!("110", encode(6, 3).unwrap().to_string());
    assert_eq!("1", encode(1, 1).unwrap().to_string());
    assert_eq!(Prefix::ROOT, encode(0, 0).unwrap());
    assert_eq!("*", encode(0, 0).unwrap().to_string());
  }

  #[test]
  fn encode_rejects_out_of_range() {
    assert!(matches!(encode(8, 3), Err(Error::IndexOutOfRange { index: 8, capacity: 8 })));
    assert!(matches!(encode(1, 0), Err(Error::IndexOutOfRange { index: 1, capacity: 1 })));
    assert!(matches!(encode(0, MAX_DEPTH + 1), Err(Error::InvalidDepth(_))));
    assert!(encode(capacity(MAX_DEPTH) - 1, MAX_DEPTH).is_ok());
  }

  #[test]
  fn common_prefix() {
    let p = |i| encode(i, 3).unwrap();
    assert_eq!("00", p(0).common(&p(1)).to_string());
    assert_eq!("0", p(1).common(&p(2)).to_string());
    assert_eq!(Prefix::ROOT, p(0).common(&p(7)));
    assert_eq!(Prefix::ROOT, p(3).common(&p(4)));
    assert_eq!(p(5), p(5).common(&p(5)));
    assert_eq!("1", p(5).common(&encode(1, 1).unwrap()).to_string());
  }

  #[test]
  fn ancestry() {
    let leaf = encode(5, 3).unwrap();
    assert!(Prefix::ROOT.is_ancestor_of(&leaf));
    assert!(leaf.truncate(1).is_ancestor_of(&leaf));
    assert!(leaf.truncate(2).is_ancestor_of(&leaf));
    assert!(leaf.is_ancestor_of(&leaf));
    assert!(!encode(0, 2).unwrap().is_ancestor_of(&leaf));
    assert!(!leaf.is_ancestor_of(&leaf.truncate(2)));
  }

  #[test]
  fn navigation_helpers() {
    let leaf = encode(6, 3).unwrap();
    assert_eq!(Some(Side::Right), leaf.side_at(0));
    assert_eq!(Some(Side::Right), leaf.side_at(1));
    assert_eq!(Some(Side::Left), leaf.side_at(2));
    assert_eq!(None, leaf.side_at(3));
    assert_eq!(Some(leaf.truncate(2)), leaf.parent());
    assert_eq!(None, Prefix::ROOT.parent());
    assert_eq!(leaf, leaf.truncate(2).child(Side::Left));
    assert_eq!(Side::Left, Side::Right.opposite());
  }
}
