//! Inclusion proofs.
//!
//! A proof carries the sibling digests met on the way from a leaf to the root, nearest first.
//! Every sibling is tagged with the side it sits on so that verification recombines the
//! digests in exactly the order the tree did.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::hashtree::path::Side;
use crate::hashtree::{Error, Hasher, MAX_DEPTH, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sibling<D> {
  /// Side of the sibling relative to the node on the proven path.
  pub side: Side,
  pub hash: D,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof<D> {
  pub value: Vec<u8>,
  pub leaf_hash: D,
  /// Bottom-to-top.
  pub siblings: Vec<Sibling<D>>,
}

/// Recompute the root from `data` and the proof's siblings and compare it to `root`.
///
/// A digest mismatch is `Ok(false)`; only a sibling count that does not match `depth` is an error.
pub fn verify<H: Hasher>(depth: u8, proof: &Proof<H::Digest>, data: &[u8], root: &H::Digest) -> Result<bool> {
  if proof.siblings.len() != depth as usize {
    return Err(Error::MalformedProof(format!("{} siblings for a tree of depth {depth}", proof.siblings.len())));
  }
  let running = proof.siblings.iter().fold(H::hash(data), |running, sibling| match sibling.side {
    Side::Left => H::combine(&sibling.hash, &running),
    Side::Right => H::combine(&running, &sibling.hash),
  });
  Ok(running == *root)
}

const SIDE_LEFT: u8 = 0;
const SIDE_RIGHT: u8 = 1;

impl<D> Proof<D> {
  /// Write the proof as `value length (u32) | value | leaf hash | sibling count (u8) | (side, hash)*`.
  pub fn write<H: Hasher<Digest = D>, W: Write>(&self, w: &mut W) -> Result<usize> {
    let len = u32::try_from(self.value.len())
      .map_err(|_| Error::MalformedProof(format!("value of {} bytes is too large", self.value.len())))?;
    let count = u8::try_from(self.siblings.len())
      .ok()
      .filter(|count| *count <= MAX_DEPTH)
      .ok_or_else(|| Error::MalformedProof(format!("{} siblings", self.siblings.len())))?;

    w.write_u32::<LittleEndian>(len)?;
    w.write_all(&self.value)?;
    w.write_all(H::digest_bytes(&self.leaf_hash))?;
    w.write_u8(count)?;
    for sibling in &self.siblings {
      w.write_u8(match sibling.side {
        Side::Left => SIDE_LEFT,
        Side::Right => SIDE_RIGHT,
      })?;
      w.write_all(H::digest_bytes(&sibling.hash))?;
    }
    Ok(4 + self.value.len() + H::DIGEST_LEN + 1 + self.siblings.len() * (1 + H::DIGEST_LEN))
  }

  pub fn read<H: Hasher<Digest = D>, R: Read>(r: &mut R) -> Result<Self> {
    let len = r.read_u32::<LittleEndian>()? as u64;
    let mut value = Vec::new();
    r.by_ref().take(len).read_to_end(&mut value)?;
    if value.len() as u64 != len {
      return Err(Error::MalformedProof(format!("value truncated at {} of {len} bytes", value.len())));
    }
    let leaf_hash = read_digest::<H, R>(r)?;

    let count = r.read_u8()?;
    if count > MAX_DEPTH {
      return Err(Error::MalformedProof(format!("{count} siblings exceeds the maximum depth")));
    }
    let mut siblings = Vec::with_capacity(count as usize);
    for _ in 0..count {
      let side = match r.read_u8()? {
        SIDE_LEFT => Side::Left,
        SIDE_RIGHT => Side::Right,
        other => return Err(Error::MalformedProof(format!("unknown sibling side: {other}"))),
      };
      let hash = read_digest::<H, R>(r)?;
      siblings.push(Sibling { side, hash });
    }
    Ok(Proof { value, leaf_hash, siblings })
  }
}

fn read_digest<H: Hasher, R: Read>(r: &mut R) -> Result<H::Digest> {
  let mut buffer = vec![0u8; H::DIGEST_LEN];
  r.read_exact(&mut buffer)?;
  H::digest_from_slice(&buffer).ok_or_else(|| Error::MalformedProof("digest of unexpected length".to_string()))
}

#[cfg(test)]
mod test {
  use std::io::Cursor;

  use super::*;
  use crate::hashtree::Blake3;

  fn sample() -> Proof<blake3::Hash> {
    Proof {
      value: b"hello".to_vec(),
      leaf_hash: blake3::hash(b"hello"),
      siblings: vec![
        Sibling { side: Side::Right, hash: blake3::hash(b"a") },
        Sibling { side: Side::Left, hash: blake3::hash(b"b") },
      ],
    }
  }

  fn decode(bytes: &[u8]) -> Result<Proof<blake3::Hash>> {
    Proof::read::<Blake3, _>(&mut Cursor::new(bytes))
  }

  #[test]
  fn verify_respects_sides() {
    let proof = sample();
    let expected = Blake3::combine(
      &blake3::hash(b"b"),
      &Blake3::combine(&blake3::hash(b"hello"), &blake3::hash(b"a")),
    );
    assert!(verify::<Blake3>(2, &proof, b"hello", &expected).unwrap());

    // flipping a side tag changes the recomputed root
    let mut flipped = proof.clone();
    flipped.siblings[0].side = Side::Left;
    assert!(!verify::<Blake3>(2, &flipped, b"hello", &expected).unwrap());
  }

  #[test]
  fn verify_rejects_wrong_sibling_count() {
    let proof = sample();
    let root = blake3::hash(b"whatever");
    assert!(matches!(verify::<Blake3>(3, &proof, b"hello", &root), Err(Error::MalformedProof(_))));
    assert!(matches!(verify::<Blake3>(1, &proof, b"hello", &root), Err(Error::MalformedProof(_))));
  }

  #[test]
  fn encoding_preserves_proof() {
    let proof = sample();
    let mut buffer = Vec::new();
    let size = proof.write::<Blake3, _>(&mut buffer).unwrap();
    assert_eq!(buffer.len(), size);
    assert_eq!(4 + 5 + 32 + 1 + 2 * 33, size);
    let decoded = decode(&buffer).unwrap();
    assert_eq!(proof, decoded);
  }

  #[test]
  fn decoding_rejects_damaged_input() {
    let mut buffer = Vec::new();
    sample().write::<Blake3, _>(&mut buffer).unwrap();

    // truncated in the middle of a sibling digest
    let truncated = &buffer[..buffer.len() - 3];
    assert!(matches!(decode(truncated), Err(Error::Io(_))));

    // value length pointing past the end
    let mut long = buffer.clone();
    long[..4].copy_from_slice(&u32::MAX.to_le_bytes());
    assert!(matches!(decode(&long), Err(Error::MalformedProof(_))));

    // unknown side tag on the first sibling
    let mut side = buffer.clone();
    side[4 + 5 + 32 + 1] = 7;
    assert!(matches!(decode(&side), Err(Error::MalformedProof(_))));
  }
}
