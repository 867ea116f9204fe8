//! Nibble paths and the hex-prefix encoding used inside leaf and extension
//! nodes.
//!
//! Trie keys are sequences of 4-bit nibbles obtained by splitting each key
//! byte high-half first. Leaf and extension nodes store their path as a
//! hex-prefix byte-string whose first byte packs a terminator flag (leaf vs
//! extension) and the parity of the path length.

use std::fmt::{self, Debug, Display, LowerHex};

use bytes::Bytes;
use ethereum_types::H256;
use thiserror::Error;

/// A 4-bit value stored in a `u8` for convenience.
pub type Nibble = u8;

/// Flag bit marking a terminal (leaf) path in hex-prefix form.
const FLAG_TERMINATOR: u8 = 0b10;
/// Flag bit marking an odd-length path in hex-prefix form.
const FLAG_ODD: u8 = 0b01;

/// Errors produced when reading a hex-prefix encoding back into nibbles.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum HexPrefixError {
    /// The encoding was empty; even the empty path carries a flag byte.
    #[error("hex-prefix encoding is empty")]
    Empty,

    /// The flag nibble held bits outside the two defined ones.
    #[error("hex-prefix flags {0:#06b} are out of range")]
    InvalidFlags(u8),

    /// An even-length path carried a nonzero padding nibble.
    #[error("hex-prefix padding nibble is nonzero: {0:#x}")]
    DirtyPadding(u8),
}

/// An ordered sequence of nibbles; the key type for every trie operation.
#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Nibbles(Vec<Nibble>);

impl Nibbles {
    /// The empty path.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Builds a path from raw nibble values. Values above 15 are a caller
    /// bug.
    pub fn from_nibbles(nibbles: Vec<Nibble>) -> Self {
        debug_assert!(nibbles.iter().all(|&n| n < 16));
        Self(nibbles)
    }

    /// Splits each byte into two nibbles, high half first.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut nibbles = Vec::with_capacity(bytes.len() * 2);
        for &b in bytes {
            nibbles.push(b >> 4);
            nibbles.push(b & 0x0f);
        }
        Self(nibbles)
    }

    /// A 64-nibble path over the big-endian bytes of a hash.
    pub fn from_h256_be(h: H256) -> Self {
        Self::from_bytes(h.as_bytes())
    }

    /// Number of nibbles in the path.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the path holds no nibbles.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The nibbles as a slice.
    pub fn as_slice(&self) -> &[Nibble] {
        &self.0
    }

    /// Appends a single nibble, returning the extended path.
    pub fn join_nibble(&self, nibble: Nibble) -> Self {
        debug_assert!(nibble < 16);
        let mut out = self.0.clone();
        out.push(nibble);
        Self(out)
    }

    /// Concatenates two paths.
    pub fn join(&self, other: &Self) -> Self {
        let mut out = self.0.clone();
        out.extend_from_slice(&other.0);
        Self(out)
    }

    /// Packs an even-length path back into bytes; `None` for odd lengths.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        if self.0.len() % 2 != 0 {
            return None;
        }
        Some(
            self.0
                .chunks(2)
                .map(|pair| (pair[0] << 4) | pair[1])
                .collect(),
        )
    }

    /// Encodes the path plus a leaf/extension flag into a hex-prefix
    /// byte-string.
    pub fn to_hex_prefix_encoding(&self, is_leaf: bool) -> Bytes {
        let odd = self.0.len() % 2 == 1;
        let mut flags = if is_leaf { FLAG_TERMINATOR } else { 0 };
        if odd {
            flags |= FLAG_ODD;
        }

        let mut out = Vec::with_capacity(1 + self.0.len() / 2);
        let rest = if odd {
            out.push((flags << 4) | self.0[0]);
            &self.0[1..]
        } else {
            out.push(flags << 4);
            &self.0[..]
        };
        for pair in rest.chunks(2) {
            out.push((pair[0] << 4) | pair[1]);
        }

        out.into()
    }

    /// Decodes a hex-prefix byte-string back into a path and its leaf flag.
    pub fn from_hex_prefix_encoding(bytes: &[u8]) -> Result<(Self, bool), HexPrefixError> {
        let first = *bytes.first().ok_or(HexPrefixError::Empty)?;
        let flags = first >> 4;
        if flags > (FLAG_TERMINATOR | FLAG_ODD) {
            return Err(HexPrefixError::InvalidFlags(flags));
        }

        let is_leaf = flags & FLAG_TERMINATOR != 0;
        let odd = flags & FLAG_ODD != 0;

        let mut nibbles = Vec::with_capacity(bytes.len() * 2);
        if odd {
            nibbles.push(first & 0x0f);
        } else if first & 0x0f != 0 {
            return Err(HexPrefixError::DirtyPadding(first & 0x0f));
        }
        for &b in &bytes[1..] {
            nibbles.push(b >> 4);
            nibbles.push(b & 0x0f);
        }

        Ok((Self(nibbles), is_leaf))
    }
}

impl From<&[u8]> for Nibbles {
    fn from(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for Nibbles {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(&bytes)
    }
}

impl<const N: usize> From<&[u8; N]> for Nibbles {
    fn from(bytes: &[u8; N]) -> Self {
        Self::from_bytes(bytes)
    }
}

/// Length of the longest prefix shared by two nibble slices.
pub fn common_prefix_len(a: &[Nibble], b: &[Nibble]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

impl Display for Nibbles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl Debug for Nibbles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nibbles(0x{:x})", self)
    }
}

impl LowerHex for Nibbles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for n in &self.0 {
            write!(f, "{:x}", n)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nibs(ns: &[Nibble]) -> Nibbles {
        Nibbles::from_nibbles(ns.to_vec())
    }

    #[test]
    fn byte_splitting_is_high_half_first() {
        assert_eq!(Nibbles::from_bytes(&[0x12, 0xab]).as_slice(), &[1, 2, 0xa, 0xb]);
    }

    #[test]
    fn hex_prefix_known_vectors() {
        // Even-length extension: flag byte 0x00.
        assert_eq!(
            nibs(&[1, 2, 3, 4]).to_hex_prefix_encoding(false).to_vec(),
            vec![0x00, 0x12, 0x34]
        );
        // Even-length leaf: flag byte 0x20.
        assert_eq!(
            nibs(&[1, 2, 3, 4]).to_hex_prefix_encoding(true).to_vec(),
            vec![0x20, 0x12, 0x34]
        );
        // Odd-length extension folds the first nibble into the flag byte.
        assert_eq!(
            nibs(&[1, 2, 3, 4, 5]).to_hex_prefix_encoding(false).to_vec(),
            vec![0x11, 0x23, 0x45]
        );
        // Odd-length leaf.
        assert_eq!(
            nibs(&[1, 2, 3, 4, 5]).to_hex_prefix_encoding(true).to_vec(),
            vec![0x31, 0x23, 0x45]
        );
    }

    #[test]
    fn hex_prefix_roundtrip() {
        for len in 0..12 {
            for leaf in [false, true] {
                let path = nibs(&(0..len).map(|i| (i % 16) as u8).collect::<Vec<_>>());
                let encoded = path.to_hex_prefix_encoding(leaf);
                let (decoded, decoded_leaf) =
                    Nibbles::from_hex_prefix_encoding(&encoded).unwrap();
                assert_eq!(decoded, path);
                assert_eq!(decoded_leaf, leaf);
            }
        }
    }

    #[test]
    fn first_byte_disambiguates_leaf_from_extension() {
        let path = nibs(&[7, 7]);
        let leaf = path.to_hex_prefix_encoding(true);
        let ext = path.to_hex_prefix_encoding(false);
        assert_ne!(leaf[0], ext[0]);
        assert_eq!(&leaf[1..], &ext[1..]);
    }

    #[test]
    fn decode_rejects_bad_flags() {
        assert_eq!(
            Nibbles::from_hex_prefix_encoding(&[0x40]).unwrap_err(),
            HexPrefixError::InvalidFlags(4)
        );
        assert_eq!(
            Nibbles::from_hex_prefix_encoding(&[]).unwrap_err(),
            HexPrefixError::Empty
        );
    }

    #[test]
    fn common_prefix_lengths() {
        assert_eq!(common_prefix_len(&[1, 2, 3], &[1, 2, 4]), 2);
        assert_eq!(common_prefix_len(&[1, 2], &[1, 2, 4]), 2);
        assert_eq!(common_prefix_len(&[], &[1]), 0);
        assert_eq!(common_prefix_len(&[5], &[6]), 0);
    }

    #[test]
    fn to_bytes_requires_even_length() {
        assert_eq!(nibs(&[1, 2, 3, 4]).to_bytes(), Some(vec![0x12, 0x34]));
        assert_eq!(nibs(&[1, 2, 3]).to_bytes(), None);
    }
}
