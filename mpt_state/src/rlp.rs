//! Recursive-Length Prefix serialization.
//!
//! An RLP datum is either a byte-string or an ordered list of data, and the
//! encoding is fully determined by that shape. Every structure this crate
//! persists (trie nodes, accounts) and everything layered above it
//! (transactions, headers, receipts) passes through this module, so the byte
//! layout here is consensus-critical.

use bytes::Bytes;
use ethereum_types::{H160, H256, U256};
use thiserror::Error;

/// Single-byte payloads below this value encode as themselves.
const SINGLE_BYTE_MAX: u8 = 0x80;
/// Offset for short (≤ 55 byte) string headers.
const STRING_OFFSET: u8 = 0x80;
/// Offset for short (≤ 55 byte payload) list headers.
const LIST_OFFSET: u8 = 0xc0;
/// Longest payload expressible with a single-byte header.
const SHORT_PAYLOAD_MAX: usize = 55;

/// The canonical RLP encoding of the empty byte-string, `0x80`.
pub const EMPTY_STRING_RLP: [u8; 1] = [0x80];

/// Result alias for decoding and typed item access.
pub type RlpResult<T> = Result<T, RlpError>;

/// Errors produced while decoding RLP input or reading typed fields out of a
/// decoded item.
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum RlpError {
    /// The input ended before the bytes its header promised.
    #[error("rlp input truncated: needed {needed} more bytes, had {remaining}")]
    Truncated {
        /// Bytes still required by the current header.
        needed: usize,
        /// Bytes actually left in the input.
        remaining: usize,
    },

    /// A top-level decode left unconsumed bytes behind.
    #[error("rlp input has {0} trailing bytes after the first item")]
    TrailingBytes(usize),

    /// A typed accessor expected a byte-string item.
    #[error("expected an rlp byte-string, found a list")]
    ExpectedString,

    /// A typed accessor expected a list item.
    #[error("expected an rlp list, found a byte-string")]
    ExpectedList,

    /// An integer field was wider than 256 bits.
    #[error("integer field is {0} bytes wide, the maximum is 32")]
    IntegerTooLarge(usize),

    /// A fixed-width field (hash, address) had the wrong length.
    #[error("fixed-width field is {actual} bytes, expected {expected}")]
    UnexpectedLength {
        /// Width the caller required.
        expected: usize,
        /// Width actually present.
        actual: usize,
    },

    /// A list held the wrong number of items for the structure being read.
    #[error("list has {actual} items, expected {expected}")]
    WrongItemCount {
        /// Item count the caller required.
        expected: usize,
        /// Item count actually present.
        actual: usize,
    },
}

/// A decoded RLP datum: a byte-string or a list of further data.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum RlpItem {
    /// A byte-string.
    Str(Bytes),
    /// An ordered list of items.
    List(Vec<RlpItem>),
}

impl RlpItem {
    /// A byte-string item.
    pub fn str(bytes: impl Into<Bytes>) -> Self {
        Self::Str(bytes.into())
    }

    /// The empty byte-string item.
    pub fn empty() -> Self {
        Self::Str(Bytes::new())
    }

    /// A list item.
    pub fn list(items: Vec<RlpItem>) -> Self {
        Self::List(items)
    }

    /// An unsigned integer as its shortest big-endian byte-string. Zero
    /// encodes as the empty string.
    pub fn uint(v: U256) -> Self {
        let mut buf = [0u8; 32];
        v.to_big_endian(&mut buf);
        let skip = (v.leading_zeros() / 8) as usize;
        Self::Str(Bytes::copy_from_slice(&buf[skip..]))
    }

    /// A 32-byte hash as a byte-string.
    pub fn hash(h: H256) -> Self {
        Self::Str(Bytes::copy_from_slice(h.as_bytes()))
    }

    /// A 20-byte address as a byte-string.
    pub fn address(a: H160) -> Self {
        Self::Str(Bytes::copy_from_slice(a.as_bytes()))
    }

    /// The raw bytes of a string item.
    pub fn as_str(&self) -> RlpResult<&[u8]> {
        match self {
            Self::Str(b) => Ok(b),
            Self::List(_) => Err(RlpError::ExpectedString),
        }
    }

    /// The items of a list.
    pub fn as_list(&self) -> RlpResult<&[RlpItem]> {
        match self {
            Self::Str(_) => Err(RlpError::ExpectedList),
            Self::List(items) => Ok(items),
        }
    }

    /// The items of a list, checked against an expected arity.
    pub fn as_list_of(&self, expected: usize) -> RlpResult<&[RlpItem]> {
        let items = self.as_list()?;
        if items.len() != expected {
            return Err(RlpError::WrongItemCount {
                expected,
                actual: items.len(),
            });
        }
        Ok(items)
    }

    /// A string item read back as a big-endian unsigned integer. Leading
    /// zeros are tolerated on decode; encoders never emit them.
    pub fn as_uint(&self) -> RlpResult<U256> {
        let bytes = self.as_str()?;
        let stripped = strip_leading_zeros(bytes);
        if stripped.len() > 32 {
            return Err(RlpError::IntegerTooLarge(bytes.len()));
        }
        Ok(U256::from_big_endian(stripped))
    }

    /// An integer field narrowed to `u64`.
    pub fn as_u64(&self) -> RlpResult<u64> {
        let v = self.as_uint()?;
        if v.bits() > 64 {
            return Err(RlpError::IntegerTooLarge(self.as_str()?.len()));
        }
        Ok(v.low_u64())
    }

    /// A string item required to be exactly 32 bytes.
    pub fn as_hash(&self) -> RlpResult<H256> {
        let bytes = self.as_str()?;
        if bytes.len() != 32 {
            return Err(RlpError::UnexpectedLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        Ok(H256::from_slice(bytes))
    }

    /// A string item required to be exactly 20 bytes.
    pub fn as_address(&self) -> RlpResult<H160> {
        let bytes = self.as_str()?;
        if bytes.len() != 20 {
            return Err(RlpError::UnexpectedLength {
                expected: 20,
                actual: bytes.len(),
            });
        }
        Ok(H160::from_slice(bytes))
    }

    /// Whether this is the empty byte-string.
    pub fn is_empty_str(&self) -> bool {
        matches!(self, Self::Str(b) if b.is_empty())
    }
}

/// Canonically encodes an item.
pub fn encode(item: &RlpItem) -> Bytes {
    let mut out = Vec::new();
    encode_into(item, &mut out);
    out.into()
}

fn encode_into(item: &RlpItem, out: &mut Vec<u8>) {
    match item {
        RlpItem::Str(bytes) => {
            if bytes.len() == 1 && bytes[0] < SINGLE_BYTE_MAX {
                out.push(bytes[0]);
            } else {
                encode_header(bytes.len(), STRING_OFFSET, out);
                out.extend_from_slice(bytes);
            }
        }
        RlpItem::List(items) => {
            let mut payload = Vec::new();
            for inner in items {
                encode_into(inner, &mut payload);
            }
            encode_header(payload.len(), LIST_OFFSET, out);
            out.extend_from_slice(&payload);
        }
    }
}

fn encode_header(len: usize, offset: u8, out: &mut Vec<u8>) {
    if len <= SHORT_PAYLOAD_MAX {
        out.push(offset + len as u8);
    } else {
        let be = len.to_be_bytes();
        let be = strip_leading_zeros(&be);
        out.push(offset + SHORT_PAYLOAD_MAX as u8 + be.len() as u8);
        out.extend_from_slice(be);
    }
}

/// Decodes a single item that must span the entire input.
pub fn decode(buf: &[u8]) -> RlpResult<RlpItem> {
    let (item, consumed) = decode_prefix(buf)?;
    if consumed != buf.len() {
        return Err(RlpError::TrailingBytes(buf.len() - consumed));
    }
    Ok(item)
}

/// Decodes the item at the front of `buf`, returning it together with the
/// number of bytes consumed. Non-minimal length prefixes are accepted;
/// [`encode`] always produces the canonical form.
pub fn decode_prefix(buf: &[u8]) -> RlpResult<(RlpItem, usize)> {
    let first = *buf.first().ok_or(RlpError::Truncated {
        needed: 1,
        remaining: 0,
    })?;

    match first {
        0x00..=0x7f => Ok((RlpItem::Str(Bytes::copy_from_slice(&[first])), 1)),
        0x80..=0xb7 => {
            let len = (first - 0x80) as usize;
            let payload = take(buf, 1, len)?;
            Ok((RlpItem::Str(Bytes::copy_from_slice(payload)), 1 + len))
        }
        0xb8..=0xbf => {
            let len_of_len = (first - 0xb7) as usize;
            let len = read_length(buf, len_of_len)?;
            let payload = take(buf, 1 + len_of_len, len)?;
            Ok((
                RlpItem::Str(Bytes::copy_from_slice(payload)),
                1 + len_of_len + len,
            ))
        }
        0xc0..=0xf7 => {
            let len = (first - 0xc0) as usize;
            let payload = take(buf, 1, len)?;
            Ok((RlpItem::List(decode_items(payload)?), 1 + len))
        }
        0xf8..=0xff => {
            let len_of_len = (first - 0xf7) as usize;
            let len = read_length(buf, len_of_len)?;
            let payload = take(buf, 1 + len_of_len, len)?;
            Ok((RlpItem::List(decode_items(payload)?), 1 + len_of_len + len))
        }
    }
}

fn decode_items(mut payload: &[u8]) -> RlpResult<Vec<RlpItem>> {
    let mut items = Vec::new();
    while !payload.is_empty() {
        let (item, consumed) = decode_prefix(payload)?;
        items.push(item);
        payload = &payload[consumed..];
    }
    Ok(items)
}

fn read_length(buf: &[u8], len_of_len: usize) -> RlpResult<usize> {
    let be = take(buf, 1, len_of_len)?;
    if be.len() > std::mem::size_of::<usize>() {
        // A length this wide cannot fit in memory anyway; report it as the
        // truncation it necessarily is.
        return Err(RlpError::Truncated {
            needed: usize::MAX,
            remaining: buf.len(),
        });
    }
    let mut len = 0usize;
    for &b in be {
        len = (len << 8) | b as usize;
    }
    Ok(len)
}

fn take(buf: &[u8], start: usize, len: usize) -> RlpResult<&[u8]> {
    let end = start.checked_add(len).ok_or(RlpError::Truncated {
        needed: len,
        remaining: buf.len().saturating_sub(start),
    })?;
    buf.get(start..end).ok_or(RlpError::Truncated {
        needed: end - buf.len().min(end),
        remaining: buf.len().saturating_sub(start),
    })
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    &bytes[skip..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc_str(s: &[u8]) -> Vec<u8> {
        encode(&RlpItem::str(s.to_vec())).to_vec()
    }

    #[test]
    fn empty_string_is_0x80() {
        assert_eq!(enc_str(b""), vec![0x80]);
    }

    #[test]
    fn single_low_byte_encodes_as_itself() {
        assert_eq!(enc_str(&[0x04]), vec![0x04]);
        assert_eq!(enc_str(&[0x7f]), vec![0x7f]);
    }

    #[test]
    fn single_high_byte_gets_a_header() {
        assert_eq!(enc_str(&[0x80]), vec![0x81, 0x80]);
    }

    #[test]
    fn two_byte_string() {
        assert_eq!(enc_str(&[0x04, 0x00]), vec![0x82, 0x04, 0x00]);
    }

    #[test]
    fn long_string_uses_length_of_length() {
        let sixty_a = vec![b'A'; 60];
        let mut expected = vec![0xb8, 0x3c];
        expected.extend_from_slice(&sixty_a);
        assert_eq!(enc_str(&sixty_a), expected);
    }

    #[test]
    fn nested_empty_lists() {
        // [ [], [[]], [ [], [[]] ] ]
        let item = RlpItem::list(vec![
            RlpItem::list(vec![]),
            RlpItem::list(vec![RlpItem::list(vec![])]),
            RlpItem::list(vec![
                RlpItem::list(vec![]),
                RlpItem::list(vec![RlpItem::list(vec![])]),
            ]),
        ]);
        assert_eq!(
            encode(&item).to_vec(),
            vec![0xc7, 0xc0, 0xc1, 0xc0, 0xc3, 0xc0, 0xc1, 0xc0]
        );
    }

    #[test]
    fn long_list_uses_length_of_length() {
        let items: Vec<_> = (0..60).map(|_| RlpItem::str(vec![b'x'])).collect();
        let encoded = encode(&RlpItem::list(items)).to_vec();
        assert_eq!(encoded[0], 0xf8);
        assert_eq!(encoded[1], 60);
        assert_eq!(encoded.len(), 62);
    }

    #[test]
    fn uint_adapter_is_minimal_big_endian() {
        assert_eq!(encode(&RlpItem::uint(U256::zero())).to_vec(), vec![0x80]);
        assert_eq!(encode(&RlpItem::uint(15.into())).to_vec(), vec![0x0f]);
        assert_eq!(
            encode(&RlpItem::uint(1024.into())).to_vec(),
            vec![0x82, 0x04, 0x00]
        );
    }

    #[test]
    fn uint_roundtrip() {
        for v in [0u64, 1, 127, 128, 255, 256, 0xdead_beef, u64::MAX] {
            let item = RlpItem::uint(v.into());
            let decoded = decode(&encode(&item)).unwrap();
            assert_eq!(decoded.as_u64().unwrap(), v);
        }
    }

    #[test]
    fn roundtrip_nested_structures() {
        let item = RlpItem::list(vec![
            RlpItem::str(b"cat".to_vec()),
            RlpItem::list(vec![RlpItem::str(b"dog".to_vec()), RlpItem::empty()]),
            RlpItem::uint(1_000_000.into()),
            RlpItem::str(vec![0xff; 100]),
        ]);
        let encoded = encode(&item);
        assert_eq!(decode(&encoded).unwrap(), item);
    }

    #[test]
    fn decode_reports_truncation() {
        // Header promises two payload bytes, only one follows.
        let err = decode(&[0x82, 0x04]).unwrap_err();
        assert!(matches!(err, RlpError::Truncated { .. }));

        assert!(matches!(
            decode(&[]).unwrap_err(),
            RlpError::Truncated { .. }
        ));

        // Long-form header cut off inside the length bytes.
        assert!(matches!(
            decode(&[0xb9, 0x01]).unwrap_err(),
            RlpError::Truncated { .. }
        ));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        assert!(matches!(
            decode(&[0x01, 0x02]).unwrap_err(),
            RlpError::TrailingBytes(1)
        ));
    }

    #[test]
    fn decode_accepts_non_minimal_length_prefix() {
        // "dog" with a gratuitous long-form header.
        let (item, consumed) = decode_prefix(&[0xb8, 0x03, b'd', b'o', b'g']).unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(item.as_str().unwrap(), b"dog");
        // Re-encoding is canonical.
        assert_eq!(encode(&item).to_vec(), vec![0x83, b'd', b'o', b'g']);
    }

    #[test]
    fn typed_accessors_enforce_shape() {
        let list = RlpItem::list(vec![]);
        assert_eq!(list.as_str().unwrap_err(), RlpError::ExpectedString);
        let s = RlpItem::str(b"x".to_vec());
        assert_eq!(s.as_list().unwrap_err(), RlpError::ExpectedList);
        assert!(matches!(
            RlpItem::str(vec![1; 33]).as_uint().unwrap_err(),
            RlpError::IntegerTooLarge(33)
        ));
        assert!(matches!(
            RlpItem::str(vec![1; 31]).as_hash().unwrap_err(),
            RlpError::UnexpectedLength {
                expected: 32,
                actual: 31
            }
        ));
    }
}
