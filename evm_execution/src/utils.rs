//! Small conversions between the VM's word type and host-sized integers.

use ethereum_types::{Address, BigEndianHash, H256, U256};

/// Narrows a word to `u64`, `None` on overflow.
pub(crate) fn u256_to_u64(v: U256) -> Option<u64> {
    (v.bits() <= 64).then(|| v.low_u64())
}

/// Narrows a word to `usize`, `None` on overflow.
pub(crate) fn u256_to_usize(v: U256) -> Option<usize> {
    u256_to_u64(v).and_then(|v| usize::try_from(v).ok())
}

/// The low 20 bytes of a word, as an address.
pub(crate) fn u256_to_address(v: U256) -> Address {
    let h = H256::from_uint(&v);
    Address::from_slice(&h.as_bytes()[12..])
}

/// An address zero-extended into a word.
pub(crate) fn address_to_u256(a: Address) -> U256 {
    U256::from_big_endian(a.as_bytes())
}

/// A hash reinterpreted as a big-endian word.
pub(crate) fn h256_to_u256(h: H256) -> U256 {
    h.into_uint()
}

/// A word written out as a 32-byte big-endian hash.
pub(crate) fn u256_to_h256(v: U256) -> H256 {
    H256::from_uint(&v)
}

/// 32-byte words needed to cover `len` bytes.
pub(crate) fn words_for_bytes(len: u64) -> u64 {
    len.div_ceil(32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowing_checks_the_width() {
        assert_eq!(u256_to_u64(U256::from(u64::MAX)), Some(u64::MAX));
        assert_eq!(u256_to_u64(U256::from(u64::MAX) + 1), None);
    }

    #[test]
    fn address_conversion_keeps_the_low_bytes() {
        let a = Address::from_low_u64_be(0xdead_beef);
        assert_eq!(u256_to_address(address_to_u256(a)), a);
        // High bytes beyond 20 are discarded.
        let wide = (U256::one() << 180) | U256::from(7);
        assert_eq!(u256_to_address(wide), Address::from_low_u64_be(7));
    }

    #[test]
    fn word_counting_rounds_up() {
        assert_eq!(words_for_bytes(0), 0);
        assert_eq!(words_for_bytes(1), 1);
        assert_eq!(words_for_bytes(32), 1);
        assert_eq!(words_for_bytes(33), 2);
    }
}
