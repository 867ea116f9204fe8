//! 256-bit word arithmetic with the VM's wrapping and signedness rules.
//!
//! Everything operates modulo 2²⁵⁶. Division and modulo by zero yield zero
//! rather than trapping. Signed variants interpret words as two's
//! complement with C-style truncation toward zero.

use ethereum_types::{U256, U512};

/// The sign bit of a 256-bit word.
fn is_negative(v: U256) -> bool {
    v.bit(255)
}

/// Two's-complement negation.
fn negate(v: U256) -> U256 {
    (!v).overflowing_add(U256::one()).0
}

/// Truncates a 512-bit intermediate back into the word range. The caller
/// guarantees the value already fits (it has been reduced mod 2²⁵⁶ or
/// smaller).
fn low_u256(v: U512) -> U256 {
    U256([v.0[0], v.0[1], v.0[2], v.0[3]])
}

/// Wrapping addition.
pub(crate) fn add(a: U256, b: U256) -> U256 {
    a.overflowing_add(b).0
}

/// Wrapping multiplication.
pub(crate) fn mul(a: U256, b: U256) -> U256 {
    a.overflowing_mul(b).0
}

/// Wrapping subtraction.
pub(crate) fn sub(a: U256, b: U256) -> U256 {
    a.overflowing_sub(b).0
}

/// Unsigned truncated division; zero divisor yields zero.
pub(crate) fn div(a: U256, b: U256) -> U256 {
    a.checked_div(b).unwrap_or_default()
}

/// Unsigned remainder; zero divisor yields zero.
pub(crate) fn rem(a: U256, b: U256) -> U256 {
    a.checked_rem(b).unwrap_or_default()
}

/// Signed division, truncating toward zero. The one non-obvious corner:
/// `MIN / -1` overflows and wraps back to `MIN`.
pub(crate) fn sdiv(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::zero();
    }
    let min = U256::one() << 255;
    if a == min && b == U256::MAX {
        return min;
    }
    let quotient = div(abs(a), abs(b));
    if is_negative(a) != is_negative(b) {
        negate(quotient)
    } else {
        quotient
    }
}

/// Signed remainder; takes the sign of the dividend.
pub(crate) fn smod(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::zero();
    }
    let remainder = rem(abs(a), abs(b));
    if is_negative(a) {
        negate(remainder)
    } else {
        remainder
    }
}

fn abs(v: U256) -> U256 {
    if is_negative(v) {
        negate(v)
    } else {
        v
    }
}

/// `(a + b) mod n` in unbounded precision; zero modulus yields zero.
pub(crate) fn addmod(a: U256, b: U256, n: U256) -> U256 {
    if n.is_zero() {
        return U256::zero();
    }
    let sum = U512::from(a) + U512::from(b);
    low_u256(sum % U512::from(n))
}

/// `(a * b) mod n` in unbounded precision; zero modulus yields zero.
pub(crate) fn mulmod(a: U256, b: U256, n: U256) -> U256 {
    if n.is_zero() {
        return U256::zero();
    }
    let product = U512::from(a) * U512::from(b);
    low_u256(product % U512::from(n))
}

/// Wrapping exponentiation by squaring.
pub(crate) fn exp(base: U256, exponent: U256) -> U256 {
    base.overflowing_pow(exponent).0
}

/// Extends the sign bit of byte `position` (0 = least significant) through
/// the higher bytes. Positions of 31 and above leave the word untouched.
pub(crate) fn signextend(position: U256, value: U256) -> U256 {
    if position >= U256::from(31) {
        return value;
    }
    let sign_bit = position.low_u64() as usize * 8 + 7;
    let mask = (U256::one() << (sign_bit + 1)) - 1;
    if value.bit(sign_bit) {
        value | !mask
    } else {
        value & mask
    }
}

/// Byte `index` of the word, counting from the most significant; indices of
/// 32 and above yield zero.
pub(crate) fn byte(index: U256, value: U256) -> U256 {
    if index >= U256::from(32) {
        return U256::zero();
    }
    U256::from(value.byte(31 - index.low_u64() as usize))
}

/// Signed less-than.
pub(crate) fn slt(a: U256, b: U256) -> bool {
    match (is_negative(a), is_negative(b)) {
        (true, false) => true,
        (false, true) => false,
        _ => a < b,
    }
}

/// Signed greater-than.
pub(crate) fn sgt(a: U256, b: U256) -> bool {
    slt(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neg(v: u64) -> U256 {
        negate(U256::from(v))
    }

    #[test]
    fn wrapping_add_and_mul() {
        assert_eq!(add(U256::MAX, U256::one()), U256::zero());
        assert_eq!(mul(U256::MAX, U256::from(2)), U256::MAX - 1);
        assert_eq!(sub(U256::zero(), U256::one()), U256::MAX);
    }

    #[test]
    fn division_by_zero_yields_zero() {
        assert_eq!(div(U256::from(10), U256::zero()), U256::zero());
        assert_eq!(rem(U256::from(10), U256::zero()), U256::zero());
        assert_eq!(sdiv(neg(10), U256::zero()), U256::zero());
        assert_eq!(smod(neg(10), U256::zero()), U256::zero());
    }

    #[test]
    fn div_is_unsigned_even_for_high_bit_operands() {
        // -2 viewed as unsigned is huge; DIV must not treat it as signed.
        assert_eq!(div(neg(2), U256::from(2)), (U256::MAX - 1) / 2);
    }

    #[test]
    fn sdiv_truncates_toward_zero() {
        assert_eq!(sdiv(neg(7), U256::from(2)), neg(3));
        assert_eq!(sdiv(U256::from(7), U256::from(2)), U256::from(3));
        assert_eq!(sdiv(neg(7), neg(2)), U256::from(3));
    }

    #[test]
    fn sdiv_min_by_minus_one_wraps_to_min() {
        let min = U256::one() << 255;
        assert_eq!(sdiv(min, U256::MAX), min);
    }

    #[test]
    fn smod_takes_the_dividend_sign() {
        assert_eq!(smod(neg(7), U256::from(3)), neg(1));
        assert_eq!(smod(U256::from(7), neg(3)), U256::from(1));
    }

    #[test]
    fn modular_ops_use_full_precision() {
        // (MAX + MAX) mod MAX would be wrong under wrapping addition.
        assert_eq!(addmod(U256::MAX, U256::MAX, U256::MAX), U256::zero());
        assert_eq!(
            addmod(U256::MAX, U256::from(3), U256::MAX),
            U256::from(3)
        );
        assert_eq!(
            mulmod(U256::MAX, U256::MAX, U256::from(12)),
            U256::from(9)
        );
        assert_eq!(addmod(1.into(), 2.into(), U256::zero()), U256::zero());
        assert_eq!(mulmod(1.into(), 2.into(), U256::zero()), U256::zero());
    }

    #[test]
    fn exp_is_exact_above_float_precision() {
        // 2^200 exercises the range where float-based power loses bits.
        assert_eq!(exp(U256::from(2), U256::from(200)), U256::one() << 200);
        assert_eq!(exp(U256::from(3), U256::zero()), U256::one());
        assert_eq!(
            exp(U256::from(2), U256::from(256)),
            U256::zero() // wrapped
        );
    }

    #[test]
    fn signextend_fills_high_bytes() {
        // 0xff in byte 0 is -1 once sign-extended.
        assert_eq!(signextend(U256::zero(), U256::from(0xff)), U256::MAX);
        // 0x7f stays positive.
        assert_eq!(signextend(U256::zero(), U256::from(0x7f)), U256::from(0x7f));
        // Garbage above the extended byte is cleared for positive values.
        assert_eq!(
            signextend(U256::zero(), U256::from(0xaa01)),
            U256::from(0x01)
        );
        // Out-of-range positions are the identity.
        assert_eq!(signextend(U256::from(31), U256::MAX), U256::MAX);
        assert_eq!(signextend(U256::MAX, U256::from(5)), U256::from(5));
    }

    #[test]
    fn byte_indexes_from_the_big_end() {
        let word = U256::from_big_endian(&{
            let mut b = [0u8; 32];
            b[0] = 0xaa;
            b[31] = 0xbb;
            b
        });
        assert_eq!(byte(U256::zero(), word), U256::from(0xaa));
        assert_eq!(byte(U256::from(31), word), U256::from(0xbb));
        assert_eq!(byte(U256::from(32), word), U256::zero());
    }

    #[test]
    fn signed_comparisons() {
        assert!(slt(neg(1), U256::zero()));
        assert!(!slt(U256::zero(), neg(1)));
        assert!(slt(neg(5), neg(3)));
        assert!(sgt(U256::from(3), neg(3)));
    }
}
