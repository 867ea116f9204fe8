//! The built-in contracts at addresses 1 through 4.
//!
//! Calls to these addresses never execute bytecode; they dispatch straight
//! to native primitives. A gas shortfall or malformed input is a call
//! failure (the caller sees `0`), never a frame exception.

use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::transaction::EcdsaRecover;
use crate::utils::words_for_bytes;

const ECRECOVER_ADDRESS: u64 = 1;
const SHA256_ADDRESS: u64 = 2;
const RIPEMD160_ADDRESS: u64 = 3;
const IDENTITY_ADDRESS: u64 = 4;

const G_ECRECOVER: u64 = 3_000;
const G_SHA256: u64 = 60;
const G_SHA256_WORD: u64 = 12;
const G_RIPEMD160: u64 = 600;
const G_RIPEMD160_WORD: u64 = 120;
const G_IDENTITY: u64 = 15;
const G_IDENTITY_WORD: u64 = 3;

/// Whether an address is reserved for a precompiled contract.
pub fn is_precompile(address: Address) -> bool {
    let low = U256::from_big_endian(address.as_bytes());
    low >= U256::from(ECRECOVER_ADDRESS) && low <= U256::from(IDENTITY_ADDRESS)
}

/// A successful precompile run.
pub(crate) struct PrecompileOutput {
    pub output: Bytes,
    pub gas_left: u64,
}

/// Runs the precompile at `address`. `None` is a call failure: not enough
/// gas, or input the primitive rejects.
pub(crate) fn run_precompile(
    externs: &dyn EcdsaRecover,
    address: Address,
    input: &[u8],
    gas: u64,
) -> Option<PrecompileOutput> {
    let which = U256::from_big_endian(address.as_bytes()).low_u64();
    let cost = match which {
        ECRECOVER_ADDRESS => G_ECRECOVER,
        SHA256_ADDRESS => {
            G_SHA256 + G_SHA256_WORD * words_for_bytes(input.len() as u64)
        }
        RIPEMD160_ADDRESS => {
            G_RIPEMD160 + G_RIPEMD160_WORD * words_for_bytes(input.len() as u64)
        }
        IDENTITY_ADDRESS => {
            G_IDENTITY + G_IDENTITY_WORD * words_for_bytes(input.len() as u64)
        }
        _ => return None,
    };
    if gas < cost {
        return None;
    }
    let gas_left = gas - cost;

    let output = match which {
        ECRECOVER_ADDRESS => ecrecover(externs, input)?,
        SHA256_ADDRESS => Bytes::copy_from_slice(&Sha256::digest(input)),
        RIPEMD160_ADDRESS => {
            // 20-byte digest, left-padded to a word.
            let digest = Ripemd160::digest(input);
            let mut padded = [0u8; 32];
            padded[12..].copy_from_slice(&digest);
            Bytes::copy_from_slice(&padded)
        }
        IDENTITY_ADDRESS => Bytes::copy_from_slice(input),
        _ => return None,
    };

    Some(PrecompileOutput { output, gas_left })
}

/// Input layout: `hash(32) ‖ v(32) ‖ r(32) ‖ s(32)`, zero-padded if short.
fn ecrecover(externs: &dyn EcdsaRecover, input: &[u8]) -> Option<Bytes> {
    let mut padded = [0u8; 128];
    let len = input.len().min(128);
    padded[..len].copy_from_slice(&input[..len]);

    let message = H256::from_slice(&padded[0..32]);
    let v = U256::from_big_endian(&padded[32..64]);
    let r = U256::from_big_endian(&padded[64..96]);
    let s = U256::from_big_endian(&padded[96..128]);
    if v != U256::from(27) && v != U256::from(28) {
        return None;
    }

    let address = externs.recover(message, v.low_u64(), r, s).ok()?;
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_bytes());
    Some(Bytes::copy_from_slice(&word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing_utils::FixedSender;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    #[test]
    fn reserved_addresses() {
        assert!(!is_precompile(addr(0)));
        assert!(is_precompile(addr(1)));
        assert!(is_precompile(addr(4)));
        assert!(!is_precompile(addr(5)));
    }

    #[test]
    fn identity_copies_its_input() {
        let externs = FixedSender(addr(0xaa));
        let out = run_precompile(&externs, addr(4), b"echo", 100).unwrap();
        assert_eq!(out.output, Bytes::copy_from_slice(b"echo"));
        assert_eq!(out.gas_left, 100 - (G_IDENTITY + G_IDENTITY_WORD));
    }

    #[test]
    fn sha256_known_vector() {
        let externs = FixedSender(addr(0xaa));
        let out = run_precompile(&externs, addr(2), b"abc", 1_000).unwrap();
        assert_eq!(
            hex::encode(&out.output),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn ripemd_pads_its_digest_to_a_word() {
        let externs = FixedSender(addr(0xaa));
        let out = run_precompile(&externs, addr(3), b"", 10_000).unwrap();
        assert_eq!(out.output.len(), 32);
        assert_eq!(&out.output[..12], &[0u8; 12]);
        assert_eq!(
            hex::encode(&out.output[12..]),
            "9c1185a5c5e9fc54612808977ee8f548b2258d31"
        );
    }

    #[test]
    fn gas_shortfall_is_a_call_failure() {
        let externs = FixedSender(addr(0xaa));
        assert!(run_precompile(&externs, addr(4), b"echo", 17).is_none());
    }

    #[test]
    fn ecrecover_requires_a_plausible_v() {
        let externs = FixedSender(addr(0xbb));
        let mut input = [0u8; 128];
        input[63] = 27;
        let out = run_precompile(&externs, addr(1), &input, 5_000).unwrap();
        assert_eq!(&out.output[12..], addr(0xbb).as_bytes());

        input[63] = 29;
        assert!(run_precompile(&externs, addr(1), &input, 5_000).is_none());
    }
}
