//! Helpers shared by unit and integration tests: funded states, canned
//! headers, and a deterministic signature-recovery stub.

use bytes::Bytes;
use ethereum_types::{Address, Bloom, H256, H64, U256};
use keccak_hash::KECCAK_NULL_RLP;
use mpt_state::{StoreHandle, WorldState};

use crate::block::{Block, BlockHeader, MINIMUM_DIFFICULTY};
use crate::transaction::{EcdsaRecover, SignatureError};

/// Recovery stub that attributes every signature to one fixed address.
#[derive(Clone, Copy, Debug)]
pub struct FixedSender(pub Address);

impl EcdsaRecover for FixedSender {
    fn recover(
        &self,
        _message: H256,
        _v: u64,
        _r: U256,
        _s: U256,
    ) -> Result<Address, SignatureError> {
        Ok(self.0)
    }
}

/// Recovery stub that rejects every signature.
#[derive(Clone, Copy, Debug)]
pub struct RejectAll;

impl EcdsaRecover for RejectAll {
    fn recover(
        &self,
        _message: H256,
        _v: u64,
        _r: U256,
        _s: U256,
    ) -> Result<Address, SignatureError> {
        Err(SignatureError)
    }
}

/// An in-memory world state holding the given balances.
pub fn funded_state(balances: &[(Address, U256)]) -> WorldState {
    let mut state = WorldState::empty(StoreHandle::in_memory());
    for &(address, balance) in balances {
        state
            .add_balance(address, balance)
            .expect("in-memory state cannot fault");
    }
    state
}

/// A header with room to execute: high gas limit, block 1, fixed
/// beneficiary.
pub fn test_header() -> BlockHeader {
    BlockHeader {
        parent_hash: H256::zero(),
        ommers_hash: KECCAK_NULL_RLP,
        beneficiary: Address::from_low_u64_be(0xbe),
        state_root: KECCAK_NULL_RLP,
        transactions_root: KECCAK_NULL_RLP,
        receipts_root: KECCAK_NULL_RLP,
        logs_bloom: Bloom::zero(),
        difficulty: U256::from(MINIMUM_DIFFICULTY),
        number: 1,
        gas_limit: 10_000_000,
        gas_used: 0,
        timestamp: 1_500_000_000,
        extra_data: Bytes::new(),
        mix_hash: H256::zero(),
        nonce: H64::zero(),
    }
}

/// A contentless block for tree tests: only the parent link, difficulty,
/// and number matter.
pub fn bare_block(parent_hash: H256, difficulty: u64, number: u64) -> Block {
    let mut header = test_header();
    header.parent_hash = parent_hash;
    header.difficulty = difficulty.into();
    header.number = number;
    Block {
        header,
        transactions: Vec::new(),
        ommers: Vec::new(),
    }
}
