//! Block headers, receipts, the bloom filter, derived header fields, and
//! sequential transaction application.

use bytes::Bytes;
use ethereum_types::{Address, Bloom, BloomInput, H256, H64, U256};
use keccak_hash::keccak;
use log::debug;
use mpt_state::rlp::{self, RlpError, RlpItem};
use mpt_state::{StoreHandle, Trie, TrieResult, WorldState};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::{execute_transaction, TxError};
use crate::transaction::{EcdsaRecover, Transaction};
use crate::vm::frame::{LogEntry, VmContext};

/// Difficulty of the genesis block and the floor for every block after it.
pub const MINIMUM_DIFFICULTY: u64 = 131_072;
/// First block number governed by the Homestead difficulty rule.
pub const HOMESTEAD_BLOCK: u64 = 1_150_000;
/// Every block must admit more gas than this.
pub const MINIMUM_GAS_LIMIT: u64 = 125_000;

/// Structural block validation failures.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum BlockError {
    /// The gas limit left the window allowed by the parent.
    #[error("gas limit {got} is outside the window allowed by parent limit {parent}")]
    InvalidGasLimit {
        /// Parent's gas limit.
        parent: u64,
        /// This block's gas limit.
        got: u64,
    },

    /// The difficulty does not match the canonical derivation.
    #[error("difficulty {got} does not match the derived {expected}")]
    InvalidDifficulty {
        /// Difficulty derived from the parent.
        expected: U256,
        /// Difficulty the header claims.
        got: U256,
    },
}

/// A block header.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlockHeader {
    /// Hash of the parent block's header.
    pub parent_hash: H256,
    /// Root of the ommer-header list.
    pub ommers_hash: H256,
    /// Recipient of this block's transaction fees.
    pub beneficiary: Address,
    /// World-state root after all transactions.
    pub state_root: H256,
    /// Root of the index-keyed transaction trie.
    pub transactions_root: H256,
    /// Root of the index-keyed receipt trie.
    pub receipts_root: H256,
    /// Union of every receipt's bloom.
    pub logs_bloom: Bloom,
    /// Mining difficulty.
    pub difficulty: U256,
    /// Height of this block.
    pub number: u64,
    /// Gas the block admits.
    pub gas_limit: u64,
    /// Gas its transactions consumed.
    pub gas_used: u64,
    /// Unix timestamp.
    pub timestamp: u64,
    /// Arbitrary short payload.
    pub extra_data: Bytes,
    /// Proof-of-work mix hash (validated elsewhere).
    pub mix_hash: H256,
    /// Proof-of-work nonce.
    pub nonce: H64,
}

impl BlockHeader {
    /// The header's RLP: the 15 fields in declaration order.
    pub fn to_rlp(&self) -> Bytes {
        rlp::encode(&RlpItem::list(vec![
            RlpItem::hash(self.parent_hash),
            RlpItem::hash(self.ommers_hash),
            RlpItem::address(self.beneficiary),
            RlpItem::hash(self.state_root),
            RlpItem::hash(self.transactions_root),
            RlpItem::hash(self.receipts_root),
            RlpItem::str(self.logs_bloom.as_bytes().to_vec()),
            RlpItem::uint(self.difficulty),
            RlpItem::uint(self.number.into()),
            RlpItem::uint(self.gas_limit.into()),
            RlpItem::uint(self.gas_used.into()),
            RlpItem::uint(self.timestamp.into()),
            RlpItem::str(self.extra_data.clone()),
            RlpItem::hash(self.mix_hash),
            RlpItem::str(self.nonce.as_bytes().to_vec()),
        ]))
    }

    /// Decodes a header from its RLP.
    pub fn from_rlp(bytes: &[u8]) -> Result<Self, RlpError> {
        Self::from_item(&rlp::decode(bytes)?)
    }

    fn from_item(item: &RlpItem) -> Result<Self, RlpError> {
        let fields = item.as_list_of(15)?;
        let bloom_bytes = fields[6].as_str()?;
        if bloom_bytes.len() != 256 {
            return Err(RlpError::UnexpectedLength {
                expected: 256,
                actual: bloom_bytes.len(),
            });
        }
        let nonce_bytes = fields[14].as_str()?;
        if nonce_bytes.len() != 8 {
            return Err(RlpError::UnexpectedLength {
                expected: 8,
                actual: nonce_bytes.len(),
            });
        }
        Ok(Self {
            parent_hash: fields[0].as_hash()?,
            ommers_hash: fields[1].as_hash()?,
            beneficiary: fields[2].as_address()?,
            state_root: fields[3].as_hash()?,
            transactions_root: fields[4].as_hash()?,
            receipts_root: fields[5].as_hash()?,
            logs_bloom: Bloom::from_slice(bloom_bytes),
            difficulty: fields[7].as_uint()?,
            number: fields[8].as_u64()?,
            gas_limit: fields[9].as_u64()?,
            gas_used: fields[10].as_u64()?,
            timestamp: fields[11].as_u64()?,
            extra_data: Bytes::copy_from_slice(fields[12].as_str()?),
            mix_hash: fields[13].as_hash()?,
            nonce: H64::from_slice(nonce_bytes),
        })
    }

    /// The block id: keccak of the header RLP.
    pub fn hash(&self) -> H256 {
        keccak(self.to_rlp())
    }
}

/// A block: header, transactions, and ommer headers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    /// The header.
    pub header: BlockHeader,
    /// Transactions in application order.
    pub transactions: Vec<Transaction>,
    /// Referenced non-canonical sibling headers.
    pub ommers: Vec<BlockHeader>,
}

impl Block {
    /// The block's RLP: `[header, [transactions], [ommers]]`.
    pub fn to_rlp(&self) -> Bytes {
        let txs = self
            .transactions
            .iter()
            .map(|tx| rlp_raw_item(&tx.to_rlp()))
            .collect();
        let ommers = self
            .ommers
            .iter()
            .map(|ommer| rlp_raw_item(&ommer.to_rlp()))
            .collect();
        rlp::encode(&RlpItem::list(vec![
            rlp_raw_item(&self.header.to_rlp()),
            RlpItem::list(txs),
            RlpItem::list(ommers),
        ]))
    }

    /// The block id: the header's hash.
    pub fn hash(&self) -> H256 {
        self.header.hash()
    }
}

/// Re-parses an already-encoded structure for embedding into a larger
/// list. Our own encoders always produce valid RLP, so this cannot fail in
/// practice, but a decode fault still surfaces as an empty item rather
/// than a panic.
fn rlp_raw_item(encoded: &[u8]) -> RlpItem {
    rlp::decode(encoded).unwrap_or_else(|_| RlpItem::empty())
}

/// A transaction receipt, pre-Byzantium shape: the post-transaction state
/// root, cumulative gas, the logs bloom, and the logs themselves.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Receipt {
    /// State root after this transaction.
    pub state_root: H256,
    /// Gas used by the block up to and including this transaction.
    pub cumulative_gas_used: u64,
    /// Bloom over this receipt's logs.
    pub logs_bloom: Bloom,
    /// Logs the transaction emitted.
    pub logs: Vec<LogEntry>,
}

impl Receipt {
    /// The receipt's RLP: `[state_root, cumulative_gas, bloom, [logs]]`
    /// with each log as `[address, [topics], data]`.
    pub fn to_rlp(&self) -> Bytes {
        let logs = self
            .logs
            .iter()
            .map(|log| {
                RlpItem::list(vec![
                    RlpItem::address(log.address),
                    RlpItem::list(log.topics.iter().map(|t| RlpItem::hash(*t)).collect()),
                    RlpItem::str(log.data.clone()),
                ])
            })
            .collect();
        rlp::encode(&RlpItem::list(vec![
            RlpItem::hash(self.state_root),
            RlpItem::uint(self.cumulative_gas_used.into()),
            RlpItem::str(self.logs_bloom.as_bytes().to_vec()),
            RlpItem::list(logs),
        ]))
    }
}

/// The m3:2048 bloom over a set of logs: each log contributes its address
/// and every topic.
pub fn logs_bloom(logs: &[LogEntry]) -> Bloom {
    let mut bloom = Bloom::zero();
    for log in logs {
        bloom.accrue(BloomInput::Raw(log.address.as_bytes()));
        for topic in &log.topics {
            bloom.accrue(BloomInput::Raw(topic.as_bytes()));
        }
    }
    bloom
}

/// Root of a list indexed by RLP-encoded position, as used for the
/// transaction, receipt, and ommer tries.
pub fn ordered_trie_root(items: impl IntoIterator<Item = Bytes>) -> TrieResult<H256> {
    let mut trie = Trie::empty(StoreHandle::in_memory());
    for (index, item) in items.into_iter().enumerate() {
        let key = rlp::encode(&RlpItem::uint(index.into()));
        trie.insert(&key[..], item.to_vec())?;
    }
    Ok(trie.root_hash())
}

/// The canonical difficulty of a block with the given parent.
pub fn canonical_difficulty(parent: &BlockHeader, number: u64, timestamp: u64) -> U256 {
    let floor = U256::from(MINIMUM_DIFFICULTY);
    if number == 0 {
        return floor;
    }

    let x = parent.difficulty / 2048;
    let periods = number / 100_000;
    let bomb = if periods >= 2 {
        U256::one() << (periods - 2).min(255)
    } else {
        U256::zero()
    };

    let adjusted = if number < HOMESTEAD_BLOCK {
        // Frontier rule: a fixed step toward the 13-second target.
        if timestamp < parent.timestamp + 13 {
            parent.difficulty + x
        } else {
            parent.difficulty.saturating_sub(x)
        }
    } else {
        // Homestead rule: the step scales with how late the block is,
        // bounded at -99.
        let elapsed = timestamp.saturating_sub(parent.timestamp);
        let sigma = (1 - (elapsed / 10) as i64).max(-99);
        if sigma >= 0 {
            parent.difficulty + x * sigma as u64
        } else {
            parent.difficulty.saturating_sub(x * (-sigma) as u64)
        }
    };

    (adjusted + bomb).max(floor)
}

/// Whether a child gas limit is admissible against its parent's: inside
/// the ±1/1024 window and above the hard floor.
pub fn gas_limit_valid(parent_limit: u64, limit: u64) -> bool {
    limit > MINIMUM_GAS_LIMIT && limit.abs_diff(parent_limit) < parent_limit / 1024
}

/// Checks a header's derived fields against its parent.
pub fn validate_header(parent: &BlockHeader, header: &BlockHeader) -> Result<(), BlockError> {
    if !gas_limit_valid(parent.gas_limit, header.gas_limit) {
        return Err(BlockError::InvalidGasLimit {
            parent: parent.gas_limit,
            got: header.gas_limit,
        });
    }
    let expected = canonical_difficulty(parent, header.number, header.timestamp);
    if header.difficulty != expected {
        return Err(BlockError::InvalidDifficulty {
            expected,
            got: header.difficulty,
        });
    }
    Ok(())
}

/// Applies `txs` to `block` in order, threading the world state through
/// each and finalizing the header: per-transaction receipts, updated
/// state root, accumulated gas, list roots, and the bloom union.
pub fn add_transactions_to_block(
    state: &mut WorldState,
    block: &mut Block,
    txs: Vec<Transaction>,
    externs: &dyn EcdsaRecover,
    ancestor_hashes: &[H256],
) -> Result<Vec<Receipt>, TxError> {
    let mut receipts = Vec::with_capacity(txs.len());

    for tx in txs {
        let header = block.header.clone();
        let ctx = VmContext {
            header: &header,
            externs,
            ancestor_hashes,
        };
        let outcome = execute_transaction(state, &ctx, &tx, block.header.gas_used)?;

        block.header.gas_used += outcome.gas_used;
        block.header.state_root = state.state_root();
        let receipt = Receipt {
            state_root: block.header.state_root,
            cumulative_gas_used: block.header.gas_used,
            logs_bloom: logs_bloom(&outcome.logs),
            logs: outcome.logs,
        };
        block.header.logs_bloom.accrue_bloom(&receipt.logs_bloom);
        receipts.push(receipt);
        block.transactions.push(tx);
    }

    block.header.transactions_root =
        ordered_trie_root(block.transactions.iter().map(|tx| tx.to_rlp()))?;
    block.header.receipts_root = ordered_trie_root(receipts.iter().map(|r| r.to_rlp()))?;
    block.header.ommers_hash = ordered_trie_root(block.ommers.iter().map(|o| o.to_rlp()))?;

    debug!(
        "block {} assembled: {} txs, gas {}",
        block.header.number,
        block.transactions.len(),
        block.header.gas_used
    );
    Ok(receipts)
}

#[cfg(test)]
mod tests {
    use keccak_hash::KECCAK_NULL_RLP;

    use super::*;
    use crate::testing_utils::test_header;

    #[test]
    fn header_rlp_roundtrip() {
        let header = test_header();
        let decoded = BlockHeader::from_rlp(&header.to_rlp()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());
    }

    #[test]
    fn genesis_difficulty_is_the_floor() {
        let parent = test_header();
        assert_eq!(
            canonical_difficulty(&parent, 0, 0),
            U256::from(MINIMUM_DIFFICULTY)
        );
    }

    #[test]
    fn frontier_difficulty_steps_by_a_fixed_quantum() {
        let mut parent = test_header();
        parent.difficulty = U256::from(2_048_000);
        parent.timestamp = 1000;
        let x = parent.difficulty / 2048;

        // Fast block: difficulty rises.
        assert_eq!(
            canonical_difficulty(&parent, 100, 1005),
            parent.difficulty + x
        );
        // Slow block: difficulty falls.
        assert_eq!(
            canonical_difficulty(&parent, 100, 1020),
            parent.difficulty - x
        );
    }

    #[test]
    fn homestead_difficulty_scales_with_lateness() {
        let mut parent = test_header();
        parent.difficulty = U256::from(2_048_000);
        parent.timestamp = 1000;
        let number = HOMESTEAD_BLOCK + 1;
        let x = parent.difficulty / 2048;
        let bomb = U256::one() << (number / 100_000 - 2);

        // Within ten seconds the step is +1.
        assert_eq!(
            canonical_difficulty(&parent, number, 1005),
            parent.difficulty + x + bomb
        );
        // 35 seconds late: sigma = 1 - 3 = -2.
        assert_eq!(
            canonical_difficulty(&parent, number, 1035),
            parent.difficulty - x * 2 + bomb
        );
        // Absurdly late: sigma is clamped at -99.
        assert_eq!(
            canonical_difficulty(&parent, number, 1_000_000),
            parent.difficulty - x * 99 + bomb
        );
    }

    #[test]
    fn difficulty_never_drops_below_the_floor() {
        let mut parent = test_header();
        parent.difficulty = U256::from(MINIMUM_DIFFICULTY);
        parent.timestamp = 1000;
        assert_eq!(
            canonical_difficulty(&parent, 100, 5000),
            U256::from(MINIMUM_DIFFICULTY)
        );
    }

    #[test]
    fn gas_limit_window() {
        let parent = 3_000_000;
        assert!(gas_limit_valid(parent, parent));
        assert!(gas_limit_valid(parent, parent + parent / 1024 - 1));
        assert!(gas_limit_valid(parent, parent - parent / 1024 + 1));
        assert!(!gas_limit_valid(parent, parent + parent / 1024));
        assert!(!gas_limit_valid(parent, parent - parent / 1024));
        // The floor binds even inside the window.
        assert!(!gas_limit_valid(125_100, 125_000));
    }

    #[test]
    fn header_validation_catches_bad_derivations() {
        let mut parent = test_header();
        parent.difficulty = U256::from(2_048_000);
        parent.timestamp = 1000;
        parent.gas_limit = 3_000_000;

        let mut child = test_header();
        child.number = 100;
        child.timestamp = 1005;
        child.gas_limit = 3_000_000;
        child.difficulty = canonical_difficulty(&parent, child.number, child.timestamp);
        assert_eq!(validate_header(&parent, &child), Ok(()));

        let mut wrong_difficulty = child.clone();
        wrong_difficulty.difficulty = wrong_difficulty.difficulty + 1;
        assert!(matches!(
            validate_header(&parent, &wrong_difficulty),
            Err(BlockError::InvalidDifficulty { .. })
        ));

        let mut wrong_limit = child;
        wrong_limit.gas_limit = parent.gas_limit * 2;
        assert!(matches!(
            validate_header(&parent, &wrong_limit),
            Err(BlockError::InvalidGasLimit { .. })
        ));
    }

    #[test]
    fn empty_list_root_is_the_null_root() {
        assert_eq!(
            ordered_trie_root(std::iter::empty()).unwrap(),
            KECCAK_NULL_RLP
        );
    }

    #[test]
    fn bloom_covers_addresses_and_topics() {
        let log = LogEntry {
            address: Address::from_low_u64_be(7),
            topics: vec![H256::from_low_u64_be(9)],
            data: Bytes::from_static(b"payload"),
        };
        let bloom = logs_bloom(std::slice::from_ref(&log));
        assert!(bloom.contains_input(BloomInput::Raw(log.address.as_bytes())));
        assert!(bloom.contains_input(BloomInput::Raw(log.topics[0].as_bytes())));
        // Data is not indexed.
        assert!(!bloom.contains_input(BloomInput::Raw(b"payload")));
    }
}
