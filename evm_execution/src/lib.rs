//! An Ethereum-style state-transition engine: a gas-metered stack-machine
//! interpreter over an authenticated world state, the transaction executor
//! that drives it, and the block layer above.
//!
//! Layers, bottom up:
//! - [`vm`] — word arithmetic, the instruction table, gas schedule, the
//!   interpreter cycle, and contract creation / message calls;
//! - [`transaction`] — the transaction wire format and the injected
//!   signature-recovery seam;
//! - [`executor`] — the per-transaction state transition: gas purchase,
//!   dispatch, refund settlement, beneficiary payout, suicide reaping;
//! - [`block`] — headers, receipts, blooms, derived fields (difficulty,
//!   gas-limit window), and sequential block assembly;
//! - [`block_tree`] — imported blocks under their parents, with cumulative
//!   difficulty picking the canonical tip.
//!
//! World-state storage (tries, accounts, code) lives in the `mpt_state`
//! crate; this one only mutates it through frames and commits or discards
//! roots at the transaction boundary.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

pub mod block;
pub mod block_tree;
pub mod executor;
pub mod testing_utils;
pub mod transaction;
mod utils;
pub mod vm;

pub use block::{
    add_transactions_to_block, canonical_difficulty, gas_limit_valid, logs_bloom,
    validate_header, Block, BlockError, BlockHeader, Receipt,
};
pub use block_tree::{BlockTree, TreeError};
pub use executor::{execute_transaction, TxError, TxOutcome};
pub use transaction::{EcdsaRecover, SignatureError, Transaction};
pub use vm::{
    run_frame, ExceptionKind, ExecEnv, FrameOutcome, LogEntry, Substate, VmContext, VmFault,
};
