//! Per-frame execution data: the mutable machine state, the immutable
//! environment, the accumulated substate, and frame outcomes.

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use mpt_state::TrieError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::BlockHeader;
use crate::transaction::EcdsaRecover;
use crate::vm::memory::Memory;
use crate::vm::stack::Stack;

/// The exceptional ways a frame can halt. Any of these reverts every state
/// change the frame made and consumes all of its gas.
#[derive(Clone, Copy, Debug, Eq, Error, Hash, PartialEq)]
pub enum ExceptionKind {
    /// Remaining gas cannot cover the next instruction.
    #[error("out of gas")]
    InsufficientGas,

    /// The opcode byte is not in the instruction table.
    #[error("invalid instruction")]
    InvalidInstruction,

    /// The stack holds fewer words than the instruction consumes.
    #[error("stack underflow")]
    StackUnderflow,

    /// The instruction would push the stack past its depth limit.
    #[error("stack overflow")]
    StackOverflow,

    /// A jump targets a position outside the valid destination set.
    #[error("invalid jump destination")]
    InvalidJumpDestination,
}

/// Fatal faults that abort execution outright rather than becoming a
/// frame outcome: lost store data and similar corruption.
#[derive(Debug, Error)]
pub enum VmFault {
    /// The authenticated state misbehaved underneath us.
    #[error(transparent)]
    State(#[from] TrieError),
}

/// Result alias for operations that can only fail fatally.
pub type VmResult<T> = Result<T, VmFault>;

/// The mutable register file of one frame: program counter, gas meter,
/// stack, and memory.
#[derive(Clone, Debug)]
pub struct MachineState {
    /// Byte offset of the next instruction.
    pub pc: usize,
    /// Gas remaining.
    pub gas: u64,
    /// The word stack.
    pub stack: Stack,
    /// Linear memory.
    pub memory: Memory,
}

impl MachineState {
    /// A fresh machine with `gas` to spend.
    pub fn new(gas: u64) -> Self {
        Self {
            pc: 0,
            gas,
            stack: Stack::new(),
            memory: Memory::new(),
        }
    }
}

/// The immutable environment a frame executes in.
#[derive(Clone, Debug)]
pub struct ExecEnv {
    /// The account whose storage and balance this frame touches.
    pub address: Address,
    /// The externally-owned account that started the transaction.
    pub origin: Address,
    /// Gas price of the enclosing transaction.
    pub gas_price: U256,
    /// Call data (empty for init frames).
    pub input: Bytes,
    /// The immediate caller.
    pub sender: Address,
    /// Apparent value passed with the call.
    pub value: U256,
    /// The bytecode being executed.
    pub code: Bytes,
    /// Nesting depth; the top-level frame is zero.
    pub depth: usize,
}

/// One log record emitted by `LOGn`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LogEntry {
    /// The emitting contract.
    pub address: Address,
    /// Indexed topics, at most four.
    pub topics: Vec<H256>,
    /// Opaque payload.
    pub data: Bytes,
}

/// The transaction-scoped accumulator: contracts condemned by
/// `SELFDESTRUCT`, emitted logs, and the gas-refund counter. Merged into
/// the parent on a normal halt, dropped on an exceptional one.
#[derive(Clone, Debug, Default)]
pub struct Substate {
    /// Contracts to delete when the transaction commits.
    pub suicides: BTreeSet<Address>,
    /// Logs in emission order.
    pub logs: Vec<LogEntry>,
    /// Accumulated refunds, paid out capped at commit.
    pub refunds: u64,
}

impl Substate {
    /// Folds a successfully completed child frame's substate into this one.
    pub fn merge(&mut self, child: Substate) {
        self.suicides.extend(child.suicides);
        self.logs.extend(child.logs);
        self.refunds += child.refunds;
    }
}

/// How a frame ended.
#[derive(Debug)]
pub enum FrameOutcome {
    /// A normal halt: `STOP`, `RETURN`, `SELFDESTRUCT`, or running off the
    /// end of the code.
    Done {
        /// Bytes returned by `RETURN`; empty otherwise.
        output: Bytes,
        /// Gas left for the caller to reclaim.
        gas_left: u64,
        /// The frame's accumulated substate.
        substate: Substate,
    },
    /// An exceptional halt: state already reverted, all gas consumed.
    Failed(ExceptionKind),
}

/// Transaction-wide context threaded through every frame: the enclosing
/// block header, the injected signature-recovery collaborator (which also
/// backs the `ecrecover` precompile), and the ancestor hashes serving
/// `BLOCKHASH`.
pub struct VmContext<'a> {
    /// Header of the block being executed.
    pub header: &'a BlockHeader,
    /// Signature recovery, supplied by the embedder.
    pub externs: &'a dyn EcdsaRecover,
    /// Hashes of recent ancestors, parent first.
    pub ancestor_hashes: &'a [H256],
}

impl VmContext<'_> {
    /// The hash of ancestor block `number`, or zero outside the window of
    /// known ancestors.
    pub fn block_hash(&self, number: U256) -> H256 {
        let current = U256::from(self.header.number);
        if number >= current || current - number > U256::from(self.ancestor_hashes.len()) {
            return H256::zero();
        }
        let back = (current - number).low_u64() as usize;
        self.ancestor_hashes[back - 1]
    }
}

impl fmt::Debug for VmContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmContext")
            .field("block", &self.header.number)
            .field("ancestors", &self.ancestor_hashes.len())
            .finish()
    }
}
