//! The fee schedule and the dynamic cost components that depend on
//! operands, memory growth, or storage contents.
//!
//! Cost arithmetic saturates at `u64::MAX`: an unpayably large operand
//! (say, a copy length above the address space) simply produces a cost no
//! gas budget can cover, which the check phase turns into an out-of-gas
//! exception without ever allocating.

use ethereum_types::U256;

use crate::utils::{u256_to_u64, words_for_bytes};
use crate::vm::instruction::Op;

/// Free operations (`STOP`, `RETURN`, `SELFDESTRUCT`).
pub const G_ZERO: u64 = 0;
/// The cheapest tier of environment reads.
pub const G_BASE: u64 = 2;
/// Cheap ALU and stack traffic.
pub const G_VERY_LOW: u64 = 3;
/// Multiplication-class ALU work.
pub const G_LOW: u64 = 5;
/// Full-precision modular arithmetic and `JUMP`.
pub const G_MID: u64 = 8;
/// `JUMPI`.
pub const G_HIGH: u64 = 10;
/// Reads that touch other accounts.
pub const G_EXT: u64 = 20;
/// A storage read.
pub const G_SLOAD: u64 = 50;
/// Landing on a `JUMPDEST`.
pub const G_JUMPDEST: u64 = 1;
/// Storage write turning a zero slot non-zero.
pub const G_SSET: u64 = 20_000;
/// Any other storage write.
pub const G_SRESET: u64 = 5_000;
/// Refund for clearing a non-zero slot.
pub const R_SCLEAR: u64 = 15_000;
/// Refund for a contract scheduling its own deletion.
pub const R_SELFDESTRUCT: u64 = 24_000;
/// Base cost of `CREATE`.
pub const G_CREATE: u64 = 32_000;
/// Per-byte charge for installing created code.
pub const G_CODE_DEPOSIT: u64 = 200;
/// Base cost of the call family.
pub const G_CALL: u64 = 40;
/// Surcharge for transferring value with a call.
pub const G_CALL_VALUE: u64 = 9_000;
/// Gas granted to the callee for free alongside a value transfer.
pub const G_CALL_STIPEND: u64 = 2_300;
/// Surcharge for calling into an account that does not exist yet.
pub const G_NEW_ACCOUNT: u64 = 25_000;
/// Base cost of `EXP`.
pub const G_EXP: u64 = 10;
/// Per-byte-of-exponent cost of `EXP`.
pub const G_EXP_BYTE: u64 = 10;
/// Linear memory cost per 32-byte word.
pub const G_MEMORY: u64 = 3;
/// Intrinsic cost of every transaction.
pub const G_TRANSACTION: u64 = 21_000;
/// Additional intrinsic cost of a creation transaction.
pub const G_TX_CREATE: u64 = 32_000;
/// Intrinsic cost per zero byte of call data.
pub const G_TX_DATA_ZERO: u64 = 4;
/// Intrinsic cost per non-zero byte of call data.
pub const G_TX_DATA_NON_ZERO: u64 = 68;
/// Base cost of a log.
pub const G_LOG: u64 = 375;
/// Per-byte cost of logged data.
pub const G_LOG_DATA: u64 = 8;
/// Per-topic cost of a log.
pub const G_LOG_TOPIC: u64 = 375;
/// Base cost of `KECCAK256`.
pub const G_KECCAK: u64 = 30;
/// Per-word cost of `KECCAK256` input.
pub const G_KECCAK_WORD: u64 = 6;
/// Per-word cost of the copy instructions.
pub const G_COPY: u64 = 3;
/// Cost of `BLOCKHASH`.
pub const G_BLOCKHASH: u64 = 20;

/// Total memory cost for holding `words` active words: linear plus a
/// quadratic term that makes huge memories prohibitive.
pub(crate) fn memory_cost(words: u64) -> u64 {
    let words = words as u128;
    let cost = G_MEMORY as u128 * words + words * words / 512;
    u64::try_from(cost).unwrap_or(u64::MAX)
}

/// Cost of growing memory from `current` to at least `required` words;
/// zero when no growth happens.
pub(crate) fn memory_expansion_cost(current: u64, required: u64) -> u64 {
    if required <= current {
        return 0;
    }
    memory_cost(required) - memory_cost(current)
}

/// Active words needed to cover the byte range `[offset, offset + len)`;
/// zero-length ranges need nothing. Saturates on out-of-range operands.
pub(crate) fn words_for_range(offset: U256, len: U256) -> u64 {
    if len.is_zero() {
        return 0;
    }
    let (Some(offset), Some(len)) = (u256_to_u64(offset), u256_to_u64(len)) else {
        return u64::MAX;
    };
    match offset.checked_add(len) {
        Some(end) => words_for_bytes(end),
        None => u64::MAX,
    }
}

/// Per-word copy surcharge for `len` bytes.
pub(crate) fn copy_cost(len: U256) -> u64 {
    match u256_to_u64(len) {
        Some(len) => G_COPY.saturating_mul(words_for_bytes(len)),
        None => u64::MAX,
    }
}

/// `KECCAK256` cost over `len` bytes.
pub(crate) fn keccak_cost(len: U256) -> u64 {
    match u256_to_u64(len) {
        Some(len) => G_KECCAK.saturating_add(G_KECCAK_WORD.saturating_mul(words_for_bytes(len))),
        None => u64::MAX,
    }
}

/// `LOGn` cost for `len` bytes of data.
pub(crate) fn log_cost(topics: u8, len: U256) -> u64 {
    match u256_to_u64(len) {
        Some(len) => G_LOG
            .saturating_add(G_LOG_TOPIC.saturating_mul(topics as u64))
            .saturating_add(G_LOG_DATA.saturating_mul(len)),
        None => u64::MAX,
    }
}

/// `EXP` cost grows with the byte width of the exponent.
pub(crate) fn exp_cost(exponent: U256) -> u64 {
    let byte_len = (exponent.bits() as u64).div_ceil(8);
    G_EXP + G_EXP_BYTE * byte_len
}

/// `SSTORE` cost for the zero/non-zero transition of a slot, and the
/// refund granted (only a non-zero slot being cleared earns one).
pub(crate) fn sstore_cost_and_refund(current: U256, new: U256) -> (u64, u64) {
    if current.is_zero() && !new.is_zero() {
        (G_SSET, 0)
    } else if !current.is_zero() && new.is_zero() {
        (G_SRESET, R_SCLEAR)
    } else {
        (G_SRESET, 0)
    }
}

/// Gas a transaction pays before any code runs. Creation transactions pay
/// the creation surcharge instead of per-byte data gas; message calls pay
/// for each byte of call data.
pub(crate) fn intrinsic_gas(is_create: bool, data: &[u8]) -> u64 {
    if is_create {
        return G_TRANSACTION + G_TX_CREATE;
    }
    let mut gas = G_TRANSACTION;
    for &b in data {
        gas += if b == 0 {
            G_TX_DATA_ZERO
        } else {
            G_TX_DATA_NON_ZERO
        };
    }
    gas
}

/// Fixed cost of an instruction before any dynamic component.
pub(crate) fn static_cost(op: Op) -> u64 {
    match op {
        Op::Stop | Op::Return | Op::SelfDestruct => G_ZERO,

        Op::Address
        | Op::Origin
        | Op::Caller
        | Op::CallValue
        | Op::CallDataSize
        | Op::CodeSize
        | Op::GasPrice
        | Op::Coinbase
        | Op::Timestamp
        | Op::Number
        | Op::Difficulty
        | Op::GasLimit
        | Op::Pop
        | Op::Pc
        | Op::MSize
        | Op::Gas => G_BASE,

        Op::Add
        | Op::Sub
        | Op::Lt
        | Op::Gt
        | Op::Slt
        | Op::Sgt
        | Op::Eq
        | Op::IsZero
        | Op::And
        | Op::Or
        | Op::Xor
        | Op::Not
        | Op::Byte
        | Op::CallDataLoad
        | Op::MLoad
        | Op::MStore
        | Op::MStore8
        | Op::Push(_)
        | Op::Dup(_)
        | Op::Swap(_) => G_VERY_LOW,

        Op::Mul | Op::Div | Op::Sdiv | Op::Mod | Op::Smod | Op::SignExtend => G_LOW,

        Op::AddMod | Op::MulMod | Op::Jump => G_MID,
        Op::JumpI => G_HIGH,
        Op::Balance | Op::ExtCodeSize | Op::ExtCodeCopy => G_EXT,
        Op::SLoad => G_SLOAD,
        Op::JumpDest => G_JUMPDEST,
        Op::BlockHash => G_BLOCKHASH,
        Op::Keccak256 => G_KECCAK,
        Op::Exp => G_EXP,
        Op::Create => G_CREATE,
        Op::Call | Op::CallCode | Op::DelegateCall => G_CALL,
        Op::Log(_) => G_LOG,
        Op::CallDataCopy | Op::CodeCopy => G_VERY_LOW,

        // Fully dynamic; the check phase prices these from operands.
        Op::SStore => 0,
    }
}
