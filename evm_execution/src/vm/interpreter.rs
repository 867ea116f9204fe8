//! The fetch-decode-execute cycle.
//!
//! Each cycle checks the exception predicates (undefined opcode, stack
//! arities, gas against the full dynamic cost, jump validity), deducts gas,
//! runs the handler, and advances the program counter. An exceptional halt
//! reverts every state change the frame made and consumes all of its gas;
//! fatal state faults propagate out untranslated.

use std::collections::HashSet;

use bytes::Bytes;
use ethereum_types::U256;
use keccak_hash::keccak;
use log::{debug, trace};
use mpt_state::{TrieError, WorldState};

use crate::utils::{address_to_u256, h256_to_u256, u256_to_address, u256_to_usize};
use crate::vm::arith;
use crate::vm::calls::{self, CallKind, CallParams, CreateParams, CALL_DEPTH_LIMIT};
use crate::vm::frame::{
    ExceptionKind, ExecEnv, FrameOutcome, LogEntry, MachineState, Substate, VmContext, VmFault,
    VmResult,
};
use crate::vm::gas::{self, G_CALL_STIPEND, G_CALL_VALUE, G_NEW_ACCOUNT, R_SELFDESTRUCT};
use crate::vm::instruction::{decode, operand_len, valid_jump_destinations, Op};
use crate::vm::stack::STACK_LIMIT;

/// What a completed cycle asks the loop to do next.
enum Control {
    /// Continue at this program counter.
    Next(usize),
    /// Halt normally with this output.
    Halt(Bytes),
}

/// Why a cycle could not complete.
enum StepFailure {
    /// Frame-level exception: revert and consume the frame's gas.
    Exception(ExceptionKind),
    /// Corruption-class fault: abort the whole execution.
    Fault(VmFault),
}

impl From<ExceptionKind> for StepFailure {
    fn from(kind: ExceptionKind) -> Self {
        Self::Exception(kind)
    }
}

impl From<TrieError> for StepFailure {
    fn from(err: TrieError) -> Self {
        Self::Fault(VmFault::State(err))
    }
}

/// Executes `env.code` to completion against `state`.
pub fn run_frame(
    state: &mut WorldState,
    ctx: &VmContext<'_>,
    env: ExecEnv,
    gas: u64,
) -> VmResult<FrameOutcome> {
    debug!(
        "frame enter: address {:x} depth {} gas {}",
        env.address, env.depth, gas
    );
    let snapshot = state.clone();
    let jumpdests = valid_jump_destinations(&env.code);
    let mut frame = Frame {
        state,
        ctx,
        env,
        jumpdests,
        machine: MachineState::new(gas),
        substate: Substate::default(),
    };

    loop {
        match frame.step() {
            Ok(Control::Next(pc)) => frame.machine.pc = pc,
            Ok(Control::Halt(output)) => {
                debug!(
                    "frame halt: address {:x} gas left {} output {} bytes",
                    frame.env.address,
                    frame.machine.gas,
                    output.len()
                );
                return Ok(FrameOutcome::Done {
                    output,
                    gas_left: frame.machine.gas,
                    substate: frame.substate,
                });
            }
            Err(StepFailure::Exception(kind)) => {
                debug!("frame exception: address {:x} {}", frame.env.address, kind);
                *frame.state = snapshot;
                return Ok(FrameOutcome::Failed(kind));
            }
            Err(StepFailure::Fault(fault)) => return Err(fault),
        }
    }
}

struct Frame<'a, 'ctx> {
    state: &'a mut WorldState,
    ctx: &'a VmContext<'ctx>,
    env: ExecEnv,
    jumpdests: HashSet<usize>,
    machine: MachineState,
    substate: Substate,
}

impl Frame<'_, '_> {
    fn step(&mut self) -> Result<Control, StepFailure> {
        let pc = self.machine.pc;
        // Bytes past the end of the code act as an implicit STOP.
        let opcode = self.env.code.get(pc).copied().unwrap_or(0x00);
        let def = decode(opcode).ok_or(ExceptionKind::InvalidInstruction)?;
        trace!("pc {:>5} {:<12} gas {}", pc, def.name, self.machine.gas);

        if self.machine.stack.depth() < def.inputs {
            return Err(ExceptionKind::StackUnderflow.into());
        }
        let cost = self.instruction_cost(def.op)?;
        if self.machine.gas < cost {
            return Err(ExceptionKind::InsufficientGas.into());
        }
        if matches!(def.op, Op::Jump | Op::JumpI) {
            self.check_jump_target()?;
        }
        if self.machine.stack.depth() - def.inputs + def.outputs > STACK_LIMIT {
            return Err(ExceptionKind::StackOverflow.into());
        }

        self.machine.gas -= cost;
        self.execute(def.op, pc)
    }

    /// Full cost of the instruction about to run: its schedule entry, any
    /// operand-dependent component, and the memory expansion it forces.
    /// Saturating arithmetic turns absurd operands into an unpayable cost.
    fn instruction_cost(&self, op: Op) -> Result<u64, StepFailure> {
        let peek = |n: usize| self.machine.stack.peek(n);
        let word32 = U256::from(32u8);

        let (cost, words): (u64, u64) = match op {
            Op::MLoad | Op::MStore => {
                (gas::static_cost(op), gas::words_for_range(peek(0)?, word32))
            }
            Op::MStore8 => (
                gas::static_cost(op),
                gas::words_for_range(peek(0)?, U256::one()),
            ),
            Op::Keccak256 => (
                gas::keccak_cost(peek(1)?),
                gas::words_for_range(peek(0)?, peek(1)?),
            ),
            Op::CallDataCopy | Op::CodeCopy => (
                gas::static_cost(op).saturating_add(gas::copy_cost(peek(2)?)),
                gas::words_for_range(peek(0)?, peek(2)?),
            ),
            Op::ExtCodeCopy => (
                gas::static_cost(op).saturating_add(gas::copy_cost(peek(3)?)),
                gas::words_for_range(peek(1)?, peek(3)?),
            ),
            Op::Log(topics) => (
                gas::log_cost(topics, peek(1)?),
                gas::words_for_range(peek(0)?, peek(1)?),
            ),
            Op::Return => (0, gas::words_for_range(peek(0)?, peek(1)?)),
            Op::Create => (
                gas::static_cost(op),
                gas::words_for_range(peek(1)?, peek(2)?),
            ),
            Op::Exp => (gas::exp_cost(peek(1)?), 0),
            Op::SStore => {
                let current = self.state.storage_at(self.env.address, peek(0)?)?;
                (gas::sstore_cost_and_refund(current, peek(1)?).0, 0)
            }
            Op::Call | Op::CallCode => {
                let operand = gas_operand(peek(0)?);
                let recipient = u256_to_address(peek(1)?);
                let value = peek(2)?;
                let mut cost = gas::static_cost(op).saturating_add(operand);
                if !value.is_zero() {
                    cost = cost.saturating_add(G_CALL_VALUE);
                }
                if op == Op::Call && self.state.account(recipient)?.is_none() {
                    cost = cost.saturating_add(G_NEW_ACCOUNT);
                }
                let in_words = gas::words_for_range(peek(3)?, peek(4)?);
                let out_words = gas::words_for_range(peek(5)?, peek(6)?);
                (cost, in_words.max(out_words))
            }
            Op::DelegateCall => {
                let cost = gas::static_cost(op).saturating_add(gas_operand(peek(0)?));
                let in_words = gas::words_for_range(peek(2)?, peek(3)?);
                let out_words = gas::words_for_range(peek(4)?, peek(5)?);
                (cost, in_words.max(out_words))
            }
            _ => (gas::static_cost(op), 0),
        };

        Ok(cost.saturating_add(gas::memory_expansion_cost(
            self.machine.memory.active_words(),
            words,
        )))
    }

    fn check_jump_target(&self) -> Result<(), StepFailure> {
        let dest = self.machine.stack.peek(0)?;
        match u256_to_usize(dest) {
            Some(dest) if self.jumpdests.contains(&dest) => Ok(()),
            _ => Err(ExceptionKind::InvalidJumpDestination.into()),
        }
    }

    fn execute(&mut self, op: Op, pc: usize) -> Result<Control, StepFailure> {
        let next = Control::Next(pc + 1 + operand_len(op));
        let machine = &mut self.machine;

        match op {
            Op::Stop => return Ok(Control::Halt(Bytes::new())),

            Op::Add => binary(machine, arith::add)?,
            Op::Mul => binary(machine, arith::mul)?,
            Op::Sub => binary(machine, arith::sub)?,
            Op::Div => binary(machine, arith::div)?,
            Op::Sdiv => binary(machine, arith::sdiv)?,
            Op::Mod => binary(machine, arith::rem)?,
            Op::Smod => binary(machine, arith::smod)?,
            Op::Exp => binary(machine, arith::exp)?,
            Op::SignExtend => binary(machine, arith::signextend)?,
            Op::Byte => binary(machine, arith::byte)?,
            Op::AddMod => ternary(machine, arith::addmod)?,
            Op::MulMod => ternary(machine, arith::mulmod)?,

            Op::Lt => binary(machine, |a, b| bool_word(a < b))?,
            Op::Gt => binary(machine, |a, b| bool_word(a > b))?,
            Op::Slt => binary(machine, |a, b| bool_word(arith::slt(a, b)))?,
            Op::Sgt => binary(machine, |a, b| bool_word(arith::sgt(a, b)))?,
            Op::Eq => binary(machine, |a, b| bool_word(a == b))?,
            Op::IsZero => {
                let a = machine.stack.pop()?;
                machine.stack.push(bool_word(a.is_zero()))?;
            }
            Op::And => binary(machine, |a, b| a & b)?,
            Op::Or => binary(machine, |a, b| a | b)?,
            Op::Xor => binary(machine, |a, b| a ^ b)?,
            Op::Not => {
                let a = machine.stack.pop()?;
                machine.stack.push(!a)?;
            }

            Op::Keccak256 => {
                let offset = machine.stack.pop()?;
                let len = machine.stack.pop()?;
                let data = read_region(machine, offset, len)?;
                machine.stack.push(h256_to_u256(keccak(&data)))?;
            }

            Op::Address => machine.stack.push(address_to_u256(self.env.address))?,
            Op::Origin => machine.stack.push(address_to_u256(self.env.origin))?,
            Op::Caller => machine.stack.push(address_to_u256(self.env.sender))?,
            Op::CallValue => machine.stack.push(self.env.value)?,
            Op::GasPrice => machine.stack.push(self.env.gas_price)?,
            Op::Balance => {
                let address = u256_to_address(machine.stack.pop()?);
                let balance = self.state.balance(address)?;
                machine.stack.push(balance)?;
            }

            Op::CallDataLoad => {
                let offset = machine.stack.pop()?;
                let mut word = [0u8; 32];
                if let Some(offset) = u256_to_usize(offset) {
                    if offset < self.env.input.len() {
                        let end = (offset + 32).min(self.env.input.len());
                        word[..end - offset].copy_from_slice(&self.env.input[offset..end]);
                    }
                }
                machine.stack.push(U256::from_big_endian(&word))?;
            }
            Op::CallDataSize => machine.stack.push(self.env.input.len().into())?,
            Op::CallDataCopy => {
                let input = self.env.input.clone();
                copy_to_memory(machine, &input)?;
            }
            Op::CodeSize => machine.stack.push(self.env.code.len().into())?,
            Op::CodeCopy => {
                let code = self.env.code.clone();
                copy_to_memory(machine, &code)?;
            }
            Op::ExtCodeSize => {
                let address = u256_to_address(machine.stack.pop()?);
                let code = self.state.code(address)?;
                machine.stack.push(code.len().into())?;
            }
            Op::ExtCodeCopy => {
                let address = u256_to_address(machine.stack.pop()?);
                let code = self.state.code(address)?;
                copy_to_memory(machine, &code)?;
            }

            Op::BlockHash => {
                let number = machine.stack.pop()?;
                let hash = self.ctx.block_hash(number);
                machine.stack.push(h256_to_u256(hash))?;
            }
            Op::Coinbase => machine
                .stack
                .push(address_to_u256(self.ctx.header.beneficiary))?,
            Op::Timestamp => machine.stack.push(self.ctx.header.timestamp.into())?,
            Op::Number => machine.stack.push(self.ctx.header.number.into())?,
            Op::Difficulty => machine.stack.push(self.ctx.header.difficulty)?,
            Op::GasLimit => machine.stack.push(self.ctx.header.gas_limit.into())?,

            Op::Pop => {
                machine.stack.pop()?;
            }
            Op::MLoad => {
                let offset = as_usize_or_oog(machine.stack.pop()?)?;
                let word = machine.memory.load_word(offset);
                machine.stack.push(word)?;
            }
            Op::MStore => {
                let offset = as_usize_or_oog(machine.stack.pop()?)?;
                let value = machine.stack.pop()?;
                machine.memory.store_word(offset, value);
            }
            Op::MStore8 => {
                let offset = as_usize_or_oog(machine.stack.pop()?)?;
                let value = machine.stack.pop()?;
                machine.memory.store_byte(offset, value.byte(0));
            }

            Op::SLoad => {
                let key = machine.stack.pop()?;
                let value = self.state.storage_at(self.env.address, key)?;
                machine.stack.push(value)?;
            }
            Op::SStore => {
                let key = machine.stack.pop()?;
                let value = machine.stack.pop()?;
                let current = self.state.storage_at(self.env.address, key)?;
                let (_, refund) = gas::sstore_cost_and_refund(current, value);
                self.substate.refunds += refund;
                self.state.set_storage(self.env.address, key, value)?;
            }

            Op::Jump => {
                let dest = machine.stack.pop()?;
                return Ok(Control::Next(jump_target(dest)?));
            }
            Op::JumpI => {
                let dest = machine.stack.pop()?;
                let condition = machine.stack.pop()?;
                if !condition.is_zero() {
                    return Ok(Control::Next(jump_target(dest)?));
                }
            }
            Op::Pc => machine.stack.push(pc.into())?,
            Op::MSize => machine.stack.push(machine.memory.size().into())?,
            Op::Gas => machine.stack.push(machine.gas.into())?,
            Op::JumpDest => {}

            Op::Push(n) => {
                // Immediates past the end of the code read as zero.
                let n = n as usize;
                let start = (pc + 1).min(self.env.code.len());
                let available = &self.env.code[start..self.env.code.len().min(pc + 1 + n)];
                let mut immediate = [0u8; 32];
                immediate[..available.len()].copy_from_slice(available);
                machine
                    .stack
                    .push(U256::from_big_endian(&immediate[..n]))?;
            }
            Op::Dup(n) => machine.stack.dup(n as usize)?,
            Op::Swap(n) => machine.stack.swap(n as usize)?,

            Op::Log(topic_count) => {
                let offset = machine.stack.pop()?;
                let len = machine.stack.pop()?;
                let mut topics = Vec::with_capacity(topic_count as usize);
                for _ in 0..topic_count {
                    topics.push(crate::utils::u256_to_h256(machine.stack.pop()?));
                }
                let data = read_region(machine, offset, len)?;
                self.substate.logs.push(LogEntry {
                    address: self.env.address,
                    topics,
                    data: data.into(),
                });
            }

            Op::Create => return self.execute_create(pc),
            Op::Call | Op::CallCode | Op::DelegateCall => return self.execute_call(op, pc),

            Op::Return => {
                let offset = machine.stack.pop()?;
                let len = machine.stack.pop()?;
                let output = read_region(machine, offset, len)?;
                return Ok(Control::Halt(output.into()));
            }
            Op::SelfDestruct => return self.execute_selfdestruct(),
        }

        Ok(next)
    }

    fn execute_create(&mut self, pc: usize) -> Result<Control, StepFailure> {
        let value = self.machine.stack.pop()?;
        let offset = self.machine.stack.pop()?;
        let len = self.machine.stack.pop()?;
        let init = read_region(&mut self.machine, offset, len)?;

        // Depth and endowment failures are call failures, not exceptions:
        // the creator's nonce stays untouched and the gas stays with us.
        if self.env.depth + 1 > CALL_DEPTH_LIMIT
            || self.state.balance(self.env.address)? < value
        {
            self.machine.stack.push(U256::zero())?;
            return Ok(Control::Next(pc + 1));
        }

        self.state.increment_nonce(self.env.address)?;
        let child_gas = self.machine.gas;
        self.machine.gas = 0;
        let outcome = calls::create_contract(
            self.state,
            self.ctx,
            CreateParams {
                creator: self.env.address,
                origin: self.env.origin,
                gas_price: self.env.gas_price,
                value,
                init: init.into(),
                gas: child_gas,
                depth: self.env.depth + 1,
            },
        )
        .map_err(StepFailure::Fault)?;

        self.machine.gas += outcome.gas_left;
        self.substate.merge(outcome.substate);
        match outcome.address {
            Some(address) => self.machine.stack.push(address_to_u256(address))?,
            None => self.machine.stack.push(U256::zero())?,
        }
        Ok(Control::Next(pc + 1))
    }

    fn execute_call(&mut self, op: Op, pc: usize) -> Result<Control, StepFailure> {
        let machine = &mut self.machine;
        let gas_word = machine.stack.pop()?;
        let code_address = u256_to_address(machine.stack.pop()?);
        let value = match op {
            Op::DelegateCall => U256::zero(),
            _ => machine.stack.pop()?,
        };
        let in_offset = machine.stack.pop()?;
        let in_len = machine.stack.pop()?;
        let out_offset = machine.stack.pop()?;
        let out_len = machine.stack.pop()?;

        let input = read_region(machine, in_offset, in_len)?;
        // The output region's expansion was charged up front; materialize
        // it now so a short child output still leaves it addressable.
        if !out_len.is_zero() {
            let offset = as_usize_or_oog(out_offset)?;
            let len = as_usize_or_oog(out_len)?;
            machine.memory.read(offset, len);
        }

        let mut child_gas = gas_operand(gas_word);
        if !value.is_zero() {
            child_gas = child_gas.saturating_add(G_CALL_STIPEND);
        }

        let params = match op {
            Op::Call => CallParams {
                kind: CallKind::Call,
                caller: self.env.address,
                recipient: code_address,
                code_address,
                context_address: code_address,
                context_sender: self.env.address,
                context_value: value,
                transfer_value: value,
                input: input.into(),
                gas: child_gas,
                depth: self.env.depth + 1,
                origin: self.env.origin,
                gas_price: self.env.gas_price,
            },
            Op::CallCode => CallParams {
                kind: CallKind::CallCode,
                caller: self.env.address,
                recipient: self.env.address,
                code_address,
                context_address: self.env.address,
                context_sender: self.env.address,
                context_value: value,
                transfer_value: value,
                input: input.into(),
                gas: child_gas,
                depth: self.env.depth + 1,
                origin: self.env.origin,
                gas_price: self.env.gas_price,
            },
            Op::DelegateCall => CallParams {
                kind: CallKind::DelegateCall,
                caller: self.env.address,
                recipient: self.env.address,
                code_address,
                context_address: self.env.address,
                // The parent's own caller and apparent value carry through.
                context_sender: self.env.sender,
                context_value: self.env.value,
                transfer_value: U256::zero(),
                input: input.into(),
                gas: child_gas,
                depth: self.env.depth + 1,
                origin: self.env.origin,
                gas_price: self.env.gas_price,
            },
            _ => unreachable!("execute_call only handles the call family"),
        };

        let outcome = calls::message_call(self.state, self.ctx, params)
            .map_err(StepFailure::Fault)?;

        self.machine.gas += outcome.gas_left;
        if outcome.success {
            self.substate.merge(outcome.substate);
        }
        if !out_len.is_zero() && !outcome.output.is_empty() {
            let offset = as_usize_or_oog(out_offset)?;
            let len = as_usize_or_oog(out_len)?;
            let copied = len.min(outcome.output.len());
            self.machine.memory.write(offset, &outcome.output[..copied]);
        }
        self.machine.stack.push(bool_word(outcome.success))?;
        Ok(Control::Next(pc + 1))
    }

    fn execute_selfdestruct(&mut self) -> Result<Control, StepFailure> {
        let beneficiary = u256_to_address(self.machine.stack.pop()?);
        let balance = self.state.balance(self.env.address)?;
        if beneficiary != self.env.address {
            self.state.add_balance(beneficiary, balance)?;
            let mut own = self.state.account_or_empty(self.env.address)?;
            own.balance = U256::zero();
            self.state.upsert_account(self.env.address, &own)?;
        }
        if self.substate.suicides.insert(self.env.address) {
            self.substate.refunds += R_SELFDESTRUCT;
        }
        Ok(Control::Halt(Bytes::new()))
    }
}

fn binary(
    machine: &mut MachineState,
    f: impl FnOnce(U256, U256) -> U256,
) -> Result<(), StepFailure> {
    let a = machine.stack.pop()?;
    let b = machine.stack.pop()?;
    machine.stack.push(f(a, b))?;
    Ok(())
}

fn ternary(
    machine: &mut MachineState,
    f: impl FnOnce(U256, U256, U256) -> U256,
) -> Result<(), StepFailure> {
    let a = machine.stack.pop()?;
    let b = machine.stack.pop()?;
    let c = machine.stack.pop()?;
    machine.stack.push(f(a, b, c))?;
    Ok(())
}

fn bool_word(b: bool) -> U256 {
    if b {
        U256::one()
    } else {
        U256::zero()
    }
}

/// A child-gas operand, saturated so oversized words become an unpayable
/// cost rather than a panic.
fn gas_operand(word: U256) -> u64 {
    crate::utils::u256_to_u64(word).unwrap_or(u64::MAX)
}

/// Narrowing for offsets whose expansion cost was already charged. A word
/// that still does not fit can only mean the charge saturated, so the gas
/// check would have failed first; treat it as the same exception.
fn as_usize_or_oog(v: U256) -> Result<usize, StepFailure> {
    u256_to_usize(v).ok_or_else(|| ExceptionKind::InsufficientGas.into())
}

/// Reads `[offset, offset + len)` out of frame memory, zero-length reads
/// never touching (or charging for) memory at all.
fn read_region(
    machine: &mut MachineState,
    offset: U256,
    len: U256,
) -> Result<Vec<u8>, StepFailure> {
    if len.is_zero() {
        return Ok(Vec::new());
    }
    let offset = as_usize_or_oog(offset)?;
    let len = as_usize_or_oog(len)?;
    Ok(machine.memory.read(offset, len))
}

/// The shared tail of the copy instructions: pops the memory offset, source
/// offset, and length, then writes the zero-padded source slice.
fn copy_to_memory(machine: &mut MachineState, source: &[u8]) -> Result<(), StepFailure> {
    let mem_offset = machine.stack.pop()?;
    let src_offset = machine.stack.pop()?;
    let len = machine.stack.pop()?;
    if len.is_zero() {
        return Ok(());
    }
    let mem_offset = as_usize_or_oog(mem_offset)?;
    let len = as_usize_or_oog(len)?;
    let src = match u256_to_usize(src_offset) {
        Some(offset) if offset < source.len() => &source[offset..],
        _ => &[],
    };
    machine.memory.write_zero_padded(mem_offset, len, src);
    Ok(())
}

fn jump_target(dest: U256) -> Result<usize, StepFailure> {
    u256_to_usize(dest).ok_or_else(|| ExceptionKind::InvalidJumpDestination.into())
}
