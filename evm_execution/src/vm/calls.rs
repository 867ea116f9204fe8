//! Contract creation and message calls: address derivation, value
//! transfer, nested frame execution, and code installation.
//!
//! Depth overflow, an unpayable value transfer, and precompile rejections
//! are *call failures*: the caller observes `0` and execution continues.
//! Only the five frame exceptions revert and burn gas, and those are
//! handled inside the frame itself.

use bytes::Bytes;
use ethereum_types::{Address, U256};
use keccak_hash::keccak;
use log::debug;
use mpt_state::rlp::{self, RlpItem};
use mpt_state::WorldState;

use crate::vm::frame::{ExecEnv, FrameOutcome, Substate, VmContext, VmResult};
use crate::vm::gas::G_CODE_DEPOSIT;
use crate::vm::interpreter::run_frame;
use crate::vm::precompiles::{is_precompile, run_precompile};

/// Nested calls beyond this depth short-circuit into a call failure.
pub const CALL_DEPTH_LIMIT: usize = 1024;

/// Derives the address of a contract created by `creator` at `nonce`:
/// the low 20 bytes of `keccak(rlp([creator, nonce]))`.
pub fn contract_address(creator: Address, nonce: u64) -> Address {
    let encoded = rlp::encode(&RlpItem::list(vec![
        RlpItem::address(creator),
        RlpItem::uint(nonce.into()),
    ]));
    Address::from_slice(&keccak(encoded).as_bytes()[12..])
}

/// Inputs to a contract creation. The creator's nonce must already have
/// been incremented; the new address derives from `nonce - 1`.
#[derive(Clone, Debug)]
pub struct CreateParams {
    /// The account running `CREATE` (or the transaction sender).
    pub creator: Address,
    /// Originating externally-owned account.
    pub origin: Address,
    /// Transaction gas price.
    pub gas_price: U256,
    /// Endowment transferred to the new contract.
    pub value: U256,
    /// Initialization code; its return value becomes the contract's code.
    pub init: Bytes,
    /// Gas available to the init frame.
    pub gas: u64,
    /// Depth of the init frame.
    pub depth: usize,
}

/// Result of a contract creation.
#[derive(Debug)]
pub struct CreateOutcome {
    /// The new contract's address on success, `None` on failure.
    pub address: Option<Address>,
    /// Gas returned to the creator.
    pub gas_left: u64,
    /// Substate to merge into the creator on success; empty otherwise.
    pub substate: Substate,
}

impl CreateOutcome {
    fn failure(gas_left: u64) -> Self {
        Self {
            address: None,
            gas_left,
            substate: Substate::default(),
        }
    }
}

/// Which call instruction produced a [`CallParams`]; decides value
/// handling and the child's environment derivation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallKind {
    /// Plain call into the recipient's own context.
    Call,
    /// Recipient's code, caller's context.
    CallCode,
    /// Recipient's code; caller's context, sender, and value.
    DelegateCall,
}

/// Fully derived inputs to a message call. The interpreter (or the
/// transaction executor, for top-level calls) resolves the per-variant
/// environment rules before handing over.
#[derive(Clone, Debug)]
pub struct CallParams {
    /// The call variant, kept for logging.
    pub kind: CallKind,
    /// Balance source for the value transfer.
    pub caller: Address,
    /// Balance destination for the value transfer.
    pub recipient: Address,
    /// Account whose code runs.
    pub code_address: Address,
    /// The child frame's own address (storage and balance context).
    pub context_address: Address,
    /// The child frame's apparent sender.
    pub context_sender: Address,
    /// The child frame's apparent value.
    pub context_value: U256,
    /// Wei actually moved (zero for delegate calls).
    pub transfer_value: U256,
    /// Call data.
    pub input: Bytes,
    /// Gas handed to the child (stipend included).
    pub gas: u64,
    /// Child frame depth.
    pub depth: usize,
    /// Originating externally-owned account.
    pub origin: Address,
    /// Transaction gas price.
    pub gas_price: U256,
}

/// Result of a message call.
#[derive(Debug)]
pub struct CallOutcome {
    /// Whether the callee completed normally.
    pub success: bool,
    /// The callee's returned bytes.
    pub output: Bytes,
    /// Gas returned to the caller.
    pub gas_left: u64,
    /// Substate to merge on success; empty otherwise.
    pub substate: Substate,
}

impl CallOutcome {
    fn failure(gas_left: u64) -> Self {
        Self {
            success: false,
            output: Bytes::new(),
            gas_left,
            substate: Substate::default(),
        }
    }
}

/// Creates a contract: derives the address, endows it, runs the init code,
/// and installs the returned bytes as the contract's code.
pub fn create_contract(
    state: &mut WorldState,
    ctx: &VmContext<'_>,
    params: CreateParams,
) -> VmResult<CreateOutcome> {
    if params.depth > CALL_DEPTH_LIMIT {
        return Ok(CreateOutcome::failure(params.gas));
    }

    let nonce = state.nonce(params.creator)?;
    debug_assert!(nonce > 0, "creator nonce must be pre-incremented");
    let address = contract_address(params.creator, nonce - 1);
    debug!(
        "create: {:x} nonce {} -> {:x} (gas {})",
        params.creator,
        nonce - 1,
        address,
        params.gas
    );

    let snapshot = state.clone();
    if !state.transfer(params.creator, address, params.value)? {
        return Ok(CreateOutcome::failure(params.gas));
    }

    let env = ExecEnv {
        address,
        origin: params.origin,
        gas_price: params.gas_price,
        input: Bytes::new(),
        sender: params.creator,
        value: params.value,
        code: params.init,
        depth: params.depth,
    };
    match run_frame(state, ctx, env, params.gas)? {
        FrameOutcome::Failed(_) => {
            // The frame already reverted its own writes; the endowment
            // transfer predates the frame and reverts here.
            *state = snapshot;
            Ok(CreateOutcome::failure(0))
        }
        FrameOutcome::Done {
            output,
            gas_left,
            substate,
        } => {
            let deposit = G_CODE_DEPOSIT.saturating_mul(output.len() as u64);
            if deposit > gas_left {
                // Unpayable code deposit is an exceptional halt under
                // Homestead rules: nothing is installed, gas is gone.
                *state = snapshot;
                return Ok(CreateOutcome::failure(0));
            }
            state.set_code(address, output)?;
            Ok(CreateOutcome {
                address: Some(address),
                gas_left: gas_left - deposit,
                substate,
            })
        }
    }
}

/// Runs a message call: optional value transfer, then either a precompile
/// or the recipient's code in a child frame.
pub fn message_call(
    state: &mut WorldState,
    ctx: &VmContext<'_>,
    params: CallParams,
) -> VmResult<CallOutcome> {
    if params.depth > CALL_DEPTH_LIMIT {
        return Ok(CallOutcome::failure(params.gas));
    }
    debug!(
        "{:?}: {:x} -> {:x} value {} gas {}",
        params.kind, params.caller, params.code_address, params.transfer_value, params.gas
    );

    let snapshot = state.clone();
    if !state.transfer(params.caller, params.recipient, params.transfer_value)? {
        return Ok(CallOutcome::failure(params.gas));
    }

    if is_precompile(params.code_address) {
        return match run_precompile(ctx.externs, params.code_address, &params.input, params.gas)
        {
            Some(out) => Ok(CallOutcome {
                success: true,
                output: out.output,
                gas_left: out.gas_left,
                substate: Substate::default(),
            }),
            None => {
                *state = snapshot;
                Ok(CallOutcome::failure(0))
            }
        };
    }

    let code = state.code(params.code_address)?;
    if code.is_empty() {
        // A plain transfer; nothing to execute.
        return Ok(CallOutcome {
            success: true,
            output: Bytes::new(),
            gas_left: params.gas,
            substate: Substate::default(),
        });
    }

    let env = ExecEnv {
        address: params.context_address,
        origin: params.origin,
        gas_price: params.gas_price,
        input: params.input,
        sender: params.context_sender,
        value: params.context_value,
        code,
        depth: params.depth,
    };
    match run_frame(state, ctx, env, params.gas)? {
        FrameOutcome::Failed(_) => {
            *state = snapshot;
            Ok(CallOutcome::failure(0))
        }
        FrameOutcome::Done {
            output,
            gas_left,
            substate,
        } => Ok(CallOutcome {
            success: true,
            output,
            gas_left,
            substate,
        }),
    }
}
