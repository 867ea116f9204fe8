//! The virtual machine: machine state, instruction set, gas schedule, the
//! interpreter cycle, and the call/create plumbing around it.

pub mod arith;
pub mod calls;
pub mod frame;
pub mod gas;
pub mod instruction;
pub mod interpreter;
pub mod memory;
pub mod precompiles;
pub mod stack;

pub use calls::{
    contract_address, create_contract, message_call, CallKind, CallOutcome, CallParams,
    CreateOutcome, CreateParams, CALL_DEPTH_LIMIT,
};
pub use frame::{
    ExceptionKind, ExecEnv, FrameOutcome, LogEntry, MachineState, Substate, VmContext, VmFault,
    VmResult,
};
pub use instruction::{decode, valid_jump_destinations, InstructionDef, Op};
pub use interpreter::run_frame;
