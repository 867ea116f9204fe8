//! The transaction executor: gas purchase, dispatch to creation or call,
//! refund settlement, beneficiary payout, and suicide reaping.

use bytes::Bytes;
use ethereum_types::{Address, U256};
use log::debug;
use mpt_state::{TrieError, WorldState};
use thiserror::Error;

use crate::transaction::{SignatureError, Transaction};
use crate::vm::calls::{
    create_contract, message_call, CallKind, CallOutcome, CallParams, CreateOutcome, CreateParams,
};
use crate::vm::frame::{LogEntry, Substate, VmContext, VmFault};
use crate::vm::gas;

/// Reasons a transaction is rejected before (or fatal faults aborting)
/// execution. Rejections leave the state untouched.
#[derive(Debug, Error)]
pub enum TxError {
    /// The signature did not recover to a sender.
    #[error(transparent)]
    InvalidSignature(#[from] SignatureError),

    /// The sender's account nonce does not match the transaction's.
    #[error("account nonce is {account} but the transaction carries {transaction}")]
    NonceMismatch {
        /// Nonce currently recorded on the account.
        account: u64,
        /// Nonce the transaction claims.
        transaction: u64,
    },

    /// The sender cannot pay for the gas purchase up front.
    #[error("gas purchase of {required} wei exceeds the sender balance of {available}")]
    UpfrontUnaffordable {
        /// `gas_limit * gas_price`.
        required: U256,
        /// The sender's balance.
        available: U256,
    },

    /// The gas limit does not even cover the intrinsic cost.
    #[error("gas limit {gas_limit} is below the intrinsic requirement {intrinsic}")]
    IntrinsicGas {
        /// Gas the transaction purchased.
        gas_limit: u64,
        /// Gas it must pay before any code runs.
        intrinsic: u64,
    },

    /// The transaction does not fit in the block's remaining gas.
    #[error("gas limit {gas_limit} exceeds the block's remaining gas {remaining}")]
    BlockGasLimit {
        /// Gas the transaction purchased.
        gas_limit: u64,
        /// Gas still available in the block.
        remaining: u64,
    },

    /// A corruption-class fault from underneath the VM.
    #[error(transparent)]
    Fault(#[from] VmFault),
}

impl From<TrieError> for TxError {
    fn from(err: TrieError) -> Self {
        Self::Fault(VmFault::State(err))
    }
}

/// The observable result of an executed transaction.
#[derive(Debug)]
pub struct TxOutcome {
    /// Whether execution completed without an exceptional halt.
    pub success: bool,
    /// Gas charged to the sender (limit minus the settled refund).
    pub gas_used: u64,
    /// Output of a message call; empty for creations and failures.
    pub output: Bytes,
    /// Logs for receipt assembly.
    pub logs: Vec<LogEntry>,
    /// Address of the created contract, when one was installed.
    pub created: Option<Address>,
}

/// Executes one transaction against `state`.
///
/// `block_gas_used` is the gas consumed by earlier transactions in the
/// block, for the block-limit admission check.
pub fn execute_transaction(
    state: &mut WorldState,
    ctx: &VmContext<'_>,
    tx: &Transaction,
    block_gas_used: u64,
) -> Result<TxOutcome, TxError> {
    let sender = tx.sender(ctx.externs)?;
    let account = state.account_or_empty(sender)?;

    if account.nonce != tx.nonce {
        return Err(TxError::NonceMismatch {
            account: account.nonce,
            transaction: tx.nonce,
        });
    }
    let upfront = U256::from(tx.gas_limit) * tx.gas_price;
    if upfront > account.balance {
        return Err(TxError::UpfrontUnaffordable {
            required: upfront,
            available: account.balance,
        });
    }
    let intrinsic = gas::intrinsic_gas(tx.is_create(), &tx.payload);
    if intrinsic > tx.gas_limit {
        return Err(TxError::IntrinsicGas {
            gas_limit: tx.gas_limit,
            intrinsic,
        });
    }
    let block_remaining = ctx.header.gas_limit.saturating_sub(block_gas_used);
    if tx.gas_limit > block_remaining {
        return Err(TxError::BlockGasLimit {
            gas_limit: tx.gas_limit,
            remaining: block_remaining,
        });
    }

    // Gas purchase: the full limit is debited now and the unused part is
    // bought back after execution.
    state.sub_balance(sender, upfront)?;
    state.increment_nonce(sender)?;
    let exec_gas = tx.gas_limit - intrinsic;

    let (success, output, remaining_gas, substate, created) = match tx.to {
        None => {
            let CreateOutcome {
                address,
                gas_left,
                substate,
            } = create_contract(
                state,
                ctx,
                CreateParams {
                    creator: sender,
                    origin: sender,
                    gas_price: tx.gas_price,
                    value: tx.value,
                    init: tx.payload.clone(),
                    gas: exec_gas,
                    depth: 0,
                },
            )?;
            (address.is_some(), Bytes::new(), gas_left, substate, address)
        }
        Some(to) => {
            let CallOutcome {
                success,
                output,
                gas_left,
                substate,
            } = message_call(
                state,
                ctx,
                CallParams {
                    kind: CallKind::Call,
                    caller: sender,
                    recipient: to,
                    code_address: to,
                    context_address: to,
                    context_sender: sender,
                    context_value: tx.value,
                    transfer_value: tx.value,
                    input: tx.payload.clone(),
                    gas: exec_gas,
                    depth: 0,
                    origin: sender,
                    gas_price: tx.gas_price,
                },
            )?;
            (success, output, gas_left, substate, None)
        }
    };

    settle(state, ctx, tx, sender, remaining_gas, &substate)?;
    let refund = settled_refund(tx.gas_limit, remaining_gas, &substate);
    debug!(
        "tx {:x}: success {} gas_used {}",
        tx.hash(),
        success,
        tx.gas_limit - refund
    );

    Ok(TxOutcome {
        success,
        gas_used: tx.gas_limit - refund,
        output,
        logs: substate.logs,
        created,
    })
}

/// The gas bought back by the sender: the unspent remainder plus the
/// refund counter, the latter capped at half of what was actually spent.
fn settled_refund(gas_limit: u64, remaining_gas: u64, substate: &Substate) -> u64 {
    remaining_gas + ((gas_limit - remaining_gas) / 2).min(substate.refunds)
}

/// Pays the sender's buy-back and the beneficiary's fee, then reaps every
/// account condemned during execution.
fn settle(
    state: &mut WorldState,
    ctx: &VmContext<'_>,
    tx: &Transaction,
    sender: Address,
    remaining_gas: u64,
    substate: &Substate,
) -> Result<(), TxError> {
    let refund = settled_refund(tx.gas_limit, remaining_gas, substate);
    state.add_balance(sender, U256::from(refund) * tx.gas_price)?;
    state.add_balance(
        ctx.header.beneficiary,
        U256::from(tx.gas_limit - refund) * tx.gas_price,
    )?;
    for &address in &substate.suicides {
        state.delete_account(address)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockHeader;
    use crate::testing_utils::{funded_state, test_header, FixedSender};

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn plain_transfer(to: Address, value: u64) -> Transaction {
        Transaction {
            nonce: 0,
            gas_price: 2.into(),
            gas_limit: 30_000,
            to: Some(to),
            value: value.into(),
            payload: Bytes::new(),
            v: 27,
            r: 1.into(),
            s: 1.into(),
        }
    }

    fn run(
        state: &mut WorldState,
        header: &BlockHeader,
        sender: Address,
        tx: &Transaction,
    ) -> Result<TxOutcome, TxError> {
        let externs = FixedSender(sender);
        let ctx = VmContext {
            header,
            externs: &externs,
            ancestor_hashes: &[],
        };
        execute_transaction(state, &ctx, tx, 0)
    }

    #[test]
    fn value_transfer_settles_all_balances() {
        let sender = addr(1);
        let mut state = funded_state(&[(sender, 1_000_000u64.into())]);
        let header = test_header();
        let tx = plain_transfer(addr(2), 700);

        let outcome = run(&mut state, &header, sender, &tx).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.gas_used, gas::G_TRANSACTION);

        let fee = U256::from(gas::G_TRANSACTION) * tx.gas_price;
        assert_eq!(
            state.balance(sender).unwrap(),
            U256::from(1_000_000u64) - 700 - fee
        );
        assert_eq!(state.balance(addr(2)).unwrap(), 700.into());
        assert_eq!(state.balance(header.beneficiary).unwrap(), fee);
        assert_eq!(state.nonce(sender).unwrap(), 1);
    }

    #[test]
    fn gas_conservation_holds() {
        let sender = addr(1);
        let mut state = funded_state(&[(sender, 10_000_000u64.into())]);
        let header = test_header();
        let tx = plain_transfer(addr(2), 1);

        let outcome = run(&mut state, &header, sender, &tx).unwrap();
        // Beneficiary fee plus the sender's buy-back equals the purchase.
        let fee = state.balance(header.beneficiary).unwrap();
        let buy_back = U256::from(tx.gas_limit - outcome.gas_used) * tx.gas_price;
        assert_eq!(
            fee + buy_back,
            U256::from(tx.gas_limit) * tx.gas_price
        );
    }

    #[test]
    fn nonce_mismatch_rejects_without_state_change() {
        let sender = addr(1);
        let mut state = funded_state(&[(sender, 1_000_000u64.into())]);
        let root = state.state_root();
        let header = test_header();
        let tx = Transaction {
            nonce: 3,
            ..plain_transfer(addr(2), 1)
        };

        assert!(matches!(
            run(&mut state, &header, sender, &tx),
            Err(TxError::NonceMismatch {
                account: 0,
                transaction: 3
            })
        ));
        assert_eq!(state.state_root(), root);
    }

    #[test]
    fn unaffordable_gas_purchase_rejects() {
        let sender = addr(1);
        let mut state = funded_state(&[(sender, 100u64.into())]);
        let header = test_header();

        assert!(matches!(
            run(&mut state, &header, sender, &plain_transfer(addr(2), 0)),
            Err(TxError::UpfrontUnaffordable { .. })
        ));
    }

    #[test]
    fn intrinsic_shortfall_rejects() {
        let sender = addr(1);
        let mut state = funded_state(&[(sender, 1_000_000u64.into())]);
        let header = test_header();
        let tx = Transaction {
            gas_limit: 20_000,
            ..plain_transfer(addr(2), 0)
        };

        assert!(matches!(
            run(&mut state, &header, sender, &tx),
            Err(TxError::IntrinsicGas { .. })
        ));
    }

    #[test]
    fn block_gas_limit_rejects() {
        let sender = addr(1);
        let mut state = funded_state(&[(sender, 1_000_000u64.into())]);
        let mut header = test_header();
        header.gas_limit = 25_000;

        let externs = FixedSender(sender);
        let ctx = VmContext {
            header: &header,
            externs: &externs,
            ancestor_hashes: &[],
        };
        let tx = plain_transfer(addr(2), 0);
        assert!(matches!(
            execute_transaction(&mut state, &ctx, &tx, 10_000),
            Err(TxError::BlockGasLimit { .. })
        ));
    }

    #[test]
    fn unpayable_value_transfer_fails_the_call_but_charges_intrinsic_gas() {
        let sender = addr(1);
        // Covers the gas purchase but not the transferred value on top.
        let mut state = funded_state(&[(sender, 100_000u64.into())]);
        let header = test_header();
        let tx = plain_transfer(addr(2), 90_000);

        let outcome = run(&mut state, &header, sender, &tx).unwrap();
        assert!(!outcome.success);
        // Execution gas came back; only the intrinsic part was consumed.
        assert_eq!(outcome.gas_used, gas::G_TRANSACTION);
        assert_eq!(state.balance(addr(2)).unwrap(), U256::zero());
        assert_eq!(state.nonce(sender).unwrap(), 1);
    }
}
