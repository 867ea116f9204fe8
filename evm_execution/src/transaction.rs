//! Transactions, their wire format, and the signature-recovery seam.

use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use mpt_state::rlp::{self, RlpError, RlpItem};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failed signature recovery.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("signature does not recover to a valid sender")]
pub struct SignatureError;

/// The ECDSA recovery primitive, injected by the embedder.
///
/// Recovery is deliberately opaque here: the executor only needs a 20-byte
/// sender for a message hash, and the `ecrecover` precompile routes through
/// the same seam.
pub trait EcdsaRecover {
    /// Recovers the signing address of `message` from `(v, r, s)`.
    fn recover(&self, message: H256, v: u64, r: U256, s: U256) -> Result<Address, SignatureError>;
}

/// A transaction: either a message call (`to` present, `payload` is call
/// data) or a contract creation (`to` absent, `payload` is init code).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Transaction {
    /// Sender's transaction count at submission.
    pub nonce: u64,
    /// Wei paid per unit of gas.
    pub gas_price: U256,
    /// Gas purchased for the whole transaction.
    pub gas_limit: u64,
    /// Recipient; `None` creates a contract.
    pub to: Option<Address>,
    /// Wei transferred to the recipient (or endowed to the new contract).
    pub value: U256,
    /// Call data, or init code for creations.
    pub payload: Bytes,
    /// Signature recovery id.
    pub v: u64,
    /// Signature `r`.
    pub r: U256,
    /// Signature `s`.
    pub s: U256,
}

impl Transaction {
    /// Whether this transaction creates a contract.
    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }

    /// The signed 9-field RLP:
    /// `[nonce, gas_price, gas_limit, to, value, payload, v, r, s]`, with
    /// `to` as the empty string for creations.
    pub fn to_rlp(&self) -> Bytes {
        let mut fields = self.unsigned_fields();
        fields.push(RlpItem::uint(self.v.into()));
        fields.push(RlpItem::uint(self.r));
        fields.push(RlpItem::uint(self.s));
        rlp::encode(&RlpItem::list(fields))
    }

    /// Decodes a transaction from its RLP.
    pub fn from_rlp(bytes: &[u8]) -> Result<Self, RlpError> {
        let item = rlp::decode(bytes)?;
        let fields = item.as_list_of(9)?;
        let to_bytes = fields[3].as_str()?;
        let to = if to_bytes.is_empty() {
            None
        } else {
            Some(fields[3].as_address()?)
        };
        Ok(Self {
            nonce: fields[0].as_u64()?,
            gas_price: fields[1].as_uint()?,
            gas_limit: fields[2].as_u64()?,
            to,
            value: fields[4].as_uint()?,
            payload: Bytes::copy_from_slice(fields[5].as_str()?),
            v: fields[6].as_u64()?,
            r: fields[7].as_uint()?,
            s: fields[8].as_uint()?,
        })
    }

    /// The transaction id: keccak of the signed RLP.
    pub fn hash(&self) -> H256 {
        keccak(self.to_rlp())
    }

    /// The hash the sender signed: keccak of the six unsigned fields.
    pub fn signing_hash(&self) -> H256 {
        keccak(rlp::encode(&RlpItem::list(self.unsigned_fields())))
    }

    /// Recovers the sender through the injected primitive.
    pub fn sender(&self, externs: &dyn EcdsaRecover) -> Result<Address, SignatureError> {
        externs.recover(self.signing_hash(), self.v, self.r, self.s)
    }

    fn unsigned_fields(&self) -> Vec<RlpItem> {
        vec![
            RlpItem::uint(self.nonce.into()),
            RlpItem::uint(self.gas_price),
            RlpItem::uint(self.gas_limit.into()),
            match self.to {
                Some(to) => RlpItem::address(to),
                None => RlpItem::empty(),
            },
            RlpItem::uint(self.value),
            RlpItem::str(self.payload.clone()),
        ]
    }
}
