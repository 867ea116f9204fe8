//! Accounts and the world state: typed accessors layered over the trie.
//!
//! The world state is a trie mapping 20-byte addresses to RLP-encoded
//! accounts. Each account in turn owns a storage trie (32-byte big-endian
//! words on both sides) and optionally code, stored in the same backing
//! store under its keccak.

use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use keccak_hash::{keccak, KECCAK_EMPTY, KECCAK_NULL_RLP};
use log::trace;
use serde::{Deserialize, Serialize};

use crate::nibbles::Nibbles;
use crate::rlp::{self, RlpItem, RlpResult};
use crate::store::StoreHandle;
use crate::trie::{Trie, TrieError, TrieResult};

/// A world-state account.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Account {
    /// Number of transactions sent from (or, for contracts, creations made
    /// by) this account.
    pub nonce: u64,
    /// Balance in wei.
    pub balance: U256,
    /// Root of the account's storage trie.
    pub storage_root: H256,
    /// Keccak of the account's code; [`KECCAK_EMPTY`] for plain accounts.
    pub code_hash: H256,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            storage_root: KECCAK_NULL_RLP,
            code_hash: KECCAK_EMPTY,
        }
    }
}

impl Account {
    /// A fresh account with the given balance and nothing else.
    pub fn with_balance(balance: U256) -> Self {
        Self {
            balance,
            ..Self::default()
        }
    }

    /// Whether the account has deployed code.
    pub fn has_code(&self) -> bool {
        self.code_hash != KECCAK_EMPTY
    }

    /// Whether the account has any storage entries.
    pub fn has_storage(&self) -> bool {
        self.storage_root != KECCAK_NULL_RLP
    }

    /// The account's RLP: `[nonce, balance, storage_root, code_hash]`.
    pub fn to_rlp(&self) -> Bytes {
        rlp::encode(&RlpItem::list(vec![
            RlpItem::uint(self.nonce.into()),
            RlpItem::uint(self.balance),
            RlpItem::hash(self.storage_root),
            RlpItem::hash(self.code_hash),
        ]))
    }

    /// Decodes an account from its RLP.
    pub fn from_rlp(bytes: &[u8]) -> RlpResult<Self> {
        let item = rlp::decode(bytes)?;
        let fields = item.as_list_of(4)?;
        Ok(Self {
            nonce: fields[0].as_u64()?,
            balance: fields[1].as_uint()?,
            storage_root: fields[2].as_hash()?,
            code_hash: fields[3].as_hash()?,
        })
    }
}

/// The world state: every account, its storage, and its code, bound by a
/// single root hash.
///
/// Cloning is a snapshot — the clone shares the backing store and pins the
/// current root, so reverting is plain reassignment.
#[derive(Clone, Debug)]
pub struct WorldState {
    trie: Trie,
}

impl WorldState {
    /// An empty world state over `store`.
    pub fn empty(store: StoreHandle) -> Self {
        Self {
            trie: Trie::empty(store),
        }
    }

    /// Reopens the world state rooted at `root`.
    pub fn from_root(store: StoreHandle, root: H256) -> Self {
        Self {
            trie: Trie::from_root(store, root),
        }
    }

    /// The shared backing store.
    pub fn store(&self) -> &StoreHandle {
        self.trie.store()
    }

    /// The state root binding all accounts, storage, and code hashes.
    pub fn state_root(&self) -> H256 {
        self.trie.root_hash()
    }

    /// Loads an account, `None` when the address is unknown.
    pub fn account(&self, address: Address) -> TrieResult<Option<Account>> {
        match self.trie.get(account_key(address))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(Account::from_rlp(&bytes)?)),
        }
    }

    /// Loads an account, substituting the empty account when absent.
    pub fn account_or_empty(&self, address: Address) -> TrieResult<Account> {
        Ok(self.account(address)?.unwrap_or_default())
    }

    /// Writes an account record.
    pub fn upsert_account(&mut self, address: Address, account: &Account) -> TrieResult<()> {
        trace!("state upsert {:x} (balance {})", address, account.balance);
        self.trie
            .insert(account_key(address), account.to_rlp().to_vec())
    }

    /// Removes an account outright (suicide reaping).
    pub fn delete_account(&mut self, address: Address) -> TrieResult<()> {
        trace!("state delete {:x}", address);
        self.trie.delete(account_key(address))?;
        Ok(())
    }

    /// The balance of an account, zero when absent.
    pub fn balance(&self, address: Address) -> TrieResult<U256> {
        Ok(self.account_or_empty(address)?.balance)
    }

    /// The nonce of an account, zero when absent.
    pub fn nonce(&self, address: Address) -> TrieResult<u64> {
        Ok(self.account_or_empty(address)?.nonce)
    }

    /// Bumps an account's nonce by one, creating the account if needed.
    pub fn increment_nonce(&mut self, address: Address) -> TrieResult<()> {
        let mut account = self.account_or_empty(address)?;
        account.nonce += 1;
        self.upsert_account(address, &account)
    }

    /// Credits `amount` to an account, creating it if absent.
    pub fn add_balance(&mut self, address: Address, amount: U256) -> TrieResult<()> {
        let mut account = self.account_or_empty(address)?;
        account.balance = account.balance.saturating_add(amount);
        self.upsert_account(address, &account)
    }

    /// Debits `amount`; returns `false` (without writing) when the balance
    /// cannot cover it.
    pub fn sub_balance(&mut self, address: Address, amount: U256) -> TrieResult<bool> {
        let mut account = self.account_or_empty(address)?;
        if account.balance < amount {
            return Ok(false);
        }
        account.balance = account.balance - amount;
        self.upsert_account(address, &account)?;
        Ok(true)
    }

    /// Moves `value` between two accounts, creating the recipient if
    /// needed. Returns `false` (without writing) when the sender cannot
    /// cover it. A zero-value transfer still materializes the recipient.
    pub fn transfer(&mut self, from: Address, to: Address, value: U256) -> TrieResult<bool> {
        if self.balance(from)? < value {
            return Ok(false);
        }
        if from != to {
            self.sub_balance(from, value)?;
            self.add_balance(to, value)?;
        } else {
            self.add_balance(to, U256::zero())?;
        }
        Ok(true)
    }

    /// The code deployed at an address; empty for plain accounts.
    pub fn code(&self, address: Address) -> TrieResult<Bytes> {
        let account = self.account_or_empty(address)?;
        if !account.has_code() {
            return Ok(Bytes::new());
        }
        self.store()
            .get(account.code_hash)?
            .ok_or(TrieError::KeyNotFound(account.code_hash))
    }

    /// Installs code on an account: the bytes are stored under their keccak
    /// and the account's `code_hash` is pointed at them.
    pub fn set_code(&mut self, address: Address, code: Bytes) -> TrieResult<()> {
        let mut account = self.account_or_empty(address)?;
        if code.is_empty() {
            account.code_hash = KECCAK_EMPTY;
        } else {
            let hash = keccak(&code);
            self.store().put(hash, code)?;
            account.code_hash = hash;
        }
        self.upsert_account(address, &account)
    }

    /// Reads a storage word; absent keys read as zero.
    pub fn storage_at(&self, address: Address, key: U256) -> TrieResult<U256> {
        let account = self.account_or_empty(address)?;
        let trie = self.storage_trie(&account);
        match trie.get(storage_key(key))? {
            None => Ok(U256::zero()),
            Some(raw) => decode_storage_word(&raw),
        }
    }

    /// Writes a storage word. Writing zero deletes the key, so the storage
    /// root returns to that of a trie which never held it.
    pub fn set_storage(&mut self, address: Address, key: U256, value: U256) -> TrieResult<()> {
        let mut account = self.account_or_empty(address)?;
        let mut trie = self.storage_trie(&account);
        if value.is_zero() {
            trie.delete(storage_key(key))?;
        } else {
            let mut word = [0u8; 32];
            value.to_big_endian(&mut word);
            trie.insert(storage_key(key), word.to_vec())?;
        }
        account.storage_root = trie.root_hash();
        self.upsert_account(address, &account)
    }

    /// Every storage entry of an account, in key order.
    pub fn storage_entries(&self, address: Address) -> TrieResult<Vec<(U256, U256)>> {
        let account = self.account_or_empty(address)?;
        let mut entries = Vec::new();
        for item in self.storage_trie(&account).iter() {
            let (key, raw) = item?;
            let key_bytes = key.to_bytes().ok_or(TrieError::MalformedNode(
                "storage key is not byte-aligned",
            ))?;
            if key_bytes.len() != 32 {
                return Err(TrieError::MalformedNode("storage key is not 32 bytes"));
            }
            entries.push((
                U256::from_big_endian(&key_bytes),
                decode_storage_word(&raw)?,
            ));
        }
        Ok(entries)
    }

    /// Every account in the state, in address order.
    pub fn accounts(&self) -> TrieResult<Vec<(Address, Account)>> {
        let mut accounts = Vec::new();
        for item in self.trie.iter() {
            let (key, raw) = item?;
            let key_bytes = key.to_bytes().ok_or(TrieError::MalformedNode(
                "account key is not byte-aligned",
            ))?;
            if key_bytes.len() != 20 {
                return Err(TrieError::MalformedNode("account key is not 20 bytes"));
            }
            accounts.push((Address::from_slice(&key_bytes), Account::from_rlp(&raw)?));
        }
        Ok(accounts)
    }

    fn storage_trie(&self, account: &Account) -> Trie {
        Trie::from_root(self.store().clone(), account.storage_root)
    }
}

fn account_key(address: Address) -> Nibbles {
    Nibbles::from_bytes(address.as_bytes())
}

fn storage_key(key: U256) -> Nibbles {
    let mut word = [0u8; 32];
    key.to_big_endian(&mut word);
    Nibbles::from_bytes(&word)
}

fn decode_storage_word(raw: &[u8]) -> TrieResult<U256> {
    if raw.len() != 32 {
        return Err(TrieError::MalformedNode("storage value is not 32 bytes"));
    }
    Ok(U256::from_big_endian(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing_utils::common_setup;

    fn addr(n: u8) -> Address {
        Address::from_low_u64_be(n as u64)
    }

    fn fresh_state() -> WorldState {
        WorldState::empty(StoreHandle::in_memory())
    }

    #[test]
    fn empty_state_has_the_null_root() {
        common_setup();
        assert_eq!(fresh_state().state_root(), KECCAK_NULL_RLP);
    }

    #[test]
    fn account_rlp_roundtrip() {
        let account = Account {
            nonce: 9,
            balance: U256::from(1_000_000_007u64),
            storage_root: KECCAK_NULL_RLP,
            code_hash: KECCAK_EMPTY,
        };
        assert_eq!(Account::from_rlp(&account.to_rlp()).unwrap(), account);
    }

    #[test]
    fn empty_account_sentinels() {
        let account = Account::default();
        assert!(!account.has_code());
        assert!(!account.has_storage());
        assert_eq!(account.code_hash, KECCAK_EMPTY);
        assert_eq!(account.storage_root, KECCAK_NULL_RLP);
    }

    #[test]
    fn balances_and_nonces() {
        common_setup();
        let mut state = fresh_state();
        let a = addr(1);
        assert_eq!(state.balance(a).unwrap(), U256::zero());

        state.add_balance(a, 500.into()).unwrap();
        assert_eq!(state.balance(a).unwrap(), U256::from(500));

        assert!(state.sub_balance(a, 200.into()).unwrap());
        assert_eq!(state.balance(a).unwrap(), U256::from(300));
        assert!(!state.sub_balance(a, 301.into()).unwrap());
        assert_eq!(state.balance(a).unwrap(), U256::from(300));

        state.increment_nonce(a).unwrap();
        state.increment_nonce(a).unwrap();
        assert_eq!(state.nonce(a).unwrap(), 2);
    }

    #[test]
    fn transfer_moves_value_and_creates_the_recipient() {
        common_setup();
        let mut state = fresh_state();
        state.add_balance(addr(1), 100.into()).unwrap();

        assert!(state.transfer(addr(1), addr(2), 40.into()).unwrap());
        assert_eq!(state.balance(addr(1)).unwrap(), U256::from(60));
        assert_eq!(state.balance(addr(2)).unwrap(), U256::from(40));
        assert!(state.account(addr(2)).unwrap().is_some());

        assert!(!state.transfer(addr(1), addr(2), 61.into()).unwrap());
        assert_eq!(state.balance(addr(1)).unwrap(), U256::from(60));
    }

    #[test]
    fn code_storage_roundtrip() {
        common_setup();
        let mut state = fresh_state();
        let a = addr(3);
        let code = Bytes::from_static(&[0x60, 0x03, 0x60, 0x05, 0x01, 0x00]);

        state.set_code(a, code.clone()).unwrap();
        assert_eq!(state.code(a).unwrap(), code);
        assert_eq!(state.account(a).unwrap().unwrap().code_hash, keccak(&code));

        // Plain accounts read back empty code.
        assert_eq!(state.code(addr(4)).unwrap(), Bytes::new());
    }

    #[test]
    fn storage_words_roundtrip_and_zero_deletes() {
        common_setup();
        let mut state = fresh_state();
        let a = addr(5);

        state.set_storage(a, 5.into(), 3.into()).unwrap();
        assert_eq!(state.storage_at(a, 5.into()).unwrap(), U256::from(3));
        assert_eq!(state.storage_at(a, 6.into()).unwrap(), U256::zero());
        assert_eq!(
            state.storage_entries(a).unwrap(),
            vec![(U256::from(5), U256::from(3))]
        );

        let root_with_entry = state.account(a).unwrap().unwrap().storage_root;
        assert_ne!(root_with_entry, KECCAK_NULL_RLP);

        // Writing zero removes the key and restores the empty storage root.
        state.set_storage(a, 5.into(), U256::zero()).unwrap();
        assert_eq!(state.storage_at(a, 5.into()).unwrap(), U256::zero());
        assert_eq!(
            state.account(a).unwrap().unwrap().storage_root,
            KECCAK_NULL_RLP
        );
    }

    #[test]
    fn storage_is_isolated_per_account() {
        common_setup();
        let mut state = fresh_state();
        state.set_storage(addr(1), 1.into(), 11.into()).unwrap();
        state.set_storage(addr(2), 1.into(), 22.into()).unwrap();

        assert_eq!(state.storage_at(addr(1), 1.into()).unwrap(), 11.into());
        assert_eq!(state.storage_at(addr(2), 1.into()).unwrap(), 22.into());
    }

    #[test]
    fn state_root_reflects_every_mutation_and_snapshots_revert() {
        common_setup();
        let mut state = fresh_state();
        state.add_balance(addr(1), 1000.into()).unwrap();
        let snapshot = state.clone();
        let root = state.state_root();

        state.set_storage(addr(1), 1.into(), 2.into()).unwrap();
        state.increment_nonce(addr(1)).unwrap();
        assert_ne!(state.state_root(), root);

        // Reverting is plain reassignment of the snapshot.
        state = snapshot;
        assert_eq!(state.state_root(), root);
        assert_eq!(state.nonce(addr(1)).unwrap(), 0);
    }

    #[test]
    fn deleted_accounts_disappear_from_enumeration() {
        common_setup();
        let mut state = fresh_state();
        state.add_balance(addr(1), 10.into()).unwrap();
        state.add_balance(addr(2), 20.into()).unwrap();

        state.delete_account(addr(1)).unwrap();
        let accounts = state.accounts().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].0, addr(2));
        assert!(state.account(addr(1)).unwrap().is_none());
    }

    #[test]
    fn reopening_by_root_preserves_accounts() {
        common_setup();
        let store = StoreHandle::in_memory();
        let mut state = WorldState::empty(store.clone());
        state.add_balance(addr(9), 999.into()).unwrap();
        state.set_storage(addr(9), 1.into(), 2.into()).unwrap();

        let reopened = WorldState::from_root(store, state.state_root());
        assert_eq!(reopened.balance(addr(9)).unwrap(), U256::from(999));
        assert_eq!(reopened.storage_at(addr(9), 1.into()).unwrap(), 2.into());
    }
}
