//! The Merkle-Patricia trie: a persistent key/value map whose root hash
//! binds its entire contents.
//!
//! Every mutation produces a freshly committed root and leaves all prior
//! roots resolvable, so cloning a [`Trie`] is a free snapshot: the clone
//! shares the backing store and simply remembers a different root.

use ethereum_types::H256;
use keccak_hash::KECCAK_NULL_RLP;
use log::trace;
use thiserror::Error;

use crate::nibbles::{common_prefix_len, HexPrefixError, Nibble, Nibbles};
use crate::node::{Node, NodeRef};
use crate::rlp::RlpError;
use crate::store::{StoreError, StoreHandle};

/// Result alias for trie operations.
pub type TrieResult<T> = Result<T, TrieError>;

/// Faults surfaced by trie operations. Lookups on a well-formed trie never
/// fail for merely absent keys; everything here is corruption-class.
#[derive(Debug, Error)]
pub enum TrieError {
    /// A hashed child reference had no bytes behind it in the store.
    #[error("node {0:x} is referenced by the trie but missing from the backing store")]
    KeyNotFound(H256),

    /// Stored node bytes decoded into an impossible shape.
    #[error("malformed trie node: {0}")]
    MalformedNode(&'static str),

    /// A node path failed to decode from its hex-prefix form.
    #[error(transparent)]
    HexPrefix(#[from] HexPrefixError),

    /// Stored node bytes were not valid RLP.
    #[error(transparent)]
    Rlp(#[from] RlpError),

    /// The backing store itself failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where the side of a split lands inside the freshly built branch: in the
/// branch's value slot when its remaining path is empty, or under a child
/// slot otherwise.
enum BranchSlot {
    Value(Vec<u8>),
    Child(Nibble, NodeRef),
}

/// A persistent Merkle-Patricia trie over a shared backing store.
#[derive(Clone, Debug)]
pub struct Trie {
    store: StoreHandle,
    root: NodeRef,
}

impl Trie {
    /// The empty trie over `store`.
    pub fn empty(store: StoreHandle) -> Self {
        Self {
            store,
            root: NodeRef::empty(),
        }
    }

    /// Reopens the trie whose root hash is `root`. The root node itself is
    /// resolved lazily; a bogus hash surfaces as [`TrieError::KeyNotFound`]
    /// on first use.
    pub fn from_root(store: StoreHandle, root: H256) -> Self {
        if root == KECCAK_NULL_RLP {
            return Self::empty(store);
        }
        Self {
            store,
            root: NodeRef::Hash(root),
        }
    }

    /// The shared backing store.
    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// The root hash binding the trie's contents. Equal contents yield an
    /// equal root regardless of insertion order.
    pub fn root_hash(&self) -> H256 {
        self.root.node_hash()
    }

    /// Whether the trie holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Looks up the value stored under `key`.
    pub fn get<K: Into<Nibbles>>(&self, key: K) -> TrieResult<Option<Vec<u8>>> {
        let key = key.into();
        let root = self.root.resolve(&self.store)?;
        self.get_at(&root, key.as_slice())
    }

    /// Whether `key` has a value in the trie.
    pub fn contains<K: Into<Nibbles>>(&self, key: K) -> TrieResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Inserts `value` under `key`, replacing any previous value. Produces
    /// a new root; shared subtrees keep their existing references.
    pub fn insert<K: Into<Nibbles>>(&mut self, key: K, value: Vec<u8>) -> TrieResult<()> {
        let key = key.into();
        trace!("trie insert {:x} ({} value bytes)", key, value.len());
        let root = self.root.resolve(&self.store)?;
        let updated = self.insert_at(root, key.as_slice(), value)?;
        self.root = NodeRef::commit(&updated, &self.store)?;
        Ok(())
    }

    /// Removes `key`, returning its previous value. The resulting root
    /// equals that of a trie which never held the key.
    pub fn delete<K: Into<Nibbles>>(&mut self, key: K) -> TrieResult<Option<Vec<u8>>> {
        let key = key.into();
        trace!("trie delete {:x}", key);
        let root = self.root.resolve(&self.store)?;
        match self.delete_at(root, key.as_slice())? {
            None => Ok(None),
            Some((updated, removed)) => {
                self.root = NodeRef::commit(&updated, &self.store)?;
                Ok(Some(removed))
            }
        }
    }

    /// A depth-first iterator over all `(key, value)` pairs in
    /// lexicographic key order.
    pub fn iter(&self) -> TrieIter {
        TrieIter {
            store: self.store.clone(),
            stack: vec![(Nibbles::new(), IterEntry::Ref(self.root.clone()))],
        }
    }

    fn get_at(&self, node: &Node, key: &[Nibble]) -> TrieResult<Option<Vec<u8>>> {
        match node {
            Node::Empty => Ok(None),
            Node::Leaf { path, value } => {
                trace!("get traversed leaf {:x}", path);
                Ok((path.as_slice() == key).then(|| value.clone()))
            }
            Node::Extension { prefix, child } => {
                trace!("get traversed extension {:x}", prefix);
                if !key.starts_with(prefix.as_slice()) {
                    return Ok(None);
                }
                let child = child.resolve(&self.store)?;
                self.get_at(&child, &key[prefix.len()..])
            }
            Node::Branch { children, value } => match key.split_first() {
                None => Ok((!value.is_empty()).then(|| value.clone())),
                Some((&nib, rest)) => {
                    trace!("get traversed branch (nibble {:x})", nib);
                    let child = children[nib as usize].resolve(&self.store)?;
                    self.get_at(&child, rest)
                }
            },
        }
    }

    fn insert_at(&self, node: Node, key: &[Nibble], value: Vec<u8>) -> TrieResult<Node> {
        match node {
            Node::Empty => Ok(Node::Leaf {
                path: Nibbles::from_nibbles(key.to_vec()),
                value,
            }),
            Node::Leaf {
                path,
                value: existing,
            } => {
                if path.as_slice() == key {
                    return Ok(Node::Leaf { path, value });
                }

                let common = common_prefix_len(path.as_slice(), key);
                let existing_slot = match path.as_slice()[common..].split_first() {
                    None => BranchSlot::Value(existing),
                    Some((&nib, rest)) => {
                        let relocated = Node::Leaf {
                            path: Nibbles::from_nibbles(rest.to_vec()),
                            value: existing,
                        };
                        BranchSlot::Child(nib, NodeRef::commit(&relocated, &self.store)?)
                    }
                };
                self.split_into_branch(&key[..common], existing_slot, &key[common..], value)
            }
            Node::Extension { prefix, child } => {
                if key.starts_with(prefix.as_slice()) {
                    let child_node = child.resolve(&self.store)?;
                    let updated = self.insert_at(child_node, &key[prefix.len()..], value)?;
                    return Ok(Node::Extension {
                        prefix,
                        child: NodeRef::commit(&updated, &self.store)?,
                    });
                }

                // The extension splits: part of its prefix moves below the
                // new branch, either as a shorter extension or, when a
                // single nibble remains, as the branch slot itself.
                let common = common_prefix_len(prefix.as_slice(), key);
                let (ext_nib, ext_rest) = match prefix.as_slice()[common..].split_first() {
                    Some((&nib, rest)) => (nib, rest),
                    None => unreachable!("key would have matched the whole prefix"),
                };
                let surviving = if ext_rest.is_empty() {
                    child
                } else {
                    let shortened = Node::Extension {
                        prefix: Nibbles::from_nibbles(ext_rest.to_vec()),
                        child,
                    };
                    NodeRef::commit(&shortened, &self.store)?
                };
                self.split_into_branch(
                    &key[..common],
                    BranchSlot::Child(ext_nib, surviving),
                    &key[common..],
                    value,
                )
            }
            Node::Branch {
                mut children,
                value: branch_value,
            } => match key.split_first() {
                None => Ok(Node::Branch {
                    children,
                    value,
                }),
                Some((&nib, rest)) => {
                    let child_node = children[nib as usize].resolve(&self.store)?;
                    let updated = self.insert_at(child_node, rest, value)?;
                    children[nib as usize] = NodeRef::commit(&updated, &self.store)?;
                    Ok(Node::Branch {
                        children,
                        value: branch_value,
                    })
                }
            },
        }
    }

    /// Builds the branch produced by splitting a leaf or extension against
    /// a diverging key, prefixing it with an extension over the shared
    /// nibbles when there are any.
    fn split_into_branch(
        &self,
        common: &[Nibble],
        existing: BranchSlot,
        new_tail: &[Nibble],
        value: Vec<u8>,
    ) -> TrieResult<Node> {
        let mut children = Node::empty_branch();
        let mut branch_value = Vec::new();

        match existing {
            BranchSlot::Value(v) => branch_value = v,
            BranchSlot::Child(nib, child) => children[nib as usize] = child,
        }
        match new_tail.split_first() {
            None => branch_value = value,
            Some((&nib, rest)) => {
                let leaf = Node::Leaf {
                    path: Nibbles::from_nibbles(rest.to_vec()),
                    value,
                };
                children[nib as usize] = NodeRef::commit(&leaf, &self.store)?;
            }
        }

        let branch = Node::Branch {
            children,
            value: branch_value,
        };
        if common.is_empty() {
            Ok(branch)
        } else {
            Ok(Node::Extension {
                prefix: Nibbles::from_nibbles(common.to_vec()),
                child: NodeRef::commit(&branch, &self.store)?,
            })
        }
    }

    fn delete_at(&self, node: Node, key: &[Nibble]) -> TrieResult<Option<(Node, Vec<u8>)>> {
        match node {
            Node::Empty => Ok(None),
            Node::Leaf { path, value } => {
                Ok((path.as_slice() == key).then(|| (Node::Empty, value)))
            }
            Node::Extension { prefix, child } => {
                if !key.starts_with(prefix.as_slice()) {
                    return Ok(None);
                }
                let child_node = child.resolve(&self.store)?;
                match self.delete_at(child_node, &key[prefix.len()..])? {
                    None => Ok(None),
                    Some((updated, removed)) => {
                        Ok(Some((self.collapse_extension(&prefix, updated)?, removed)))
                    }
                }
            }
            Node::Branch {
                mut children,
                value,
            } => match key.split_first() {
                None => {
                    if value.is_empty() {
                        return Ok(None);
                    }
                    Ok(Some((
                        Node::Branch {
                            children,
                            value: Vec::new(),
                        },
                        value,
                    )))
                }
                Some((&nib, rest)) => {
                    let child_node = children[nib as usize].resolve(&self.store)?;
                    let Some((updated, removed)) = self.delete_at(child_node, rest)? else {
                        return Ok(None);
                    };

                    let child_emptied = matches!(updated, Node::Empty);
                    if child_emptied && value.is_empty() && count_non_empty(&children) <= 2 {
                        // A single child remains; the branch dissolves into
                        // it (possibly collapsing further in the parent).
                        children[nib as usize] = NodeRef::empty();
                        let collapsed = match remaining_child(&children) {
                            None => Node::Empty,
                            Some((other_nib, other)) => self.graft_child(other_nib, other)?,
                        };
                        Ok(Some((collapsed, removed)))
                    } else {
                        children[nib as usize] = NodeRef::commit(&updated, &self.store)?;
                        Ok(Some((Node::Branch { children, value }, removed)))
                    }
                }
            },
        }
    }

    /// Pulls a dissolved branch's sole remaining child up one nibble.
    fn graft_child(&self, nib: Nibble, child: NodeRef) -> TrieResult<Node> {
        let head = Nibbles::from_nibbles(vec![nib]);
        match child.resolve(&self.store)? {
            Node::Branch { .. } => Ok(Node::Extension {
                prefix: head,
                child,
            }),
            Node::Extension {
                prefix,
                child: grandchild,
            } => Ok(Node::Extension {
                prefix: head.join(&prefix),
                child: grandchild,
            }),
            Node::Leaf { path, value } => Ok(Node::Leaf {
                path: head.join(&path),
                value,
            }),
            Node::Empty => Err(TrieError::MalformedNode(
                "branch child vanished during collapse",
            )),
        }
    }

    /// Re-attaches an extension prefix over an updated child, merging away
    /// shapes an extension must not point at.
    fn collapse_extension(&self, prefix: &Nibbles, child: Node) -> TrieResult<Node> {
        Ok(match child {
            Node::Empty => Node::Empty,
            Node::Branch { .. } => Node::Extension {
                prefix: prefix.clone(),
                child: NodeRef::commit(&child, &self.store)?,
            },
            Node::Extension {
                prefix: tail,
                child: grandchild,
            } => Node::Extension {
                prefix: prefix.join(&tail),
                child: grandchild,
            },
            Node::Leaf { path, value } => Node::Leaf {
                path: prefix.join(&path),
                value,
            },
        })
    }
}

fn count_non_empty(children: &[NodeRef; 16]) -> usize {
    children.iter().filter(|c| !c.is_empty()).count()
}

fn remaining_child(children: &[NodeRef; 16]) -> Option<(Nibble, NodeRef)> {
    children
        .iter()
        .enumerate()
        .find(|(_, c)| !c.is_empty())
        .map(|(nib, c)| (nib as Nibble, c.clone()))
}

enum IterEntry {
    Ref(NodeRef),
    /// A branch value, queued so it yields before the branch's children.
    Value(Vec<u8>),
}

/// Iterator over a trie's `(key, value)` pairs in lexicographic key order.
///
/// Resolution faults (a lost node, corrupt bytes) surface as `Err` items.
pub struct TrieIter {
    store: StoreHandle,
    stack: Vec<(Nibbles, IterEntry)>,
}

impl Iterator for TrieIter {
    type Item = TrieResult<(Nibbles, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((key, entry)) = self.stack.pop() {
            let node_ref = match entry {
                IterEntry::Value(value) => return Some(Ok((key, value))),
                IterEntry::Ref(r) => r,
            };
            if node_ref.is_empty() {
                continue;
            }
            let node = match node_ref.resolve(&self.store) {
                Ok(node) => node,
                Err(e) => return Some(Err(e)),
            };
            match node {
                Node::Empty => {}
                Node::Leaf { path, value } => return Some(Ok((key.join(&path), value))),
                Node::Extension { prefix, child } => {
                    self.stack.push((key.join(&prefix), IterEntry::Ref(child)));
                }
                Node::Branch { children, value } => {
                    for (nib, child) in children.iter().enumerate().rev() {
                        if !child.is_empty() {
                            self.stack.push((
                                key.join_nibble(nib as Nibble),
                                IterEntry::Ref(child.clone()),
                            ));
                        }
                    }
                    if !value.is_empty() {
                        self.stack.push((key, IterEntry::Value(value)));
                    }
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for TrieIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrieIter")
            .field("pending", &self.stack.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing_utils::{common_setup, random_fixed_key_entries};

    fn memory_trie() -> Trie {
        Trie::empty(StoreHandle::in_memory())
    }

    fn items(trie: &Trie) -> Vec<(Nibbles, Vec<u8>)> {
        trie.iter().collect::<TrieResult<Vec<_>>>().unwrap()
    }

    #[test]
    fn empty_trie_has_the_null_root() {
        common_setup();
        assert_eq!(memory_trie().root_hash(), KECCAK_NULL_RLP);
    }

    #[test]
    fn inserted_values_are_retrievable() {
        common_setup();
        let mut trie = memory_trie();
        trie.insert(&b"type"[..], b"fighter".to_vec()).unwrap();
        trie.insert(&b"name"[..], b"bob".to_vec()).unwrap();

        assert_eq!(trie.get(&b"type"[..]).unwrap(), Some(b"fighter".to_vec()));
        assert_eq!(trie.get(&b"name"[..]).unwrap(), Some(b"bob".to_vec()));
        assert_eq!(trie.get(&b"nope"[..]).unwrap(), None);
    }

    #[test]
    fn insertion_order_does_not_change_the_root() {
        common_setup();
        let pairs: [(&[u8], &[u8]); 4] = [
            (b"type", b"fighter"),
            (b"name", b"bob"),
            (b"nationality", b"usa"),
            (b"nato", b"strong"),
        ];

        let mut roots = Vec::new();
        for rotation in 0..pairs.len() {
            let mut trie = memory_trie();
            for i in 0..pairs.len() {
                let (k, v) = pairs[(rotation + i) % pairs.len()];
                trie.insert(k, v.to_vec()).unwrap();
            }
            roots.push(trie.root_hash());

            // Enumeration returns exactly the inserted pairs, sorted by key.
            let got = items(&trie);
            let mut expected: Vec<_> = pairs
                .iter()
                .map(|(k, v)| (Nibbles::from_bytes(k), v.to_vec()))
                .collect();
            expected.sort();
            assert_eq!(got, expected);
        }
        assert!(roots.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn final_write_wins_up_to_root_hash() {
        common_setup();
        let mut overwritten = memory_trie();
        overwritten.insert(&b"key"[..], b"first".to_vec()).unwrap();
        overwritten.insert(&b"key"[..], b"second".to_vec()).unwrap();

        let mut direct = memory_trie();
        direct.insert(&b"key"[..], b"second".to_vec()).unwrap();

        assert_eq!(overwritten.root_hash(), direct.root_hash());
    }

    #[test]
    fn random_entries_converge_across_insertion_orders() {
        common_setup();
        let mut entries = random_fixed_key_entries(100, 0xfeed);
        let mut forward = memory_trie();
        for (k, v) in &entries {
            forward.insert(k.clone(), v.clone()).unwrap();
        }
        entries.reverse();
        let mut backward = memory_trie();
        for (k, v) in &entries {
            backward.insert(k.clone(), v.clone()).unwrap();
        }
        assert_eq!(forward.root_hash(), backward.root_hash());

        for (k, v) in &entries {
            assert_eq!(forward.get(k.clone()).unwrap().as_ref(), Some(v));
        }
    }

    #[test]
    fn delete_restores_the_prior_root() {
        common_setup();
        let entries = random_fixed_key_entries(40, 7);
        let mut trie = memory_trie();
        for (k, v) in &entries[..20] {
            trie.insert(k.clone(), v.clone()).unwrap();
        }
        let root_before = trie.root_hash();

        for (k, v) in &entries[20..] {
            trie.insert(k.clone(), v.clone()).unwrap();
        }
        assert_ne!(trie.root_hash(), root_before);

        for (k, v) in &entries[20..] {
            assert_eq!(trie.delete(k.clone()).unwrap().as_ref(), Some(v));
        }
        assert_eq!(trie.root_hash(), root_before);
    }

    #[test]
    fn deleting_the_only_entry_empties_the_trie() {
        common_setup();
        let mut trie = memory_trie();
        trie.insert(&b"solo"[..], b"value".to_vec()).unwrap();
        assert_eq!(
            trie.delete(&b"solo"[..]).unwrap(),
            Some(b"value".to_vec())
        );
        assert_eq!(trie.root_hash(), KECCAK_NULL_RLP);
        assert!(trie.is_empty());
    }

    #[test]
    fn delete_of_absent_key_is_a_no_op() {
        common_setup();
        let mut trie = memory_trie();
        trie.insert(&b"present"[..], b"v".to_vec()).unwrap();
        let root = trie.root_hash();
        assert_eq!(trie.delete(&b"absent!"[..]).unwrap(), None);
        assert_eq!(trie.root_hash(), root);
    }

    #[test]
    fn branch_value_enumerates_before_longer_keys() {
        common_setup();
        let mut trie = memory_trie();
        // One key is a strict prefix of the other, forcing a branch value.
        trie.insert(Nibbles::from_nibbles(vec![1, 2]), b"short".to_vec())
            .unwrap();
        trie.insert(
            Nibbles::from_nibbles(vec![1, 2, 3, 4]),
            b"long".to_vec(),
        )
        .unwrap();

        let got = items(&trie);
        assert_eq!(
            got,
            vec![
                (Nibbles::from_nibbles(vec![1, 2]), b"short".to_vec()),
                (Nibbles::from_nibbles(vec![1, 2, 3, 4]), b"long".to_vec()),
            ]
        );
        assert_eq!(
            trie.get(Nibbles::from_nibbles(vec![1, 2])).unwrap(),
            Some(b"short".to_vec())
        );
    }

    #[test]
    fn clone_is_a_snapshot() {
        common_setup();
        let mut trie = memory_trie();
        trie.insert(&b"stable"[..], b"old".to_vec()).unwrap();
        let snapshot = trie.clone();

        trie.insert(&b"stable"[..], b"new".to_vec()).unwrap();
        trie.insert(&b"fresh"[..], b"x".to_vec()).unwrap();

        assert_eq!(snapshot.get(&b"stable"[..]).unwrap(), Some(b"old".to_vec()));
        assert_eq!(snapshot.get(&b"fresh"[..]).unwrap(), None);
        assert_eq!(trie.get(&b"stable"[..]).unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn reopening_by_root_sees_the_same_contents() {
        common_setup();
        let store = StoreHandle::in_memory();
        let mut trie = Trie::empty(store.clone());
        let entries = random_fixed_key_entries(50, 99);
        for (k, v) in &entries {
            trie.insert(k.clone(), v.clone()).unwrap();
        }

        let reopened = Trie::from_root(store, trie.root_hash());
        for (k, v) in &entries {
            assert_eq!(reopened.get(k.clone()).unwrap().as_ref(), Some(v));
        }
    }

    #[test]
    fn lost_store_data_is_a_hard_fault() {
        common_setup();
        let mut trie = memory_trie();
        for (k, v) in random_fixed_key_entries(10, 3) {
            trie.insert(k, v).unwrap();
        }
        // Same root, detached from the store that holds the nodes.
        let detached = Trie::from_root(StoreHandle::in_memory(), trie.root_hash());
        let err = detached
            .get(random_fixed_key_entries(1, 3).remove(0).0)
            .unwrap_err();
        assert!(matches!(err, TrieError::KeyNotFound(_)));
    }
}
