//! Trie node shapes, their RLP encoding, and the inline-vs-hashed child
//! references that tie nodes to the backing store.

use bytes::Bytes;
use ethereum_types::H256;
use keccak_hash::keccak;

use crate::nibbles::Nibbles;
use crate::rlp::{self, RlpItem};
use crate::store::StoreHandle;
use crate::trie::{TrieError, TrieResult};

/// Encodings this long or longer are stored out-of-line under their keccak.
pub const INLINE_LIMIT: usize = 32;

/// A reference to a child node.
///
/// Children whose RLP encoding is shorter than 32 bytes are embedded
/// directly in the parent's encoding; everything else is referenced by the
/// keccak of its encoding and lives in the backing store under that hash.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum NodeRef {
    /// An embedded node, held as its decoded RLP item.
    Inline(RlpItem),
    /// The keccak of the node's encoding; the bytes live in the store.
    Hash(H256),
}

impl NodeRef {
    /// The reference to the empty node.
    pub fn empty() -> Self {
        Self::Inline(RlpItem::empty())
    }

    /// Whether this references the empty node.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Inline(item) if item.is_empty_str())
    }

    /// Encodes `node` and commits it: small encodings stay inline, larger
    /// ones are written to the store and referenced by hash.
    pub fn commit(node: &Node, store: &StoreHandle) -> TrieResult<Self> {
        let item = node.to_item();
        let encoded = rlp::encode(&item);
        if encoded.len() < INLINE_LIMIT {
            Ok(Self::Inline(item))
        } else {
            let hash = keccak(&encoded);
            store.put(hash, encoded)?;
            Ok(Self::Hash(hash))
        }
    }

    /// Loads the referenced node, reading through the store for hashed
    /// references. A hashed reference that the store cannot produce means
    /// the backing store has lost data.
    pub fn resolve(&self, store: &StoreHandle) -> TrieResult<Node> {
        match self {
            Self::Inline(item) => Node::from_item(item),
            Self::Hash(hash) => {
                let encoded = store.get(*hash)?.ok_or(TrieError::KeyNotFound(*hash))?;
                Node::from_item(&rlp::decode(&encoded)?)
            }
        }
    }

    /// The keccak of the referenced node's encoding. For inline references
    /// this re-encodes; it is only needed when an inline node is the root.
    pub fn node_hash(&self) -> H256 {
        match self {
            Self::Inline(item) => keccak(rlp::encode(item)),
            Self::Hash(hash) => *hash,
        }
    }

    /// The item embedded into a parent's encoding for this reference.
    fn to_item(&self) -> RlpItem {
        match self {
            Self::Inline(item) => item.clone(),
            Self::Hash(hash) => RlpItem::hash(*hash),
        }
    }

    /// Reads a child reference out of a parent's decoded encoding.
    fn from_item(item: &RlpItem) -> TrieResult<Self> {
        match item {
            RlpItem::Str(bytes) if bytes.is_empty() => Ok(Self::empty()),
            RlpItem::Str(bytes) if bytes.len() == 32 => {
                Ok(Self::Hash(H256::from_slice(bytes)))
            }
            RlpItem::Str(_) => Err(TrieError::MalformedNode(
                "child reference must be empty, a 32-byte hash, or an embedded node",
            )),
            RlpItem::List(_) => Ok(Self::Inline(item.clone())),
        }
    }
}

/// A trie node.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Node {
    /// The empty trie.
    #[default]
    Empty,
    /// A terminal node holding the remaining key nibbles and a value.
    Leaf {
        /// Remaining nibbles below the parent.
        path: Nibbles,
        /// The stored value.
        value: Vec<u8>,
    },
    /// A shared-prefix compressor; always points at a branch.
    Extension {
        /// The shared nibble prefix.
        prefix: Nibbles,
        /// The branch beneath the prefix.
        child: NodeRef,
    },
    /// A 16-way fanout plus a value slot for keys terminating here.
    Branch {
        /// One child per next-nibble, empty-referenced when absent.
        children: [NodeRef; 16],
        /// Value for the key ending at this node; empty when unset.
        value: Vec<u8>,
    },
}

impl Node {
    /// A branch with all sixteen children empty and no value.
    pub fn empty_branch() -> [NodeRef; 16] {
        std::array::from_fn(|_| NodeRef::empty())
    }

    /// The node's RLP item: leaves and extensions are two-item lists headed
    /// by their hex-prefix path, branches are 17-item lists with the value
    /// slot last, and the empty node is the empty byte-string.
    pub fn to_item(&self) -> RlpItem {
        match self {
            Node::Empty => RlpItem::empty(),
            Node::Leaf { path, value } => RlpItem::list(vec![
                RlpItem::str(path.to_hex_prefix_encoding(true)),
                RlpItem::str(value.clone()),
            ]),
            Node::Extension { prefix, child } => RlpItem::list(vec![
                RlpItem::str(prefix.to_hex_prefix_encoding(false)),
                child.to_item(),
            ]),
            Node::Branch { children, value } => {
                let mut items = Vec::with_capacity(17);
                for child in children {
                    items.push(child.to_item());
                }
                items.push(RlpItem::str(value.clone()));
                RlpItem::list(items)
            }
        }
    }

    /// Rebuilds a node from its decoded encoding.
    pub fn from_item(item: &RlpItem) -> TrieResult<Self> {
        match item {
            RlpItem::Str(bytes) if bytes.is_empty() => Ok(Node::Empty),
            RlpItem::Str(_) => Err(TrieError::MalformedNode(
                "a node is either the empty string or a list",
            )),
            RlpItem::List(items) => match items.len() {
                2 => {
                    let (path, is_leaf) =
                        Nibbles::from_hex_prefix_encoding(items[0].as_str()?)?;
                    if is_leaf {
                        Ok(Node::Leaf {
                            path,
                            value: items[1].as_str()?.to_vec(),
                        })
                    } else {
                        Ok(Node::Extension {
                            prefix: path,
                            child: NodeRef::from_item(&items[1])?,
                        })
                    }
                }
                17 => {
                    let mut children = Node::empty_branch();
                    for (slot, item) in children.iter_mut().zip(items.iter()) {
                        *slot = NodeRef::from_item(item)?;
                    }
                    Ok(Node::Branch {
                        children,
                        value: items[16].as_str()?.to_vec(),
                    })
                }
                _ => Err(TrieError::MalformedNode(
                    "a node list has either 2 or 17 items",
                )),
            },
        }
    }

    /// The node's full RLP encoding.
    pub fn encode(&self) -> Bytes {
        rlp::encode(&self.to_item())
    }
}
