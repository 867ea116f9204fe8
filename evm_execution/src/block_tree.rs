//! The block tree: every imported block, keyed under its parent, with
//! cumulative difficulty deciding the canonical chain.

use ethereum_types::{H256, U256};
use log::debug;
use thiserror::Error;

use crate::block::Block;

/// Why a block could not be attached.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum TreeError {
    /// The block's parent is not in the tree.
    #[error("no path to parent {0:x}")]
    NoPath(H256),

    /// The block is already in the tree.
    #[error("block {0:x} is already present")]
    Duplicate(H256),
}

struct TreeNode {
    hash: H256,
    parent: Option<usize>,
    children: Vec<usize>,
    block: Option<Block>,
    /// Sum of difficulties along the path from the root to this node.
    cumulative_difficulty: U256,
    /// Largest cumulative difficulty among this node and its descendants.
    total_difficulty: U256,
}

/// A tree of blocks rooted at a sentinel whose only child is the genesis
/// block (the genesis parent hash is all zeroes, matching the sentinel).
pub struct BlockTree {
    nodes: Vec<TreeNode>,
    index: std::collections::HashMap<H256, usize>,
}

impl Default for BlockTree {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockTree {
    /// An empty tree: just the sentinel root.
    pub fn new() -> Self {
        let sentinel = TreeNode {
            hash: H256::zero(),
            parent: None,
            children: Vec::new(),
            block: None,
            cumulative_difficulty: U256::zero(),
            total_difficulty: U256::zero(),
        };
        let mut index = std::collections::HashMap::new();
        index.insert(H256::zero(), 0);
        Self {
            nodes: vec![sentinel],
            index,
        }
    }

    /// Attaches `block` under its parent and propagates the heaviest
    /// descendant's cumulative difficulty back up the path.
    pub fn add_block(&mut self, block: Block) -> Result<(), TreeError> {
        let hash = block.hash();
        if self.index.contains_key(&hash) {
            return Err(TreeError::Duplicate(hash));
        }
        let parent_hash = block.header.parent_hash;
        let Some(&parent_idx) = self.index.get(&parent_hash) else {
            return Err(TreeError::NoPath(parent_hash));
        };

        let cumulative =
            self.nodes[parent_idx].cumulative_difficulty + block.header.difficulty;
        debug!(
            "tree add {:x} under {:x} (cumulative difficulty {})",
            hash, parent_hash, cumulative
        );

        let idx = self.nodes.len();
        self.nodes.push(TreeNode {
            hash,
            parent: Some(parent_idx),
            children: Vec::new(),
            block: Some(block),
            cumulative_difficulty: cumulative,
            total_difficulty: cumulative,
        });
        self.nodes[parent_idx].children.push(idx);
        self.index.insert(hash, idx);

        // Pull the new weight up toward the root.
        let mut current = parent_idx;
        loop {
            if self.nodes[current].total_difficulty >= cumulative {
                break;
            }
            self.nodes[current].total_difficulty = cumulative;
            match self.nodes[current].parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(())
    }

    /// Whether a block is in the tree.
    pub fn contains(&self, hash: H256) -> bool {
        hash != H256::zero() && self.index.contains_key(&hash)
    }

    /// Sum of difficulties from the root down to `hash`.
    pub fn cumulative_difficulty(&self, hash: H256) -> Option<U256> {
        self.index
            .get(&hash)
            .map(|&idx| self.nodes[idx].cumulative_difficulty)
    }

    /// The heaviest cumulative difficulty reachable below `hash`.
    pub fn total_difficulty(&self, hash: H256) -> Option<U256> {
        self.index
            .get(&hash)
            .map(|&idx| self.nodes[idx].total_difficulty)
    }

    /// The canonical tip: descend from the root, at each step taking the
    /// child whose subtree carries the heaviest cumulative difficulty,
    /// first-seen winning ties.
    pub fn canonical_head(&self) -> Option<&Block> {
        let mut current = 0;
        loop {
            let next = self.nodes[current]
                .children
                .iter()
                .copied()
                .max_by_key(|&child| {
                    // Stable max: later equal children must not displace
                    // earlier ones, so key on (difficulty, reverse index).
                    (
                        self.nodes[child].total_difficulty,
                        std::cmp::Reverse(child),
                    )
                });
            match next {
                Some(child) => current = child,
                None => break,
            }
        }
        self.nodes[current].block.as_ref()
    }

    /// Hashes from `hash` up to (and excluding) the sentinel root, i.e.
    /// the block's ancestry newest-first.
    pub fn path_to_root(&self, hash: H256) -> Option<Vec<H256>> {
        let mut idx = *self.index.get(&hash)?;
        if self.nodes[idx].block.is_none() {
            return None;
        }
        let mut path = Vec::new();
        while let Some(parent) = self.nodes[idx].parent {
            path.push(self.nodes[idx].hash);
            idx = parent;
        }
        Some(path)
    }
}

impl std::fmt::Debug for BlockTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockTree")
            .field("blocks", &(self.nodes.len() - 1))
            .finish()
    }
}
