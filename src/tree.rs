/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The in-memory tree of tentative blocks.
//!
//! The tree is an arena of [`BlockPointer`]s indexed by hash. Children are discovered on demand
//! through the pending-by-parent table; parents never store links to their children, which keeps
//! the pruning pass of finalization local to the branches being pruned.
//!
//! Out-of-order blocks wait in two structures that deliberately overlap: the *pending-by-parent*
//! table, which is authoritative, and the *pending queue*, a round-keyed min-queue that may
//! contain stale entries. A queue entry is only acted upon if the table still witnesses it;
//! stale entries are discarded silently. This lets both "parent arrived" and "round reached"
//! consumers pop cheaply without the two structures having to stay exactly in sync.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::store::kv_store::{KVGet, KVGetError};
use crate::types::block::SignedBlock;
use crate::types::data_types::{BlockHash, BlockHeight, Epoch, Round, StateHash, Timestamp};

/// Bound on the number of hashes the dead cache retains. Eviction is first-in-first-out.
const DEAD_CACHE_BOUND: usize = 1000;

/// A node of the in-memory tree: the data every component needs about a block that has passed
/// verification, without the block body itself being mandatory (the genesis block has no body).
#[derive(Clone)]
pub struct BlockPointer {
    /// Hash of the block.
    pub hash: BlockHash,

    /// Height of the block: its distance from genesis along parent links.
    pub height: BlockHeight,

    /// Round of the block.
    pub round: Round,

    /// Epoch of the block.
    pub epoch: Epoch,

    /// Timestamp the block carries.
    pub timestamp: Timestamp,

    /// The state hash resulting from executing the block.
    pub state_hash: StateHash,

    /// Hash of the parent block. The genesis block is its own parent.
    pub parent: BlockHash,

    /// The signed block, absent for the genesis block.
    pub block: Option<Arc<SignedBlock>>,

    /// When this node first saw the block.
    pub arrive_time: Timestamp,
}

impl BlockPointer {
    /// Create the pointer for the genesis block.
    pub fn genesis(hash: BlockHash, state_hash: StateHash, timestamp: Timestamp) -> BlockPointer {
        BlockPointer {
            hash,
            height: BlockHeight::new(0),
            round: Round::genesis(),
            epoch: Epoch::genesis(),
            timestamp,
            state_hash,
            parent: hash,
            block: None,
            arrive_time: timestamp,
        }
    }
}

/// A block in the live map: either still waiting for its parent, or fully integrated.
#[derive(Clone)]
enum LiveBlock {
    Pending(Arc<SignedBlock>),
    Alive(Arc<BlockPointer>),
}

/// The status of a block relative to the tree, when the caller can afford a store read.
#[derive(Clone)]
pub enum BlockStatus {
    /// The block is finalized and is the last finalized block.
    Finalized(Arc<BlockPointer>),

    /// The block is integrated but not finalized.
    Alive(Arc<BlockPointer>),

    /// The block has been received but its parent has not become alive.
    Pending(Arc<SignedBlock>),

    /// The block was proven invalid, or pruned when a competitor finalized.
    Dead,

    /// The block has never been seen.
    Unknown,
}

/// The status of a block relative to the tree, computable without touching the persistent store.
#[derive(Clone)]
pub enum RecentBlockStatus {
    /// The block was finalized before the last finalized block; only its existence is cheap to
    /// know.
    OldFinalized,

    /// The block is recent; its exact status is attached.
    Recent(BlockStatus),
}

/// Bounded set of recently rejected block hashes, evicting first-in-first-out.
struct DeadCache {
    members: HashSet<BlockHash>,
    order: VecDeque<BlockHash>,
}

impl DeadCache {
    fn new() -> DeadCache {
        DeadCache {
            members: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, hash: BlockHash) {
        if self.members.insert(hash) {
            self.order.push_back(hash);
            if self.order.len() > DEAD_CACHE_BOUND {
                if let Some(evicted) = self.order.pop_front() {
                    self.members.remove(&evicted);
                }
            }
        }
    }

    fn contains(&self, hash: &BlockHash) -> bool {
        self.members.contains(hash)
    }
}

/// Entry of the round-keyed pending min-queue.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingQueueEntry {
    round: Round,
    hash: BlockHash,
    parent: BlockHash,
}

/// The in-memory tree state: live and pending blocks, the dead cache, the pending tables, and the
/// finalization frontier.
///
/// Exclusively owned by the consensus engine; every component reads and mutates it through the
/// engine's single-threaded context.
pub struct TreeState {
    live: HashMap<BlockHash, LiveBlock>,
    dead: DeadCache,
    pending_by_parent: IndexMap<BlockHash, Vec<Arc<SignedBlock>>>,
    pending_queue: BinaryHeap<Reverse<PendingQueueEntry>>,
    /// Non-finalized alive blocks, indexed by height.
    branches: BTreeMap<BlockHeight, Vec<Arc<BlockPointer>>>,
    last_finalized: Arc<BlockPointer>,
    focus: Arc<BlockPointer>,
    /// Hashes finalized during this session, below the last finalized block.
    old_finalized: HashMap<BlockHash, BlockHeight>,
}

impl TreeState {
    /// Create a tree whose only block is `last_finalized` (at startup, the genesis block or the
    /// block recovered from the store).
    pub fn new(last_finalized: Arc<BlockPointer>) -> TreeState {
        TreeState {
            live: HashMap::new(),
            dead: DeadCache::new(),
            pending_by_parent: IndexMap::new(),
            pending_queue: BinaryHeap::new(),
            branches: BTreeMap::new(),
            focus: Arc::clone(&last_finalized),
            last_finalized,
            old_finalized: HashMap::new(),
        }
    }

    /// Get the last finalized block.
    pub fn last_finalized(&self) -> &Arc<BlockPointer> {
        &self.last_finalized
    }

    /// Get the focus block: the tip from which pending-transaction bookkeeping is projected.
    pub fn focus(&self) -> &Arc<BlockPointer> {
        &self.focus
    }

    pub(crate) fn set_focus(&mut self, focus: Arc<BlockPointer>) {
        self.focus = focus;
    }

    /// Get the status of a block without touching the persistent store.
    pub fn get_recent_block_status(&self, hash: &BlockHash) -> RecentBlockStatus {
        if *hash == self.last_finalized.hash {
            return RecentBlockStatus::Recent(BlockStatus::Finalized(Arc::clone(
                &self.last_finalized,
            )));
        }
        match self.live.get(hash) {
            Some(LiveBlock::Alive(pointer)) => {
                RecentBlockStatus::Recent(BlockStatus::Alive(Arc::clone(pointer)))
            }
            Some(LiveBlock::Pending(block)) => {
                RecentBlockStatus::Recent(BlockStatus::Pending(Arc::clone(block)))
            }
            None => {
                if self.dead.contains(hash) {
                    RecentBlockStatus::Recent(BlockStatus::Dead)
                } else if self.old_finalized.contains_key(hash) {
                    RecentBlockStatus::OldFinalized
                } else {
                    RecentBlockStatus::Recent(BlockStatus::Unknown)
                }
            }
        }
    }

    /// Get the status of a block, consulting the persistent store for blocks finalized before
    /// this session. May block on a store read.
    pub fn get_block_status<S: KVGet>(
        &self,
        store: &S,
        hash: &BlockHash,
    ) -> Result<RecentBlockStatus, KVGetError> {
        match self.get_recent_block_status(hash) {
            RecentBlockStatus::Recent(BlockStatus::Unknown) => {
                if store.height_by_hash(hash)?.is_some() {
                    Ok(RecentBlockStatus::OldFinalized)
                } else {
                    Ok(RecentBlockStatus::Recent(BlockStatus::Unknown))
                }
            }
            status => Ok(status),
        }
    }

    /// Get the pointer of an alive block, including the last finalized block.
    pub fn get_alive(&self, hash: &BlockHash) -> Option<Arc<BlockPointer>> {
        if *hash == self.last_finalized.hash {
            return Some(Arc::clone(&self.last_finalized));
        }
        match self.live.get(hash) {
            Some(LiveBlock::Alive(pointer)) => Some(Arc::clone(pointer)),
            _ => None,
        }
    }

    /// Insert a block whose parent is not alive yet.
    ///
    /// The block is prepended to its parent's pending list and recorded in the pending queue under
    /// its round.
    pub fn add_pending_block(&mut self, block: Arc<SignedBlock>) {
        self.pending_queue.push(Reverse(PendingQueueEntry {
            round: block.round(),
            hash: block.hash,
            parent: block.parent(),
        }));
        self.pending_by_parent
            .entry(block.parent())
            .or_default()
            .insert(0, Arc::clone(&block));
        self.live.insert(block.hash, LiveBlock::Pending(block));
    }

    /// Atomically remove and return all pending children of `parent`.
    pub fn take_pending_children(&mut self, parent: &BlockHash) -> Vec<Arc<SignedBlock>> {
        self.pending_by_parent
            .swap_remove(parent)
            .unwrap_or_default()
    }

    /// Pop the pending block with the smallest round at most `target_round` whose presence is
    /// still witnessed by the pending-by-parent table.
    ///
    /// Queue entries no longer witnessed by the table are discarded silently; the table is
    /// authoritative.
    pub fn take_next_pending_until(&mut self, target_round: Round) -> Option<Arc<SignedBlock>> {
        while let Some(Reverse(entry)) = self.pending_queue.peek().copied() {
            if entry.round > target_round {
                return None;
            }
            self.pending_queue.pop();

            let Some(children) = self.pending_by_parent.get_mut(&entry.parent) else {
                continue;
            };
            let Some(position) = children.iter().position(|child| child.hash == entry.hash) else {
                continue;
            };
            let block = children.remove(position);
            if children.is_empty() {
                self.pending_by_parent.swap_remove(&entry.parent);
            }
            return Some(block);
        }
        None
    }

    /// Replace the pending record of `block` with an alive pointer.
    pub fn make_live(
        &mut self,
        block: Arc<SignedBlock>,
        state_hash: StateHash,
        height: BlockHeight,
        arrive_time: Timestamp,
    ) -> Arc<BlockPointer> {
        let pointer = Arc::new(BlockPointer {
            hash: block.hash,
            height,
            round: block.round(),
            epoch: block.epoch(),
            timestamp: block.timestamp(),
            state_hash,
            parent: block.parent(),
            block: Some(block),
            arrive_time,
        });
        self.live
            .insert(pointer.hash, LiveBlock::Alive(Arc::clone(&pointer)));
        self.branches
            .entry(height)
            .or_default()
            .push(Arc::clone(&pointer));
        pointer
    }

    /// Remove a block from the live map and remember its hash in the dead cache.
    ///
    /// Pending blocks lose their pending-by-parent entry as well; stale queue entries are left to
    /// be discarded lazily.
    pub fn mark_dead(&mut self, hash: &BlockHash) {
        match self.live.remove(hash) {
            Some(LiveBlock::Pending(block)) => {
                if let Some(children) = self.pending_by_parent.get_mut(&block.parent()) {
                    children.retain(|child| child.hash != *hash);
                    if children.is_empty() {
                        self.pending_by_parent.swap_remove(&block.parent());
                    }
                }
            }
            Some(LiveBlock::Alive(pointer)) => {
                if let Some(at_height) = self.branches.get_mut(&pointer.height) {
                    at_height.retain(|branch| branch.hash != *hash);
                    if at_height.is_empty() {
                        self.branches.remove(&pointer.height);
                    }
                }
            }
            None => {}
        }
        self.dead.insert(*hash);
    }

    /// Promote an alive block to be the new last finalized block.
    ///
    /// The previous last finalized block is remembered as old-finalized. Callers must finalize in
    /// height order.
    pub(crate) fn set_finalized(&mut self, pointer: Arc<BlockPointer>) {
        let hash = pointer.hash;
        let height = pointer.height;
        let previous = std::mem::replace(&mut self.last_finalized, pointer);
        self.old_finalized.insert(previous.hash, previous.height);

        self.live.remove(&hash);
        if let Some(at_height) = self.branches.get_mut(&height) {
            at_height.retain(|branch| branch.hash != hash);
            if at_height.is_empty() {
                self.branches.remove(&height);
            }
        }
    }

    /// Drop every pending queue entry (and its pending block) whose round is at most `round`,
    /// marking the blocks dead: they can never become alive once the round is finalized.
    pub(crate) fn drain_pending_below(&mut self, round: Round) {
        while let Some(block) = self.take_next_pending_until(round) {
            let hash = block.hash;
            drop(block);
            self.live.remove(&hash);
            self.dead.insert(hash);
        }
    }

    /// Iterate through the non-finalized alive blocks in ascending height order.
    pub fn branches(&self) -> impl Iterator<Item = &Arc<BlockPointer>> {
        self.branches.values().flatten()
    }

    /// Check whether `pointer` descends from the block with `ancestor` hash (inclusively).
    pub fn descends_from(&self, pointer: &Arc<BlockPointer>, ancestor: &BlockHash) -> bool {
        let mut current = Arc::clone(pointer);
        loop {
            if current.hash == *ancestor {
                return true;
            }
            if current.height == BlockHeight::new(0) {
                return false;
            }
            match self.get_alive(&current.parent) {
                Some(parent) => current = parent,
                // The parent is not alive, so it is finalized, dead, or unknown; in every case
                // the only ancestor left to match is the parent itself.
                None => return current.parent == *ancestor,
            }
        }
    }

    /// Collect the alive blocks with no alive child.
    pub fn leaves(&self) -> Vec<Arc<BlockPointer>> {
        let parents: HashSet<BlockHash> = self.branches().map(|pointer| pointer.parent).collect();
        self.branches()
            .filter(|pointer| !parents.contains(&pointer.hash))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::block::{BakedBlock, Transaction};
    use crate::types::certificates::QuorumCertificate;
    use crate::types::data_types::*;

    fn pending_block(round: u64, parent: BlockHash) -> Arc<SignedBlock> {
        let block = BakedBlock {
            round: Round::new(round),
            epoch: Epoch::new(0),
            timestamp: Timestamp::new(round * 1000),
            baker: BakerId::new(0),
            baker_key: VerifyingKeyBytes::new([0u8; 32]),
            block_nonce: VrfOutput::new([0u8; 32]),
            nonce_proof: VrfProofBytes::new([0u8; 80]),
            leader_proof: VrfProofBytes::new([0u8; 80]),
            parent,
            justify: QuorumCertificate::genesis(parent),
            timeout_certificate: None,
            finalization_entry: None,
            transactions: vec![Transaction::new(vec![round as u8])],
            state_hash: StateHash::new([0u8; 32]),
            outcomes_hash: StateHash::new([0u8; 32]),
        };
        Arc::new(SignedBlock::new(block, SignatureBytes::new([0u8; 64])))
    }

    fn tree() -> TreeState {
        let genesis = Arc::new(BlockPointer::genesis(
            BlockHash::new([0u8; 32]),
            StateHash::new([0u8; 32]),
            Timestamp::new(0),
        ));
        TreeState::new(genesis)
    }

    #[test]
    fn take_next_pending_respects_round_bound() {
        let mut tree = tree();
        let parent = BlockHash::new([9u8; 32]);
        let early = pending_block(2, parent);
        let late = pending_block(8, parent);
        tree.add_pending_block(Arc::clone(&early));
        tree.add_pending_block(Arc::clone(&late));

        let popped = tree.take_next_pending_until(Round::new(5)).unwrap();
        assert_eq!(popped.hash, early.hash);
        assert!(tree.take_next_pending_until(Round::new(5)).is_none());
        let popped = tree.take_next_pending_until(Round::new(8)).unwrap();
        assert_eq!(popped.hash, late.hash);
    }

    #[test]
    fn stale_queue_entries_are_discarded_silently() {
        let mut tree = tree();
        let parent = BlockHash::new([9u8; 32]);
        let block = pending_block(3, parent);
        tree.add_pending_block(Arc::clone(&block));

        // Taking the children empties the authoritative table but leaves the queue entry behind.
        let children = tree.take_pending_children(&parent);
        assert_eq!(children.len(), 1);
        assert!(tree.take_next_pending_until(Round::new(10)).is_none());
    }

    #[test]
    fn dead_cache_evicts_first_in_first_out() {
        let mut cache = DeadCache::new();
        for i in 0..(DEAD_CACHE_BOUND + 1) {
            let mut bytes = [0u8; 32];
            bytes[..8].copy_from_slice(&(i as u64).to_be_bytes());
            cache.insert(BlockHash::new(bytes));
        }
        let mut first = [0u8; 32];
        first[..8].copy_from_slice(&0u64.to_be_bytes());
        assert!(!cache.contains(&BlockHash::new(first)));
        let mut second = [0u8; 32];
        second[..8].copy_from_slice(&1u64.to_be_bytes());
        assert!(cache.contains(&BlockHash::new(second)));
    }

    #[test]
    fn mark_dead_purges_pending_state() {
        let mut tree = tree();
        let parent = BlockHash::new([9u8; 32]);
        let block = pending_block(3, parent);
        tree.add_pending_block(Arc::clone(&block));

        tree.mark_dead(&block.hash);
        assert!(matches!(
            tree.get_recent_block_status(&block.hash),
            RecentBlockStatus::Recent(BlockStatus::Dead)
        ));
        assert!(tree.take_next_pending_until(Round::new(10)).is_none());
    }
}
