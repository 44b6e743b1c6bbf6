/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The finality detector: turning chained quorum certificates into irreversible finalization.
//!
//! A block is finalized when two consecutive rounds of the same epoch are certified and the later
//! certificate's block extends the earlier one. Everything that follows from that (persisting the
//! finalized chain, pruning competitors into the dead cache, draining the pending queue, and
//! re-anchoring the focus block) happens here, in one pass per new certificate.

use std::sync::Arc;

use sha2::Digest;

use crate::crypto::CryptoHasher;
use crate::engine::{Consensus, ConsensusContext};
use crate::events::{Event, FinalizeBlockEvent, PruneBlockEvent};
use crate::store::kv_store::{KVGetError, KVStore, WriteBatch};
use crate::tree::BlockPointer;
use crate::types::certificates::{FinalizationEntry, QuorumCertificate, SuccessorProof};
use crate::types::data_types::Epoch;

/// Errors that are not recoverable in the consensus context.
///
/// These are distinct from protocol-level invalid messages, which are always recovered locally by
/// rejection: a fatal error means this node's own state is broken, and the engine must stop.
#[derive(Debug)]
pub enum FatalConsensusError {
    /// The low-level store returned malformed or missing data for a key that must be intact.
    Store(KVGetError),

    /// No committee could be resolved for an epoch consensus has provably entered.
    MissingCommittee { epoch: Epoch },

    /// A cryptographically valid finalization entry references blocks inconsistent with the tree.
    InconsistentFinalization { description: &'static str },

    /// The store was initialized for a different chain than the engine was configured with.
    GenesisMismatch {
        stored: crate::types::data_types::BlockHash,
        configured: crate::types::data_types::BlockHash,
    },
}

impl From<KVGetError> for FatalConsensusError {
    fn from(value: KVGetError) -> Self {
        FatalConsensusError::Store(value)
    }
}

impl std::fmt::Display for FatalConsensusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalConsensusError::Store(err) => write!(f, "Broken consensus store: {}", err),
            FatalConsensusError::MissingCommittee { epoch } => {
                write!(f, "No finalization committee for entered epoch {}", epoch)
            }
            FatalConsensusError::InconsistentFinalization { description } => {
                write!(f, "Inconsistent finalization: {}", description)
            }
            FatalConsensusError::GenesisMismatch { stored, configured } => write!(
                f,
                "The store belongs to chain {} but the engine was configured for chain {}",
                stored, configured
            ),
        }
    }
}

/// Build the finalization entry witnessing that `finalized_qc.block` is final, with
/// `successor_qc` certifying its immediate successor.
pub(crate) fn make_finalization_entry(
    finalized_qc: QuorumCertificate,
    successor_qc: QuorumCertificate,
) -> FinalizationEntry {
    let mut hasher = CryptoHasher::new();
    hasher.update(finalized_qc.block.bytes());
    hasher.update(successor_qc.block.bytes());
    FinalizationEntry {
        finalized_qc,
        successor_qc,
        successor_proof: SuccessorProof::new(hasher.finalize().into()),
    }
}

impl<Ctx: ConsensusContext> Consensus<Ctx> {
    /// Determine whether `certificate` makes some block newly finalized, and if so advance the
    /// finalization frontier.
    ///
    /// Writing the certificate's block as `B`: `B.parent` becomes finalized when `B` sits in the
    /// round immediately after its parent's, in the same epoch, and the parent is past the current
    /// last finalized round. Every alive ancestor of the new last finalized block finalizes with
    /// it, in height order; competing branches die; pending blocks at or below the finalized round
    /// are drained.
    ///
    /// A certificate for a block that is not (yet) alive is not an error: the certificate may
    /// become useful later, but cannot finalize anything now.
    pub(crate) fn check_finality(
        &mut self,
        certificate: &QuorumCertificate,
    ) -> Result<(), FatalConsensusError> {
        let Some(block) = self.tree.get_alive(&certificate.block) else {
            return Ok(());
        };
        let Some(parent) = self.tree.get_alive(&block.parent) else {
            return Ok(());
        };

        let consecutive = block.round == parent.round + 1 && block.epoch == parent.epoch;
        if !consecutive || parent.round <= self.tree.last_finalized().round {
            return Ok(());
        }

        // The parent's certificate is carried by the block that extends it.
        let parent_qc = match &block.block {
            Some(signed) => signed.block.justify.clone(),
            None => {
                return Err(FatalConsensusError::InconsistentFinalization {
                    description: "certified block extending the genesis block cannot finalize it",
                })
            }
        };
        let entry = make_finalization_entry(parent_qc, certificate.clone());

        // 1. Collect the finalizing chain: `parent` and every alive ancestor down to (but not
        //    including) the previous last finalized block.
        let previous_finalized = Arc::clone(self.tree.last_finalized());
        let mut chain: Vec<Arc<BlockPointer>> = Vec::new();
        let mut cursor = Arc::clone(&parent);
        while cursor.hash != previous_finalized.hash {
            chain.push(Arc::clone(&cursor));
            match self.tree.get_alive(&cursor.parent) {
                Some(ancestor) => cursor = ancestor,
                None => {
                    if cursor.parent == previous_finalized.hash {
                        break;
                    }
                    return Err(FatalConsensusError::InconsistentFinalization {
                        description: "finalizing chain does not reach the last finalized block",
                    });
                }
            }
        }
        chain.reverse();

        // 2. Persist the finalized blocks and the entry in one atomic batch, then update the
        //    in-memory frontier in height order.
        let mut batch = <Ctx::Store as KVStore>::WriteBatch::new();
        for pointer in &chain {
            let signed = pointer
                .block
                .as_ref()
                .expect("only the genesis block has no body, and it is finalized from the start");
            batch.set_finalized_block(pointer.height, signed);
        }
        batch.set_latest_finalization_entry(&entry);
        self.store.write(batch);

        for pointer in &chain {
            self.tree.set_finalized(Arc::clone(pointer));
            Event::FinalizeBlock(FinalizeBlockEvent {
                timestamp: self.clock_now(),
                block: pointer.hash,
                height: pointer.height,
                round: pointer.round,
            })
            .publish(&self.event_publisher);
        }
        self.latest_finalization_entry = Some(entry);

        // 3. Prune: an alive block that does not descend from the new last finalized block can
        //    never be finalized.
        let last_finalized = Arc::clone(self.tree.last_finalized());
        let condemned: Vec<_> = self
            .tree
            .branches()
            .filter(|branch| !self.tree.descends_from(branch, &last_finalized.hash))
            .map(|branch| branch.hash)
            .collect();
        for hash in condemned {
            self.tree.mark_dead(&hash);
            Event::PruneBlock(PruneBlockEvent {
                timestamp: self.clock_now(),
                block: hash,
            })
            .publish(&self.event_publisher);
        }

        // 4. Pending blocks at or below the finalized round can never become alive.
        self.tree.drain_pending_below(last_finalized.round);

        // 5. Keep the focus block on a chain that can still grow.
        if !self
            .tree
            .descends_from(&Arc::clone(self.tree.focus()), &last_finalized.hash)
        {
            self.tree.set_focus(last_finalized);
        }

        // Witnesses for rounds at or below the finalized round are no longer needed.
        let finalized_round = self.tree.last_finalized().round;
        self.round_witnesses = self.round_witnesses.split_off(&(finalized_round + 1));

        Ok(())
    }
}
