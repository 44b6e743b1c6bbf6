/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Reception, verification, execution and production of blocks.
//!
//! Incoming blocks run a fixed pipeline: cheap structural checks, duplicate and staleness
//! filtering, parent resolution, full verification against the committee and the VRF lottery,
//! execution through the ledger, and finally integration into the tree, which may certify the
//! parent, finalize ancestors, advance the round and epoch, trigger this node's vote, and revive
//! pending children.
//!
//! Block *production* lives here too: [`make_block`](Consensus::make_block) runs whenever a round
//! advance elects this node, and feeds the produced block back through the same reception
//! pipeline so a leader treats its own blocks exactly like anyone else's.

use std::sync::Arc;

use crate::crypto::{self, VrfScheme};
use crate::engine::{Consensus, ConsensusContext, Ledger, Network};
use crate::events::{Event, ProduceBlockEvent, ReceiveBlockEvent};
use crate::finality::FatalConsensusError;
use crate::messages::ConsensusMessage;
use crate::round_status::RoundAdvanceCause;
use crate::tree::{BlockPointer, BlockStatus, RecentBlockStatus};
use crate::types::block::{BakedBlock, SignedBlock};
use crate::types::committee::FinalizationCommittee;
use crate::types::data_types::VrfOutput;

/// Outcome of receiving a block, as reported to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveBlockResult {
    /// The block was verified, executed and integrated.
    Success,

    /// The block (or its hash) is already known.
    Duplicate,

    /// The block cannot extend the finalized chain any more.
    Stale,

    /// The block failed verification or execution; it is now dead.
    Invalid,

    /// The block's parent is not known yet; the block is parked as pending.
    Pending,

    /// The block's timestamp is too far in the future.
    EarlyBlock,

    /// The engine has been shut down and only answers queries.
    ConsensusShutDown,
}

impl<Ctx: ConsensusContext> Consensus<Ctx> {
    /// Receive a block from the network.
    pub fn receive_block(
        &mut self,
        block: SignedBlock,
    ) -> Result<ReceiveBlockResult, FatalConsensusError> {
        self.receive_block_with(block, true)
    }

    /// Receive a block, optionally deferring block production on any round advance it causes
    /// (catch-up processing produces at most one block, at the very end).
    pub(crate) fn receive_block_with(
        &mut self,
        block: SignedBlock,
        produce: bool,
    ) -> Result<ReceiveBlockResult, FatalConsensusError> {
        // 1. A shut-down engine answers queries only.
        if self.shutdown {
            return Ok(ReceiveBlockResult::ConsensusShutDown);
        }

        let now = self.clock_now();
        Event::ReceiveBlock(ReceiveBlockEvent {
            timestamp: now,
            block: block.hash,
            round: block.round(),
            height: None,
        })
        .publish(&self.event_publisher);

        // A hash that does not bind the body makes every downstream check meaningless.
        if !block.hash_is_correct() {
            return Ok(ReceiveBlockResult::Invalid);
        }

        // 2. Reject blocks claiming to come from too far in the future.
        let horizon = now.saturating_add(self.genesis.early_block_threshold.as_duration());
        if block.timestamp() > horizon {
            return Ok(ReceiveBlockResult::EarlyBlock);
        }

        // 3. Duplicates are answered from the status index.
        match self.tree.get_block_status(&self.store, &block.hash)? {
            RecentBlockStatus::Recent(BlockStatus::Unknown) => {}
            _ => return Ok(ReceiveBlockResult::Duplicate),
        }

        // 4. A block at or before the last finalized block can never become alive.
        let last_finalized = self.tree.last_finalized();
        if block.timestamp() <= last_finalized.timestamp || block.round() <= last_finalized.round {
            self.tree.mark_dead(&block.hash);
            return Ok(ReceiveBlockResult::Stale);
        }

        // 5. Resolve the parent. A missing or still-pending parent parks the block after cheap
        //    pre-checks; a dead or outdated parent kills it.
        let block = Arc::new(block);
        let parent = match self.tree.get_block_status(&self.store, &block.parent())? {
            RecentBlockStatus::Recent(BlockStatus::Alive(parent)) => parent,
            RecentBlockStatus::Recent(BlockStatus::Finalized(parent)) => parent,
            RecentBlockStatus::Recent(BlockStatus::Pending(_))
            | RecentBlockStatus::Recent(BlockStatus::Unknown) => {
                return if self.pending_pre_checks(&block) {
                    self.tree.add_pending_block(block);
                    Ok(ReceiveBlockResult::Pending)
                } else {
                    self.tree.mark_dead(&block.hash);
                    Ok(ReceiveBlockResult::Invalid)
                };
            }
            RecentBlockStatus::Recent(BlockStatus::Dead)
            | RecentBlockStatus::OldFinalized => {
                self.tree.mark_dead(&block.hash);
                return Ok(ReceiveBlockResult::Stale);
            }
        };

        // 6.–9. Full verification, execution, integration, and pending-children processing; the
        // same path revives pending blocks, so it runs a worklist.
        self.integrate(block, parent, produce)
    }

    /// Verify, execute and insert `block` (whose parent is alive), then run every pending block
    /// this unblocks.
    fn integrate(
        &mut self,
        block: Arc<SignedBlock>,
        parent: Arc<BlockPointer>,
        produce: bool,
    ) -> Result<ReceiveBlockResult, FatalConsensusError> {
        let first_result = self.verify_execute_insert(&block, parent, produce)?;

        // Run pending children (and pending blocks whose round has been reached) until the
        // worklist dries up. Children of failed blocks die with their parent, so only successful
        // insertions extend the worklist.
        let mut worklist: Vec<Arc<SignedBlock>> = Vec::new();
        if first_result == ReceiveBlockResult::Success {
            worklist.extend(self.tree.take_pending_children(&block.hash));
        }
        while let Some(pending) = worklist.pop() {
            let Some(parent) = self.tree.get_alive(&pending.parent()) else {
                self.tree.mark_dead(&pending.hash);
                continue;
            };
            let hash = pending.hash;
            if self.verify_execute_insert(&pending, parent, produce)? == ReceiveBlockResult::Success
            {
                worklist.extend(self.tree.take_pending_children(&hash));
            }
        }

        Ok(first_result)
    }

    /// The cheap checks a block must pass to be parked as pending: its baker exists, its
    /// signature verifies under the claimed key, and its leader proof verifies against the
    /// *predicted* leadership nonce (the best prediction being the current one).
    fn pending_pre_checks(&self, block: &SignedBlock) -> bool {
        let committee = match self.committee_for_block(block) {
            Some(committee) => committee,
            None => return false,
        };
        let Some(member) = committee.member_by_baker(block.block.baker) else {
            return false;
        };

        if !crypto::verify_block_signature(&block.block.baker_key, &block.hash, &block.signature) {
            return false;
        }

        self.vrf.verify_leader(
            &self.leadership_nonce(),
            block.round(),
            &member.vrf_key,
            member.weight,
            committee.total_weight(),
            &block.block.leader_proof,
        )
    }

    /// Full verification of a block whose parent is alive, followed by execution and integration.
    ///
    /// Any failure marks the block dead and returns `Invalid`; success returns `Success` after
    /// the round/epoch machinery and this node's vote have run.
    fn verify_execute_insert(
        &mut self,
        block: &Arc<SignedBlock>,
        parent: Arc<BlockPointer>,
        produce: bool,
    ) -> Result<ReceiveBlockResult, FatalConsensusError> {
        if !self.verify_against_parent(block, &parent)? {
            self.tree.mark_dead(&block.hash);
            return Ok(ReceiveBlockResult::Invalid);
        }

        // 7. Execute against the parent state; the claimed hashes must match exactly.
        let outcome = match self.ledger.execute_block(parent.state_hash, block) {
            Ok(outcome) => outcome,
            Err(_) => {
                self.tree.mark_dead(&block.hash);
                return Ok(ReceiveBlockResult::Invalid);
            }
        };
        if outcome.state_hash != block.block.state_hash
            || outcome.outcomes_hash != block.block.outcomes_hash
        {
            self.tree.mark_dead(&block.hash);
            return Ok(ReceiveBlockResult::Invalid);
        }

        // 8. Insert as alive.
        let now = self.clock_now();
        let height = parent.height + 1;
        let pointer = self
            .tree
            .make_live(Arc::clone(block), outcome.state_hash, height, now);
        self.on_block(&pointer);

        // The certificates the block carries move the round/epoch state machine.
        let justify = block.block.justify.clone();
        self.record_certified(&justify);
        self.check_finality(&justify)?;

        if block.block.epoch == self.committees.current_epoch() + 1 {
            let entry = block
                .block
                .finalization_entry
                .as_ref()
                .expect("verify_against_parent admits an epoch bump only with an entry");
            let contribution = VrfOutput::new(entry.successor_proof.bytes());
            let entry = entry.clone();
            self.advance_epoch(block.block.epoch, &entry, contribution)?;
        }

        if let Some(certificate) = &block.block.timeout_certificate {
            if self.round_status.current_round() <= certificate.round {
                self.advance_round(
                    certificate.round + 1,
                    RoundAdvanceCause::Timeout {
                        certificate: certificate.clone(),
                        highest_qc: justify.clone(),
                    },
                    produce,
                )?;
            }
        }
        if self.round_status.current_round() <= justify.round {
            self.advance_round(justify.round + 1, RoundAdvanceCause::Quorum(justify), produce)?;
        }

        // A finalizer votes for the block of the now-current round.
        if block.round() == self.round_status.current_round() {
            self.sign_quorum_message_for(block.hash, block.round(), block.epoch())?;
        }

        Ok(ReceiveBlockResult::Success)
    }

    /// The verification conditions tying a block to its (alive) parent.
    fn verify_against_parent(
        &mut self,
        block: &SignedBlock,
        parent: &BlockPointer,
    ) -> Result<bool, FatalConsensusError> {
        let body = &block.block;

        // Rounds strictly increase along parent links.
        if body.round <= parent.round {
            return Ok(false);
        }

        // The epoch either matches the parent's, or increments by one under a finalization entry.
        match &body.finalization_entry {
            None => {
                if body.epoch != parent.epoch {
                    return Ok(false);
                }
            }
            Some(entry) => {
                if body.epoch != parent.epoch + 1 || entry.finalized_qc.epoch != parent.epoch {
                    return Ok(false);
                }
                let Some(committee) = self.committees.committee_for(entry.finalized_qc.epoch)
                else {
                    return Ok(false);
                };
                if !entry.verify(
                    self.genesis.genesis_hash,
                    self.genesis.signature_threshold,
                    committee,
                    &self.aggregate,
                ) {
                    return Ok(false);
                }
            }
        }

        // The embedded certificate must be for the parent, and must verify.
        let justify = &body.justify;
        if justify.block != parent.hash
            || justify.round != parent.round
            || justify.epoch != parent.epoch
        {
            return Ok(false);
        }
        let Some(justify_committee) = self.committees.committee_for(justify.epoch).cloned() else {
            return Ok(false);
        };
        if !justify.verify(
            self.genesis.genesis_hash,
            self.genesis.signature_threshold,
            &justify_committee,
            &self.aggregate,
        ) {
            return Ok(false);
        }

        // A round gap needs a timeout certificate explaining it; no gap forbids one.
        match &body.timeout_certificate {
            None => {
                if body.round != parent.round + 1 {
                    return Ok(false);
                }
            }
            Some(certificate) => {
                if body.round == parent.round + 1 || !certificate.is_relevant_to(body.round) {
                    return Ok(false);
                }
                if justify.round < certificate.max_round() {
                    return Ok(false);
                }
                let committees = &self.committees;
                if !certificate.verify(
                    self.genesis.genesis_hash,
                    self.genesis.signature_threshold,
                    |epoch| committees.committee_for(epoch),
                    &self.aggregate,
                ) {
                    return Ok(false);
                }
            }
        }

        // The baker must hold a seat, under exactly the keys the committee records.
        let Some(committee) = self.committee_for_block(block) else {
            return Ok(false);
        };
        let Some(member) = committee.member_by_baker(body.baker) else {
            return Ok(false);
        };
        if member.signing_key.to_bytes() != body.baker_key.bytes() {
            return Ok(false);
        }
        if !crypto::verify_block_signature(&body.baker_key, &block.hash, &block.signature) {
            return Ok(false);
        }

        // The VRF lottery: the leader proof and the block nonce chain.
        let nonce = self.leadership_nonce();
        if !self.vrf.verify_leader(
            &nonce,
            body.round,
            &member.vrf_key,
            member.weight,
            committee.total_weight(),
            &body.leader_proof,
        ) {
            return Ok(false);
        }
        if !self.vrf.verify_block_nonce(
            &body.block_nonce,
            &nonce,
            body.round,
            &member.vrf_key,
            &body.nonce_proof,
        ) {
            return Ok(false);
        }

        Ok(true)
    }

    /// Resolve the committee a block's baker should be looked up in: the tracked committee of the
    /// block's epoch, or the ledger's answer for an epoch we have not entered yet.
    fn committee_for_block(&self, block: &SignedBlock) -> Option<FinalizationCommittee> {
        if let Some(committee) = self.committees.committee_for(block.epoch()) {
            return Some(committee.clone());
        }
        if block.epoch() == self.committees.current_epoch() + 1 {
            return self.ledger.committee_for(block.epoch());
        }
        None
    }

    /// Produce, sign, broadcast and loop back a block for the current round, iff the local
    /// identity wins the round's leader lottery and a valid parent chain exists.
    pub(crate) fn make_block(&mut self) -> Result<(), FatalConsensusError> {
        if self.shutdown {
            return Ok(());
        }
        let round = self.round_status.current_round();
        if self.last_baked_round.is_some_and(|baked| baked >= round) {
            return Ok(());
        }
        let Some(credentials) = self.credentials.clone() else {
            return Ok(());
        };
        let committee = self.committees.current().clone();
        let Some(member) = committee.member_by_baker(credentials.baker) else {
            return Ok(());
        };

        let Some(leader_proof) = self.vrf.try_win_leadership(
            &credentials.vrf_secret,
            &self.leadership_nonce(),
            round,
            member.weight,
            committee.total_weight(),
        ) else {
            return Ok(());
        };

        // Build on the highest certified block; without it alive there is nothing to extend.
        let justify = self.round_status.highest_certified().clone();
        let Some(parent) = self.tree.get_alive(&justify.block) else {
            return Ok(());
        };

        let timeout_certificate = self
            .round_status
            .previous_round_timeout()
            .map(|timeout| timeout.certificate.clone())
            .filter(|certificate| certificate.is_relevant_to(round));
        if parent.round + 1 != round && timeout_certificate.is_none() {
            // A round gap we cannot justify; do not produce.
            return Ok(());
        }

        // An epoch transition is carried when the ledger says the epoch is over and we hold the
        // finalization entry that proves the current epoch finished.
        let epoch = self.committees.current_epoch();
        let finalization_entry = if self
            .ledger
            .epoch_transition_due(epoch, parent.state_hash)
        {
            self.latest_finalization_entry
                .clone()
                .filter(|entry| entry.finalized_qc.epoch == parent.epoch)
        } else {
            None
        };
        let (epoch, parent_epoch_matches) = match &finalization_entry {
            Some(_) => (parent.epoch + 1, true),
            None => (parent.epoch, parent.epoch == epoch),
        };
        if !parent_epoch_matches {
            return Ok(());
        }

        let now = self.clock_now();
        let payload = self.ledger.produce_payload(parent.state_hash, round, now);
        let (block_nonce, nonce_proof) =
            self.vrf
                .prove_block_nonce(&credentials.vrf_secret, &self.leadership_nonce(), round);

        let body = BakedBlock {
            round,
            epoch,
            timestamp: now,
            baker: credentials.baker,
            baker_key: credentials.keypair.public_bytes(),
            block_nonce,
            nonce_proof,
            leader_proof,
            parent: parent.hash,
            justify,
            timeout_certificate,
            finalization_entry,
            transactions: payload.transactions,
            state_hash: payload.state_hash,
            outcomes_hash: payload.outcomes_hash,
        };
        let hash = body.hash();
        let signature = credentials.keypair.sign(&hash.bytes());
        let block = SignedBlock::new(body, signature);

        self.last_baked_round = Some(round);

        Event::ProduceBlock(ProduceBlockEvent {
            timestamp: now,
            block: block.hash,
            round,
        })
        .publish(&self.event_publisher);

        self.network
            .broadcast(ConsensusMessage::Block(block.clone()));
        let _ = self.receive_block(block)?;
        Ok(())
    }

    /// Hook run when a block becomes alive. Publishes the insertion event; statistics and
    /// transaction-table bookkeeping hang off the event bus.
    fn on_block(&mut self, pointer: &Arc<BlockPointer>) {
        Event::ReceiveBlock(ReceiveBlockEvent {
            timestamp: pointer.arrive_time,
            block: pointer.hash,
            round: pointer.round,
            height: Some(pointer.height),
        })
        .publish(&self.event_publisher);

        // Project transaction bookkeeping from the freshest tip we consider best: the new block,
        // if it extends the focus chain.
        if pointer.parent == self.tree.focus().hash {
            self.tree.set_focus(Arc::clone(pointer));
        }
    }
}
