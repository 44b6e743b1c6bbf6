/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Reception and aggregation of quorum messages: the votes that certify blocks.
//!
//! Quorum messages are only ever collected for the current round. The [`QuorumPool`] keeps, per
//! candidate block, an incrementally-combined aggregate signature and weight tally, so that
//! threshold detection after each insert is a single comparison and the certificate can be emitted
//! without recombining signatures from scratch.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use indexmap::IndexMap;

use crate::crypto::{self, AggregateScheme};
use crate::engine::{Consensus, ConsensusContext, Network};
use crate::events::{Event, Flag, ReceiveQuorumMessageEvent};
use crate::finality::FatalConsensusError;
use crate::round_status::RoundAdvanceCause;
use crate::types::certificates::{meets_threshold, QuorumCertificate};
use crate::types::data_types::{
    AggregateSignatureBytes, BlockHash, Epoch, FinalizerIndex, FinalizerSet, Round, TotalWeight,
};

/// A single finalizer's vote to certify `block` in `round`.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QuorumMessage {
    /// The genesis hash of the chain this vote belongs to.
    pub genesis: BlockHash,

    /// The block being voted for.
    pub block: BlockHash,

    /// The round the vote certifies.
    pub round: Round,

    /// The epoch of the block being voted for.
    pub epoch: Epoch,

    /// The committee seat of the voter in `epoch`.
    pub finalizer: FinalizerIndex,

    /// The voter's aggregate signature over the [quorum signing
    /// bytes](crypto::quorum_signing_bytes).
    pub signature: AggregateSignatureBytes,
}

impl QuorumMessage {
    /// Get the bytes covered by this message's signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        crypto::quorum_signing_bytes(self.genesis, self.block, self.round, self.epoch)
    }
}

/// A [`QuorumMessage`] that has passed [`receive_quorum_message`](Consensus::receive_quorum_message)
/// validation and may be fed to [`process_quorum_message`](Consensus::process_quorum_message).
pub struct VerifiedQuorumMessage(QuorumMessage);

impl VerifiedQuorumMessage {
    /// Get the validated message.
    pub fn message(&self) -> &QuorumMessage {
        &self.0
    }
}

/// Why a quorum message was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumRejectReason {
    /// The message names a different genesis hash, i.e. a different chain session.
    WrongGenesis,

    /// The message is for a round before the current round.
    ObsoleteRound,

    /// The signer index is not a seat in the current epoch's committee.
    NotAFinalizer,

    /// A different quorum message from the same seat is already stored for this round.
    DoubleSigning,

    /// The aggregate signature does not verify under the signer's key.
    InvalidSignature,
}

/// Outcome of receiving a quorum message.
pub enum ReceiveQuorumMessageResult {
    /// The message is valid and should be relayed to peers.
    Received(VerifiedQuorumMessage),

    /// The message is valid, but the weight for its block already formed a quorum, so relaying it
    /// serves no purpose.
    ReceivedNoRelay(VerifiedQuorumMessage),

    /// The message was rejected with the given reason.
    Rejected(QuorumRejectReason),

    /// The message is ahead of us; the sender should be asked for catch-up.
    CatchupRequired,

    /// A byte-identical message from the same seat is already stored.
    Duplicate,
}

/// The quorum messages of the current round, with per-block aggregation state.
pub struct QuorumPool {
    round: Round,
    messages: BTreeMap<FinalizerIndex, QuorumMessage>,
    accumulators: IndexMap<BlockHash, QuorumAccumulator>,
}

/// Incremental aggregation state for one candidate block.
pub(crate) struct QuorumAccumulator {
    pub(crate) weight: TotalWeight,
    pub(crate) signature: AggregateSignatureBytes,
    pub(crate) signatories: FinalizerSet,
}

impl QuorumPool {
    /// Create an empty pool collecting votes for `round`.
    pub fn new(round: Round) -> QuorumPool {
        QuorumPool {
            round,
            messages: BTreeMap::new(),
            accumulators: IndexMap::new(),
        }
    }

    /// Get the round this pool collects votes for.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Get the stored message from `finalizer`, if one exists.
    pub fn message_from(&self, finalizer: FinalizerIndex) -> Option<&QuorumMessage> {
        self.messages.get(&finalizer)
    }

    /// Iterate through the stored messages in ascending seat order.
    pub fn messages(&self) -> impl Iterator<Item = &QuorumMessage> {
        self.messages.values()
    }

    /// Get the signatory set accumulated for `block`, if any vote for it was stored.
    pub fn signatories_for(&self, block: &BlockHash) -> Option<&FinalizerSet> {
        self.accumulators
            .get(block)
            .map(|accumulator| &accumulator.signatories)
    }

    /// Iterate through `(block, signatories)` pairs for every candidate block in the pool.
    pub fn blocks_and_signatories(&self) -> impl Iterator<Item = (&BlockHash, &FinalizerSet)> {
        self.accumulators
            .iter()
            .map(|(block, accumulator)| (block, &accumulator.signatories))
    }

    /// Get the accumulated weight for `block`.
    pub(crate) fn weight_for(&self, block: &BlockHash) -> TotalWeight {
        self.accumulators
            .get(block)
            .map(|accumulator| accumulator.weight)
            .unwrap_or_default()
    }

    /// Store `message` and fold its signature into the accumulator of its block.
    ///
    /// # Preconditions
    ///
    /// The message has passed validation: it is for this pool's round, from a committee seat with
    /// `weight`, no message from that seat is stored, and its signature verifies.
    pub(crate) fn insert<A: AggregateScheme>(
        &mut self,
        message: QuorumMessage,
        weight: crate::types::data_types::Weight,
        scheme: &A,
    ) -> &QuorumAccumulator {
        let block = message.block;
        let accumulator =
            self.accumulators
                .entry(block)
                .or_insert_with(|| QuorumAccumulator {
                    weight: TotalWeight::new(0),
                    signature: scheme.empty(),
                    signatories: FinalizerSet::new(),
                });
        accumulator.weight += weight;
        accumulator.signature = scheme.combine(&accumulator.signature, &message.signature);
        accumulator.signatories.insert(message.finalizer);
        self.messages.insert(message.finalizer, message);
        &self.accumulators[&block]
    }

    /// Discard all messages and accumulators and start collecting for `round`.
    pub(crate) fn reset(&mut self, round: Round) {
        self.round = round;
        self.messages.clear();
        self.accumulators.clear();
    }
}

impl<Ctx: ConsensusContext> Consensus<Ctx> {
    /// Validate a quorum message received from the network.
    ///
    /// Validation is performed in a fixed order so that later checks can assume earlier ones held:
    /// session match, round match, committee membership, per-seat at-most-once, signature.
    /// Double-signing and invalid signatures are additionally flagged as evidence on the event
    /// bus.
    ///
    /// On `Received` or `ReceivedNoRelay`, the caller should invoke
    /// [`process_quorum_message`](Self::process_quorum_message) with the verified message.
    pub fn receive_quorum_message(&mut self, message: QuorumMessage) -> ReceiveQuorumMessageResult {
        Event::ReceiveQuorumMessage(ReceiveQuorumMessageEvent {
            timestamp: self.clock_now(),
            block: message.block,
            round: message.round,
            finalizer: message.finalizer,
        })
        .publish(&self.event_publisher);

        // 1. The message must belong to this chain session.
        if message.genesis != self.genesis.genesis_hash {
            return ReceiveQuorumMessageResult::Rejected(QuorumRejectReason::WrongGenesis);
        }

        // 2. The message must be for the current round; an older round is uninteresting, a newer
        //    round means we are behind.
        let current_round = self.round_status.current_round();
        if message.round < current_round {
            return ReceiveQuorumMessageResult::Rejected(QuorumRejectReason::ObsoleteRound);
        }
        if message.round > current_round || message.epoch > self.committees.current_epoch() {
            return ReceiveQuorumMessageResult::CatchupRequired;
        }

        // 3. The signer must hold a seat in the current epoch's committee.
        let Some(member) = self.committees.current().member(message.finalizer) else {
            return ReceiveQuorumMessageResult::Rejected(QuorumRejectReason::NotAFinalizer);
        };

        // 4. At most one message per (round, seat). A byte-identical repeat is a plain duplicate;
        //    a different one is evidence of double signing.
        if let Some(existing) = self.quorum_pool.message_from(message.finalizer) {
            if *existing == message {
                return ReceiveQuorumMessageResult::Duplicate;
            }
            Event::Flag(Flag::QuorumDoubleSigning {
                finalizer: message.finalizer,
                round: message.round,
            })
            .publish(&self.event_publisher);
            return ReceiveQuorumMessageResult::Rejected(QuorumRejectReason::DoubleSigning);
        }

        // 5. The signature must verify under the seat's aggregate key.
        let group = (vec![member.aggregate_key], message.signing_bytes());
        if !self
            .aggregate
            .verify_aggregate(&[group], &message.signature)
        {
            Event::Flag(Flag::InvalidQuorumSignature {
                finalizer: message.finalizer,
                round: message.round,
            })
            .publish(&self.event_publisher);
            return ReceiveQuorumMessageResult::Rejected(QuorumRejectReason::InvalidSignature);
        }

        // Suppress relaying when the block's accumulated weight already forms a quorum: the
        // network has seen enough votes for this block.
        let threshold_met = meets_threshold(
            self.quorum_pool.weight_for(&message.block),
            self.committees.current().total_weight(),
            self.genesis.signature_threshold,
        );
        if threshold_met {
            ReceiveQuorumMessageResult::ReceivedNoRelay(VerifiedQuorumMessage(message))
        } else {
            ReceiveQuorumMessageResult::Received(VerifiedQuorumMessage(message))
        }
    }

    /// Fold a verified quorum message into the current round's pool, emitting a quorum
    /// certificate (and everything downstream of it) if its block reaches the threshold.
    ///
    /// When a certificate forms, finality is checked, the highest certified block is updated, and
    /// the round advances to `certificate.round + 1`. `produce_block` is passed through to
    /// [`advance_round`](Self::advance_round): catch-up processing defers block production until
    /// all terminal data has been applied.
    pub fn process_quorum_message(
        &mut self,
        verified: VerifiedQuorumMessage,
        produce_block: bool,
    ) -> Result<(), FatalConsensusError> {
        let message = verified.0;
        if message.round != self.quorum_pool.round() {
            // The round advanced between validation and processing; the vote no longer matters.
            return Ok(());
        }

        let weight = match self.committees.current().member(message.finalizer) {
            Some(member) => member.weight,
            None => return Ok(()),
        };

        let block = message.block;
        let round = message.round;
        let epoch = message.epoch;
        let already_formed = meets_threshold(
            self.quorum_pool.weight_for(&block),
            self.committees.current().total_weight(),
            self.genesis.signature_threshold,
        );
        let accumulator = self.quorum_pool.insert(message, weight, &self.aggregate);

        // At most one certificate per round: once the threshold was crossed, later votes only
        // pile onto the accumulator.
        if already_formed
            || !meets_threshold(
                accumulator.weight,
                self.committees.current().total_weight(),
                self.genesis.signature_threshold,
            )
        {
            return Ok(());
        }

        let certificate = QuorumCertificate {
            block,
            round,
            epoch,
            aggregate_signature: accumulator.signature,
            signatories: accumulator.signatories.clone(),
        };

        self.check_finality(&certificate)?;
        self.record_certified(&certificate);
        self.advance_round(
            certificate.round + 1,
            RoundAdvanceCause::Quorum(certificate),
            produce_block,
        )
    }

    /// Sign and broadcast this node's own quorum message for `block`, then loop it back through
    /// the pool.
    ///
    /// A no-op unless the local identity holds a seat in the current committee, and at most one
    /// message is signed per round: the last signed message is persisted in the round status
    /// before the message leaves the node, so a restart cannot double-vote.
    pub(crate) fn sign_quorum_message_for(
        &mut self,
        block: BlockHash,
        round: Round,
        epoch: Epoch,
    ) -> Result<(), FatalConsensusError> {
        let Some(credentials) = &self.credentials else {
            return Ok(());
        };
        let Some(member) = self
            .committees
            .current()
            .member_by_baker(credentials.baker)
        else {
            return Ok(());
        };
        if self
            .round_status
            .last_signed_quorum()
            .is_some_and(|last| last.round >= round)
        {
            return Ok(());
        }

        let message = QuorumMessage {
            genesis: self.genesis.genesis_hash,
            block,
            round,
            epoch,
            finalizer: member.index,
            signature: self.aggregate.sign(
                &credentials.aggregate_secret,
                &crypto::quorum_signing_bytes(self.genesis.genesis_hash, block, round, epoch),
            ),
        };

        self.round_status.set_last_signed_quorum(message.clone());
        self.persist_round_status();

        self.network
            .broadcast(crate::messages::ConsensusMessage::Quorum(message.clone()));
        self.process_quorum_message(VerifiedQuorumMessage(message), true)
    }
}
