/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Reception and aggregation of timeout messages: the votes that abandon a round.
//!
//! Unlike quorum messages, timeout messages can legitimately arrive from two consecutive epochs at
//! once, because an epoch transition may be in flight while a round times out. The
//! [`TimeoutMessages`] window therefore keeps exactly two epoch buckets and rotates them in
//! constant time, rather than a general ring buffer: honest timeout messages for the current
//! round's view cluster within two consecutive epochs.
//!
//! The flow for an incoming message is a strict two-step:
//! [`receive_timeout_message`](Consensus::receive_timeout_message) validates and returns a
//! [`PartiallyVerifiedTimeoutMessage`], which the caller **must** immediately hand to
//! [`execute_timeout_message`](Consensus::execute_timeout_message) without intervening state
//! mutation, since the embedded quorum certificate is verified against tree state resolved during
//! reception.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto::{self, AggregateScheme};
use crate::engine::{Consensus, ConsensusContext, Network, RoundClock};
use crate::events::{Event, Flag, ReceiveTimeoutMessageEvent, TimeoutEvent};
use crate::finality::FatalConsensusError;
use crate::round_status::RoundAdvanceCause;
use crate::tree::{BlockStatus, RecentBlockStatus};
use crate::types::certificates::{
    meets_threshold, FinalizerRounds, QuorumCertificate, TimeoutCertificate,
};
use crate::types::committee::FinalizationCommittee;
use crate::types::data_types::{
    AggregateSignatureBytes, BlockHash, Epoch, FinalizerIndex, Round, SignatureBytes, TotalWeight,
};

/// A single finalizer's declaration that `round` timed out, carrying the highest quorum
/// certificate the finalizer had witnessed at that point.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TimeoutMessage {
    /// The genesis hash of the chain this message belongs to.
    pub genesis: BlockHash,

    /// The round that timed out.
    pub round: Round,

    /// The epoch the finalizer was in when it timed out.
    pub epoch: Epoch,

    /// The committee seat of the sender in `epoch`.
    pub finalizer: FinalizerIndex,

    /// The highest quorum certificate the sender had witnessed.
    pub quorum_certificate: QuorumCertificate,

    /// Aggregate signature over the [timeout signing bytes](crypto::timeout_signing_bytes) of
    /// `(genesis, round, qc.round, qc.epoch)`.
    pub aggregate_signature: AggregateSignatureBytes,

    /// Ed25519 signature over the [envelope bytes](crypto::timeout_envelope_bytes), binding the
    /// fields the aggregate signature does not cover.
    pub envelope_signature: SignatureBytes,
}

impl TimeoutMessage {
    /// Get the bytes covered by this message's aggregate signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        crypto::timeout_signing_bytes(
            self.genesis,
            self.round,
            self.quorum_certificate.round,
            self.epoch,
        )
    }

    /// Get the bytes covered by this message's envelope signature.
    pub fn envelope_bytes(&self) -> Vec<u8> {
        crypto::timeout_envelope_bytes(
            self.genesis,
            self.round,
            self.epoch,
            self.quorum_certificate.block,
        )
    }
}

/// A [`TimeoutMessage`] that has passed reception checks, together with the committee resolved for
/// the embedded quorum certificate's epoch.
///
/// The caller must feed this to [`execute_timeout_message`](Consensus::execute_timeout_message)
/// immediately: the resolved committee and block statuses are only valid as long as no other state
/// mutation intervenes.
pub struct PartiallyVerifiedTimeoutMessage {
    message: TimeoutMessage,
    quorum_committee: FinalizationCommittee,
}

impl PartiallyVerifiedTimeoutMessage {
    /// Get the validated message.
    pub fn message(&self) -> &TimeoutMessage {
        &self.message
    }
}

/// Why a timeout message was rejected.
///
/// Variants are listed in the order the conditions are checked, so each condition assumes the
/// earlier ones did not hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutRejectReason {
    /// The message names a different genesis hash, i.e. a different chain session.
    WrongGenesis,

    /// The message is for a round before the current round.
    ObsoleteRound,

    /// The embedded quorum certificate is for a round or epoch below the last finalized block.
    ObsoleteQc,

    /// The signer index is not a seat in the committee of the message's epoch.
    NotAFinalizer,

    /// The Ed25519 envelope signature does not verify.
    InvalidSignature,

    /// A different timeout message from the same seat is already stored for this round.
    DoubleSigning,

    /// The embedded quorum certificate names a block finalized before the last finalized block.
    ObsoleteQcPointer,

    /// The embedded quorum certificate names a dead block.
    DeadQcPointer,

    /// The aggregate signature over the timeout payload does not verify.
    InvalidAggregateSignature,
}

/// Outcome of receiving a timeout message.
pub enum ReceiveTimeoutMessageResult {
    /// The message passed reception checks; execute it immediately.
    Received(PartiallyVerifiedTimeoutMessage),

    /// The message was rejected with the given reason.
    Rejected(TimeoutRejectReason),

    /// The message is ahead of us; the sender should be asked for catch-up.
    CatchupRequired,

    /// A byte-identical message from the same seat is already stored.
    Duplicate,
}

/// Outcome of executing a received timeout message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecuteTimeoutMessageResult {
    /// The message was folded into the timeout window.
    Executed,

    /// The embedded quorum certificate failed verification.
    InvalidQc,

    /// The embedded quorum certificate names an epoch inconsistent with the certificate already
    /// witnessed for its round.
    InvalidQcEpoch,
}

/// The timeout messages currently under aggregation, bucketed into a sliding window of exactly
/// two consecutive epochs.
pub struct TimeoutMessages {
    first_epoch: Epoch,
    first_epoch_timeouts: BTreeMap<FinalizerIndex, TimeoutMessage>,
    second_epoch_timeouts: BTreeMap<FinalizerIndex, TimeoutMessage>,
}

impl TimeoutMessages {
    /// Start a window at `message.epoch` containing only `message`.
    pub(crate) fn start(message: TimeoutMessage) -> TimeoutMessages {
        let first_epoch = message.epoch;
        let mut first_epoch_timeouts = BTreeMap::new();
        first_epoch_timeouts.insert(message.finalizer, message);
        TimeoutMessages {
            first_epoch,
            first_epoch_timeouts,
            second_epoch_timeouts: BTreeMap::new(),
        }
    }

    /// Get the older of the two epochs the window covers.
    pub fn first_epoch(&self) -> Epoch {
        self.first_epoch
    }

    /// Get the stored messages of the window's first epoch, keyed by seat.
    pub fn first_epoch_timeouts(&self) -> &BTreeMap<FinalizerIndex, TimeoutMessage> {
        &self.first_epoch_timeouts
    }

    /// Get the stored messages of the window's second epoch, keyed by seat.
    pub fn second_epoch_timeouts(&self) -> &BTreeMap<FinalizerIndex, TimeoutMessage> {
        &self.second_epoch_timeouts
    }

    /// Look up the stored message from `finalizer` in the bucket that would hold messages of
    /// `epoch`.
    fn stored(&self, epoch: Epoch, finalizer: FinalizerIndex) -> Option<&TimeoutMessage> {
        if epoch == self.first_epoch {
            self.first_epoch_timeouts.get(&finalizer)
        } else if epoch == self.first_epoch + 1 {
            self.second_epoch_timeouts.get(&finalizer)
        } else {
            None
        }
    }

    /// Insert `message` into the window, rotating or resetting it as the message's epoch demands.
    ///
    /// Returns `false` when the message's epoch is too old for the window and the state was left
    /// unchanged.
    pub(crate) fn insert(&mut self, message: TimeoutMessage) -> bool {
        let epoch = message.epoch;

        if epoch == self.first_epoch {
            self.first_epoch_timeouts.insert(message.finalizer, message);
            true
        } else if epoch == self.first_epoch + 1 {
            self.second_epoch_timeouts
                .insert(message.finalizer, message);
            true
        } else if epoch == self.first_epoch + 2 && !self.second_epoch_timeouts.is_empty() {
            // Rotate left: the old first epoch falls out of the window.
            self.first_epoch = self.first_epoch + 1;
            self.first_epoch_timeouts = std::mem::take(&mut self.second_epoch_timeouts);
            self.second_epoch_timeouts.insert(message.finalizer, message);
            true
        } else if epoch + 1 == self.first_epoch && self.second_epoch_timeouts.is_empty() {
            // Rotate right: prepend a new first epoch.
            self.first_epoch = epoch;
            self.second_epoch_timeouts = std::mem::take(&mut self.first_epoch_timeouts);
            self.first_epoch_timeouts.insert(message.finalizer, message);
            true
        } else if epoch >= self.first_epoch + 2 {
            // Rotation alone cannot accommodate the message.
            *self = TimeoutMessages::start(message);
            true
        } else {
            // Too old for the window.
            false
        }
    }

    /// Iterate through every stored message, first bucket then second.
    pub(crate) fn all_messages(&self) -> impl Iterator<Item = &TimeoutMessage> {
        self.first_epoch_timeouts
            .values()
            .chain(self.second_epoch_timeouts.values())
    }

    /// Build a timeout certificate for `round` from the stored messages.
    ///
    /// For each bucket the signatures are grouped by the quorum round they witness; the aggregate
    /// signature is the combination of every contained timeout signature.
    pub(crate) fn make_certificate<A: AggregateScheme>(
        &self,
        round: Round,
        scheme: &A,
    ) -> TimeoutCertificate {
        let mut first_epoch_rounds = FinalizerRounds::new();
        let mut second_epoch_rounds = FinalizerRounds::new();
        let mut aggregate_signature = scheme.empty();

        for message in self.first_epoch_timeouts.values() {
            first_epoch_rounds.insert(
                message.quorum_certificate.round,
                [message.finalizer].into_iter().collect(),
            );
            aggregate_signature = scheme.combine(&aggregate_signature, &message.aggregate_signature);
        }
        for message in self.second_epoch_timeouts.values() {
            second_epoch_rounds.insert(
                message.quorum_certificate.round,
                [message.finalizer].into_iter().collect(),
            );
            aggregate_signature = scheme.combine(&aggregate_signature, &message.aggregate_signature);
        }

        TimeoutCertificate {
            round,
            min_epoch: self.first_epoch,
            first_epoch_rounds,
            second_epoch_rounds,
            aggregate_signature,
        }
    }
}

impl<Ctx: ConsensusContext> Consensus<Ctx> {
    /// Validate a timeout message received from the network.
    ///
    /// The rejection conditions are checked in the order of the [`TimeoutRejectReason`] variants,
    /// so each condition assumes the earlier ones did not hold. Double-signing and invalid
    /// signatures are flagged as evidence on the event bus.
    ///
    /// On `Received`, the caller **must** invoke
    /// [`execute_timeout_message`](Self::execute_timeout_message) immediately, without intervening
    /// state mutation.
    pub fn receive_timeout_message(&mut self, message: TimeoutMessage) -> ReceiveTimeoutMessageResult {
        Event::ReceiveTimeoutMessage(ReceiveTimeoutMessageEvent {
            timestamp: self.clock_now(),
            round: message.round,
            epoch: message.epoch,
            finalizer: message.finalizer,
        })
        .publish(&self.event_publisher);

        if message.genesis != self.genesis.genesis_hash {
            return ReceiveTimeoutMessageResult::Rejected(TimeoutRejectReason::WrongGenesis);
        }

        // 1. An old round is uninteresting.
        let current_round = self.round_status.current_round();
        if message.round < current_round {
            return ReceiveTimeoutMessageResult::Rejected(TimeoutRejectReason::ObsoleteRound);
        }

        // 2. A quorum certificate below the last finalized block cannot be useful.
        let last_finalized = self.tree.last_finalized();
        let qc = &message.quorum_certificate;
        if qc.round < last_finalized.round || qc.epoch < last_finalized.epoch {
            return ReceiveTimeoutMessageResult::Rejected(TimeoutRejectReason::ObsoleteQc);
        }

        // 3. Conditions under which the sender knows something we do not: a future epoch, a
        //    quorum certificate for a block we have not integrated, or a round gap the embedded
        //    certificate cannot explain.
        if message.epoch > self.committees.current_epoch() {
            return ReceiveTimeoutMessageResult::CatchupRequired;
        }
        let qc_status = self.tree.get_recent_block_status(&qc.block);
        if matches!(
            qc_status,
            RecentBlockStatus::Recent(BlockStatus::Unknown | BlockStatus::Pending(_))
        ) {
            return ReceiveTimeoutMessageResult::CatchupRequired;
        }
        if message.round > current_round && qc.round + 1 < message.round {
            return ReceiveTimeoutMessageResult::CatchupRequired;
        }

        // 4. The signer must hold a seat in its epoch's committee.
        let Some(member) = self
            .committees
            .committee_for(message.epoch)
            .and_then(|committee| committee.member(message.finalizer))
        else {
            return ReceiveTimeoutMessageResult::Rejected(TimeoutRejectReason::NotAFinalizer);
        };
        let signing_key = crate::types::data_types::VerifyingKeyBytes::new(
            member.signing_key.to_bytes(),
        );
        let aggregate_key = member.aggregate_key;

        // 5. The envelope must be signed by the seat's Ed25519 key.
        if !crypto::verify_signature(
            &signing_key,
            &message.envelope_bytes(),
            &message.envelope_signature,
        ) {
            Event::Flag(Flag::InvalidTimeoutSignature {
                finalizer: message.finalizer,
                round: message.round,
            })
            .publish(&self.event_publisher);
            return ReceiveTimeoutMessageResult::Rejected(TimeoutRejectReason::InvalidSignature);
        }

        // 6. At most one message per (round, seat); a different one is double signing.
        let stored = self
            .timeout_pool
            .as_ref()
            .and_then(|window| window.stored(message.epoch, message.finalizer));
        if let Some(stored) = stored {
            if stored.round == message.round && *stored != message {
                Event::Flag(Flag::TimeoutDoubleSigning {
                    finalizer: message.finalizer,
                    round: message.round,
                })
                .publish(&self.event_publisher);
                return ReceiveTimeoutMessageResult::Rejected(TimeoutRejectReason::DoubleSigning);
            }
        }

        // 7./8. The embedded certificate must point at a live part of the tree.
        match qc_status {
            RecentBlockStatus::OldFinalized => {
                return ReceiveTimeoutMessageResult::Rejected(TimeoutRejectReason::ObsoleteQcPointer)
            }
            RecentBlockStatus::Recent(BlockStatus::Dead) => {
                return ReceiveTimeoutMessageResult::Rejected(TimeoutRejectReason::DeadQcPointer)
            }
            _ => {}
        }

        // 9. The timeout payload must carry a valid aggregate signature.
        let group = (vec![aggregate_key], message.signing_bytes());
        if !self
            .aggregate
            .verify_aggregate(&[group], &message.aggregate_signature)
        {
            return ReceiveTimeoutMessageResult::Rejected(
                TimeoutRejectReason::InvalidAggregateSignature,
            );
        }

        // 10. A byte-identical repeat is a plain duplicate.
        if stored.is_some_and(|stored| *stored == message) {
            return ReceiveTimeoutMessageResult::Duplicate;
        }

        // The committee of the embedded certificate's epoch drives the threshold check during
        // aggregation; resolve it now so execution needs no further lookups.
        let Some(quorum_committee) = self.committees.committee_for(qc.epoch).cloned() else {
            return ReceiveTimeoutMessageResult::Rejected(TimeoutRejectReason::ObsoleteQc);
        };

        ReceiveTimeoutMessageResult::Received(PartiallyVerifiedTimeoutMessage {
            message,
            quorum_committee,
        })
    }

    /// Execute a timeout message that passed reception checks.
    ///
    /// If the embedded quorum certificate is ahead of our highest certified block it is verified
    /// and integrated first (possibly finalizing blocks and advancing the round); otherwise it is
    /// cross-checked against the certificate already witnessed for its round. In every success
    /// branch the message is folded into the timeout window.
    pub fn execute_timeout_message(
        &mut self,
        partially_verified: PartiallyVerifiedTimeoutMessage,
    ) -> Result<ExecuteTimeoutMessageResult, FatalConsensusError> {
        self.execute_timeout_message_with(partially_verified, true)
    }

    /// [`execute_timeout_message`](Self::execute_timeout_message), with block production on any
    /// resulting round advance made optional (catch-up processing defers it).
    pub(crate) fn execute_timeout_message_with(
        &mut self,
        partially_verified: PartiallyVerifiedTimeoutMessage,
        produce: bool,
    ) -> Result<ExecuteTimeoutMessageResult, FatalConsensusError> {
        let PartiallyVerifiedTimeoutMessage {
            message,
            quorum_committee,
        } = partially_verified;
        let qc = message.quorum_certificate.clone();

        if qc.round > self.round_status.highest_certified().round {
            // The sender knows a newer certificate than we do: adopt it if it verifies.
            if !qc.verify(
                self.genesis.genesis_hash,
                self.genesis.signature_threshold,
                &quorum_committee,
                &self.aggregate,
            ) {
                Event::Flag(Flag::TimeoutMessageInvalidQc {
                    finalizer: message.finalizer,
                    round: message.round,
                })
                .publish(&self.event_publisher);
                return Ok(ExecuteTimeoutMessageResult::InvalidQc);
            }

            self.check_finality(&qc)?;
            self.record_certified(&qc);
            if self.round_status.current_round() <= qc.round {
                self.advance_round(qc.round + 1, RoundAdvanceCause::Quorum(qc), produce)?;
            }
        } else if let Some(witnessed_epoch) = self.round_witness(qc.round) {
            // We already hold a certificate for that round; the epochs must agree.
            if witnessed_epoch != qc.epoch {
                return Ok(ExecuteTimeoutMessageResult::InvalidQcEpoch);
            }
        }

        self.process_timeout(message, &quorum_committee, produce)?;
        Ok(ExecuteTimeoutMessageResult::Executed)
    }

    /// Fold a timeout message into the two-epoch window, and emit a timeout certificate (and the
    /// round advance it implies) if the stored weight reaches the threshold.
    pub(crate) fn process_timeout(
        &mut self,
        message: TimeoutMessage,
        quorum_committee: &FinalizationCommittee,
        produce: bool,
    ) -> Result<(), FatalConsensusError> {
        match &mut self.timeout_pool {
            None => self.timeout_pool = Some(TimeoutMessages::start(message)),
            Some(window) => {
                if !window.insert(message) {
                    return Ok(());
                }
            }
        }
        let window = self.timeout_pool.as_ref().unwrap();

        // Tally the distinct bakers behind the stored messages that hold a seat in the committee
        // of the embedded certificate's epoch.
        let mut signatory_bakers = std::collections::BTreeSet::new();
        let buckets = [
            (window.first_epoch(), window.first_epoch_timeouts()),
            (window.first_epoch() + 1, window.second_epoch_timeouts()),
        ];
        for (epoch, bucket) in buckets {
            let Some(committee) = self.committees.committee_for(epoch) else {
                continue;
            };
            for finalizer in bucket.keys() {
                if let Some(member) = committee.member(*finalizer) {
                    signatory_bakers.insert(member.baker);
                }
            }
        }
        let mut signed = TotalWeight::new(0);
        for baker in signatory_bakers {
            if let Some(member) = quorum_committee.member_by_baker(baker) {
                signed += member.weight;
            }
        }

        if !meets_threshold(
            signed,
            quorum_committee.total_weight(),
            self.genesis.signature_threshold,
        ) {
            return Ok(());
        }

        let current_round = self.round_status.current_round();
        let certificate = window.make_certificate(current_round, &self.aggregate);
        let highest_qc = self.round_status.highest_certified().clone();
        self.advance_round(
            current_round + 1,
            RoundAdvanceCause::Timeout {
                certificate,
                highest_qc,
            },
            produce,
        )
    }

    /// React to the local round timer firing.
    ///
    /// A no-op unless the local identity holds a seat in the current committee. Otherwise: the
    /// round timeout grows by the chain's growth factor and is re-persisted, the timer is
    /// re-armed, and a timeout message for the current round is signed, stored as the last signed
    /// timeout message, broadcast, and looped back through the window.
    pub fn trigger_timeout(&mut self) -> Result<(), FatalConsensusError> {
        if self.shutdown {
            return Ok(());
        }
        let current_round = self.round_status.current_round();
        let current_epoch = self.committees.current_epoch();
        Event::Timeout(TimeoutEvent {
            timestamp: self.clock_now(),
            round: current_round,
        })
        .publish(&self.event_publisher);

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
        let finalizer = member.index;

        // Grow the timeout so that a struggling network keeps widening its rounds, and re-arm the
        // timer so the next expiry fires even if no round advance happens in between.
        let grown = self
            .round_status
            .current_timeout()
            .grow(self.genesis.timeout_increase);
        self.round_status.set_current_timeout(grown);
        self.persist_round_status();
        self.clock.reset_timer(grown.as_duration());

        let quorum_certificate = self.round_status.highest_certified().clone();
        let message = TimeoutMessage {
            genesis: self.genesis.genesis_hash,
            round: current_round,
            epoch: current_epoch,
            finalizer,
            aggregate_signature: self.aggregate.sign(
                &self.credentials.as_ref().unwrap().aggregate_secret,
                &crypto::timeout_signing_bytes(
                    self.genesis.genesis_hash,
                    current_round,
                    quorum_certificate.round,
                    current_epoch,
                ),
            ),
            envelope_signature: self.credentials.as_ref().unwrap().keypair.sign(
                &crypto::timeout_envelope_bytes(
                    self.genesis.genesis_hash,
                    current_round,
                    current_epoch,
                    quorum_certificate.block,
                ),
            ),
            quorum_certificate,
        };

        self.round_status.set_last_signed_timeout(message.clone());
        self.persist_round_status();

        self.network
            .broadcast(crate::messages::ConsensusMessage::Timeout(message.clone()));

        let Some(quorum_committee) = self
            .committees
            .committee_for(message.quorum_certificate.epoch)
            .cloned()
        else {
            return Ok(());
        };
        self.process_timeout(message, &quorum_committee, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(epoch: u64, finalizer: u32, round: u64) -> TimeoutMessage {
        TimeoutMessage {
            genesis: BlockHash::new([0u8; 32]),
            round: Round::new(round),
            epoch: Epoch::new(epoch),
            finalizer: FinalizerIndex::new(finalizer),
            quorum_certificate: QuorumCertificate::genesis(BlockHash::new([0u8; 32])),
            aggregate_signature: AggregateSignatureBytes::new([0u8; 48]),
            envelope_signature: SignatureBytes::new([0u8; 64]),
        }
    }

    #[test]
    fn window_inserts_into_both_buckets() {
        let mut window = TimeoutMessages::start(message(5, 0, 10));
        assert!(window.insert(message(5, 1, 10)));
        assert!(window.insert(message(6, 2, 10)));

        assert_eq!(window.first_epoch(), Epoch::new(5));
        assert_eq!(window.first_epoch_timeouts().len(), 2);
        assert_eq!(window.second_epoch_timeouts().len(), 1);
    }

    #[test]
    fn window_rotates_left_when_second_bucket_occupied() {
        let mut window = TimeoutMessages::start(message(5, 0, 10));
        assert!(window.insert(message(6, 1, 10)));
        assert!(window.insert(message(7, 2, 11)));

        assert_eq!(window.first_epoch(), Epoch::new(6));
        assert_eq!(window.first_epoch_timeouts().len(), 1);
        assert_eq!(window.second_epoch_timeouts().len(), 1);
        assert!(window
            .second_epoch_timeouts()
            .contains_key(&FinalizerIndex::new(2)));
    }

    #[test]
    fn window_resets_when_second_bucket_empty_at_rotation_boundary() {
        let mut window = TimeoutMessages::start(message(5, 0, 10));
        assert!(window.insert(message(7, 1, 11)));

        assert_eq!(window.first_epoch(), Epoch::new(7));
        assert_eq!(window.first_epoch_timeouts().len(), 1);
        assert!(window.second_epoch_timeouts().is_empty());
    }

    #[test]
    fn window_rotates_right_for_older_epoch_when_second_empty() {
        let mut window = TimeoutMessages::start(message(5, 0, 10));
        assert!(window.insert(message(4, 1, 10)));

        assert_eq!(window.first_epoch(), Epoch::new(4));
        assert!(window
            .first_epoch_timeouts()
            .contains_key(&FinalizerIndex::new(1)));
        assert!(window
            .second_epoch_timeouts()
            .contains_key(&FinalizerIndex::new(0)));
    }

    #[test]
    fn window_drops_messages_too_old_for_it() {
        let mut window = TimeoutMessages::start(message(5, 0, 10));
        assert!(window.insert(message(6, 1, 10)));

        // Second bucket occupied, so an epoch-4 message cannot be accommodated.
        assert!(!window.insert(message(4, 2, 10)));
        assert!(!window.insert(message(3, 3, 10)));
        assert_eq!(window.first_epoch(), Epoch::new(5));
    }
}
