/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The round status: the engine's position in the round/epoch state machine.
//!
//! The [`RoundStatus`] record is persisted as a single key in the low-level store, written
//! atomically, and the write always happens **before** any side effect of a round change (an
//! outgoing message naming the new round, a produced block) is allowed to escape. That ordering is
//! what makes a crashed node restart into a state it cannot be slashed for: the last signed
//! quorum and timeout messages are part of the same record.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto::VrfScheme;
use crate::engine::{Consensus, ConsensusContext, Ledger, RoundClock};
use crate::events::{AdvanceEpochEvent, AdvanceRoundEvent, Event};
use crate::finality::FatalConsensusError;
use crate::quorum::QuorumMessage;
use crate::timeout::TimeoutMessage;
use crate::types::certificates::{FinalizationEntry, QuorumCertificate, TimeoutCertificate};
use crate::types::data_types::{Epoch, Round, TimeoutDuration, VrfOutput};
use crate::types::genesis::GenesisConfiguration;

/// Why a round advanced: either a quorum certificate for the preceding round, or a timeout
/// certificate together with the highest quorum certificate known when the timeout fired.
pub enum RoundAdvanceCause {
    /// The preceding round was certified.
    Quorum(QuorumCertificate),

    /// The preceding round timed out.
    Timeout {
        /// The certificate witnessing the timeout.
        certificate: TimeoutCertificate,

        /// The highest quorum certificate known at the time, recorded so the next block can
        /// justify building on it.
        highest_qc: QuorumCertificate,
    },
}

/// Record of a round that timed out, kept so the next produced block can embed the evidence.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RoundTimeout {
    /// The timeout certificate of the failed round.
    pub certificate: TimeoutCertificate,

    /// The highest quorum certificate known when the certificate formed.
    pub highest_qc: QuorumCertificate,
}

/// The engine's position in the round/epoch state machine, as persisted on every change.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct RoundStatus {
    current_round: Round,
    current_epoch: Epoch,
    current_timeout: TimeoutDuration,
    highest_certified: QuorumCertificate,
    previous_round_timeout: Option<RoundTimeout>,
    last_signed_quorum: Option<QuorumMessage>,
    last_signed_timeout: Option<TimeoutMessage>,
    leadership_nonce: VrfOutput,
}

impl RoundStatus {
    /// The round status of a fresh chain: round 1 of epoch 0, with the genesis block as the
    /// highest certified block.
    pub fn initial(genesis: &GenesisConfiguration) -> RoundStatus {
        RoundStatus {
            current_round: Round::new(1),
            current_epoch: Epoch::genesis(),
            current_timeout: genesis.base_timeout,
            highest_certified: QuorumCertificate::genesis(genesis.genesis_hash),
            previous_round_timeout: None,
            last_signed_quorum: None,
            last_signed_timeout: None,
            leadership_nonce: genesis.leadership_nonce,
        }
    }

    /// Get the current round.
    pub fn current_round(&self) -> Round {
        self.current_round
    }

    /// Get the current epoch.
    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    /// Get the current round timeout duration.
    pub fn current_timeout(&self) -> TimeoutDuration {
        self.current_timeout
    }

    /// Get the quorum certificate of the highest certified block.
    pub fn highest_certified(&self) -> &QuorumCertificate {
        &self.highest_certified
    }

    /// Get the record of the previous round's timeout, if the previous round timed out.
    pub fn previous_round_timeout(&self) -> Option<&RoundTimeout> {
        self.previous_round_timeout.as_ref()
    }

    /// Get the last quorum message this node signed, if any.
    pub fn last_signed_quorum(&self) -> Option<&QuorumMessage> {
        self.last_signed_quorum.as_ref()
    }

    /// Get the last timeout message this node signed, if any.
    pub fn last_signed_timeout(&self) -> Option<&TimeoutMessage> {
        self.last_signed_timeout.as_ref()
    }

    /// Get the leadership election nonce of the current epoch.
    pub fn leadership_nonce(&self) -> VrfOutput {
        self.leadership_nonce
    }

    pub(crate) fn set_current_timeout(&mut self, timeout: TimeoutDuration) {
        self.current_timeout = timeout;
    }

    pub(crate) fn set_highest_certified(&mut self, certificate: QuorumCertificate) {
        self.highest_certified = certificate;
    }

    pub(crate) fn set_last_signed_quorum(&mut self, message: QuorumMessage) {
        self.last_signed_quorum = Some(message);
    }

    pub(crate) fn set_last_signed_timeout(&mut self, message: TimeoutMessage) {
        self.last_signed_timeout = Some(message);
    }

    pub(crate) fn enter_round(&mut self, round: Round, timeout: Option<RoundTimeout>) {
        self.current_round = round;
        self.previous_round_timeout = timeout;
    }

    pub(crate) fn enter_epoch(&mut self, epoch: Epoch, leadership_nonce: VrfOutput) {
        self.current_epoch = epoch;
        self.leadership_nonce = leadership_nonce;
    }
}

impl<Ctx: ConsensusContext> Consensus<Ctx> {
    /// Advance to `new_round` because of `cause`.
    ///
    /// In order: the local round timer is re-armed (iff the local identity is a finalizer in the
    /// current epoch), the new round status (including the previous-round timeout record when the
    /// cause is a timeout) is written and persisted, the current round's vote pool is discarded,
    /// and only then, if `produce_block` is set, the block production hook runs for the new round.
    ///
    /// A `new_round` at or below the current round is ignored: rounds are monotone.
    pub(crate) fn advance_round(
        &mut self,
        new_round: Round,
        cause: RoundAdvanceCause,
        produce_block: bool,
    ) -> Result<(), FatalConsensusError> {
        if new_round <= self.round_status.current_round() {
            return Ok(());
        }

        // 1. Re-arm the round timer before anything that could block on disk.
        if self.is_local_finalizer() {
            let timeout = self.round_status.current_timeout();
            self.clock.reset_timer(timeout.as_duration());
        }

        // 2./3. Write the new status and persist it before any side effect of the new round.
        let previous_round_timeout = match cause {
            RoundAdvanceCause::Quorum(_) => None,
            RoundAdvanceCause::Timeout {
                certificate,
                highest_qc,
            } => Some(RoundTimeout {
                certificate,
                highest_qc,
            }),
        };
        self.round_status
            .enter_round(new_round, previous_round_timeout);
        self.persist_round_status();

        self.quorum_pool.reset(new_round);

        Event::AdvanceRound(AdvanceRoundEvent {
            timestamp: self.clock_now(),
            round: new_round,
            epoch: self.committees.current_epoch(),
        })
        .publish(&self.event_publisher);

        // 4. Produce a block if the round lottery elects us.
        if produce_block {
            self.make_block()?;
        }
        Ok(())
    }

    /// Advance to `new_epoch`, justified by `entry`.
    ///
    /// The committee for the new epoch is obtained from the ledger, the leadership election nonce
    /// is recomputed from the entry's contribution, and vote pools whose epoch window no longer
    /// overlaps the new epoch are discarded.
    pub(crate) fn advance_epoch(
        &mut self,
        new_epoch: Epoch,
        entry: &FinalizationEntry,
        contribution: VrfOutput,
    ) -> Result<(), FatalConsensusError> {
        if new_epoch <= self.committees.current_epoch() {
            return Ok(());
        }

        let committee = self
            .ledger
            .committee_for(new_epoch)
            .ok_or(FatalConsensusError::MissingCommittee { epoch: new_epoch })?;
        self.committees.advance(new_epoch, committee);

        let leadership_nonce = self.vrf.derive_epoch_nonce(
            &self.round_status.leadership_nonce(),
            &contribution,
            new_epoch,
        );
        self.round_status.enter_epoch(new_epoch, leadership_nonce);
        self.persist_round_status();

        // Quorum messages are always for the epoch of the round they vote in, so the pool cannot
        // survive the transition. The timeout window survives only while it still overlaps
        // {new_epoch - 1, new_epoch}.
        let round = self.quorum_pool.round();
        self.quorum_pool.reset(round);
        let window_is_stale = self.timeout_pool.as_ref().is_some_and(|window| {
            let newest_covered = if window.second_epoch_timeouts().is_empty() {
                window.first_epoch()
            } else {
                window.first_epoch() + 1
            };
            newest_covered + 1 < new_epoch
        });
        if window_is_stale {
            self.timeout_pool = None;
        }

        Event::AdvanceEpoch(AdvanceEpochEvent {
            timestamp: self.clock_now(),
            epoch: new_epoch,
            finalized: entry.finalized_qc.block,
        })
        .publish(&self.event_publisher);
        Ok(())
    }

    /// Record `certificate` as the highest certified block if its round exceeds the previous
    /// highest, and remember the `(round, epoch)` witness for cross-checking later certificates.
    pub(crate) fn record_certified(&mut self, certificate: &QuorumCertificate) {
        self.round_witnesses
            .insert(certificate.round, certificate.epoch);
        if certificate.round > self.round_status.highest_certified().round {
            self.round_status.set_highest_certified(certificate.clone());
            self.persist_round_status();
        }
    }

    /// Get the epoch of the certificate already witnessed for `round`, if any.
    pub(crate) fn round_witness(&self, round: Round) -> Option<Epoch> {
        self.round_witnesses.get(&round).copied()
    }

    /// Write the round status to the low-level store. The write is atomic and synchronous:
    /// when this returns, a restart will observe the new status.
    pub(crate) fn persist_round_status(&mut self) {
        use crate::store::kv_store::{KVStore, WriteBatch};

        let mut batch = <Ctx::Store as KVStore>::WriteBatch::new();
        batch.set_round_status(&self.round_status);
        self.store.write(batch);
    }
}
