/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The requesting side of catch-up: deciding when to catch up, and applying a response.

use crate::engine::{Consensus, ConsensusContext};
use crate::finality::FatalConsensusError;
use crate::quorum::ReceiveQuorumMessageResult;
use crate::round_status::RoundAdvanceCause;
use crate::timeout::{ExecuteTimeoutMessageResult, ReceiveTimeoutMessageResult};
use crate::tree::{BlockStatus, RecentBlockStatus};
use crate::types::block::SignedBlock;
use crate::types::data_types::Epoch;

use super::messages::{CatchUpStatus, CatchUpTerminalData};

/// How applying catch-up terminal data ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalDataOutcome {
    /// Every datum was valid (some may have been redundant).
    Success,

    /// An invalid datum stopped processing; earlier progress is kept.
    Invalid,
}

/// The result of applying catch-up terminal data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminalDataResult {
    /// Whether any state actually changed.
    pub progress: bool,

    /// How processing ended.
    pub outcome: TerminalDataOutcome,
}

impl<Ctx: ConsensusContext> Consensus<Ctx> {
    /// Decide whether `their_status` shows the peer to be ahead of us, so that we should request
    /// catch-up from them.
    pub fn is_catch_up_required(&self, their_status: &CatchUpStatus) -> bool {
        let my_current_round = self.round_status.current_round();
        let my_last_finalized = self.tree.last_finalized();

        // A peer ahead on either frontier is ahead, full stop.
        if their_status.current_round > my_current_round
            || their_status.last_finalized_round > my_last_finalized.round
        {
            return true;
        }

        // A peer whose whole view is at or behind our finalized frontier has nothing for us.
        if their_status.current_round <= my_last_finalized.round {
            return false;
        }

        // The frontiers line up; the peer may still hold blocks or votes we lack.
        let unknown_leaf = their_status.leaves.iter().any(|leaf| {
            matches!(
                self.tree.get_recent_block_status(leaf),
                RecentBlockStatus::Recent(BlockStatus::Unknown | BlockStatus::Pending(_))
            )
        });
        if unknown_leaf {
            return true;
        }

        if their_status.current_round == my_current_round {
            let missing_quorum_signature =
                their_status.quorum_signatories.iter().any(|(block, set)| {
                    set.iter().any(|finalizer| {
                        !self
                            .quorum_pool
                            .signatories_for(block)
                            .is_some_and(|mine| mine.contains(finalizer))
                    })
                });
            if missing_quorum_signature {
                return true;
            }

            if let Some(summary) = &their_status.timeout_summary {
                let buckets = [
                    (summary.first_epoch, &summary.first_epoch_finalizers),
                    (summary.first_epoch + 1, &summary.second_epoch_finalizers),
                ];
                for (epoch, finalizers) in buckets {
                    if !self.epoch_is_relevant(epoch) {
                        continue;
                    }
                    let missing = finalizers.iter().any(|finalizer| {
                        !self.holds_timeout_message_from(epoch, finalizer)
                    });
                    if missing {
                        return true;
                    }
                }
            }
        }

        false
    }

    /// Check whether `epoch` is one timeout messages are still collected for.
    fn epoch_is_relevant(&self, epoch: Epoch) -> bool {
        self.committees.committee_for(epoch).is_some()
    }

    fn holds_timeout_message_from(
        &self,
        epoch: Epoch,
        finalizer: crate::types::data_types::FinalizerIndex,
    ) -> bool {
        let Some(window) = &self.timeout_pool else {
            return false;
        };
        if epoch == window.first_epoch() {
            window.first_epoch_timeouts().contains_key(&finalizer)
        } else if epoch == window.first_epoch() + 1 {
            window.second_epoch_timeouts().contains_key(&finalizer)
        } else {
            false
        }
    }

    /// Apply a full catch-up response: the streamed blocks, then the terminal data.
    ///
    /// Round advances during application do not produce blocks; at most one block is produced,
    /// at the very end.
    pub fn process_catch_up_response(
        &mut self,
        blocks: Vec<SignedBlock>,
        terminal_data: Option<CatchUpTerminalData>,
    ) -> Result<TerminalDataResult, FatalConsensusError> {
        for block in blocks {
            let _ = self.receive_block_with(block, false)?;
        }
        match terminal_data {
            Some(data) => self.process_catch_up_terminal_data(&data),
            None => Ok(TerminalDataResult {
                progress: false,
                outcome: TerminalDataOutcome::Success,
            }),
        }
    }

    /// Apply catch-up terminal data: quorum certificates (up to two), then the optional timeout
    /// certificate, then quorum messages, then timeout messages, in that order.
    ///
    /// Round advances here never produce a block immediately; only after all four phases is the
    /// block production hook invoked, once. The first invalid datum short-circuits to an
    /// `Invalid` outcome carrying whatever progress was already made.
    pub fn process_catch_up_terminal_data(
        &mut self,
        data: &CatchUpTerminalData,
    ) -> Result<TerminalDataResult, FatalConsensusError> {
        let mut progress = false;
        let invalid = |progress| {
            Ok(TerminalDataResult {
                progress,
                outcome: TerminalDataOutcome::Invalid,
            })
        };

        // 1. Quorum certificates.
        for certificate in data.quorum_certificates.iter().take(2) {
            if certificate.round <= self.tree.last_finalized().round {
                continue;
            }
            let Some(committee) = self.committees.committee_for(certificate.epoch).cloned() else {
                return invalid(progress);
            };
            if !certificate.verify(
                self.genesis.genesis_hash,
                self.genesis.signature_threshold,
                &committee,
                &self.aggregate,
            ) {
                return invalid(progress);
            }
            self.check_finality(certificate)?;
            self.record_certified(certificate);
            if self.round_status.current_round() <= certificate.round {
                self.advance_round(
                    certificate.round + 1,
                    RoundAdvanceCause::Quorum(certificate.clone()),
                    false,
                )?;
                progress = true;
            }
        }

        // 2. Timeout certificate.
        if let Some(certificate) = &data.timeout_certificate {
            if certificate.round >= self.round_status.current_round() {
                let committees = &self.committees;
                if !certificate.verify(
                    self.genesis.genesis_hash,
                    self.genesis.signature_threshold,
                    |epoch| committees.committee_for(epoch),
                    &self.aggregate,
                ) {
                    return invalid(progress);
                }
                let highest_qc = self.round_status.highest_certified().clone();
                self.advance_round(
                    certificate.round + 1,
                    RoundAdvanceCause::Timeout {
                        certificate: certificate.clone(),
                        highest_qc,
                    },
                    false,
                )?;
                progress = true;
            }
        }

        // 3. Quorum messages.
        for message in &data.quorum_messages {
            match self.receive_quorum_message(message.clone()) {
                ReceiveQuorumMessageResult::Received(verified)
                | ReceiveQuorumMessageResult::ReceivedNoRelay(verified) => {
                    self.process_quorum_message(verified, false)?;
                    progress = true;
                }
                ReceiveQuorumMessageResult::Rejected(_) => return invalid(progress),
                ReceiveQuorumMessageResult::CatchupRequired
                | ReceiveQuorumMessageResult::Duplicate => {}
            }
        }

        // 4. Timeout messages.
        for message in &data.timeout_messages {
            match self.receive_timeout_message(message.clone()) {
                ReceiveTimeoutMessageResult::Received(partially_verified) => {
                    match self.execute_timeout_message_with(partially_verified, false)? {
                        ExecuteTimeoutMessageResult::Executed => progress = true,
                        ExecuteTimeoutMessageResult::InvalidQc
                        | ExecuteTimeoutMessageResult::InvalidQcEpoch => {
                            return invalid(progress)
                        }
                    }
                }
                ReceiveTimeoutMessageResult::Rejected(_) => return invalid(progress),
                ReceiveTimeoutMessageResult::CatchupRequired
                | ReceiveTimeoutMessageResult::Duplicate => {}
            }
        }

        // Only now may the round we ended up in produce its block.
        self.make_block()?;

        Ok(TerminalDataResult {
            progress,
            outcome: TerminalDataOutcome::Success,
        })
    }
}
