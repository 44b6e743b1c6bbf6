/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Wire messages of the catch-up protocol.
//!
//! Catch-up exchanges a compact [`CatchUpStatus`] digest of a node's view of the tree. Three
//! message kinds share it:
//! 1. [`CatchUpStatusMessage`]: a lightweight summary with no branches, broadcast so peers can
//!    notice they are behind.
//! 2. [`CatchUpRequestMessage`]: a full summary (with branches and leaves), asking the receiver
//!    to respond with what the sender is missing.
//! 3. [`CatchUpResponseMessage`]: the terminator of a response stream, optionally carrying the
//!    [`CatchUpTerminalData`]. A response stream on the wire is zero or more block frames
//!    followed by exactly one response message.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::quorum::QuorumMessage;
use crate::timeout::TimeoutMessage;
use crate::types::certificates::{QuorumCertificate, TimeoutCertificate};
use crate::types::data_types::{BlockHash, Epoch, FinalizerSet, Round};

/// Which finalizers' timeout messages a node holds, per epoch of its two-epoch window.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TimeoutSetSummary {
    /// The older epoch of the window.
    pub first_epoch: Epoch,

    /// Seats with stored timeout messages in `first_epoch`.
    pub first_epoch_finalizers: FinalizerSet,

    /// Seats with stored timeout messages in `first_epoch + 1`.
    pub second_epoch_finalizers: FinalizerSet,
}

/// A compact digest of a node's view of the tree and the current round.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CatchUpStatus {
    /// Hash of the node's last finalized block.
    pub last_finalized_block: BlockHash,

    /// Round of the node's last finalized block.
    pub last_finalized_round: Round,

    /// Alive blocks with no alive child. Empty in lightweight status messages.
    pub leaves: Vec<BlockHash>,

    /// Alive non-leaf, non-finalized blocks. Empty in lightweight status messages.
    pub branches: Vec<BlockHash>,

    /// The node's current round.
    pub current_round: Round,

    /// The node's current epoch.
    pub current_epoch: Epoch,

    /// For each candidate block of the current round, the seats whose quorum messages the node
    /// holds.
    pub quorum_signatories: Vec<(BlockHash, FinalizerSet)>,

    /// The seats whose timeout messages the node holds, if any.
    pub timeout_summary: Option<TimeoutSetSummary>,
}

impl CatchUpStatus {
    /// Check whether this status already records a quorum message for `block` from `finalizer`.
    pub fn has_quorum_signature(
        &self,
        block: &BlockHash,
        finalizer: crate::types::data_types::FinalizerIndex,
    ) -> bool {
        self.quorum_signatories
            .iter()
            .any(|(b, set)| b == block && set.contains(finalizer))
    }
}

/// The data closing a catch-up response, after all blocks have been streamed.
#[derive(Clone, Default, BorshSerialize, BorshDeserialize)]
pub struct CatchUpTerminalData {
    /// Up to two certificates: the responder's highest quorum certificate and, if distinct, the
    /// certificate that last caused finalization.
    pub quorum_certificates: Vec<QuorumCertificate>,

    /// The previous round's timeout certificate, included iff the requester's current round was
    /// behind the responder's.
    pub timeout_certificate: Option<TimeoutCertificate>,

    /// Current-round quorum messages the requester was missing.
    pub quorum_messages: Vec<QuorumMessage>,

    /// Timeout messages the requester was missing, filtered by epoch-window alignment.
    pub timeout_messages: Vec<TimeoutMessage>,
}

/// Lightweight status broadcast: a summary with no branches.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct CatchUpStatusMessage {
    /// The genesis hash of the chain the status describes.
    pub genesis: BlockHash,

    /// The sender's status digest, without branches or leaves.
    pub status: CatchUpStatus,
}

/// A request for catch-up: the full branches/leaves summary.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct CatchUpRequestMessage {
    /// The genesis hash of the chain the request is about.
    pub genesis: BlockHash,

    /// The sender's full status digest.
    pub status: CatchUpStatus,
}

/// The terminator of a catch-up response stream.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct CatchUpResponseMessage {
    /// The genesis hash of the chain the response is about.
    pub genesis: BlockHash,

    /// The terminal data, absent when the responder could not serve the request.
    pub terminal_data: Option<CatchUpTerminalData>,
}
