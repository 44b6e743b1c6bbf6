/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The top-level wire message enum and the wire-visible result taxonomy.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::block_processing::ReceiveBlockResult;
use crate::catchup::messages::{
    CatchUpRequestMessage, CatchUpResponseMessage, CatchUpStatusMessage,
};
use crate::quorum::{QuorumMessage, ReceiveQuorumMessageResult};
use crate::timeout::{ReceiveTimeoutMessageResult, TimeoutMessage};
use crate::types::block::SignedBlock;

/// Every message the consensus engine sends or receives over the network.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub enum ConsensusMessage {
    Block(SignedBlock),
    Quorum(QuorumMessage),
    Timeout(TimeoutMessage),
    CatchUpStatus(CatchUpStatusMessage),
    CatchUpRequest(CatchUpRequestMessage),
    CatchUpResponse(CatchUpResponseMessage),
}

/// The wire-visible outcome of handing a message to the engine, as reported back to the peer
/// layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateResult {
    /// The message was processed and changed state.
    Success,

    /// The message was already known.
    Duplicate,

    /// The message refers to state behind the finalization frontier.
    Stale,

    /// The message is invalid and was rejected.
    Invalid,

    /// The message is a block waiting for its parent.
    PendingBlock,

    /// The message is waiting for finalization to progress.
    PendingFinalization,

    /// The message's timestamp is too far in the future.
    EarlyBlock,

    /// The engine has been shut down and only answers queries.
    ConsensusShutDown,

    /// The message cannot be verified with current knowledge; the sender should be asked for
    /// catch-up.
    Unverifiable,
}

impl From<ReceiveBlockResult> for UpdateResult {
    fn from(value: ReceiveBlockResult) -> UpdateResult {
        match value {
            ReceiveBlockResult::Success => UpdateResult::Success,
            ReceiveBlockResult::Duplicate => UpdateResult::Duplicate,
            ReceiveBlockResult::Stale => UpdateResult::Stale,
            ReceiveBlockResult::Invalid => UpdateResult::Invalid,
            ReceiveBlockResult::Pending => UpdateResult::PendingBlock,
            ReceiveBlockResult::EarlyBlock => UpdateResult::EarlyBlock,
            ReceiveBlockResult::ConsensusShutDown => UpdateResult::ConsensusShutDown,
        }
    }
}

impl From<&ReceiveQuorumMessageResult> for UpdateResult {
    fn from(value: &ReceiveQuorumMessageResult) -> UpdateResult {
        match value {
            ReceiveQuorumMessageResult::Received(_)
            | ReceiveQuorumMessageResult::ReceivedNoRelay(_) => UpdateResult::Success,
            ReceiveQuorumMessageResult::Rejected(_) => UpdateResult::Invalid,
            ReceiveQuorumMessageResult::CatchupRequired => UpdateResult::Unverifiable,
            ReceiveQuorumMessageResult::Duplicate => UpdateResult::Duplicate,
        }
    }
}

impl From<&ReceiveTimeoutMessageResult> for UpdateResult {
    fn from(value: &ReceiveTimeoutMessageResult) -> UpdateResult {
        match value {
            ReceiveTimeoutMessageResult::Received(_) => UpdateResult::Success,
            ReceiveTimeoutMessageResult::Rejected(_) => UpdateResult::Invalid,
            ReceiveTimeoutMessageResult::CatchupRequired => UpdateResult::Unverifiable,
            ReceiveTimeoutMessageResult::Duplicate => UpdateResult::Duplicate,
        }
    }
}
