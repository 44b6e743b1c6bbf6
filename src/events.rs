/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local consensus engine.
//!
//! ## Event enum
//!
//! Significant occurrences include a block becoming alive, a block being finalized or pruned, a
//! round or epoch advancing, and evidence of misbehavior being detected. Each corresponds to a
//! variant of the [`Event`] enum, whose inner struct carries a summary of the occurrence,
//! always including the engine-clock timestamp at which it happened.
//!
//! ## Registering event handlers
//!
//! Library users can register event handler closures, which are called by the
//! [event bus](crate::event_bus::start_event_bus) thread when the handler's event variant
//! happens. Default handlers that log events in CSV form live in [`crate::logging`].
//!
//! ## Timing
//!
//! Events are always emitted **after** the corresponding occurrence is completed; in particular,
//! state-changing events are only emitted once the change has been persisted.

use std::sync::mpsc::Sender;

use crate::types::data_types::{
    BlockHash, BlockHeight, Epoch, FinalizerIndex, Round, Timestamp,
};

/// Enumerates all events the engine can emit.
pub enum Event {
    // Events that change persistent state.
    ReceiveBlock(ReceiveBlockEvent),
    ProduceBlock(ProduceBlockEvent),
    FinalizeBlock(FinalizeBlockEvent),
    PruneBlock(PruneBlockEvent),
    AdvanceRound(AdvanceRoundEvent),
    AdvanceEpoch(AdvanceEpochEvent),

    // Events that involve receiving a vote.
    ReceiveQuorumMessage(ReceiveQuorumMessageEvent),
    ReceiveTimeoutMessage(ReceiveTimeoutMessageEvent),

    // Timer events.
    Timeout(TimeoutEvent),

    // Catch-up events.
    CatchUpRequest(CatchUpRequestEvent),

    // Evidence of misbehavior, for the embedding node to persist for slashing if it chooses.
    Flag(Flag),
}

impl Event {
    /// Publish this event on the event publisher channel, if a channel is configured.
    pub fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// A block was received; emitted once on arrival (with `height: None`) and once when the block
/// becomes alive (with its assigned height).
pub struct ReceiveBlockEvent {
    pub timestamp: Timestamp,
    pub block: BlockHash,
    pub round: Round,
    pub height: Option<BlockHeight>,
}

/// This node won the round's leader lottery and produced a block.
pub struct ProduceBlockEvent {
    pub timestamp: Timestamp,
    pub block: BlockHash,
    pub round: Round,
}

/// A block became finalized. Emitted once per block, in height order.
pub struct FinalizeBlockEvent {
    pub timestamp: Timestamp,
    pub block: BlockHash,
    pub height: BlockHeight,
    pub round: Round,
}

/// An alive block was pruned because a competing branch finalized.
pub struct PruneBlockEvent {
    pub timestamp: Timestamp,
    pub block: BlockHash,
}

/// The current round advanced.
pub struct AdvanceRoundEvent {
    pub timestamp: Timestamp,
    pub round: Round,
    pub epoch: Epoch,
}

/// The current epoch advanced, justified by a finalization entry for `finalized`.
pub struct AdvanceEpochEvent {
    pub timestamp: Timestamp,
    pub epoch: Epoch,
    pub finalized: BlockHash,
}

/// A quorum message arrived.
pub struct ReceiveQuorumMessageEvent {
    pub timestamp: Timestamp,
    pub block: BlockHash,
    pub round: Round,
    pub finalizer: FinalizerIndex,
}

/// A timeout message arrived.
pub struct ReceiveTimeoutMessageEvent {
    pub timestamp: Timestamp,
    pub round: Round,
    pub epoch: Epoch,
    pub finalizer: FinalizerIndex,
}

/// The local round timer fired.
pub struct TimeoutEvent {
    pub timestamp: Timestamp,
    pub round: Round,
}

/// A catch-up request was handled for a peer.
pub struct CatchUpRequestEvent {
    pub timestamp: Timestamp,
    pub peer_current_round: Round,
}

/// Typed evidence of misbehavior by a committee member.
///
/// Flags are silent from the protocol's point of view (the offending message is rejected without
/// peer penalty), but the embedding node may persist them for future slashing.
pub enum Flag {
    /// Two distinct quorum messages from one seat in one round.
    QuorumDoubleSigning {
        finalizer: FinalizerIndex,
        round: Round,
    },

    /// Two distinct timeout messages from one seat in one round.
    TimeoutDoubleSigning {
        finalizer: FinalizerIndex,
        round: Round,
    },

    /// A quorum message whose aggregate signature does not verify.
    InvalidQuorumSignature {
        finalizer: FinalizerIndex,
        round: Round,
    },

    /// A timeout message whose envelope signature does not verify.
    InvalidTimeoutSignature {
        finalizer: FinalizerIndex,
        round: Round,
    },

    /// A timeout message carrying a quorum certificate that fails verification.
    TimeoutMessageInvalidQc {
        finalizer: FinalizerIndex,
        round: Round,
    },
}
