/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The engine logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The engine-clock time the event was emitted (milliseconds since the Unix epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following
//! snippet is how a [`FinalizeBlockEvent`](crate::events::FinalizeBlockEvent) is printed:
//!
//! ```text
//! FinalizeBlock, 1701329264000, Id5u7f6, 42, 57
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the finalized block's
//!   hash.
//! - The fourth value is the block's height.
//! - The fifth value is the block's round.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const RECEIVE_BLOCK: &str = "ReceiveBlock";
pub const PRODUCE_BLOCK: &str = "ProduceBlock";
pub const FINALIZE_BLOCK: &str = "FinalizeBlock";
pub const PRUNE_BLOCK: &str = "PruneBlock";
pub const ADVANCE_ROUND: &str = "AdvanceRound";
pub const ADVANCE_EPOCH: &str = "AdvanceEpoch";

pub const RECEIVE_QUORUM_MESSAGE: &str = "ReceiveQuorumMessage";
pub const RECEIVE_TIMEOUT_MESSAGE: &str = "ReceiveTimeoutMessage";

pub const TIMEOUT: &str = "Timeout";
pub const CATCH_UP_REQUEST: &str = "CatchUpRequest";
pub const FLAG: &str = "Flag";

/// Log `event` in the CSV format described in the [module docs](self).
pub fn log_event(event: &Event) {
    match event {
        Event::ReceiveBlock(ev) => match ev.height {
            None => log::debug!(
                "{}, {}, {}, {}",
                RECEIVE_BLOCK,
                ev.timestamp.millis(),
                first_seven_base64_chars(&ev.block.bytes()),
                ev.round
            ),
            Some(height) => log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_BLOCK,
                ev.timestamp.millis(),
                first_seven_base64_chars(&ev.block.bytes()),
                ev.round,
                height
            ),
        },
        Event::ProduceBlock(ev) => log::info!(
            "{}, {}, {}, {}",
            PRODUCE_BLOCK,
            ev.timestamp.millis(),
            first_seven_base64_chars(&ev.block.bytes()),
            ev.round
        ),
        Event::FinalizeBlock(ev) => log::info!(
            "{}, {}, {}, {}, {}",
            FINALIZE_BLOCK,
            ev.timestamp.millis(),
            first_seven_base64_chars(&ev.block.bytes()),
            ev.height,
            ev.round
        ),
        Event::PruneBlock(ev) => log::info!(
            "{}, {}, {}",
            PRUNE_BLOCK,
            ev.timestamp.millis(),
            first_seven_base64_chars(&ev.block.bytes())
        ),
        Event::AdvanceRound(ev) => log::info!(
            "{}, {}, {}, {}",
            ADVANCE_ROUND,
            ev.timestamp.millis(),
            ev.round,
            ev.epoch
        ),
        Event::AdvanceEpoch(ev) => log::info!(
            "{}, {}, {}, {}",
            ADVANCE_EPOCH,
            ev.timestamp.millis(),
            ev.epoch,
            first_seven_base64_chars(&ev.finalized.bytes())
        ),
        Event::ReceiveQuorumMessage(ev) => log::debug!(
            "{}, {}, {}, {}, {}",
            RECEIVE_QUORUM_MESSAGE,
            ev.timestamp.millis(),
            first_seven_base64_chars(&ev.block.bytes()),
            ev.round,
            ev.finalizer.int()
        ),
        Event::ReceiveTimeoutMessage(ev) => log::debug!(
            "{}, {}, {}, {}, {}",
            RECEIVE_TIMEOUT_MESSAGE,
            ev.timestamp.millis(),
            ev.round,
            ev.epoch,
            ev.finalizer.int()
        ),
        Event::Timeout(ev) => log::info!("{}, {}, {}", TIMEOUT, ev.timestamp.millis(), ev.round),
        Event::CatchUpRequest(ev) => log::debug!(
            "{}, {}, {}",
            CATCH_UP_REQUEST,
            ev.timestamp.millis(),
            ev.peer_current_round
        ),
        Event::Flag(flag) => log_flag(flag),
    }
}

fn log_flag(flag: &Flag) {
    match flag {
        Flag::QuorumDoubleSigning { finalizer, round } => log::warn!(
            "{}, QuorumDoubleSigning, {}, {}",
            FLAG,
            finalizer.int(),
            round
        ),
        Flag::TimeoutDoubleSigning { finalizer, round } => log::warn!(
            "{}, TimeoutDoubleSigning, {}, {}",
            FLAG,
            finalizer.int(),
            round
        ),
        Flag::InvalidQuorumSignature { finalizer, round } => log::warn!(
            "{}, InvalidQuorumSignature, {}, {}",
            FLAG,
            finalizer.int(),
            round
        ),
        Flag::InvalidTimeoutSignature { finalizer, round } => log::warn!(
            "{}, InvalidTimeoutSignature, {}, {}",
            FLAG,
            finalizer.int(),
            round
        ),
        Flag::TimeoutMessageInvalidQc { finalizer, round } => log::warn!(
            "{}, TimeoutMessageInvalidQc, {}, {}",
            FLAG,
            finalizer.int(),
            round
        ),
    }
}

/// Get the first seven characters of the Base64 encoding of `bytes`, for compact hash display.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    encoded.chars().take(7).collect()
}
