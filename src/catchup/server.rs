/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The serving side of catch-up: producing a response stream for a peer's request.
//!
//! The response is produced as a pull-driven stream: every [`next`](CatchUpPartialResponse::next)
//! call either yields one block and the continuation, or yields the terminal data. The transport
//! drives the stream and may stop at any frame (for example to cap blocks per response), without
//! the engine needing to know the cap. The producer holds only read access to the engine, so a
//! snapshot of consensus state taken at request time stays coherent for the whole stream.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::engine::{Consensus, ConsensusContext};
use crate::events::{CatchUpRequestEvent, Event};
use crate::finality::FatalConsensusError;
use crate::store::kv_store::KVGet;
use crate::tree::{BlockPointer, BlockStatus, RecentBlockStatus};
use crate::types::block::SignedBlock;
use crate::types::data_types::{BlockHash, BlockHeight};

use super::messages::{CatchUpStatus, CatchUpTerminalData};

/// One step of a catch-up response stream.
pub enum CatchUpStep<'a, Ctx: ConsensusContext> {
    /// The next block the peer is missing, and the continuation of the stream.
    Block(SignedBlock, CatchUpPartialResponse<'a, Ctx>),

    /// No more blocks follow; the stream closes with this terminal data.
    Done(CatchUpTerminalData),
}

/// A partially-produced catch-up response: the lazy stream of blocks a peer is missing.
pub struct CatchUpPartialResponse<'a, Ctx: ConsensusContext> {
    engine: &'a Consensus<Ctx>,
    their_status: CatchUpStatus,
    known_to_them: HashSet<BlockHash>,
    next_finalized_height: BlockHeight,
    last_finalized_height: BlockHeight,
    branch_queue: VecDeque<Arc<BlockPointer>>,
    streamed: HashSet<BlockHash>,
    serviceable: bool,
}

impl<Ctx: ConsensusContext> Consensus<Ctx> {
    /// Handle a catch-up request, returning the lazy response stream.
    ///
    /// If the peer's reported last finalized block is not finalized or alive on this side, the
    /// stream is empty and its terminal data is empty: there is no coherent way to serve the
    /// request, and the peer is not actually behind us.
    pub fn handle_catch_up_request(
        &self,
        their_status: CatchUpStatus,
    ) -> Result<CatchUpPartialResponse<'_, Ctx>, FatalConsensusError> {
        Event::CatchUpRequest(CatchUpRequestEvent {
            timestamp: self.clock_now(),
            peer_current_round: their_status.current_round,
        })
        .publish(&self.event_publisher);

        let last_finalized = self.tree.last_finalized();

        // Resolve the height of the peer's last finalized block on our side; failing that, the
        // request is unserviceable. The genesis block is finalized by definition but never stored
        // under a height, so it is resolved directly.
        let their_finalized_height = if their_status.last_finalized_block
            == self.genesis.genesis_hash
        {
            Some(BlockHeight::new(0))
        } else {
            match self
                .tree
                .get_block_status(&self.store, &their_status.last_finalized_block)?
            {
                RecentBlockStatus::Recent(BlockStatus::Finalized(pointer))
                | RecentBlockStatus::Recent(BlockStatus::Alive(pointer)) => Some(pointer.height),
                RecentBlockStatus::OldFinalized => self
                    .store
                    .height_by_hash(&their_status.last_finalized_block)?,
                _ => None,
            }
        };

        let known_to_them: HashSet<BlockHash> = their_status
            .leaves
            .iter()
            .chain(their_status.branches.iter())
            .copied()
            .chain([their_status.last_finalized_block])
            .collect();

        let (serviceable, next_finalized_height) = match their_finalized_height {
            Some(height) => (true, height + 1),
            None => (false, BlockHeight::new(0)),
        };

        Ok(CatchUpPartialResponse {
            their_status,
            known_to_them,
            next_finalized_height,
            last_finalized_height: last_finalized.height,
            branch_queue: self.tree.branches().cloned().collect(),
            streamed: HashSet::new(),
            serviceable,
            engine: self,
        })
    }
}

impl<'a, Ctx: ConsensusContext> CatchUpPartialResponse<'a, Ctx> {
    /// Produce the next step of the stream: a missing block, or the terminal data if no more
    /// blocks follow.
    pub fn next(mut self) -> Result<CatchUpStep<'a, Ctx>, FatalConsensusError> {
        if !self.serviceable {
            return Ok(CatchUpStep::Done(CatchUpTerminalData::default()));
        }

        // 1. Finalized blocks, from just above the peer's last finalized height through ours,
        //    skipping the ones the peer already reports.
        while self.next_finalized_height.int() <= self.last_finalized_height.int() {
            let height = self.next_finalized_height;
            self.next_finalized_height = height + 1;

            let block = self
                .engine
                .store
                .finalized_block_at_height(height)?
                .ok_or(FatalConsensusError::InconsistentFinalization {
                    description: "finalized chain has a hole below the last finalized block",
                })?;
            if self.known_to_them.contains(&block.hash) {
                continue;
            }
            return Ok(CatchUpStep::Block(block, self));
        }

        // 2. Non-finalized alive blocks, height by height. A block the peer reports is skipped,
        //    unless it descends from a block this stream already sent: once the first
        //    unknown-to-them block at a height appears, all its descendants are streamed.
        while let Some(pointer) = self.branch_queue.pop_front() {
            if self.known_to_them.contains(&pointer.hash) && !self.streamed.contains(&pointer.parent)
            {
                continue;
            }
            self.streamed.insert(pointer.hash);
            let block = pointer
                .block
                .as_ref()
                .expect("alive non-finalized blocks always carry a body")
                .as_ref()
                .clone();
            return Ok(CatchUpStep::Block(block, self));
        }

        Ok(CatchUpStep::Done(self.finish()))
    }

    /// Assemble the terminal data for the peer.
    fn finish(&self) -> CatchUpTerminalData {
        let engine = self.engine;
        let mut quorum_certificates = Vec::new();
        let highest = engine.round_status.highest_certified().clone();
        let finalizing = engine
            .latest_finalization_entry
            .as_ref()
            .map(|entry| entry.successor_qc.clone())
            .filter(|qc| *qc != highest);
        quorum_certificates.push(highest);
        quorum_certificates.extend(finalizing);

        // The previous round's timeout certificate only helps a peer that has not reached our
        // round yet.
        let timeout_certificate = if self.their_status.current_round
            < engine.round_status.current_round()
        {
            engine
                .round_status
                .previous_round_timeout()
                .map(|timeout| timeout.certificate.clone())
        } else {
            None
        };

        let quorum_messages = engine
            .quorum_pool
            .messages()
            .filter(|message| {
                !self
                    .their_status
                    .has_quorum_signature(&message.block, message.finalizer)
            })
            .cloned()
            .collect();

        CatchUpTerminalData {
            quorum_certificates,
            timeout_certificate,
            quorum_messages,
            timeout_messages: self.missing_timeout_messages(),
        }
    }

    /// Select the timeout messages the peer is missing.
    ///
    /// The peer's summary and our window each cover up to two consecutive epochs, giving four
    /// alignments; each has its own filter pattern. A bucket the peer's summary says nothing
    /// about is sent whole; a bucket older than the peer's whole window is dropped.
    fn missing_timeout_messages(&self) -> Vec<crate::timeout::TimeoutMessage> {
        let Some(window) = &self.engine.timeout_pool else {
            return Vec::new();
        };
        let first = window.first_epoch_timeouts();
        let second = window.second_epoch_timeouts();

        let Some(summary) = &self.their_status.timeout_summary else {
            return window.all_messages().cloned().collect();
        };

        let tm_first = window.first_epoch();
        let ts_first = summary.first_epoch;

        let mut messages = Vec::new();
        if tm_first == ts_first {
            // Aligned windows: filter each bucket by the peer's matching set.
            messages.extend(
                first
                    .values()
                    .filter(|m| !summary.first_epoch_finalizers.contains(m.finalizer))
                    .cloned(),
            );
            messages.extend(
                second
                    .values()
                    .filter(|m| !summary.second_epoch_finalizers.contains(m.finalizer))
                    .cloned(),
            );
        } else if tm_first == ts_first + 1 {
            // Our window starts one epoch later: our first bucket lines up with the peer's
            // second; our second bucket is entirely new to the peer.
            messages.extend(
                first
                    .values()
                    .filter(|m| !summary.second_epoch_finalizers.contains(m.finalizer))
                    .cloned(),
            );
            messages.extend(second.values().cloned());
        } else if ts_first == tm_first + 1 {
            // The peer's window starts one epoch later: our first bucket is behind everything
            // the peer tracks, and our second bucket lines up with the peer's first.
            messages.extend(
                second
                    .values()
                    .filter(|m| !summary.first_epoch_finalizers.contains(m.finalizer))
                    .cloned(),
            );
        } else if tm_first > ts_first + 1 {
            // Disjoint, with our window entirely newer: everything is new to the peer.
            messages.extend(window.all_messages().cloned());
        }
        // Disjoint with our window entirely older: nothing we hold can help the peer.

        messages
    }
}
