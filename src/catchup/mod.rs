/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The catch-up protocol: bringing a peer up to a coherent view of the tree.
//!
//! Catch-up works over the [`CatchUpStatus`](messages::CatchUpStatus) digest. A node that
//! suspects a peer of being behind (or itself) exchanges digests; the node that is ahead streams
//! the missing blocks, finalized first and then branches height by height, and closes with
//! [terminal data](messages::CatchUpTerminalData) carrying the certificates and unaggregated
//! votes of the current round. The [server side](server) produces that stream lazily, pulled one
//! block at a time; the [client side](client) decides when catch-up is needed and applies a
//! received response.

pub mod client;

pub mod messages;

pub mod server;

use crate::engine::{Consensus, ConsensusContext};
use crate::types::data_types::FinalizerSet;

use messages::{CatchUpStatus, TimeoutSetSummary};

impl<Ctx: ConsensusContext> Consensus<Ctx> {
    /// Build this node's status digest.
    ///
    /// `include_branches` selects between the full summary (for requests) and the lightweight
    /// one (for status broadcasts).
    pub fn make_catch_up_status(&self, include_branches: bool) -> CatchUpStatus {
        let (leaves, branches) = if include_branches {
            let leaves: Vec<_> = self
                .tree
                .leaves()
                .into_iter()
                .map(|pointer| pointer.hash)
                .collect();
            let branches = self
                .tree
                .branches()
                .map(|pointer| pointer.hash)
                .filter(|hash| !leaves.contains(hash))
                .collect();
            (leaves, branches)
        } else {
            (Vec::new(), Vec::new())
        };

        let timeout_summary = self.timeout_pool.as_ref().map(|window| TimeoutSetSummary {
            first_epoch: window.first_epoch(),
            first_epoch_finalizers: window
                .first_epoch_timeouts()
                .keys()
                .copied()
                .collect::<FinalizerSet>(),
            second_epoch_finalizers: window
                .second_epoch_timeouts()
                .keys()
                .copied()
                .collect::<FinalizerSet>(),
        });

        CatchUpStatus {
            last_finalized_block: self.tree.last_finalized().hash,
            last_finalized_round: self.tree.last_finalized().round,
            leaves,
            branches,
            current_round: self.round_status.current_round(),
            current_epoch: self.committees.current_epoch(),
            quorum_signatories: self
                .quorum_pool
                .blocks_and_signatories()
                .map(|(block, set)| (*block, set.clone()))
                .collect(),
            timeout_summary,
        }
    }
}
