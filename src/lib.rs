/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A round-based Byzantine fault tolerant finality engine.
//!
//! `rondo` drives an unbounded sequence of numbered rounds, each attempting to certify exactly
//! one block. Finalizers vote with aggregate signatures; a quorum of votes forms a
//! [`QuorumCertificate`](types::certificates::QuorumCertificate), two certificates on consecutive
//! rounds finalize a block, and a round whose leader fails is abandoned through a
//! [`TimeoutCertificate`](types::certificates::TimeoutCertificate). Committees rotate across
//! [epochs](types::data_types::Epoch), and lagging peers are brought up to date by the
//! [catch-up protocol](catchup).
//!
//! The engine is deliberately narrow: transaction execution, storage engines, networking, and the
//! signature/VRF algebra are external collaborators, consumed through the capability traits in
//! [`engine`], [`store::kv_store`] and [`crypto`]. What lives here is the consensus core: the
//! [tree of tentative blocks](tree), the [persisted round status](round_status), the
//! [quorum](quorum) and [timeout](timeout) vote pools, the [finality detector](finality), the
//! [block pipeline](block_processing), and [catch-up](catchup).

pub mod block_processing;

pub mod catchup;

pub mod crypto;

pub mod engine;

pub mod event_bus;

pub mod events;

pub mod finality;

pub mod logging;

pub mod messages;

pub mod quorum;

pub mod round_status;

pub mod store;

pub mod timeout;

pub mod tree;

pub mod types;

// Re-exports of the types an embedder touches first.
pub use engine::Consensus;
pub use messages::{ConsensusMessage, UpdateResult};
