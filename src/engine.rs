/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus engine: the single-threaded context owning all consensus state.
//!
//! # Capability bundle
//!
//! The engine composes its external collaborators (persistence, multicast, execution, timekeeping
//! and the signature/VRF algebra) as a bundle of traits collected in [`ConsensusContext`]. The
//! whole core is generic over the bundle and concrete implementations are selected at wiring
//! time; tests wire in-memory stores, channel networks and deterministic schemes.
//!
//! # Concurrency
//!
//! A [`Consensus`] value is a single logical execution context: all operations that mutate tree
//! state or round status are its `&mut self` methods, so the borrow checker enforces the
//! one-at-a-time delivery of external inputs. Cryptographic verification is pure and could be
//! offloaded, as long as results re-enter through these methods.
//!
//! # Lifecycle
//!
//! Construct with [`Consensus::new`], which opens (or seeds) the store, recovers the persisted
//! round status, and arms the round timer. Tear down with [`Consensus::close`], which flushes the
//! round status. [`Consensus::stop`] puts the engine in the shut-down state in which it answers
//! queries but processes no further messages.

use std::collections::BTreeMap;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::{AggregateScheme, AggregateSecretBytes, Keypair, VrfScheme, VrfSecretBytes};
use crate::events::Event;
use crate::finality::FatalConsensusError;
use crate::messages::ConsensusMessage;
use crate::quorum::QuorumPool;
use crate::round_status::RoundStatus;
use crate::store::export::{self, Section};
use crate::store::kv_store::{KVGet, KVStore, WriteBatch};
use crate::timeout::TimeoutMessages;
use crate::tree::{BlockPointer, TreeState};
use crate::types::block::{SignedBlock, Transaction};
use crate::types::certificates::{FinalizationEntry, QuorumCertificate};
use crate::types::committee::{CommitteeState, FinalizationCommittee};
use crate::types::data_types::{
    BakerId, BlockHeight, Epoch, Round, StateHash, Timestamp, VrfOutput,
};
use crate::types::genesis::GenesisConfiguration;

/// Multicast capability: how the engine disseminates the messages it originates.
///
/// Peer-to-peer topology, relaying of *received* messages, and catch-up response delivery are the
/// embedder's concern; the engine only ever broadcasts.
pub trait Network: Send + 'static {
    /// Broadcast `message` to all peers.
    fn broadcast(&mut self, message: ConsensusMessage);
}

/// Timekeeping capability: the engine's clock and the per-round timer.
///
/// The timer is a single scheduled deadline: `reset_timer` replaces any earlier deadline. When it
/// expires, the embedder must enqueue a call to
/// [`trigger_timeout`](crate::engine::Consensus::trigger_timeout) into the engine's context.
pub trait RoundClock: Send + 'static {
    /// Get the current time.
    fn now(&self) -> Timestamp;

    /// Arm (or re-arm) the round timer to fire after `duration`.
    fn reset_timer(&mut self, duration: Duration);
}

/// The result of executing a block's transactions against its parent state.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Hash of the resulting chain state.
    pub state_hash: StateHash,

    /// Digest of the transaction outcomes.
    pub outcomes_hash: StateHash,
}

/// Why block execution failed. Execution is not retried; a failed block is dead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// A transaction in the block cannot be applied.
    InvalidTransaction,

    /// The parent state is not available to execute against.
    MissingParentState,
}

/// The material a leader gets from the ledger when producing a block.
pub struct BlockPayload {
    /// The transactions to include.
    pub transactions: Vec<Transaction>,

    /// The state hash resulting from executing them.
    pub state_hash: StateHash,

    /// The digest of their outcomes.
    pub outcomes_hash: StateHash,
}

/// Execution capability: the opaque state-transition function and the committee schedule.
///
/// This is the seam to the transaction runtime and account storage, which are external
/// collaborators: consensus only ever sees state hashes and committees.
pub trait Ledger: Send + 'static {
    /// Execute `block` against `parent_state`, returning the resulting hashes.
    fn execute_block(
        &mut self,
        parent_state: StateHash,
        block: &SignedBlock,
    ) -> Result<ExecutionOutcome, ExecutionFailure>;

    /// Select transactions and compute the resulting hashes for a block this node is about to
    /// produce on top of `parent_state`.
    fn produce_payload(
        &mut self,
        parent_state: StateHash,
        round: Round,
        timestamp: Timestamp,
    ) -> BlockPayload;

    /// Get the finalization committee of `epoch`, if the ledger can compute it.
    fn committee_for(&self, epoch: Epoch) -> Option<FinalizationCommittee>;

    /// Check whether `epoch` has run its course at `state`, so that the next produced block
    /// should carry the epoch transition.
    fn epoch_transition_due(&self, epoch: Epoch, state: StateHash) -> bool;
}

/// The secrets a committee member runs with. Absent on passive nodes.
#[derive(Clone)]
pub struct FinalizerCredentials {
    /// The baker identity the secrets belong to.
    pub baker: BakerId,

    /// Ed25519 keypair signing blocks and message envelopes.
    pub keypair: Keypair,

    /// Secret key for aggregate (BLS) signatures.
    pub aggregate_secret: AggregateSecretBytes,

    /// Secret key for VRF proofs.
    pub vrf_secret: VrfSecretBytes,
}

/// The capability bundle the consensus core is generic over.
pub trait ConsensusContext {
    /// The persistent store.
    type Store: KVStore;

    /// The multicast network.
    type Network: Network;

    /// The execution environment.
    type Ledger: Ledger;

    /// The clock and round timer.
    type Clock: RoundClock;

    /// The aggregate-signature algebra.
    type Aggregate: AggregateScheme;

    /// The VRF algebra.
    type Vrf: VrfScheme;
}

/// A single consensus participant: the process-wide singleton owning the tree state handle for
/// its lifetime.
pub struct Consensus<Ctx: ConsensusContext> {
    pub(crate) genesis: GenesisConfiguration,
    pub(crate) store: Ctx::Store,
    pub(crate) network: Ctx::Network,
    pub(crate) ledger: Ctx::Ledger,
    pub(crate) clock: Ctx::Clock,
    pub(crate) aggregate: Ctx::Aggregate,
    pub(crate) vrf: Ctx::Vrf,
    pub(crate) credentials: Option<FinalizerCredentials>,
    pub(crate) tree: TreeState,
    pub(crate) round_status: RoundStatus,
    pub(crate) committees: CommitteeState,
    pub(crate) quorum_pool: QuorumPool,
    pub(crate) timeout_pool: Option<TimeoutMessages>,
    pub(crate) round_witnesses: BTreeMap<Round, Epoch>,
    pub(crate) latest_finalization_entry: Option<FinalizationEntry>,
    pub(crate) last_baked_round: Option<Round>,
    pub(crate) event_publisher: Option<Sender<Event>>,
    pub(crate) shutdown: bool,
}

impl<Ctx: ConsensusContext> Consensus<Ctx> {
    /// Open a consensus instance over `store`.
    ///
    /// A fresh store is seeded with the genesis configuration and the initial round status. A
    /// store carrying state from an earlier run is recovered: the persisted round status is
    /// reloaded verbatim (so a crash between persisting and acting cannot roll the round back),
    /// and the tree restarts from the last finalized block. If the local identity is a finalizer,
    /// the round timer is armed with the persisted timeout duration.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        genesis: GenesisConfiguration,
        mut store: Ctx::Store,
        network: Ctx::Network,
        ledger: Ctx::Ledger,
        mut clock: Ctx::Clock,
        aggregate: Ctx::Aggregate,
        vrf: Ctx::Vrf,
        credentials: Option<FinalizerCredentials>,
        event_publisher: Option<Sender<Event>>,
    ) -> Result<Consensus<Ctx>, FatalConsensusError> {
        // 1. Seed or check the persisted genesis configuration.
        let round_status = match store.genesis_configuration()? {
            None => {
                let round_status = RoundStatus::initial(&genesis);
                let mut batch = <Ctx::Store as KVStore>::WriteBatch::new();
                batch.set_genesis_configuration(&genesis);
                batch.set_round_status(&round_status);
                store.write(batch);
                round_status
            }
            Some(stored) => {
                if stored.genesis_hash != genesis.genesis_hash {
                    return Err(FatalConsensusError::GenesisMismatch {
                        stored: stored.genesis_hash,
                        configured: genesis.genesis_hash,
                    });
                }
                store
                    .round_status()?
                    .unwrap_or_else(|| RoundStatus::initial(&genesis))
            }
        };

        // 2. Recover the last finalized block: the successor chain recorded by the latest
        //    finalization entry, or the genesis block on a fresh chain.
        let latest_finalization_entry = store.latest_finalization_entry()?;
        let last_finalized = match &latest_finalization_entry {
            None => Arc::new(BlockPointer::genesis(
                genesis.genesis_hash,
                genesis.genesis_state_hash,
                Timestamp::new(0),
            )),
            Some(entry) => {
                let block = store
                    .finalized_block_by_hash(&entry.finalized_qc.block)?
                    .ok_or(FatalConsensusError::InconsistentFinalization {
                        description: "latest finalization entry names an unstored block",
                    })?;
                let height = store
                    .height_by_hash(&block.hash)?
                    .expect("the block was just resolved through this index");
                Arc::new(BlockPointer {
                    hash: block.hash,
                    height,
                    round: block.round(),
                    epoch: block.epoch(),
                    timestamp: block.timestamp(),
                    state_hash: block.block.state_hash,
                    parent: block.parent(),
                    block: Some(Arc::new(block)),
                    arrive_time: Timestamp::new(0),
                })
            }
        };

        // 3. Resolve the committees of the recovered epoch.
        let current_epoch = round_status.current_epoch();
        let current_committee = if current_epoch == Epoch::genesis() {
            genesis.committee.clone()
        } else {
            ledger
                .committee_for(current_epoch)
                .ok_or(FatalConsensusError::MissingCommittee {
                    epoch: current_epoch,
                })?
        };
        let previous_committee = if current_epoch == Epoch::genesis() {
            None
        } else if current_epoch == Epoch::genesis() + 1 {
            Some(genesis.committee.clone())
        } else {
            ledger.committee_for(Epoch::new(current_epoch.int() - 1))
        };
        let committees = CommitteeState::new(current_epoch, current_committee, previous_committee);

        let current_round = round_status.current_round();
        let highest_certified = round_status.highest_certified().clone();
        let mut round_witnesses = BTreeMap::new();
        round_witnesses.insert(highest_certified.round, highest_certified.epoch);

        // 4. Arm the round timer before any message can arrive.
        let is_finalizer = credentials
            .as_ref()
            .is_some_and(|credentials| committees.current().contains_baker(credentials.baker));
        if is_finalizer {
            clock.reset_timer(round_status.current_timeout().as_duration());
        }

        Ok(Consensus {
            tree: TreeState::new(last_finalized),
            quorum_pool: QuorumPool::new(current_round),
            timeout_pool: None,
            round_witnesses,
            latest_finalization_entry,
            last_baked_round: None,
            genesis,
            store,
            network,
            ledger,
            clock,
            aggregate,
            vrf,
            credentials,
            round_status,
            committees,
            event_publisher,
            shutdown: false,
        })
    }

    /// Flush the round status and release the store. The matching teardown for
    /// [`new`](Self::new).
    pub fn close(mut self) {
        self.persist_round_status();
    }

    /// Put the engine in the shut-down state: queries keep working, but no further messages are
    /// processed and no blocks or votes are produced.
    pub fn stop(&mut self) {
        self.shutdown = true;
    }

    /// Check whether the engine has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Get the current round.
    pub fn current_round(&self) -> Round {
        self.round_status.current_round()
    }

    /// Get the current epoch.
    pub fn current_epoch(&self) -> Epoch {
        self.committees.current_epoch()
    }

    /// Get the last finalized block.
    pub fn last_finalized(&self) -> &Arc<BlockPointer> {
        self.tree.last_finalized()
    }

    /// Get the quorum certificate of the highest certified block.
    pub fn highest_certified(&self) -> &QuorumCertificate {
        self.round_status.highest_certified()
    }

    /// Get read access to the tree state.
    pub fn tree(&self) -> &TreeState {
        &self.tree
    }

    /// Get the persisted round status.
    pub fn round_status(&self) -> &RoundStatus {
        &self.round_status
    }

    /// Get the current time from the engine clock.
    pub(crate) fn clock_now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Get the leadership election nonce of the current epoch.
    pub(crate) fn leadership_nonce(&self) -> VrfOutput {
        self.round_status.leadership_nonce()
    }

    /// Check whether the local identity holds a seat in the current epoch's committee.
    pub(crate) fn is_local_finalizer(&self) -> bool {
        self.credentials
            .as_ref()
            .is_some_and(|credentials| self.committees.current().contains_baker(credentials.baker))
    }

    /// Export the finalized chain as one block database section (plus the latest finalization
    /// entry, if finality has advanced past genesis) to `out`.
    pub fn export_database(
        &self,
        out: &mut impl std::io::Write,
    ) -> Result<(), ExportDatabaseError> {
        let snapshot = self.store.snapshot();
        let mut blocks = Vec::new();
        let last_height = self.tree.last_finalized().height;
        let mut height = BlockHeight::new(1);
        while height.int() <= last_height.int() {
            let block = snapshot
                .finalized_block_at_height(height)?
                .ok_or(ExportDatabaseError::MissingBlock { height })?;
            blocks.push(block);
            height = height + 1;
        }

        let section = Section {
            genesis_index: self.genesis.genesis_index,
            protocol_version: self.genesis.protocol_version,
            genesis_hash: self.genesis.genesis_hash,
            first_block_height: BlockHeight::new(1),
            blocks,
            finalization_records: self.latest_finalization_entry.iter().cloned().collect(),
        };

        export::write_header(out)?;
        export::write_section(out, &section)?;
        Ok(())
    }
}

/// Enumerates the ways exporting the block database can fail. Export failures are reported to the
/// caller rather than treated as fatal: the engine's own state is untouched.
#[derive(Debug)]
pub enum ExportDatabaseError {
    /// Reading the finalized chain from the store failed.
    Store(crate::store::kv_store::KVGetError),

    /// The finalized chain has a hole below the last finalized block.
    MissingBlock { height: BlockHeight },

    /// Writing the output failed.
    Io(std::io::Error),
}

impl From<crate::store::kv_store::KVGetError> for ExportDatabaseError {
    fn from(value: crate::store::kv_store::KVGetError) -> Self {
        ExportDatabaseError::Store(value)
    }
}

impl From<std::io::Error> for ExportDatabaseError {
    fn from(value: std::io::Error) -> Self {
        ExportDatabaseError::Io(value)
    }
}
