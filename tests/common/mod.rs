/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Test harness for the consensus engine.
//!
//! The harness wires the engine with a mock capability bundle: an in-memory key-value store, a
//! recording network stub, a hand-cranked clock, a deterministic "ledger" whose state transition
//! is a hash chain over the transactions, and deterministic stand-ins for the aggregate-signature
//! and VRF algebra. These use channels, hashmaps, and hashing to simulate their production
//! counterparts, and thus never leave any artifacts.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sha2::{Digest, Sha256};

use rondo::crypto::{
    AggregateScheme, AggregateSecretBytes, Keypair, VrfScheme, VrfSecretBytes,
};
use rondo::engine::{
    BlockPayload, Consensus, ConsensusContext, ExecutionFailure, ExecutionOutcome,
    FinalizerCredentials, Ledger, Network, RoundClock,
};
use rondo::messages::ConsensusMessage;
use rondo::quorum::QuorumMessage;
use rondo::store::kv_store::{KVGet, KVStore, WriteBatch};
use rondo::timeout::TimeoutMessage;
use rondo::types::block::{BakedBlock, SignedBlock, Transaction};
use rondo::types::certificates::{
    FinalizationEntry, FinalizerRounds, QuorumCertificate, SuccessorProof, TimeoutCertificate,
};
use rondo::types::committee::{FinalizationCommittee, FinalizerInfo};
use rondo::types::data_types::*;
use rondo::types::genesis::GenesisConfiguration;

/* ↓↓↓ In-memory key-value store ↓↓↓ */

/// An in-memory implementation of [`KVStore`]. Clones share the same map, so a "restarted"
/// engine opened over a clone sees everything the previous engine persisted.
#[derive(Clone)]
pub struct MemKV(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

impl MemKV {
    pub fn new() -> MemKV {
        MemKV(Arc::new(Mutex::new(HashMap::new())))
    }
}

impl KVStore for MemKV {
    type WriteBatch = MemWriteBatch;
    type Snapshot<'a> = MemKVSnapshot<'a>;

    fn write(&mut self, wb: Self::WriteBatch) {
        let mut map = self.0.lock().unwrap();
        for (key, value) in wb.insertions {
            map.insert(key, value);
        }
        for key in wb.deletions {
            map.remove(&key);
        }
    }

    fn clear(&mut self) {
        self.0.lock().unwrap().clear();
    }

    fn snapshot<'b>(&'b self) -> MemKVSnapshot<'b> {
        MemKVSnapshot(self.0.lock().unwrap())
    }
}

impl KVGet for MemKV {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }
}

pub struct MemWriteBatch {
    insertions: HashMap<Vec<u8>, Vec<u8>>,
    deletions: HashSet<Vec<u8>>,
}

impl WriteBatch for MemWriteBatch {
    fn new() -> Self {
        MemWriteBatch {
            insertions: HashMap::new(),
            deletions: HashSet::new(),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.deletions.remove(key);
        self.insertions.insert(key.to_vec(), value.to_vec());
    }

    fn delete(&mut self, key: &[u8]) {
        self.insertions.remove(key);
        self.deletions.insert(key.to_vec());
    }
}

pub struct MemKVSnapshot<'a>(MutexGuard<'a, HashMap<Vec<u8>, Vec<u8>>>);

impl KVGet for MemKVSnapshot<'_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.get(key).cloned()
    }
}

/* ↓↓↓ Network stub ↓↓↓ */

/// A [`Network`] that records every broadcast message.
#[derive(Clone)]
pub struct NetworkStub(Arc<Mutex<Vec<ConsensusMessage>>>);

impl NetworkStub {
    pub fn new() -> NetworkStub {
        NetworkStub(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn broadcasts(&self) -> Vec<ConsensusMessage> {
        self.0.lock().unwrap().clone()
    }
}

impl Network for NetworkStub {
    fn broadcast(&mut self, message: ConsensusMessage) {
        self.0.lock().unwrap().push(message);
    }
}

/* ↓↓↓ Hand-cranked clock ↓↓↓ */

struct ClockState {
    now: u64,
    armed: Option<Duration>,
}

/// A [`RoundClock`] whose time only moves when the test moves it, and which records the last
/// armed timer duration.
#[derive(Clone)]
pub struct TestClock(Arc<Mutex<ClockState>>);

impl TestClock {
    pub fn at(now_millis: u64) -> TestClock {
        TestClock(Arc::new(Mutex::new(ClockState {
            now: now_millis,
            armed: None,
        })))
    }

    pub fn set(&self, now_millis: u64) {
        self.0.lock().unwrap().now = now_millis;
    }

    pub fn armed(&self) -> Option<Duration> {
        self.0.lock().unwrap().armed
    }
}

impl RoundClock for TestClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.0.lock().unwrap().now)
    }

    fn reset_timer(&mut self, duration: Duration) {
        self.0.lock().unwrap().armed = Some(duration);
    }
}

/* ↓↓↓ Deterministic ledger ↓↓↓ */

/// A [`Ledger`] whose state transition is a hash chain: the state after a block is the hash of
/// the parent state and the transaction bytes.
#[derive(Clone)]
pub struct TestLedger {
    committee: FinalizationCommittee,
    pub epoch_transition_due: bool,
}

impl TestLedger {
    pub fn new(committee: FinalizationCommittee) -> TestLedger {
        TestLedger {
            committee,
            epoch_transition_due: false,
        }
    }
}

/// The harness' state transition function; block builders use the same rule so claimed and
/// computed hashes agree.
pub fn transition(parent_state: StateHash, transactions: &[Transaction]) -> ExecutionOutcome {
    let mut hasher = Sha256::new();
    hasher.update(parent_state.bytes());
    for transaction in transactions {
        hasher.update(transaction.bytes());
    }
    let state_hash = StateHash::new(hasher.finalize().into());

    let mut hasher = Sha256::new();
    hasher.update(state_hash.bytes());
    hasher.update(b"outcomes");
    ExecutionOutcome {
        state_hash,
        outcomes_hash: StateHash::new(hasher.finalize().into()),
    }
}

impl Ledger for TestLedger {
    fn execute_block(
        &mut self,
        parent_state: StateHash,
        block: &SignedBlock,
    ) -> Result<ExecutionOutcome, ExecutionFailure> {
        Ok(transition(parent_state, &block.block.transactions))
    }

    fn produce_payload(
        &mut self,
        parent_state: StateHash,
        _round: Round,
        _timestamp: Timestamp,
    ) -> BlockPayload {
        let outcome = transition(parent_state, &[]);
        BlockPayload {
            transactions: Vec::new(),
            state_hash: outcome.state_hash,
            outcomes_hash: outcome.outcomes_hash,
        }
    }

    fn committee_for(&self, _epoch: Epoch) -> Option<FinalizationCommittee> {
        Some(self.committee.clone())
    }

    fn epoch_transition_due(&self, _epoch: Epoch, _state: StateHash) -> bool {
        self.epoch_transition_due
    }
}

/* ↓↓↓ Deterministic signature and VRF algebra ↓↓↓ */

fn digest(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn expand48(seed: [u8; 32]) -> [u8; 48] {
    let tail = digest(&[&seed, b"x"]);
    let mut out = [0u8; 48];
    out[..32].copy_from_slice(&seed);
    out[32..].copy_from_slice(&tail[..16]);
    out
}

fn expand80(seed: [u8; 32]) -> [u8; 80] {
    let tail = digest(&[&seed, b"y"]);
    let mut out = [0u8; 80];
    out[..32].copy_from_slice(&seed);
    out[32..64].copy_from_slice(&tail);
    out[64..].copy_from_slice(&seed[..16]);
    out
}

/// An [`AggregateScheme`] where a signature is a hash of the secret and the message, and
/// aggregation is XOR. Public keys are the secret repeated, so verification can recompute every
/// constituent signature.
#[derive(Clone)]
pub struct MockAggregate;

/// Derive the public aggregate key the mock scheme associates with `secret`.
pub fn mock_aggregate_key(secret: &AggregateSecretBytes) -> AggregateKeyBytes {
    let bytes = secret.bytes();
    let mut out = [0u8; 96];
    out[..32].copy_from_slice(&bytes);
    out[32..64].copy_from_slice(&bytes);
    out[64..].copy_from_slice(&bytes);
    AggregateKeyBytes::new(out)
}

fn xor48(left: [u8; 48], right: [u8; 48]) -> [u8; 48] {
    let mut out = [0u8; 48];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = left[i] ^ right[i];
    }
    out
}

impl AggregateScheme for MockAggregate {
    fn sign(&self, secret: &AggregateSecretBytes, message: &[u8]) -> AggregateSignatureBytes {
        AggregateSignatureBytes::new(expand48(digest(&[&secret.bytes(), message])))
    }

    fn empty(&self) -> AggregateSignatureBytes {
        AggregateSignatureBytes::new([0u8; 48])
    }

    fn combine(
        &self,
        left: &AggregateSignatureBytes,
        right: &AggregateSignatureBytes,
    ) -> AggregateSignatureBytes {
        AggregateSignatureBytes::new(xor48(left.bytes(), right.bytes()))
    }

    fn verify_aggregate(
        &self,
        groups: &[(Vec<AggregateKeyBytes>, Vec<u8>)],
        signature: &AggregateSignatureBytes,
    ) -> bool {
        let mut expected = [0u8; 48];
        for (keys, message) in groups {
            for key in keys {
                let mut secret = [0u8; 32];
                secret.copy_from_slice(&key.bytes()[..32]);
                expected = xor48(expected, expand48(digest(&[&secret, message])));
            }
        }
        expected == signature.bytes()
    }
}

/// A [`VrfScheme`] where proofs are hashes over the public key and the inputs, and every
/// committee member wins every round's lottery.
#[derive(Clone)]
pub struct MockVrf;

fn leader_proof(key: &[u8; 32], nonce: &VrfOutput, round: Round) -> VrfProofBytes {
    VrfProofBytes::new(expand80(digest(&[
        b"leader",
        key,
        &nonce.bytes(),
        &round.int().to_be_bytes(),
    ])))
}

fn block_nonce_parts(key: &[u8; 32], nonce: &VrfOutput, round: Round) -> (VrfOutput, VrfProofBytes) {
    let output = digest(&[b"nonce", key, &nonce.bytes(), &round.int().to_be_bytes()]);
    let proof = expand80(digest(&[b"nonce-proof", &output]));
    (VrfOutput::new(output), VrfProofBytes::new(proof))
}

impl VrfScheme for MockVrf {
    fn verify_leader(
        &self,
        nonce: &VrfOutput,
        round: Round,
        key: &VrfKeyBytes,
        _weight: Weight,
        _total: TotalWeight,
        proof: &VrfProofBytes,
    ) -> bool {
        *proof == leader_proof(&key.bytes(), nonce, round)
    }

    fn verify_block_nonce(
        &self,
        block_nonce: &VrfOutput,
        nonce: &VrfOutput,
        round: Round,
        key: &VrfKeyBytes,
        proof: &VrfProofBytes,
    ) -> bool {
        let (expected_nonce, expected_proof) = block_nonce_parts(&key.bytes(), nonce, round);
        *block_nonce == expected_nonce && *proof == expected_proof
    }

    fn try_win_leadership(
        &self,
        secret: &VrfSecretBytes,
        nonce: &VrfOutput,
        round: Round,
        _weight: Weight,
        _total: TotalWeight,
    ) -> Option<VrfProofBytes> {
        // The mock key is the secret itself.
        Some(leader_proof(&secret.bytes(), nonce, round))
    }

    fn prove_block_nonce(
        &self,
        secret: &VrfSecretBytes,
        nonce: &VrfOutput,
        round: Round,
    ) -> (VrfOutput, VrfProofBytes) {
        block_nonce_parts(&secret.bytes(), nonce, round)
    }

    fn derive_epoch_nonce(
        &self,
        previous: &VrfOutput,
        contribution: &VrfOutput,
        epoch: Epoch,
    ) -> VrfOutput {
        VrfOutput::new(digest(&[
            &previous.bytes(),
            &contribution.bytes(),
            &epoch.int().to_be_bytes(),
        ]))
    }
}

/* ↓↓↓ The capability bundle and chain fixture ↓↓↓ */

pub struct TestContext;

impl ConsensusContext for TestContext {
    type Store = MemKV;
    type Network = NetworkStub;
    type Ledger = TestLedger;
    type Clock = TestClock;
    type Aggregate = MockAggregate;
    type Vrf = MockVrf;
}

/// A chain fixture: the genesis configuration and the credentials of every committee member.
pub struct TestChain {
    pub genesis: GenesisConfiguration,
    pub credentials: Vec<FinalizerCredentials>,
}

/// A running engine together with the handles the test keeps.
pub struct Node {
    pub engine: Consensus<TestContext>,
    pub network: NetworkStub,
    pub clock: TestClock,
    pub store: MemKV,
}

impl TestChain {
    /// Create a chain with `n` committee members of weight 1 each.
    pub fn new(n: usize) -> TestChain {
        let credentials: Vec<FinalizerCredentials> = (0..n)
            .map(|i| {
                let seed = digest(&[b"seed", &(i as u64).to_be_bytes()]);
                FinalizerCredentials {
                    baker: BakerId::new(i as u64),
                    keypair: Keypair::from_seed(seed),
                    aggregate_secret: AggregateSecretBytes::new(digest(&[b"agg", &seed])),
                    vrf_secret: VrfSecretBytes::new(digest(&[b"vrf", &seed])),
                }
            })
            .collect();

        let members = credentials
            .iter()
            .map(|credentials| FinalizerInfo {
                index: FinalizerIndex::new(0),
                baker: credentials.baker,
                weight: Weight::new(1),
                signing_key: credentials.keypair.public(),
                aggregate_key: mock_aggregate_key(&credentials.aggregate_secret),
                vrf_key: VrfKeyBytes::new(credentials.vrf_secret.bytes()),
            })
            .collect();

        let genesis = GenesisConfiguration {
            genesis_hash: BlockHash::new(digest(&[b"genesis"])),
            genesis_state_hash: StateHash::new(digest(&[b"state0"])),
            signature_threshold: Ratio::new(2, 3),
            base_timeout: TimeoutDuration::new(10_000),
            timeout_increase: Ratio::new(3, 2),
            early_block_threshold: TimeoutDuration::new(30_000),
            leadership_nonce: VrfOutput::new(digest(&[b"nonce0"])),
            committee: FinalizationCommittee::new(members),
            protocol_version: 7,
            genesis_index: 0,
        };

        TestChain {
            genesis,
            credentials,
        }
    }

    /// Start an engine. `local` selects which member's credentials it runs with, if any.
    pub fn node(&self, local: Option<usize>) -> Node {
        self.node_over(MemKV::new(), local)
    }

    /// Start an engine over an existing store, e.g. to simulate a restart.
    pub fn node_over(&self, store: MemKV, local: Option<usize>) -> Node {
        let network = NetworkStub::new();
        let clock = TestClock::at(1_000_000);
        let engine = Consensus::new(
            self.genesis.clone(),
            store.clone(),
            network.clone(),
            TestLedger::new(self.genesis.committee.clone()),
            clock.clone(),
            MockAggregate,
            MockVrf,
            local.map(|i| self.credentials[i].clone()),
            None,
        )
        .expect("engine construction over a fresh or recovered store succeeds");
        Node {
            engine,
            network,
            clock,
            store,
        }
    }

    /* ↓↓↓ Artifact builders ↓↓↓ */

    /// Build a quorum certificate for `block` signed by `signers`.
    pub fn make_qc(
        &self,
        block: BlockHash,
        round: Round,
        epoch: Epoch,
        signers: &[usize],
    ) -> QuorumCertificate {
        let scheme = MockAggregate;
        let message = rondo::crypto::quorum_signing_bytes(
            self.genesis.genesis_hash,
            block,
            round,
            epoch,
        );
        let mut signature = scheme.empty();
        let mut signatories = FinalizerSet::new();
        for signer in signers {
            signature = scheme.combine(
                &signature,
                &scheme.sign(&self.credentials[*signer].aggregate_secret, &message),
            );
            signatories.insert(FinalizerIndex::new(*signer as u32));
        }
        QuorumCertificate {
            block,
            round,
            epoch,
            aggregate_signature: signature,
            signatories,
        }
    }

    /// Build a timeout certificate for `round` whose signers all witnessed the quorum round
    /// `qc_round` in epoch 0.
    pub fn make_tc(&self, round: Round, qc_round: Round, signers: &[usize]) -> TimeoutCertificate {
        let scheme = MockAggregate;
        let message = rondo::crypto::timeout_signing_bytes(
            self.genesis.genesis_hash,
            round,
            qc_round,
            Epoch::genesis(),
        );
        let mut signature = scheme.empty();
        let mut signatories = FinalizerSet::new();
        for signer in signers {
            signature = scheme.combine(
                &signature,
                &scheme.sign(&self.credentials[*signer].aggregate_secret, &message),
            );
            signatories.insert(FinalizerIndex::new(*signer as u32));
        }
        let mut first_epoch_rounds = FinalizerRounds::new();
        first_epoch_rounds.insert(qc_round, signatories);
        TimeoutCertificate {
            round,
            min_epoch: Epoch::genesis(),
            first_epoch_rounds,
            second_epoch_rounds: FinalizerRounds::new(),
            aggregate_signature: signature,
        }
    }

    /// Build the finalization entry pairing `finalized_qc` and `successor_qc`.
    pub fn make_entry(
        &self,
        finalized_qc: QuorumCertificate,
        successor_qc: QuorumCertificate,
    ) -> FinalizationEntry {
        let proof = digest(&[&finalized_qc.block.bytes(), &successor_qc.block.bytes()]);
        FinalizationEntry {
            finalized_qc,
            successor_qc,
            successor_proof: SuccessorProof::new(proof),
        }
    }

    /// Build and sign a block.
    #[allow(clippy::too_many_arguments)]
    pub fn make_block(
        &self,
        baker: usize,
        round: Round,
        epoch: Epoch,
        parent: BlockHash,
        parent_state: StateHash,
        justify: QuorumCertificate,
        timeout_certificate: Option<TimeoutCertificate>,
        finalization_entry: Option<FinalizationEntry>,
        leadership_nonce: VrfOutput,
    ) -> SignedBlock {
        let credentials = &self.credentials[baker];
        let vrf_key = credentials.vrf_secret.bytes();
        let (block_nonce, nonce_proof) = block_nonce_parts(&vrf_key, &leadership_nonce, round);
        let transactions = vec![Transaction::new(round.int().to_be_bytes().to_vec())];
        let outcome = transition(parent_state, &transactions);

        let body = BakedBlock {
            round,
            epoch,
            timestamp: Timestamp::new(round.int() * 1_000),
            baker: credentials.baker,
            baker_key: credentials.keypair.public_bytes(),
            block_nonce,
            nonce_proof,
            leader_proof: leader_proof(&vrf_key, &leadership_nonce, round),
            parent,
            justify,
            timeout_certificate,
            finalization_entry,
            transactions,
            state_hash: outcome.state_hash,
            outcomes_hash: outcome.outcomes_hash,
        };
        let hash = body.hash();
        let signature = credentials.keypair.sign(&hash.bytes());
        SignedBlock::new(body, signature)
    }

    /// Build a quorum message from `signer` for `block`.
    pub fn make_quorum_message(
        &self,
        signer: usize,
        block: BlockHash,
        round: Round,
        epoch: Epoch,
    ) -> QuorumMessage {
        let message = rondo::crypto::quorum_signing_bytes(
            self.genesis.genesis_hash,
            block,
            round,
            epoch,
        );
        QuorumMessage {
            genesis: self.genesis.genesis_hash,
            block,
            round,
            epoch,
            finalizer: FinalizerIndex::new(signer as u32),
            signature: MockAggregate.sign(&self.credentials[signer].aggregate_secret, &message),
        }
    }

    /// Build a timeout message from `signer` for `round`, carrying `quorum_certificate` as its
    /// highest known certificate.
    pub fn make_timeout_message(
        &self,
        signer: usize,
        round: Round,
        epoch: Epoch,
        quorum_certificate: QuorumCertificate,
    ) -> TimeoutMessage {
        let credentials = &self.credentials[signer];
        let payload = rondo::crypto::timeout_signing_bytes(
            self.genesis.genesis_hash,
            round,
            quorum_certificate.round,
            epoch,
        );
        let envelope = rondo::crypto::timeout_envelope_bytes(
            self.genesis.genesis_hash,
            round,
            epoch,
            quorum_certificate.block,
        );
        TimeoutMessage {
            genesis: self.genesis.genesis_hash,
            round,
            epoch,
            finalizer: FinalizerIndex::new(signer as u32),
            aggregate_signature: MockAggregate.sign(&credentials.aggregate_secret, &payload),
            envelope_signature: credentials.keypair.sign(&envelope),
            quorum_certificate,
        }
    }
}
