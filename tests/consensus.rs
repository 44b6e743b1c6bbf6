/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! End-to-end scenarios for the consensus engine: driving rounds through quorum certificates and
//! timeouts, finalization and pruning, catch-up between peers, and crash recovery of the round
//! status.
//!
//! Every test runs entirely on the mock capability bundle from [`common`]: no disk, no network,
//! no real cryptography.

mod common;

use common::{Node, TestChain};

use rondo::block_processing::ReceiveBlockResult;
use rondo::catchup::messages::CatchUpStatus;
use rondo::catchup::server::CatchUpStep;
use rondo::messages::ConsensusMessage;
use rondo::quorum::{QuorumMessage, ReceiveQuorumMessageResult};
use rondo::timeout::{ExecuteTimeoutMessageResult, ReceiveTimeoutMessageResult, TimeoutMessage};
use rondo::tree::{BlockStatus, RecentBlockStatus};
use rondo::types::block::SignedBlock;
use rondo::types::certificates::QuorumCertificate;
use rondo::types::data_types::*;

/// Deliver a quorum message end to end, panicking if it is not accepted.
fn deliver_quorum(node: &mut Node, message: QuorumMessage) {
    match node.engine.receive_quorum_message(message) {
        ReceiveQuorumMessageResult::Received(verified)
        | ReceiveQuorumMessageResult::ReceivedNoRelay(verified) => node
            .engine
            .process_quorum_message(verified, true)
            .expect("no fatal error processing a quorum message"),
        _ => panic!("quorum message unexpectedly not accepted"),
    }
}

/// Deliver a timeout message end to end, panicking if it is not accepted and executed.
fn deliver_timeout(node: &mut Node, message: TimeoutMessage) {
    match node.engine.receive_timeout_message(message) {
        ReceiveTimeoutMessageResult::Received(partially_verified) => {
            let result = node
                .engine
                .execute_timeout_message(partially_verified)
                .expect("no fatal error executing a timeout message");
            assert_eq!(result, ExecuteTimeoutMessageResult::Executed);
        }
        _ => panic!("timeout message unexpectedly not accepted"),
    }
}

/// Build the chain `genesis <- b1 <- b2 <- b3` on `node`, certifying rounds 1 and 2 with quorum
/// messages so that `b1` is finalized and the node sits in round 3 with `b3` alive.
fn grow_three_block_chain(chain: &TestChain, node: &mut Node) -> (SignedBlock, SignedBlock, SignedBlock) {
    let genesis = &chain.genesis;
    let nonce = genesis.leadership_nonce;

    let b1 = chain.make_block(
        0,
        Round::new(1),
        Epoch::new(0),
        genesis.genesis_hash,
        genesis.genesis_state_hash,
        QuorumCertificate::genesis(genesis.genesis_hash),
        None,
        None,
        nonce,
    );
    assert_eq!(
        node.engine.receive_block(b1.clone()).unwrap(),
        ReceiveBlockResult::Success
    );
    for signer in [0, 1] {
        deliver_quorum(
            node,
            chain.make_quorum_message(signer, b1.hash, Round::new(1), Epoch::new(0)),
        );
    }
    assert_eq!(node.engine.current_round(), Round::new(2));

    let b1_state = common::transition(genesis.genesis_state_hash, &b1.block.transactions);
    let b2 = chain.make_block(
        1,
        Round::new(2),
        Epoch::new(0),
        b1.hash,
        b1_state.state_hash,
        chain.make_qc(b1.hash, Round::new(1), Epoch::new(0), &[0, 1]),
        None,
        None,
        nonce,
    );
    assert_eq!(
        node.engine.receive_block(b2.clone()).unwrap(),
        ReceiveBlockResult::Success
    );
    for signer in [0, 1] {
        deliver_quorum(
            node,
            chain.make_quorum_message(signer, b2.hash, Round::new(2), Epoch::new(0)),
        );
    }
    assert_eq!(node.engine.current_round(), Round::new(3));
    assert_eq!(node.engine.last_finalized().hash, b1.hash);

    let b2_state = common::transition(b1_state.state_hash, &b2.block.transactions);
    let b3 = chain.make_block(
        2,
        Round::new(3),
        Epoch::new(0),
        b2.hash,
        b2_state.state_hash,
        chain.make_qc(b2.hash, Round::new(2), Epoch::new(0), &[0, 1]),
        None,
        None,
        nonce,
    );
    assert_eq!(
        node.engine.receive_block(b3.clone()).unwrap(),
        ReceiveBlockResult::Success
    );

    (b1, b2, b3)
}

/// The status digest of a peer that has `last_finalized` finalized and nothing else.
fn bare_peer_status(last_finalized: BlockHash, round: u64, current_round: u64) -> CatchUpStatus {
    CatchUpStatus {
        last_finalized_block: last_finalized,
        last_finalized_round: Round::new(round),
        leaves: Vec::new(),
        branches: Vec::new(),
        current_round: Round::new(current_round),
        current_epoch: Epoch::new(0),
        quorum_signatories: Vec::new(),
        timeout_summary: None,
    }
}

/// Drain a catch-up stream into the blocks and terminal data it produces.
fn drain_catch_up(node: &Node, status: CatchUpStatus) -> (Vec<SignedBlock>, rondo::catchup::messages::CatchUpTerminalData) {
    let mut stream = node
        .engine
        .handle_catch_up_request(status)
        .expect("catch-up request over intact state");
    let mut blocks = Vec::new();
    loop {
        match stream.next().expect("catch-up stream over intact state") {
            CatchUpStep::Block(block, rest) => {
                blocks.push(block);
                stream = rest;
            }
            CatchUpStep::Done(terminal) => return (blocks, terminal),
        }
    }
}

#[test]
fn basic_catch_up() {
    let chain = TestChain::new(3);
    let mut node = chain.node(None);
    let (b1, b2, b3) = grow_three_block_chain(&chain, &mut node);

    // Certify round 3, finalizing b2 and entering round 4.
    for signer in [0, 1] {
        deliver_quorum(
            &mut node,
            chain.make_quorum_message(signer, b3.hash, Round::new(3), Epoch::new(0)),
        );
    }
    assert_eq!(node.engine.current_round(), Round::new(4));
    assert_eq!(node.engine.last_finalized().hash, b2.hash);

    // One lonely vote and one lonely timeout for round 4.
    deliver_quorum(
        &mut node,
        chain.make_quorum_message(0, b3.hash, Round::new(4), Epoch::new(0)),
    );
    deliver_timeout(
        &mut node,
        chain.make_timeout_message(
            0,
            Round::new(4),
            Epoch::new(0),
            chain.make_qc(b3.hash, Round::new(3), Epoch::new(0), &[0, 1]),
        ),
    );

    // A peer that has finalized b1 and sits in round 2 gets exactly [b2, b3] and the round-4
    // leftovers.
    let (blocks, terminal) = drain_catch_up(&node, bare_peer_status(b1.hash, 1, 2));
    let streamed: Vec<BlockHash> = blocks.iter().map(|block| block.hash).collect();
    assert_eq!(streamed, vec![b2.hash, b3.hash]);

    assert_eq!(terminal.quorum_certificates.len(), 1);
    assert_eq!(terminal.quorum_certificates[0].block, b3.hash);
    assert_eq!(terminal.quorum_certificates[0].round, Round::new(3));
    assert!(terminal.timeout_certificate.is_none());
    assert_eq!(terminal.quorum_messages.len(), 1);
    assert_eq!(
        terminal.quorum_messages[0].finalizer,
        FinalizerIndex::new(0)
    );
    assert_eq!(terminal.timeout_messages.len(), 1);
    assert_eq!(terminal.timeout_messages[0].round, Round::new(4));
}

#[test]
fn catch_up_is_a_contraction() {
    let chain = TestChain::new(3);
    let mut node = chain.node(None);
    let (_b1, _b2, b3) = grow_three_block_chain(&chain, &mut node);
    for signer in [0, 1] {
        deliver_quorum(
            &mut node,
            chain.make_quorum_message(signer, b3.hash, Round::new(3), Epoch::new(0)),
        );
    }
    deliver_quorum(
        &mut node,
        chain.make_quorum_message(0, b3.hash, Round::new(4), Epoch::new(0)),
    );
    deliver_timeout(
        &mut node,
        chain.make_timeout_message(
            0,
            Round::new(4),
            Epoch::new(0),
            chain.make_qc(b3.hash, Round::new(3), Epoch::new(0), &[0, 1]),
        ),
    );

    // A peer starting from scratch requests catch-up and applies the full response.
    let mut peer = chain.node(None);
    let (blocks, terminal) =
        drain_catch_up(&node, peer.engine.make_catch_up_status(true));
    let result = peer
        .engine
        .process_catch_up_response(blocks, Some(terminal))
        .expect("no fatal error applying a catch-up response");
    assert!(result.progress);

    // After applying the response, neither side considers the other ahead.
    assert_eq!(peer.engine.current_round(), node.engine.current_round());
    assert_eq!(
        peer.engine.last_finalized().hash,
        node.engine.last_finalized().hash
    );
    assert!(!peer
        .engine
        .is_catch_up_required(&node.engine.make_catch_up_status(true)));
    assert!(!node
        .engine
        .is_catch_up_required(&peer.engine.make_catch_up_status(true)));
}

#[test]
fn catch_up_across_epoch_transition() {
    let chain = TestChain::new(3);
    let mut node = chain.node(None);
    let genesis = &chain.genesis;
    let nonce = genesis.leadership_nonce;

    let b1 = chain.make_block(
        0,
        Round::new(1),
        Epoch::new(0),
        genesis.genesis_hash,
        genesis.genesis_state_hash,
        QuorumCertificate::genesis(genesis.genesis_hash),
        None,
        None,
        nonce,
    );
    let b1_state = common::transition(genesis.genesis_state_hash, &b1.block.transactions);
    let b2 = chain.make_block(
        1,
        Round::new(2),
        Epoch::new(0),
        b1.hash,
        b1_state.state_hash,
        chain.make_qc(b1.hash, Round::new(1), Epoch::new(0), &[0, 1]),
        None,
        None,
        nonce,
    );
    let b2_state = common::transition(b1_state.state_hash, &b2.block.transactions);

    // b3 opens epoch 1, carrying the finalization entry for b1.
    let entry = chain.make_entry(
        chain.make_qc(b1.hash, Round::new(1), Epoch::new(0), &[0, 1]),
        chain.make_qc(b2.hash, Round::new(2), Epoch::new(0), &[0, 1]),
    );
    let b3 = chain.make_block(
        2,
        Round::new(3),
        Epoch::new(1),
        b2.hash,
        b2_state.state_hash,
        chain.make_qc(b2.hash, Round::new(2), Epoch::new(0), &[0, 1]),
        None,
        Some(entry),
        nonce,
    );

    for block in [&b1, &b2, &b3] {
        assert_eq!(
            node.engine.receive_block(block.clone()).unwrap(),
            ReceiveBlockResult::Success
        );
    }
    assert_eq!(node.engine.current_epoch(), Epoch::new(1));
    assert_eq!(node.engine.current_round(), Round::new(3));
    assert_eq!(node.engine.last_finalized().hash, b1.hash);

    // Certify round 3 in the new epoch, then leave a vote and a timeout for round 4.
    for signer in [0, 1] {
        deliver_quorum(
            &mut node,
            chain.make_quorum_message(signer, b3.hash, Round::new(3), Epoch::new(1)),
        );
    }
    assert_eq!(node.engine.current_round(), Round::new(4));
    deliver_quorum(
        &mut node,
        chain.make_quorum_message(0, b3.hash, Round::new(4), Epoch::new(1)),
    );
    deliver_timeout(
        &mut node,
        chain.make_timeout_message(
            0,
            Round::new(4),
            Epoch::new(1),
            chain.make_qc(b3.hash, Round::new(3), Epoch::new(1), &[0, 1]),
        ),
    );

    let (blocks, terminal) = drain_catch_up(&node, bare_peer_status(b1.hash, 1, 2));
    let streamed: Vec<BlockHash> = blocks.iter().map(|block| block.hash).collect();
    assert_eq!(streamed, vec![b2.hash, b3.hash]);
    // The highest certificate is for b3; the certificate that finalized b1 sits in a different
    // round, so both are included.
    assert_eq!(terminal.quorum_certificates.len(), 2);
    assert_eq!(terminal.quorum_certificates[0].block, b3.hash);
    assert_eq!(terminal.quorum_certificates[1].block, b2.hash);
    assert_eq!(terminal.quorum_messages.len(), 1);
    assert_eq!(terminal.timeout_messages.len(), 1);
}

#[test]
fn consecutive_timeouts_advance_rounds() {
    let chain = TestChain::new(4);
    let mut node = chain.node(None);
    let genesis = &chain.genesis;
    let nonce = genesis.leadership_nonce;

    let b1 = chain.make_block(
        0,
        Round::new(1),
        Epoch::new(0),
        genesis.genesis_hash,
        genesis.genesis_state_hash,
        QuorumCertificate::genesis(genesis.genesis_hash),
        None,
        None,
        nonce,
    );
    assert_eq!(
        node.engine.receive_block(b1.clone()).unwrap(),
        ReceiveBlockResult::Success
    );
    for signer in [0, 1, 2] {
        deliver_quorum(
            &mut node,
            chain.make_quorum_message(signer, b1.hash, Round::new(1), Epoch::new(0)),
        );
    }
    let b1_state = common::transition(genesis.genesis_state_hash, &b1.block.transactions);
    let b2 = chain.make_block(
        1,
        Round::new(2),
        Epoch::new(0),
        b1.hash,
        b1_state.state_hash,
        chain.make_qc(b1.hash, Round::new(1), Epoch::new(0), &[0, 1, 2]),
        None,
        None,
        nonce,
    );
    assert_eq!(
        node.engine.receive_block(b2.clone()).unwrap(),
        ReceiveBlockResult::Success
    );
    for signer in [0, 1, 2] {
        deliver_quorum(
            &mut node,
            chain.make_quorum_message(signer, b2.hash, Round::new(2), Epoch::new(0)),
        );
    }
    assert_eq!(node.engine.current_round(), Round::new(3));

    let qc_b2 = chain.make_qc(b2.hash, Round::new(2), Epoch::new(0), &[0, 1, 2]);

    // Round 3 times out: the third signature (weight 3 of 4) forms the certificate.
    for signer in [0, 1, 2] {
        deliver_timeout(
            &mut node,
            chain.make_timeout_message(signer, Round::new(3), Epoch::new(0), qc_b2.clone()),
        );
    }
    assert_eq!(node.engine.current_round(), Round::new(4));
    let recorded = node
        .engine
        .round_status()
        .previous_round_timeout()
        .expect("the round advanced because of a timeout");
    assert_eq!(recorded.certificate.round, Round::new(3));
    assert_eq!(recorded.highest_qc.block, b2.hash);

    // Round 4 times out as well.
    for signer in [0, 1, 2] {
        deliver_timeout(
            &mut node,
            chain.make_timeout_message(signer, Round::new(4), Epoch::new(0), qc_b2.clone()),
        );
    }
    assert_eq!(node.engine.current_round(), Round::new(5));
    let recorded = node
        .engine
        .round_status()
        .previous_round_timeout()
        .expect("the round advanced because of a timeout");
    assert_eq!(recorded.certificate.round, Round::new(4));
}

#[test]
fn competing_branch_pruned_on_finalization() {
    let chain = TestChain::new(3);
    let mut node = chain.node(None);
    let (b1, b2, b3) = grow_three_block_chain(&chain, &mut node);

    // Round 3 times out instead of certifying b3.
    let qc_b2 = chain.make_qc(b2.hash, Round::new(2), Epoch::new(0), &[0, 1]);
    for signer in [0, 1] {
        deliver_timeout(
            &mut node,
            chain.make_timeout_message(signer, Round::new(3), Epoch::new(0), qc_b2.clone()),
        );
    }
    assert_eq!(node.engine.current_round(), Round::new(4));

    // b4 extends b2 in round 4, justifying the gap with the round-3 timeout certificate.
    let b1_state = common::transition(chain.genesis.genesis_state_hash, &b1.block.transactions);
    let b2_state = common::transition(b1_state.state_hash, &b2.block.transactions);
    let b4 = chain.make_block(
        0,
        Round::new(4),
        Epoch::new(0),
        b2.hash,
        b2_state.state_hash,
        qc_b2.clone(),
        Some(chain.make_tc(Round::new(3), Round::new(2), &[0, 1])),
        None,
        chain.genesis.leadership_nonce,
    );
    assert_eq!(
        node.engine.receive_block(b4.clone()).unwrap(),
        ReceiveBlockResult::Success
    );

    // b5 extends b4; certifying b5 finalizes b2 and b4 and kills the b3 branch.
    let b4_state = common::transition(b2_state.state_hash, &b4.block.transactions);
    let b5 = chain.make_block(
        1,
        Round::new(5),
        Epoch::new(0),
        b4.hash,
        b4_state.state_hash,
        chain.make_qc(b4.hash, Round::new(4), Epoch::new(0), &[0, 1]),
        None,
        None,
        chain.genesis.leadership_nonce,
    );
    assert_eq!(
        node.engine.receive_block(b5.clone()).unwrap(),
        ReceiveBlockResult::Success
    );
    for signer in [0, 1] {
        deliver_quorum(
            &mut node,
            chain.make_quorum_message(signer, b5.hash, Round::new(5), Epoch::new(0)),
        );
    }

    assert_eq!(node.engine.last_finalized().hash, b4.hash);
    assert!(matches!(
        node.engine.tree().get_recent_block_status(&b3.hash),
        RecentBlockStatus::Recent(BlockStatus::Dead)
    ));
    assert!(matches!(
        node.engine.tree().get_recent_block_status(&b2.hash),
        RecentBlockStatus::OldFinalized
    ));
}

#[test]
fn early_block_is_rejected_and_not_inserted() {
    let chain = TestChain::new(3);
    let mut node = chain.node(None);
    node.clock.set(0);

    // Round 40 gives the block a timestamp of 40s, past the 30s early-block threshold at time 0.
    let early = chain.make_block(
        0,
        Round::new(40),
        Epoch::new(0),
        chain.genesis.genesis_hash,
        chain.genesis.genesis_state_hash,
        QuorumCertificate::genesis(chain.genesis.genesis_hash),
        None,
        None,
        chain.genesis.leadership_nonce,
    );
    assert_eq!(
        node.engine.receive_block(early.clone()).unwrap(),
        ReceiveBlockResult::EarlyBlock
    );
    assert!(matches!(
        node.engine.tree().get_recent_block_status(&early.hash),
        RecentBlockStatus::Recent(BlockStatus::Unknown)
    ));
}

#[test]
fn round_status_survives_restart() {
    let chain = TestChain::new(3);
    let mut node = chain.node(Some(0));
    assert_eq!(node.clock.armed(), Some(std::time::Duration::from_millis(10_000)));

    let b1 = chain.make_block(
        1,
        Round::new(1),
        Epoch::new(0),
        chain.genesis.genesis_hash,
        chain.genesis.genesis_state_hash,
        QuorumCertificate::genesis(chain.genesis.genesis_hash),
        None,
        None,
        chain.genesis.leadership_nonce,
    );
    assert_eq!(
        node.engine.receive_block(b1.clone()).unwrap(),
        ReceiveBlockResult::Success
    );
    // The node votes for b1 itself; one more vote forms the certificate and advances the round.
    deliver_quorum(
        &mut node,
        chain.make_quorum_message(1, b1.hash, Round::new(1), Epoch::new(0)),
    );
    assert_eq!(node.engine.current_round(), Round::new(2));

    // The timer fires once, growing the persisted timeout from 10s to 15s.
    node.engine.trigger_timeout().unwrap();
    assert_eq!(node.clock.armed(), Some(std::time::Duration::from_millis(15_000)));

    // Crash without a clean close; the store retains everything persisted so far.
    let store = node.store.clone();
    drop(node);

    let restarted = chain.node_over(store, Some(0));
    assert_eq!(restarted.engine.current_round(), Round::new(2));
    assert_eq!(
        restarted.engine.round_status().current_timeout(),
        TimeoutDuration::new(15_000)
    );
    assert_eq!(
        restarted.clock.armed(),
        Some(std::time::Duration::from_millis(15_000))
    );
    assert_eq!(restarted.engine.highest_certified().block, b1.hash);
    assert!(restarted.engine.round_status().last_signed_quorum().is_some());
    assert!(restarted.engine.round_status().last_signed_timeout().is_some());
}

#[test]
fn own_messages_are_broadcast() {
    let chain = TestChain::new(3);
    let mut node = chain.node(Some(0));

    let b1 = chain.make_block(
        1,
        Round::new(1),
        Epoch::new(0),
        chain.genesis.genesis_hash,
        chain.genesis.genesis_state_hash,
        QuorumCertificate::genesis(chain.genesis.genesis_hash),
        None,
        None,
        chain.genesis.leadership_nonce,
    );
    node.engine.receive_block(b1.clone()).unwrap();

    // Receiving the round's block makes a finalizer vote.
    let broadcasts = node.network.broadcasts();
    assert!(broadcasts
        .iter()
        .any(|message| matches!(message, ConsensusMessage::Quorum(vote) if vote.block == b1.hash)));

    // The timer firing makes it sign and broadcast a timeout message.
    node.engine.trigger_timeout().unwrap();
    let broadcasts = node.network.broadcasts();
    assert!(broadcasts
        .iter()
        .any(|message| matches!(message, ConsensusMessage::Timeout(timeout) if timeout.round == Round::new(1))));
}

#[test]
fn exported_database_round_trips() {
    let chain = TestChain::new(3);
    let mut node = chain.node(None);
    let (b1, b2, _b3) = grow_three_block_chain(&chain, &mut node);

    let mut bytes = Vec::new();
    node.engine.export_database(&mut bytes).unwrap();

    let sections = rondo::store::export::read_sections(&mut bytes.as_slice()).unwrap();
    assert_eq!(sections.len(), 1);
    assert_eq!(sections[0].genesis_hash, chain.genesis.genesis_hash);
    let exported: Vec<BlockHash> = sections[0].blocks.iter().map(|block| block.hash).collect();
    assert_eq!(exported, vec![b1.hash]);
    assert_eq!(sections[0].finalization_records.len(), 1);
    assert_eq!(
        sections[0].finalization_records[0].finalized_qc.block,
        b1.hash
    );
    let _ = b2;
}
