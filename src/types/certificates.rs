/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Certificates: aggregate evidence that a quorum of finalizers supports a given decision.
//!
//! Three kinds of certificate exist:
//! 1. A [`QuorumCertificate`] witnesses that a quorum voted for one block in one round.
//! 2. A [`TimeoutCertificate`] witnesses that a quorum abandoned a round.
//! 3. A [`FinalizationEntry`] pairs the quorum certificates of two consecutive rounds, witnessing
//!    that the earlier block is irreversibly finalized.
//!
//! All three are validated with the same weight inequality, [`meets_threshold`], against the
//! finalization committee(s) of the epoch(s) their signatures are drawn from.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto::{self, AggregateScheme};
use crate::types::committee::FinalizationCommittee;
use crate::types::data_types::{
    AggregateSignatureBytes, BlockHash, Epoch, FinalizerSet, Ratio, Round, TotalWeight,
};

/// Check whether `signed` weight reaches `threshold` of `total` weight.
///
/// The comparison is inclusive: exactly the threshold fraction counts as a quorum. This single
/// inequality is used everywhere a quorum is decided: quorum certificate validation, timeout
/// certificate validation, and the incremental weight tallies of both vote pools.
///
/// # Panics
///
/// Panics if the multiplication overflows `u128`, which cannot happen for committees whose total
/// weight respects the documented `u128::MAX / 2` bound.
pub fn meets_threshold(signed: TotalWeight, total: TotalWeight, threshold: Ratio) -> bool {
    const WEIGHT_OVERFLOW: &str =
        "Committee weight exceeds u128::MAX/2. Read the itemdoc for FinalizationCommittee.";

    signed
        .int()
        .checked_mul(threshold.denominator() as u128)
        .expect(WEIGHT_OVERFLOW)
        >= total
            .int()
            .checked_mul(threshold.numerator() as u128)
            .expect(WEIGHT_OVERFLOW)
}

/// Proof that at least a quorum of finalizers voted for `block` in `round`.
///
/// The aggregate signature covers the [quorum signing bytes](crypto::quorum_signing_bytes) of
/// `(genesis, block, round, epoch)`; `signatories` records which committee seats contributed.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QuorumCertificate {
    /// Hash of the block this certificate certifies.
    pub block: BlockHash,

    /// Round in which `block` was certified.
    pub round: Round,

    /// Epoch of `block`.
    pub epoch: Epoch,

    /// Aggregate signature over the quorum signing bytes.
    pub aggregate_signature: AggregateSignatureBytes,

    /// The committee seats whose signatures are aggregated in this certificate.
    pub signatories: FinalizerSet,
}

impl QuorumCertificate {
    /// Create the certificate carried by blocks whose parent is the genesis block.
    ///
    /// The genesis block is certified by fiat, so the signature is empty and the signatory set
    /// contains no seats.
    pub fn genesis(genesis_hash: BlockHash) -> QuorumCertificate {
        QuorumCertificate {
            block: genesis_hash,
            round: Round::genesis(),
            epoch: Epoch::genesis(),
            aggregate_signature: AggregateSignatureBytes::new([0u8; 48]),
            signatories: FinalizerSet::new(),
        }
    }

    /// Check whether this is the by-fiat certificate for the genesis block of `genesis_hash`.
    pub fn is_genesis(&self, genesis_hash: BlockHash) -> bool {
        self.round == Round::genesis() && self.block == genesis_hash
    }

    /// Check whether the signatures form a quorum of `committee` and the aggregate signature
    /// verifies.
    ///
    /// The genesis certificate is automatically correct.
    pub fn verify<A: AggregateScheme>(
        &self,
        genesis_hash: BlockHash,
        threshold: Ratio,
        committee: &FinalizationCommittee,
        scheme: &A,
    ) -> bool {
        if self.is_genesis(genesis_hash) {
            return true;
        }

        let signed = committee.signed_weight(&self.signatories);
        if !meets_threshold(signed, committee.total_weight(), threshold) {
            return false;
        }

        let Some(keys) = committee.aggregate_keys(&self.signatories) else {
            // A signatory index outside the committee.
            return false;
        };
        let message = crypto::quorum_signing_bytes(genesis_hash, self.block, self.round, self.epoch);
        scheme.verify_aggregate(&[(keys, message)], &self.aggregate_signature)
    }
}

/// For one epoch, the rounds that finalizers named as their highest certified round when they
/// signed a timeout, with the set of seats naming each round.
///
/// Entries are kept in ascending round order.
#[derive(Clone, Debug, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct FinalizerRounds(Vec<(Round, FinalizerSet)>);

impl FinalizerRounds {
    /// Create an empty `FinalizerRounds`.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Record that the seats in `set` named `round`, merging with any seats already recorded for
    /// that round.
    pub fn insert(&mut self, round: Round, set: FinalizerSet) {
        match self.0.binary_search_by_key(&round, |(r, _)| *r) {
            Ok(position) => {
                let merged = self.0[position].1.union(&set);
                self.0[position].1 = merged;
            }
            Err(position) => self.0.insert(position, (round, set)),
        }
    }

    /// Iterate through the `(round, seats)` entries in ascending round order.
    pub fn iter(&self) -> std::slice::Iter<'_, (Round, FinalizerSet)> {
        self.0.iter()
    }

    /// Get the highest round recorded, if any entry exists.
    pub fn max_round(&self) -> Option<Round> {
        self.0.last().map(|(round, _)| *round)
    }

    /// Check whether no entries are recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compute the union of all seat sets across the recorded rounds.
    pub fn all_signatories(&self) -> FinalizerSet {
        self.0
            .iter()
            .fold(FinalizerSet::new(), |acc, (_, set)| acc.union(set))
    }
}

/// Proof that at least a quorum of finalizers abandoned `round`.
///
/// Because an epoch transition may be in flight while a round times out, the aggregated signatures
/// may be drawn from up to two consecutive epochs: `min_epoch` and `min_epoch + 1`. Each epoch's
/// contributions are grouped by the quorum-certificate round the signer witnessed, since that round
/// is part of the signed message.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TimeoutCertificate {
    /// The round that timed out.
    pub round: Round,

    /// The older of the (up to two) epochs from which signatures are drawn.
    pub min_epoch: Epoch,

    /// Witnessed quorum rounds for signers in `min_epoch`.
    pub first_epoch_rounds: FinalizerRounds,

    /// Witnessed quorum rounds for signers in `min_epoch + 1`.
    pub second_epoch_rounds: FinalizerRounds,

    /// Aggregate of all contained timeout signatures.
    pub aggregate_signature: AggregateSignatureBytes,
}

impl TimeoutCertificate {
    /// Check whether this certificate is relevant to `round`, i.e. whether it witnesses the
    /// failure of the immediately preceding round.
    pub fn is_relevant_to(&self, round: Round) -> bool {
        self.round + 1 == round
    }

    /// Get the highest quorum round witnessed by any signer in the certificate.
    pub fn max_round(&self) -> Round {
        self.first_epoch_rounds
            .max_round()
            .into_iter()
            .chain(self.second_epoch_rounds.max_round())
            .max()
            .unwrap_or(Round::genesis())
    }

    /// Get the newest epoch from which signatures are drawn.
    pub fn max_epoch(&self) -> Epoch {
        if self.second_epoch_rounds.is_empty() {
            self.min_epoch
        } else {
            self.min_epoch + 1
        }
    }

    /// Check whether the signatures form a quorum and the aggregate signature verifies.
    ///
    /// `committee_for` resolves the committee of each of the (up to two) epochs signatures are
    /// drawn from; returning `None` for an epoch that contributed signatures fails validation.
    /// The weight check is performed against the committee of [`max_epoch`](Self::max_epoch):
    /// signers from the older epoch only count to the extent that their baker still holds a seat.
    pub fn verify<'c, A, F>(
        &self,
        genesis_hash: BlockHash,
        threshold: Ratio,
        committee_for: F,
        scheme: &A,
    ) -> bool
    where
        A: AggregateScheme,
        F: Fn(Epoch) -> Option<&'c FinalizationCommittee>,
    {
        let Some(deciding_committee) = committee_for(self.max_epoch()) else {
            return false;
        };

        // Gather, per (epoch, quorum round) group, the message and keys covered by the aggregate
        // signature, while collecting the distinct baker ids behind the seats. A baker that signed
        // in both epochs is weighed once.
        let mut groups: Vec<(Vec<_>, Vec<u8>)> = Vec::new();
        let mut signatory_bakers = std::collections::BTreeSet::new();
        let buckets = [
            (self.min_epoch, &self.first_epoch_rounds),
            (self.min_epoch + 1, &self.second_epoch_rounds),
        ];
        for (epoch, rounds) in buckets {
            if rounds.is_empty() {
                continue;
            }
            let Some(committee) = committee_for(epoch) else {
                return false;
            };
            for (quorum_round, seats) in rounds.iter() {
                let Some(keys) = committee.aggregate_keys(seats) else {
                    return false;
                };
                for index in seats.iter() {
                    signatory_bakers.insert(committee.member(index).unwrap().baker);
                }
                let message =
                    crypto::timeout_signing_bytes(genesis_hash, self.round, *quorum_round, epoch);
                groups.push((keys, message));
            }
        }
        if groups.is_empty() {
            return false;
        }

        let mut signed = TotalWeight::new(0);
        for baker in signatory_bakers {
            if let Some(member) = deciding_committee.member_by_baker(baker) {
                signed += member.weight;
            }
        }
        if !meets_threshold(signed, deciding_committee.total_weight(), threshold) {
            return false;
        }
        scheme.verify_aggregate(&groups, &self.aggregate_signature)
    }
}

/// Witness that the hash committed to by a [`FinalizationEntry`]'s successor certificate really
/// extends the finalized block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SuccessorProof([u8; 32]);

impl SuccessorProof {
    /// Create a new `SuccessorProof` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `SuccessorProof`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

/// Proof that a block is irreversibly finalized: a quorum certificate for the block together with
/// a quorum certificate for a successor in the immediately following round of the same epoch.
///
/// Carried by the first block of each epoch to justify the epoch transition, and persisted as the
/// "latest finalization entry" whenever finality advances.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FinalizationEntry {
    /// Certificate for the newly finalized block.
    pub finalized_qc: QuorumCertificate,

    /// Certificate for the immediate successor of the finalized block.
    pub successor_qc: QuorumCertificate,

    /// Witness tying `successor_qc.block` to the finalized block.
    pub successor_proof: SuccessorProof,
}

impl FinalizationEntry {
    /// Check the structural invariants: the successor round is exactly one past the finalized
    /// round, and both certificates are in the same epoch.
    pub fn is_internally_consistent(&self) -> bool {
        self.finalized_qc.round + 1 == self.successor_qc.round
            && self.finalized_qc.epoch == self.successor_qc.epoch
    }

    /// Check whether both certificates verify against `committee`, in addition to the structural
    /// invariants.
    pub fn verify<A: AggregateScheme>(
        &self,
        genesis_hash: BlockHash,
        threshold: Ratio,
        committee: &FinalizationCommittee,
        scheme: &A,
    ) -> bool {
        self.is_internally_consistent()
            && self
                .finalized_qc
                .verify(genesis_hash, threshold, committee, scheme)
            && self
                .successor_qc
                .verify(genesis_hash, threshold, committee, scheme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_inclusive() {
        let two_thirds = Ratio::new(2, 3);
        assert!(meets_threshold(
            TotalWeight::new(2),
            TotalWeight::new(3),
            two_thirds
        ));
        assert!(!meets_threshold(
            TotalWeight::new(199),
            TotalWeight::new(300),
            two_thirds
        ));
        assert!(meets_threshold(
            TotalWeight::new(200),
            TotalWeight::new(300),
            two_thirds
        ));
    }

    #[test]
    fn finalizer_rounds_merge_and_order() {
        use crate::types::data_types::FinalizerIndex;

        let mut rounds = FinalizerRounds::new();
        rounds.insert(
            Round::new(7),
            [FinalizerIndex::new(1)].into_iter().collect(),
        );
        rounds.insert(
            Round::new(3),
            [FinalizerIndex::new(0)].into_iter().collect(),
        );
        rounds.insert(
            Round::new(7),
            [FinalizerIndex::new(2)].into_iter().collect(),
        );

        let entries: Vec<Round> = rounds.iter().map(|(round, _)| *round).collect();
        assert_eq!(entries, vec![Round::new(3), Round::new(7)]);
        assert_eq!(rounds.max_round(), Some(Round::new(7)));

        let (_, seats) = rounds.iter().last().unwrap();
        assert!(seats.contains(FinalizerIndex::new(1)));
        assert!(seats.contains(FinalizerIndex::new(2)));
    }
}
