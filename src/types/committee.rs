/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that store information about the finalization committee of an epoch.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;

use super::data_types::{
    AggregateKeyBytes, BakerId, Epoch, FinalizerIndex, FinalizerSet, TotalWeight, VerifyingKeyBytes,
    VrfKeyBytes, Weight,
};

/// A single seat in the finalization committee of an epoch.
#[derive(Clone, PartialEq, Eq)]
pub struct FinalizerInfo {
    /// The seat number of this finalizer in its epoch's committee.
    pub index: FinalizerIndex,

    /// The epoch-independent identity of the participant holding this seat.
    pub baker: BakerId,

    /// The voting weight of this seat.
    pub weight: Weight,

    /// Ed25519 key verifying this finalizer's message envelopes and blocks.
    pub signing_key: VerifyingKey,

    /// Key verifying this finalizer's contributions to aggregate signatures.
    pub aggregate_key: AggregateKeyBytes,

    /// Key verifying this finalizer's VRF proofs.
    pub vrf_key: VrfKeyBytes,
}

/// The finalization committee of one epoch.
///
/// ## Ordering of members
///
/// Members are kept in ascending order of [`FinalizerIndex`], and indices are dense: the committee
/// constructor reassigns index `i` to the `i`-th member. This makes [`FinalizerSet`] bitmasks over
/// the committee unambiguous.
///
/// ## Limits to total weight
///
/// Users must make sure that the total weight of the committee does not exceed `u128::MAX / 2`,
/// so that the threshold check cannot overflow.
#[derive(Clone, PartialEq, Eq)]
pub struct FinalizationCommittee {
    // Members in ascending order of their finalizer index.
    members: Vec<FinalizerInfo>,
    total_weight: TotalWeight,
}

impl FinalizationCommittee {
    /// Create a committee from `members`.
    ///
    /// Members are sorted by their baker id and their indices reassigned densely, so callers do not
    /// need to pre-assign them.
    pub fn new(mut members: Vec<FinalizerInfo>) -> FinalizationCommittee {
        members.sort_by_key(|member| member.baker);
        for (position, member) in members.iter_mut().enumerate() {
            member.index = FinalizerIndex::new(position as u32);
        }
        let mut total_weight = TotalWeight::new(0);
        for member in &members {
            total_weight += member.weight;
        }
        FinalizationCommittee {
            members,
            total_weight,
        }
    }

    /// Get the member seated at `index`, if the index is within the committee.
    pub fn member(&self, index: FinalizerIndex) -> Option<&FinalizerInfo> {
        self.members.get(index.usize())
    }

    /// Get the member whose [`BakerId`] is `baker`, if it has a seat in this committee.
    pub fn member_by_baker(&self, baker: BakerId) -> Option<&FinalizerInfo> {
        match self.members.binary_search_by_key(&baker, |m| m.baker) {
            Ok(position) => Some(&self.members[position]),
            Err(_) => None,
        }
    }

    /// Check whether `baker` holds a seat in this committee.
    pub fn contains_baker(&self, baker: BakerId) -> bool {
        self.member_by_baker(baker).is_some()
    }

    /// Iterate through the members of this committee in ascending index order.
    pub fn members(&self) -> std::slice::Iter<'_, FinalizerInfo> {
        self.members.iter()
    }

    /// Get the number of seats in this committee.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check whether the committee has no seats.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Get the sum of the weights of all members of this committee.
    pub fn total_weight(&self) -> TotalWeight {
        self.total_weight
    }

    /// Sum the weights of the members whose indices are in `signers`.
    ///
    /// Indices in `signers` that fall outside the committee contribute nothing.
    pub fn signed_weight(&self, signers: &FinalizerSet) -> TotalWeight {
        let mut signed = TotalWeight::new(0);
        for index in signers.iter() {
            if let Some(member) = self.member(index) {
                signed += member.weight;
            }
        }
        signed
    }

    /// Collect the aggregate-signature keys of the members whose indices are in `signers`.
    ///
    /// Returns `None` if any index in `signers` falls outside the committee.
    pub fn aggregate_keys(&self, signers: &FinalizerSet) -> Option<Vec<AggregateKeyBytes>> {
        signers
            .iter()
            .map(|index| self.member(index).map(|member| member.aggregate_key))
            .collect()
    }
}

/// Intermediate representation of [`FinalizerInfo`] for safe serialization and deserialization.
///
/// Exists because [`ed25519_dalek::VerifyingKey`] does not implement the Borsh traits. Converting
/// back into [`FinalizerInfo`] is fallible since the stored bytes may not be a valid curve point.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct FinalizerInfoBytes {
    index: FinalizerIndex,
    baker: BakerId,
    weight: Weight,
    signing_key: VerifyingKeyBytes,
    aggregate_key: AggregateKeyBytes,
    vrf_key: VrfKeyBytes,
}

impl TryFrom<FinalizerInfoBytes> for FinalizerInfo {
    type Error = ed25519_dalek::SignatureError;

    fn try_from(value: FinalizerInfoBytes) -> Result<Self, Self::Error> {
        Ok(FinalizerInfo {
            index: value.index,
            baker: value.baker,
            weight: value.weight,
            signing_key: VerifyingKey::from_bytes(&value.signing_key.bytes())?,
            aggregate_key: value.aggregate_key,
            vrf_key: value.vrf_key,
        })
    }
}

impl From<&FinalizerInfo> for FinalizerInfoBytes {
    fn from(value: &FinalizerInfo) -> FinalizerInfoBytes {
        FinalizerInfoBytes {
            index: value.index,
            baker: value.baker,
            weight: value.weight,
            signing_key: VerifyingKeyBytes::new(value.signing_key.to_bytes()),
            aggregate_key: value.aggregate_key,
            vrf_key: value.vrf_key,
        }
    }
}

/// Intermediate representation of [`FinalizationCommittee`] for safe serialization and
/// deserialization.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct FinalizationCommitteeBytes {
    members: Vec<FinalizerInfoBytes>,
}

impl TryFrom<FinalizationCommitteeBytes> for FinalizationCommittee {
    type Error = ed25519_dalek::SignatureError;

    fn try_from(value: FinalizationCommitteeBytes) -> Result<Self, Self::Error> {
        let members = value
            .members
            .into_iter()
            .map(FinalizerInfo::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FinalizationCommittee::new(members))
    }
}

impl From<&FinalizationCommittee> for FinalizationCommitteeBytes {
    fn from(value: &FinalizationCommittee) -> FinalizationCommitteeBytes {
        FinalizationCommitteeBytes {
            members: value.members.iter().map(FinalizerInfoBytes::from).collect(),
        }
    }
}

/// The committees a consensus participant knows about at any point in time.
///
/// Timeout certificates may draw signatures from up to two consecutive epochs, so alongside the
/// current epoch's committee the engine keeps its predecessor for as long as messages from it can
/// still arrive.
#[derive(Clone)]
pub struct CommitteeState {
    current_epoch: Epoch,
    current: FinalizationCommittee,
    previous: Option<FinalizationCommittee>,
}

impl CommitteeState {
    /// Create a new `CommitteeState` for `current_epoch`.
    pub fn new(
        current_epoch: Epoch,
        current: FinalizationCommittee,
        previous: Option<FinalizationCommittee>,
    ) -> Self {
        Self {
            current_epoch,
            current,
            previous,
        }
    }

    /// Get the epoch whose committee is [`current`](Self::current).
    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    /// Get the committee of the current epoch.
    pub fn current(&self) -> &FinalizationCommittee {
        &self.current
    }

    /// Get the committee for `epoch`, if it is one of the (up to two) epochs tracked.
    pub fn committee_for(&self, epoch: Epoch) -> Option<&FinalizationCommittee> {
        if epoch == self.current_epoch {
            Some(&self.current)
        } else if epoch + 1 == self.current_epoch {
            self.previous.as_ref()
        } else {
            None
        }
    }

    /// Enter `new_epoch` with `committee`, retiring the current committee to the previous slot.
    pub fn advance(&mut self, new_epoch: Epoch, committee: FinalizationCommittee) {
        let retired = std::mem::replace(&mut self.current, committee);
        self.previous = Some(retired);
        self.current_epoch = new_epoch;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn committee_of(weights: &[u64]) -> FinalizationCommittee {
        let members = weights
            .iter()
            .enumerate()
            .map(|(i, weight)| {
                let keypair = Keypair::from_seed([i as u8; 32]);
                FinalizerInfo {
                    index: FinalizerIndex::new(0),
                    baker: BakerId::new(i as u64),
                    weight: Weight::new(*weight),
                    signing_key: keypair.public(),
                    aggregate_key: AggregateKeyBytes::new([i as u8; 96]),
                    vrf_key: VrfKeyBytes::new([i as u8; 32]),
                }
            })
            .collect();
        FinalizationCommittee::new(members)
    }

    #[test]
    fn indices_are_dense_and_sorted_by_baker() {
        let committee = committee_of(&[5, 3, 7]);
        for (position, member) in committee.members().enumerate() {
            assert_eq!(member.index, FinalizerIndex::new(position as u32));
        }
        assert_eq!(committee.total_weight(), TotalWeight::new(15));
    }

    #[test]
    fn signed_weight_ignores_out_of_range_indices() {
        let committee = committee_of(&[5, 3, 7]);
        let signers: FinalizerSet = [0u32, 2, 9].into_iter().map(FinalizerIndex::new).collect();
        assert_eq!(committee.signed_weight(&signers), TotalWeight::new(12));
        assert!(committee.aggregate_keys(&signers).is_none());
    }
}
