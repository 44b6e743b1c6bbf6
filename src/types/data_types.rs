/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or numbers, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, AddAssign},
    time::Duration,
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Number of a round: one attempt, per round, to certify a single block.
///
/// Rounds increase monotonically over the lifetime of a consensus instance. A round advances either
/// because a [`QuorumCertificate`](crate::types::certificates::QuorumCertificate) was formed for it,
/// or because a [`TimeoutCertificate`](crate::types::certificates::TimeoutCertificate) proved that a
/// quorum of finalizers gave up on it.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Round(u64);

impl Round {
    /// Create a new `Round` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the genesis `Round`, which is 0.
    pub const fn genesis() -> Self {
        Self(0)
    }

    /// Get the inner `u64` of this `Round`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for Round {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for Round {
    type Output = Round;

    fn add(self, rhs: u64) -> Round {
        Round(self.0.add(rhs))
    }
}

/// Number of an epoch: a committee term spanning many rounds.
///
/// An epoch advances by exactly one when a block carrying a
/// [`FinalizationEntry`](crate::types::certificates::FinalizationEntry) is certified.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Epoch(u64);

impl Epoch {
    /// Create a new `Epoch` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the genesis `Epoch`, which is 0.
    pub const fn genesis() -> Self {
        Self(0)
    }

    /// Get the inner `u64` of this `Epoch`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for Epoch {
    type Output = Epoch;

    fn add(self, rhs: u64) -> Epoch {
        Epoch(self.0.add(rhs))
    }
}

/// Height of a block in the block tree.
///
/// Starts at 0 for the genesis block and increases by 1 for every parent link. Unlike [`Round`],
/// heights have no gaps: every finalized chain contains exactly one block per height.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct BlockHeight(u64);

impl BlockHeight {
    /// Create a new `BlockHeight` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `BlockHeight`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the big-endian representation of the inner `u64` value of this `BlockHeight`.
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl Display for BlockHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for BlockHeight {
    type Output = BlockHeight;

    fn add(self, rhs: u64) -> BlockHeight {
        BlockHeight(self.0.add(rhs))
    }
}

/// 32-byte SHA256 digest identifying a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    /// Create a new `BlockHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `BlockHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for BlockHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for BlockHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// 32-byte digest of the chain state claimed to result from executing a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct StateHash([u8; 32]);

impl StateHash {
    /// Create a new `StateHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `StateHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Debug for StateHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Seat number of a finalizer in the finalization committee of a particular epoch.
///
/// Indices are dense: a committee of `n` members uses exactly the indices `0..n`. An index is only
/// meaningful together with the [`Epoch`] whose committee assigned it; the same participant may
/// hold different indices in different epochs.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct FinalizerIndex(u32);

impl FinalizerIndex {
    /// Create a new `FinalizerIndex` wrapping `int`.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the inner `u32` of this `FinalizerIndex`.
    pub const fn int(&self) -> u32 {
        self.0
    }

    /// Get this index as a `usize`, for indexing into committee member lists.
    pub const fn usize(&self) -> usize {
        self.0 as usize
    }
}

/// Identifier of a block-producing participant, stable across epochs.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct BakerId(u64);

impl BakerId {
    /// Create a new `BakerId` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` of this `BakerId`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for BakerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Voting weight of a single finalizer in consensus decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct Weight(u64);

impl Weight {
    /// Create a new `Weight` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `Weight`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// Sum of the [`Weight`]s of a set of finalizers.
///
/// The inner type is `u128` so that summing large `Weight`s cannot overflow.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize, Default,
)]
pub struct TotalWeight(u128);

impl TotalWeight {
    /// Create a new `TotalWeight` wrapping `int`.
    pub const fn new(int: u128) -> Self {
        Self(int)
    }

    /// Get the inner `u128` value of this `TotalWeight`.
    pub const fn int(&self) -> u128 {
        self.0
    }
}

impl AddAssign<Weight> for TotalWeight {
    fn add_assign(&mut self, rhs: Weight) {
        self.0.add_assign(rhs.0 as u128)
    }
}

/// Ed25519 digital signature.
///
/// Produced using the [`ed25519_dalek`] crate, whose main definitions are re-exported from the
/// [`crypto`](crate::crypto) module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

/// Ed25519 verifying key in its 32-byte serialized form.
///
/// Whether the bytes decode to a valid curve point is only established when the key is used to
/// verify a signature; invalid bytes simply fail verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct VerifyingKeyBytes([u8; 32]);

impl VerifyingKeyBytes {
    /// Create a new `VerifyingKeyBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `VerifyingKeyBytes`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

/// Opaque aggregate (BLS) signature in its 48-byte compressed form.
///
/// The engine never interprets these bytes itself: combining and verifying them is delegated to
/// the [`AggregateScheme`](crate::crypto::AggregateScheme) capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct AggregateSignatureBytes([u8; 48]);

impl AggregateSignatureBytes {
    /// Create a new `AggregateSignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 48]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 48]` value of this `AggregateSignatureBytes`.
    pub const fn bytes(&self) -> [u8; 48] {
        self.0
    }
}

/// Opaque aggregate (BLS) public key in its 96-byte compressed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct AggregateKeyBytes([u8; 96]);

impl AggregateKeyBytes {
    /// Create a new `AggregateKeyBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 96]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 96]` value of this `AggregateKeyBytes`.
    pub const fn bytes(&self) -> [u8; 96] {
        self.0
    }
}

/// Opaque VRF proof.
///
/// Verified through the [`VrfScheme`](crate::crypto::VrfScheme) capability; the engine only moves
/// the bytes around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct VrfProofBytes([u8; 80]);

impl VrfProofBytes {
    /// Create a new `VrfProofBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 80]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 80]` value of this `VrfProofBytes`.
    pub const fn bytes(&self) -> [u8; 80] {
        self.0
    }
}

/// Opaque VRF public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct VrfKeyBytes([u8; 32]);

impl VrfKeyBytes {
    /// Create a new `VrfKeyBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `VrfKeyBytes`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

/// 32-byte VRF output, used both as a block nonce and as the per-epoch leadership election nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct VrfOutput([u8; 32]);

impl VrfOutput {
    /// Create a new `VrfOutput` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `VrfOutput`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

/// Milliseconds since the Unix epoch.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new `Timestamp` wrapping `millis`.
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get the inner `u64` milliseconds value of this `Timestamp`.
    pub const fn millis(&self) -> u64 {
        self.0
    }

    /// Compute `self + duration`, saturating at `u64::MAX` milliseconds.
    pub fn saturating_add(&self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration.as_millis() as u64))
    }
}

/// A duration in milliseconds, as stored in the persisted round status.
///
/// The round timeout is kept in this form rather than as a [`Duration`] so that it round-trips
/// through Borsh unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize)]
pub struct TimeoutDuration(u64);

impl TimeoutDuration {
    /// Create a new `TimeoutDuration` wrapping `millis`.
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get the inner `u64` milliseconds value of this `TimeoutDuration`.
    pub const fn millis(&self) -> u64 {
        self.0
    }

    /// View this timeout as a standard library [`Duration`].
    pub const fn as_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }

    /// Multiply this timeout by `ratio`, saturating at `u64::MAX` milliseconds and never going
    /// below 1 millisecond.
    pub fn grow(&self, ratio: Ratio) -> TimeoutDuration {
        let grown = (self.0 as u128)
            .saturating_mul(ratio.numerator() as u128)
            .checked_div(ratio.denominator() as u128)
            .unwrap_or(u128::MAX);
        TimeoutDuration(u64::try_from(grown).unwrap_or(u64::MAX).max(1))
    }
}

/// A non-negative rational number, used for the timeout growth factor and the signature threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Ratio {
    numerator: u64,
    denominator: u64,
}

impl Ratio {
    /// Create a new `Ratio`.
    ///
    /// # Panics
    ///
    /// Panics if `denominator` is zero.
    pub fn new(numerator: u64, denominator: u64) -> Self {
        assert!(denominator != 0, "Ratio denominator must be non-zero");
        Self {
            numerator,
            denominator,
        }
    }

    /// Get the numerator of this `Ratio`.
    pub const fn numerator(&self) -> u64 {
        self.numerator
    }

    /// Get the denominator of this `Ratio`.
    pub const fn denominator(&self) -> u64 {
        self.denominator
    }
}

/// Set of [`FinalizerIndex`]es, stored as a bitmask.
///
/// Used to record which committee seats contributed signatures to a certificate. Like the
/// committee itself, a `FinalizerSet` is only meaningful relative to a particular epoch.
#[derive(Clone, PartialEq, Eq, Default, BorshDeserialize, BorshSerialize)]
pub struct FinalizerSet(Vec<u8>);

impl FinalizerSet {
    /// Create an empty `FinalizerSet`.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert `index` into the set, growing the bitmask as needed.
    pub fn insert(&mut self, index: FinalizerIndex) {
        let byte = index.usize() / 8;
        if byte >= self.0.len() {
            self.0.resize(byte + 1, 0);
        }
        self.0[byte] |= 1 << (index.usize() % 8);
    }

    /// Check whether `index` is in the set.
    pub fn contains(&self, index: FinalizerIndex) -> bool {
        let byte = index.usize() / 8;
        self.0
            .get(byte)
            .is_some_and(|bits| bits & (1 << (index.usize() % 8)) != 0)
    }

    /// Check whether the set contains no indices.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|bits| *bits == 0)
    }

    /// Iterate over the indices in the set, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = FinalizerIndex> + '_ {
        self.0.iter().enumerate().flat_map(|(byte, bits)| {
            (0..8)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| FinalizerIndex::new((byte * 8 + bit) as u32))
        })
    }

    /// Compute the union of `self` and `other`.
    pub fn union(&self, other: &FinalizerSet) -> FinalizerSet {
        let mut bytes = vec![0u8; self.0.len().max(other.0.len())];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.0.get(i).copied().unwrap_or(0) | other.0.get(i).copied().unwrap_or(0);
        }
        FinalizerSet(bytes)
    }
}

impl Debug for FinalizerSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|i| i.int())).finish()
    }
}

impl FromIterator<FinalizerIndex> for FinalizerSet {
    fn from_iter<T: IntoIterator<Item = FinalizerIndex>>(iter: T) -> Self {
        let mut set = FinalizerSet::new();
        for index in iter {
            set.insert(index);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizer_set_insert_and_iterate() {
        let mut set = FinalizerSet::new();
        set.insert(FinalizerIndex::new(0));
        set.insert(FinalizerIndex::new(9));
        set.insert(FinalizerIndex::new(63));

        assert!(set.contains(FinalizerIndex::new(0)));
        assert!(set.contains(FinalizerIndex::new(9)));
        assert!(!set.contains(FinalizerIndex::new(10)));

        let indices: Vec<u32> = set.iter().map(|i| i.int()).collect();
        assert_eq!(indices, vec![0, 9, 63]);
    }

    #[test]
    fn finalizer_set_union_covers_both_operands() {
        let left: FinalizerSet = [0u32, 2].into_iter().map(FinalizerIndex::new).collect();
        let right: FinalizerSet = [1u32, 17].into_iter().map(FinalizerIndex::new).collect();

        let union = left.union(&right);
        for index in [0u32, 1, 2, 17] {
            assert!(union.contains(FinalizerIndex::new(index)));
        }
        assert!(!union.contains(FinalizerIndex::new(3)));
    }

    #[test]
    fn timeout_duration_grows_and_saturates() {
        let timeout = TimeoutDuration::new(10_000);
        assert_eq!(timeout.grow(Ratio::new(3, 2)).millis(), 15_000);
        assert_eq!(
            TimeoutDuration::new(u64::MAX).grow(Ratio::new(2, 1)).millis(),
            u64::MAX
        );
    }
}
