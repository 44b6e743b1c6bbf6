/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The cryptography boundary of the consensus engine.
//!
//! Everything consensus needs from cryptography passes through this module, and all of it is pure:
//! hashing and Ed25519 signatures are provided concretely (through the [`sha2`] and
//! [`ed25519_dalek`] crates), while the aggregate-signature and VRF algebra is consumed through
//! the [`AggregateScheme`] and [`VrfScheme`] capability traits, wired in at engine construction.
//! Verification failure is always signalled as `false`; callers translate that into their own
//! rejection reasons.
//!
//! Keeping the algebra behind traits also means signature checks can be computed on worker threads
//! if an embedder wants to: the traits are `Sync`, and none of their methods touch engine state.

use borsh::BorshSerialize;
use ed25519_dalek::Signer;

use crate::types::data_types::{
    AggregateKeyBytes, AggregateSignatureBytes, BlockHash, Epoch, Round, SignatureBytes,
    TotalWeight, VerifyingKeyBytes, VrfKeyBytes, VrfOutput, VrfProofBytes, Weight,
};

// re-exports below.
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};

/// A wrapper around [`SigningKey`] that implements a [convenience method](Self::sign) for creating
/// signatures as well as a [getter](Self::public) for the public key.
#[derive(Clone)]
pub struct Keypair(pub(crate) SigningKey);

impl Keypair {
    /// Create a new `Keypair` wrapping `signing_key`.
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    /// Derive a `Keypair` deterministically from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Keypair {
        Keypair(SigningKey::from_bytes(&seed))
    }

    /// Convenience method for creating signatures over messages represented as byte slices.
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(message).to_bytes())
    }

    /// Get the public half of this `Keypair`.
    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }

    /// Get the public half of this `Keypair` in its serialized form.
    pub fn public_bytes(&self) -> VerifyingKeyBytes {
        VerifyingKeyBytes::new(self.0.verifying_key().to_bytes())
    }
}

/// Verify that `signature` is an Ed25519 signature by `key` over `message`.
///
/// Returns `false` if the key bytes do not decode to a valid verifying key.
pub fn verify_signature(key: &VerifyingKeyBytes, message: &[u8], signature: &SignatureBytes) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key.bytes()) else {
        return false;
    };
    let signature = Signature::from_bytes(&signature.bytes());
    verifying_key.verify(message, &signature).is_ok()
}

/// Verify the baker's signature on a block: an Ed25519 signature over the block hash.
pub fn verify_block_signature(
    key: &VerifyingKeyBytes,
    hash: &BlockHash,
    signature: &SignatureBytes,
) -> bool {
    verify_signature(key, &hash.bytes(), signature)
}

/// Compute the bytes a finalizer signs (with its aggregate key) when voting for a block.
pub fn quorum_signing_bytes(
    genesis: BlockHash,
    block: BlockHash,
    round: Round,
    epoch: Epoch,
) -> Vec<u8> {
    (genesis, block, round, epoch).try_to_vec().unwrap()
}

/// Compute the bytes a finalizer signs (with its aggregate key) when timing out a round.
///
/// `quorum_round` is the round of the highest quorum certificate the finalizer had witnessed and
/// `epoch` is the epoch the finalizer signed from. Both vary between honest signers of the same
/// timed-out round, which is why timeout certificates cannot in general be verified as a single
/// message: signatures are grouped by `(epoch, quorum_round)`.
pub fn timeout_signing_bytes(
    genesis: BlockHash,
    round: Round,
    quorum_round: Round,
    epoch: Epoch,
) -> Vec<u8> {
    (genesis, round, quorum_round, epoch).try_to_vec().unwrap()
}

/// Compute the bytes a finalizer signs (with its Ed25519 key) as the envelope of a timeout
/// message. Covers the fields the aggregate signature cannot bind, notably the embedded quorum
/// certificate.
pub fn timeout_envelope_bytes(
    genesis: BlockHash,
    round: Round,
    epoch: Epoch,
    quorum_certificate_block: BlockHash,
) -> Vec<u8> {
    (genesis, round, epoch, quorum_certificate_block)
        .try_to_vec()
        .unwrap()
}

/// Secret counterpart of an [`AggregateKeyBytes`]. Only ever handed to an [`AggregateScheme`].
#[derive(Clone, Copy)]
pub struct AggregateSecretBytes([u8; 32]);

impl AggregateSecretBytes {
    /// Create a new `AggregateSecretBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `AggregateSecretBytes`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

/// Secret counterpart of a [`VrfKeyBytes`]. Only ever handed to a [`VrfScheme`].
#[derive(Clone, Copy)]
pub struct VrfSecretBytes([u8; 32]);

impl VrfSecretBytes {
    /// Create a new `VrfSecretBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `VrfSecretBytes`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

/// The aggregate-signature (BLS) algebra consumed by the engine.
///
/// Implementations must be deterministic and side-effect free. `combine` must be associative and
/// commutative with [`empty`](Self::empty) as its identity, since the vote pools fold signatures
/// into accumulators incrementally in arrival order.
pub trait AggregateScheme: Clone + Send + Sync + 'static {
    /// Sign `message` with `secret`.
    fn sign(&self, secret: &AggregateSecretBytes, message: &[u8]) -> AggregateSignatureBytes;

    /// Get the identity element of signature combination.
    fn empty(&self) -> AggregateSignatureBytes;

    /// Combine two (possibly already aggregated) signatures.
    fn combine(
        &self,
        left: &AggregateSignatureBytes,
        right: &AggregateSignatureBytes,
    ) -> AggregateSignatureBytes;

    /// Verify an aggregate signature over one or more message groups.
    ///
    /// Each group pairs the keys of the signers of one message with that message's bytes;
    /// `signature` must be the combination of every group member's signature over its group's
    /// message. Quorum certificates verify with a single group; timeout certificates need one
    /// group per witnessed quorum round.
    fn verify_aggregate(
        &self,
        groups: &[(Vec<AggregateKeyBytes>, Vec<u8>)],
        signature: &AggregateSignatureBytes,
    ) -> bool;
}

/// The VRF algebra consumed by the engine: the round-leader lottery and the block nonce chain.
///
/// Implementations must be deterministic and side-effect free.
pub trait VrfScheme: Clone + Send + Sync + 'static {
    /// Verify that `proof` shows the holder of `key` winning the leader lottery of `round` under
    /// the epoch's leadership `nonce`, given the holder's `weight` out of `total` lottery weight.
    fn verify_leader(
        &self,
        nonce: &VrfOutput,
        round: Round,
        key: &VrfKeyBytes,
        weight: Weight,
        total: TotalWeight,
        proof: &VrfProofBytes,
    ) -> bool;

    /// Verify that `block_nonce` is the VRF output of the holder of `key` over the epoch's
    /// leadership `nonce` and `round`, as shown by `proof`.
    fn verify_block_nonce(
        &self,
        block_nonce: &VrfOutput,
        nonce: &VrfOutput,
        round: Round,
        key: &VrfKeyBytes,
        proof: &VrfProofBytes,
    ) -> bool;

    /// Attempt to win the leader lottery of `round` with `secret`. Returns the proof to embed in
    /// the produced block if the lottery is won, and `None` otherwise.
    fn try_win_leadership(
        &self,
        secret: &VrfSecretBytes,
        nonce: &VrfOutput,
        round: Round,
        weight: Weight,
        total: TotalWeight,
    ) -> Option<VrfProofBytes>;

    /// Produce the block nonce and its proof for a block of `round` under the epoch's leadership
    /// `nonce`.
    fn prove_block_nonce(
        &self,
        secret: &VrfSecretBytes,
        nonce: &VrfOutput,
        round: Round,
    ) -> (VrfOutput, VrfProofBytes);

    /// Derive the leadership election nonce of `epoch` from the previous epoch's nonce and the
    /// block nonce of the block whose finalization entry triggered the transition.
    fn derive_epoch_nonce(
        &self,
        previous: &VrfOutput,
        contribution: &VrfOutput,
        epoch: Epoch,
    ) -> VrfOutput;
}
