/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the block types and their hashing.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::Digest;

use crate::crypto::CryptoHasher;
use crate::types::certificates::{FinalizationEntry, QuorumCertificate, TimeoutCertificate};
use crate::types::data_types::{
    BakerId, BlockHash, Epoch, Round, SignatureBytes, StateHash, Timestamp, VerifyingKeyBytes,
    VrfOutput, VrfProofBytes,
};

/// An opaque transaction carried in a block.
///
/// The engine never inspects transaction contents; execution is delegated to the
/// [`Ledger`](crate::engine::Ledger) capability.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct Transaction(Vec<u8>);

impl Transaction {
    /// Create a new `Transaction` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get a reference to the inner `Vec<u8>` of this `Transaction`.
    pub fn bytes(&self) -> &Vec<u8> {
        &self.0
    }
}

/// The body of a block, before the baker's signature is attached.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BakedBlock {
    /// The round this block attempts to certify.
    pub round: Round,

    /// The epoch this block belongs to.
    pub epoch: Epoch,

    /// Objective creation time of the block.
    pub timestamp: Timestamp,

    /// Identity of the participant that produced this block.
    pub baker: BakerId,

    /// The key the baker claims signs this block. Checked against the committee record during
    /// verification.
    pub baker_key: VerifyingKeyBytes,

    /// VRF output contributed by this block to the leadership election nonce.
    pub block_nonce: VrfOutput,

    /// Proof that `block_nonce` was correctly derived.
    pub nonce_proof: VrfProofBytes,

    /// Proof that the baker won the round's leader lottery.
    pub leader_proof: VrfProofBytes,

    /// Hash of the parent block.
    pub parent: BlockHash,

    /// Quorum certificate for the parent block. Names the parent's round and epoch.
    pub justify: QuorumCertificate,

    /// Present if and only if the round preceding this block's round timed out.
    pub timeout_certificate: Option<TimeoutCertificate>,

    /// Present if and only if this block is the first block of a new epoch.
    pub finalization_entry: Option<FinalizationEntry>,

    /// The transactions executed by this block.
    pub transactions: Vec<Transaction>,

    /// The state hash the baker claims results from executing this block.
    pub state_hash: StateHash,

    /// The digest of the transaction outcomes the baker claims.
    pub outcomes_hash: StateHash,
}

impl BakedBlock {
    /// Compute the hash identifying this block.
    pub fn hash(&self) -> BlockHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(self.try_to_vec().unwrap());
        BlockHash::new(hasher.finalize().into())
    }
}

/// A block together with its hash and the baker's signature over the hash.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedBlock {
    /// Hash of `block`. Stored alongside the body so that receivers of already-hashed blocks do
    /// not recompute it; [`hash_is_correct`](Self::hash_is_correct) re-establishes the binding.
    pub hash: BlockHash,

    /// The baker's signature over `hash`.
    pub signature: SignatureBytes,

    /// The block body.
    pub block: BakedBlock,
}

impl SignedBlock {
    /// Assemble a `SignedBlock` from a body and the signature produced over its hash.
    pub fn new(block: BakedBlock, signature: SignatureBytes) -> SignedBlock {
        SignedBlock {
            hash: block.hash(),
            signature,
            block,
        }
    }

    /// Check that the stored hash is in fact the hash of the stored body.
    pub fn hash_is_correct(&self) -> bool {
        self.hash == self.block.hash()
    }

    /// Get the round of this block.
    pub fn round(&self) -> Round {
        self.block.round
    }

    /// Get the epoch of this block.
    pub fn epoch(&self) -> Epoch {
        self.block.epoch
    }

    /// Get the hash of this block's parent.
    pub fn parent(&self) -> BlockHash {
        self.block.parent
    }

    /// Get the timestamp of this block.
    pub fn timestamp(&self) -> Timestamp {
        self.block.timestamp
    }
}
