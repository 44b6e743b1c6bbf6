/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The fixed parameters a consensus instance is created with.

use borsh::{BorshDeserialize, BorshSerialize};

use super::committee::{FinalizationCommittee, FinalizationCommitteeBytes};
use super::data_types::{BlockHash, Ratio, StateHash, TimeoutDuration, VrfOutput};

/// Everything about a chain that is fixed at genesis and needed to run consensus.
///
/// Persisted once when the store is first initialized, and read back on every start.
#[derive(Clone)]
pub struct GenesisConfiguration {
    /// Hash of the genesis block. Doubles as the session identifier: every signed consensus
    /// message commits to it.
    pub genesis_hash: BlockHash,

    /// The state hash of the genesis block.
    pub genesis_state_hash: StateHash,

    /// The fraction of committee weight a certificate must gather. The default is 2/3.
    pub signature_threshold: Ratio,

    /// The timeout of round 1, before any growth.
    pub base_timeout: TimeoutDuration,

    /// The factor by which the round timeout grows on every timeout event. Greater than one.
    pub timeout_increase: Ratio,

    /// How far into the future a block's timestamp may lie before the block is rejected outright.
    pub early_block_threshold: TimeoutDuration,

    /// The leadership election nonce of epoch 0.
    pub leadership_nonce: VrfOutput,

    /// The finalization committee of epoch 0.
    pub committee: FinalizationCommittee,

    /// The protocol version recorded in exported block database sections.
    pub protocol_version: u64,

    /// The genesis index recorded in exported block database sections. Starts at 0 and increases
    /// with every protocol-update regenesis.
    pub genesis_index: u32,
}

/// Intermediate representation of [`GenesisConfiguration`] for safe serialization and
/// deserialization.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct GenesisConfigurationBytes {
    genesis_hash: BlockHash,
    genesis_state_hash: StateHash,
    signature_threshold: Ratio,
    base_timeout: TimeoutDuration,
    timeout_increase: Ratio,
    early_block_threshold: TimeoutDuration,
    leadership_nonce: VrfOutput,
    committee: FinalizationCommitteeBytes,
    protocol_version: u64,
    genesis_index: u32,
}

impl TryFrom<GenesisConfigurationBytes> for GenesisConfiguration {
    type Error = ed25519_dalek::SignatureError;

    fn try_from(value: GenesisConfigurationBytes) -> Result<Self, Self::Error> {
        Ok(GenesisConfiguration {
            genesis_hash: value.genesis_hash,
            genesis_state_hash: value.genesis_state_hash,
            signature_threshold: value.signature_threshold,
            base_timeout: value.base_timeout,
            timeout_increase: value.timeout_increase,
            early_block_threshold: value.early_block_threshold,
            leadership_nonce: value.leadership_nonce,
            committee: FinalizationCommittee::try_from(value.committee)?,
            protocol_version: value.protocol_version,
            genesis_index: value.genesis_index,
        })
    }
}

impl From<&GenesisConfiguration> for GenesisConfigurationBytes {
    fn from(value: &GenesisConfiguration) -> GenesisConfigurationBytes {
        GenesisConfigurationBytes {
            genesis_hash: value.genesis_hash,
            genesis_state_hash: value.genesis_state_hash,
            signature_threshold: value.signature_threshold,
            base_timeout: value.base_timeout,
            timeout_increase: value.timeout_increase,
            early_block_threshold: value.early_block_threshold,
            leadership_nonce: value.leadership_nonce,
            committee: FinalizationCommitteeBytes::from(&value.committee),
            protocol_version: value.protocol_version,
            genesis_index: value.genesis_index,
        }
    }
}
