/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for pluggable persistence of consensus state.
//!
//! The engine owns a single [`KVStore`] for its lifetime and is its only writer. Read-only
//! [snapshots](KVStore::snapshot) can be handed out to the catch-up producer, which streams
//! finalized blocks without participating in the writer's mutations.
//!
//! Both [`KVGet`] and [`WriteBatch`] carry typed default methods for every persisted consensus
//! variable, so a store implementation only provides raw byte access.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::round_status::RoundStatus;
use crate::store::variables::{self, concat};
use crate::types::block::SignedBlock;
use crate::types::certificates::FinalizationEntry;
use crate::types::data_types::{BlockHash, BlockHeight};
use crate::types::genesis::{GenesisConfiguration, GenesisConfigurationBytes};

/// A pluggable key-value store.
///
/// Writes go through [`WriteBatch`]es and must be atomic: either every operation in the batch is
/// applied, or none is. Failure to apply a batch is not recoverable in the consensus context, so
/// implementations should panic rather than silently drop writes.
pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;
    type Snapshot<'a>: 'a + KVGet;

    /// Atomically apply `wb` to the store.
    fn write(&mut self, wb: Self::WriteBatch);

    /// Delete every key in the store.
    fn clear(&mut self);

    /// Take a read-only snapshot of the store's current state.
    fn snapshot<'b>(&'b self) -> Self::Snapshot<'_>;
}

/// A batch of write operations applied atomically.
pub trait WriteBatch {
    /// Create an empty batch.
    fn new() -> Self;

    /// Schedule setting `key` to `value`.
    fn set(&mut self, key: &[u8], value: &[u8]);

    /// Schedule deleting `key`.
    fn delete(&mut self, key: &[u8]);

    /* ↓↓↓ Typed setters for persisted consensus variables ↓↓↓ */

    /// Schedule writing the round status.
    fn set_round_status(&mut self, round_status: &RoundStatus) {
        self.set(
            &variables::ROUND_STATUS,
            &round_status.try_to_vec().unwrap(),
        );
    }

    /// Schedule writing a finalized block at `height`, together with its hash-to-height index
    /// entry.
    fn set_finalized_block(&mut self, height: BlockHeight, block: &SignedBlock) {
        self.set(
            &concat(&variables::FINALIZED_BLOCK_AT_HEIGHT, &height.to_be_bytes()),
            &block.try_to_vec().unwrap(),
        );
        self.set(
            &concat(&variables::BLOCK_HEIGHT_BY_HASH, &block.hash.bytes()),
            &height.try_to_vec().unwrap(),
        );
    }

    /// Schedule writing the finalization entry that last advanced finality.
    fn set_latest_finalization_entry(&mut self, entry: &FinalizationEntry) {
        self.set(
            &variables::LATEST_FINALIZATION_ENTRY,
            &entry.try_to_vec().unwrap(),
        );
    }

    /// Schedule writing the genesis configuration.
    fn set_genesis_configuration(&mut self, configuration: &GenesisConfiguration) {
        self.set(
            &variables::GENESIS_CONFIGURATION,
            &GenesisConfigurationBytes::from(configuration)
                .try_to_vec()
                .unwrap(),
        );
    }
}

/// Read access to a store or snapshot.
pub trait KVGet {
    /// Get the value at `key`, if one exists.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /* ↓↓↓ Typed getters for persisted consensus variables ↓↓↓ */

    /// Get the persisted round status.
    fn round_status(&self) -> Result<Option<RoundStatus>, KVGetError> {
        self.get_borsh(&variables::ROUND_STATUS, Key::RoundStatus)
    }

    /// Get the finalized block at `height`.
    fn finalized_block_at_height(
        &self,
        height: BlockHeight,
    ) -> Result<Option<SignedBlock>, KVGetError> {
        self.get_borsh(
            &concat(&variables::FINALIZED_BLOCK_AT_HEIGHT, &height.to_be_bytes()),
            Key::FinalizedBlockAtHeight { height },
        )
    }

    /// Get the height of the finalized block with `hash`, through the secondary index.
    fn height_by_hash(&self, hash: &BlockHash) -> Result<Option<BlockHeight>, KVGetError> {
        self.get_borsh(
            &concat(&variables::BLOCK_HEIGHT_BY_HASH, &hash.bytes()),
            Key::BlockHeightByHash { block: *hash },
        )
    }

    /// Get the finalized block with `hash`, resolving through the secondary index.
    ///
    /// An index entry whose primary record is missing is a broken store and reported as an error,
    /// not as absence.
    fn finalized_block_by_hash(&self, hash: &BlockHash) -> Result<Option<SignedBlock>, KVGetError> {
        let Some(height) = self.height_by_hash(hash)? else {
            return Ok(None);
        };
        match self.finalized_block_at_height(height)? {
            Some(block) => Ok(Some(block)),
            None => Err(KVGetError::ValueExpectedButNotFound {
                key: Key::FinalizedBlockAtHeight { height },
            }),
        }
    }

    /// Get the finalization entry that last advanced finality.
    fn latest_finalization_entry(&self) -> Result<Option<FinalizationEntry>, KVGetError> {
        self.get_borsh(
            &variables::LATEST_FINALIZATION_ENTRY,
            Key::LatestFinalizationEntry,
        )
    }

    /// Get the genesis configuration.
    fn genesis_configuration(&self) -> Result<Option<GenesisConfiguration>, KVGetError> {
        let bytes: Option<GenesisConfigurationBytes> =
            self.get_borsh(&variables::GENESIS_CONFIGURATION, Key::GenesisConfiguration)?;
        match bytes {
            None => Ok(None),
            Some(bytes) => GenesisConfiguration::try_from(bytes)
                .map(Some)
                .map_err(|_| KVGetError::InvalidKeyMaterial {
                    key: Key::GenesisConfiguration,
                }),
        }
    }

    /// Get and Borsh-deserialize the value at `key`, attributing failures to `key_name`.
    #[doc(hidden)]
    fn get_borsh<T: BorshDeserialize>(
        &self,
        key: &[u8],
        key_name: Key,
    ) -> Result<Option<T>, KVGetError> {
        match self.get(key) {
            None => Ok(None),
            Some(bytes) => T::deserialize(&mut bytes.as_slice()).map(Some).map_err(|err| {
                KVGetError::DeserializeValueError {
                    key: key_name,
                    source: err,
                }
            }),
        }
    }
}

/// Names of the persisted consensus variables, for error attribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    RoundStatus,
    FinalizedBlockAtHeight { height: BlockHeight },
    BlockHeightByHash { block: BlockHash },
    LatestFinalizationEntry,
    GenesisConfiguration,
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Key::RoundStatus => write!(f, "Round Status"),
            Key::FinalizedBlockAtHeight { height } => {
                write!(f, "Finalized Block at height {}", height)
            }
            Key::BlockHeightByHash { block } => write!(f, "Block Height of block {}", block),
            Key::LatestFinalizationEntry => write!(f, "Latest Finalization Entry"),
            Key::GenesisConfiguration => write!(f, "Genesis Configuration"),
        }
    }
}

/// Enumerates the ways getting a value from the store can fail.
///
/// Malformed bytes under a consensus key mean the store is broken, which is not recoverable in the
/// consensus context (the engine treats it as fatal).
#[derive(Debug)]
pub enum KVGetError {
    /// A value that must exist, given other state that was read, was not found.
    ValueExpectedButNotFound { key: Key },

    /// The value under `key` could not be deserialized.
    DeserializeValueError { key: Key, source: std::io::Error },

    /// The value under `key` deserialized, but contained invalid key material.
    InvalidKeyMaterial { key: Key },
}

impl Display for KVGetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KVGetError::ValueExpectedButNotFound { key } => {
                write!(f, "Did not find the expected value under the key: {}", key)
            }
            KVGetError::DeserializeValueError { key, source } => write!(
                f,
                "Failed to deserialize the value under the key: {}. Caused by: {}",
                key, source
            ),
            KVGetError::InvalidKeyMaterial { key } => write!(
                f,
                "The value under the key {} contains invalid key material",
                key
            ),
        }
    }
}
