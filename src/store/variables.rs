/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Key-space layout of the low-level consensus store.
//!
//! Every persisted variable lives under a single-byte prefix. Two variables are indexed:
//! finalized blocks are addressed primarily by height ([`FINALIZED_BLOCK_AT_HEIGHT`]) with a
//! hash-to-height secondary index ([`BLOCK_HEIGHT_BY_HASH`]); the rest are single keys.
//!
//! The round status ([`ROUND_STATUS`]) is special: it is always written alone, in its own atomic
//! write, before any side effect of a round change is allowed to escape the engine.

/// Prefix: `height (8 bytes, big-endian)` → Borsh-serialized signed block.
pub const FINALIZED_BLOCK_AT_HEIGHT: [u8; 1] = [0];

/// Prefix: `block hash (32 bytes)` → Borsh-serialized block height.
pub const BLOCK_HEIGHT_BY_HASH: [u8; 1] = [1];

/// Single key → Borsh-serialized persisted round status.
pub const ROUND_STATUS: [u8; 1] = [2];

/// Single key → Borsh-serialized finalization entry that last advanced finality.
pub const LATEST_FINALIZATION_ENTRY: [u8; 1] = [3];

/// Single key → Borsh-serialized genesis configuration.
pub const GENESIS_CONFIGURATION: [u8; 1] = [4];

/// Takes references to two byteslices and returns a vector containing the bytes of the first one,
/// and then the bytes of the second one.
pub(crate) fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}
