/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Persistence of consensus state: the pluggable low-level store, its key-space layout, and the
//! block database export/import format.

pub mod export;

pub mod kv_store;

pub mod variables;
