/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple components of the consensus engine.
//!
//! Types specific to a single component can be found in that component's module, e.g., the vote
//! pools in [`crate::quorum`] and [`crate::timeout`].

pub mod data_types;

pub mod block;

pub mod certificates;

pub mod committee;

pub mod genesis;
