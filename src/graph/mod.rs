// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Dependency graph over output metadata
//!
//! Rebuilds the forward producer/consumer graph from the records in the
//! metadata store, propagates timestamps downwards, then sweeps
//! backwards to decide which outputs are up to date. The graph is
//! recomputed from disk for each decision pass and is read-only once
//! built.

mod build;
mod query;

pub use build::{DependencyGraph, GraphNode};
