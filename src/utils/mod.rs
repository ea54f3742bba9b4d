// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Utility modules
//!
//! Small path and timestamp helpers shared across the crate.

pub mod paths;

pub use paths::*;
