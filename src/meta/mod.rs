// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Output metadata records
//!
//! Every output file a stage produces gets one metadata record describing
//! how it was made: the inputs, the command, a fingerprint of the command,
//! and lifecycle flags. Records persist as key/value text files under
//! `.bioflow/outputs/` and are the raw material for dependency analysis.

mod record;
mod store;

pub use record::{fingerprint, OutputMeta};
pub use store::MetaStore;
