// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! # bioflow - Pipeline Runner Core
//!
//! `bioflow` composes named stages into an execution graph, tracks
//! file dependencies across runs to decide what must be rebuilt, and
//! dispatches each stage's shell commands through a pluggable backend.
//!
//! ## Features
//!
//! - **Composable pipelines** - `+` chains stages, `*` fans segments
//!   out over chromosomes, samples or filename patterns
//! - **Incremental runs** - per-output metadata records rebuild a
//!   dependency graph that knows what is still up to date, including
//!   intentionally cleaned intermediates
//! - **Pluggable execution** - local shell, a custom-script protocol,
//!   or an LSF batch scheduler, all behind one executor contract
//! - **Bounded concurrency** - a process-wide gate keeps fan-outs from
//!   overwhelming the head node
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bioflow::pipeline::{stage, FanoutKeys, PipelineRunner, ShellBody};
//!
//! let expr = stage("align", ShellBody::new("bwa mem ref.fa $input > $output", &["aligned.bam"]))
//!     + (FanoutKeys::branches(&["chr1", "chr2"])
//!         * vec![stage("call", ShellBody::new("call $input > $output", &["calls.vcf"]))]);
//!
//! let runner = PipelineRunner::new(workdir, config);
//! let pipeline = runner.run(&expr, vec!["reads.fastq".into()]).await?;
//! ```

pub mod cli;
pub mod config;
pub mod errors;
pub mod executors;
pub mod graph;
pub mod meta;
pub mod pipeline;
pub mod utils;

// Re-export commonly used types
pub use config::{ExecutorKind, ResourceConfig, RunConfig};
pub use errors::{BioflowError, BioflowResult};
pub use graph::DependencyGraph;
pub use meta::{MetaStore, OutputMeta};
pub use pipeline::{Pipeline, PipelineRunner};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
