// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! CLI command definitions and handlers
//!
//! Read-only views over a working directory's output metadata. Pipeline
//! definitions themselves are a library API; the binary only inspects
//! what previous runs recorded.

pub mod graph;
pub mod status;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Pipeline runner core
///
/// Inspect output dependency state recorded by pipeline runs.
#[derive(Parser, Debug)]
#[clap(
    name = "bioflow",
    version,
    about = "Pipeline runner core: dependency state over recorded outputs",
    long_about = None,
    after_help = "Examples:\n\
        bioflow status                  Report per-output up-to-date state\n\
        bioflow status -o calls.vcf     Focus on one output's lineage\n\
        bioflow graph --format dot      Render the dependency graph\n\n\
        See 'bioflow <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Report which recorded outputs are up to date
    Status {
        /// Restrict the report to one output's ancestors and descendants
        #[clap(short, long)]
        output: Option<String>,
    },

    /// Show the output dependency graph
    Graph {
        /// Output format
        #[clap(short, long, value_enum, default_value_t = GraphFormat::Text)]
        format: GraphFormat,
    },
}

/// Graph output format
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    /// Per-output status lines
    Text,
    /// Graphviz DOT
    Dot,
}
