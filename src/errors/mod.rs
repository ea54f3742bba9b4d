// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Error types for the pipeline runner
//!
//! All fallible operations in bioflow return [`BioflowError`]. Backend
//! failures carry enough context to reproduce the failing submission:
//! the exact command line, the exit code, and the captured output.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for bioflow operations
pub type BioflowResult<T> = Result<T, BioflowError>;

/// Main error type for bioflow
#[derive(Error, Debug, Diagnostic)]
pub enum BioflowError {
    // ─────────────────────────────────────────────────────────────────────────
    // Backend Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to start command '{name}' (exit {exit_code})\n  command: {command_line}\n{}", indent_output(stdout, stderr))]
    #[diagnostic(
        code(bioflow::start_failed),
        help("Check that the backend is reachable and the submit command is on PATH")
    )]
    StartFailed {
        name: String,
        command_line: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Status query failed for job {id}: {message}")]
    #[diagnostic(code(bioflow::status_failed))]
    StatusFailed { id: String, message: String },

    #[error("Status query for job {id} failed {attempts} consecutive times")]
    #[diagnostic(
        code(bioflow::status_exhausted),
        help("The backend stopped answering; the job may still be running")
    )]
    StatusExhausted { id: String, attempts: u32 },

    #[error("Failed to stop job {id}: {message}")]
    #[diagnostic(code(bioflow::stop_failed))]
    StopFailed { id: String, message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Staleness / Metadata Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Malformed output metadata file '{path}': {reason}")]
    #[diagnostic(
        code(bioflow::meta_parse),
        help("Delete the file to forget this output, or restore it from a backup")
    )]
    MetaParse { path: PathBuf, reason: String },

    #[error("Expected output '{path}' was not created by stage '{stage}'")]
    #[diagnostic(
        code(bioflow::missing_output),
        help("The stage body finished without producing this file and no metadata record explains its absence")
    )]
    MissingOutput { path: String, stage: String },

    #[error("Dependency graph contains a cycle involving: {}", outputs.join(", "))]
    #[diagnostic(code(bioflow::circular_dependency))]
    CircularDependency { outputs: Vec<String> },

    // ─────────────────────────────────────────────────────────────────────────
    // Composition Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Pattern '{pattern}' matched no input files")]
    #[diagnostic(
        code(bioflow::pattern_match),
        help("Check the pattern against the inputs of this and prior stages; '%' captures the branch id, '*' is a wildcard")
    )]
    PatternMatch { pattern: String },

    #[error("{} parallel branch(es) failed:\n{}", messages.len(), messages.iter().map(|m| format!("  {m}")).collect::<Vec<_>>().join("\n"))]
    #[diagnostic(code(bioflow::branch_failed))]
    Branch { messages: Vec<String> },

    #[error("Stage '{stage}' failed: {message}")]
    #[diagnostic(code(bioflow::stage_failed))]
    StageFailed { stage: String, message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Invalid configuration: {reason}")]
    #[diagnostic(code(bioflow::invalid_config))]
    InvalidConfig {
        reason: String,
        #[help]
        help: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("IO error: {message}")]
    #[diagnostic(code(bioflow::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(bioflow::yaml_error))]
    Yaml { message: String },
}

impl From<std::io::Error> for BioflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for BioflowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl BioflowError {
    /// Create a start error from a finished submit process
    pub fn start_failed(
        name: &str,
        command_line: &str,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
    ) -> Self {
        Self::StartFailed {
            name: name.to_string(),
            command_line: command_line.to_string(),
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    /// Aggregate failed branches into a single composite error,
    /// deduplicating repeated messages
    pub fn from_branches(messages: Vec<String>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let messages = messages
            .into_iter()
            .filter(|m| seen.insert(m.clone()))
            .collect();
        Self::Branch { messages }
    }
}

/// Indent captured stdout/stderr for display under an error heading
fn indent_output(stdout: &str, stderr: &str) -> String {
    let mut out = String::new();
    for (label, text) in [("stdout", stdout), ("stderr", stderr)] {
        if text.trim().is_empty() {
            continue;
        }
        out.push_str(&format!("  {label}:\n"));
        for line in text.lines() {
            out.push_str(&format!("    {line}\n"));
        }
    }
    out
}
