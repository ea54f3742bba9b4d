// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Command executors
//!
//! This module provides the executor trait and backend implementations
//! for running a single shell command on a target: directly in a local
//! shell, through a user-provided management script, or on an LSF batch
//! scheduler.

mod batch;
mod custom;
mod gate;
mod local;

pub use batch::LsfExecutor;
pub use custom::CustomScriptExecutor;
pub use gate::ConcurrencyGate;
pub use local::LocalExecutor;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::config::{ExecutorKind, RunConfig};
use crate::errors::BioflowResult;

/// Consecutive transient status failures tolerated before a wait fails
pub const MAX_STATUS_ERRORS: u32 = 4;

/// Pause between retries after a transient status failure
pub const STATUS_RETRY_SLEEP_MS: u64 = 100;

/// Where a command's status stands at the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Accepted but not yet running
    Queueing,
    /// Running on the target
    Running,
    /// Finished; an exit code is available
    Complete,
    /// The backend cannot say
    Unknown,
}

impl CommandStatus {
    /// Parse a status token as printed by management scripts
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "QUEUEING" => Some(Self::Queueing),
            "RUNNING" => Some(Self::Running),
            "COMPLETE" => Some(Self::Complete),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Contract every backend implements.
///
/// One executor instance owns one submitted command. `stop` is
/// idempotent and best-effort; `cleanup` releases anything `start`
/// attached (forwarders, permits) and never fails.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Submit a command, blocking until the backend assigns an id.
    /// Creates the per-job workdir before submission.
    async fn start(
        &mut self,
        config: &RunConfig,
        id: &str,
        name: &str,
        cmd: &str,
    ) -> BioflowResult<()>;

    /// Cheap status query
    async fn status(&mut self) -> BioflowResult<CommandStatus>;

    /// Block until completion, returning the command's exit code
    async fn wait_for(&mut self) -> BioflowResult<i32>;

    /// Request cancellation; idempotent
    async fn stop(&mut self) -> BioflowResult<()>;

    /// Release resources attached during `start`
    async fn cleanup(&mut self);

    /// Regexes of stdout/stderr lines the driver should suppress
    fn ignorable_outputs(&self) -> Option<Vec<String>> {
        None
    }
}

/// Create the executor selected by the configuration
pub fn create_executor(config: &RunConfig, workdir: &Path) -> Box<dyn CommandExecutor> {
    let poll = PollSettings::from_config(config);
    match &config.executor {
        ExecutorKind::Local => Box::new(LocalExecutor::new(workdir)),
        ExecutorKind::CustomScript { script } => {
            Box::new(CustomScriptExecutor::new(script.clone(), workdir, poll))
        }
        ExecutorKind::Lsf => Box::new(LsfExecutor::new(workdir, poll)),
    }
}

/// Per-job working directory under the metadata root
pub fn job_dir(workdir: &Path, id: &str) -> PathBuf {
    workdir.join(".bioflow").join("commandtmp").join(id)
}

/// Exponential backoff settings for status polling.
///
/// The sleep between polls starts at the minimum interval and grows with
/// elapsed time, capped so it never exceeds `min + max`.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Minimum sleep in milliseconds
    pub min_sleep_ms: u64,
    /// Maximum additional sleep in milliseconds
    pub max_sleep_ms: u64,
    /// Period over which the interval backs off, in milliseconds
    pub backoff_period_ms: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            min_sleep_ms: 2000,
            max_sleep_ms: 5000,
            backoff_period_ms: 180_000,
        }
    }
}

impl PollSettings {
    /// Take the polling intervals from a run configuration
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            min_sleep_ms: config.minimum_command_status_poll_interval,
            max_sleep_ms: config.max_command_status_poll_interval,
            backoff_period_ms: config.command_status_backoff_period,
        }
    }

    /// Sleep to apply after `elapsed_ms` of waiting:
    /// `min + min(max, exp(factor * elapsed))` with
    /// `factor = ln(max - min) / backoff_period`.
    pub fn sleep_for(&self, elapsed_ms: u64) -> u64 {
        let range = (self.max_sleep_ms.saturating_sub(self.min_sleep_ms)).max(1) as f64;
        let factor = range.ln() / self.backoff_period_ms as f64;
        let grown = (factor * elapsed_ms as f64).exp();
        self.min_sleep_ms + grown.min(self.max_sleep_ms as f64) as u64
    }
}
