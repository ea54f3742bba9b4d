// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Run configuration
//!
//! Defines the knobs the core consumes at run time: the global concurrency
//! limit, command status polling intervals, the executor backend selection,
//! and the resource requests forwarded to batch backends.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::{BioflowError, BioflowResult};

/// Configuration for one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum simultaneous backend calls (process-wide)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Minimum sleep between command status polls, in milliseconds
    #[serde(default = "default_min_poll_interval")]
    pub minimum_command_status_poll_interval: u64,

    /// Maximum additional sleep between command status polls, in milliseconds
    #[serde(default = "default_max_poll_interval")]
    pub max_command_status_poll_interval: u64,

    /// Period over which the poll interval backs off, in milliseconds
    #[serde(default = "default_backoff_period")]
    pub command_status_backoff_period: u64,

    /// Which backend executes commands
    #[serde(default)]
    pub executor: ExecutorKind,

    /// Resource requests forwarded to the backend
    #[serde(default)]
    pub resources: ResourceConfig,
}

fn default_concurrency() -> usize {
    1
}

fn default_min_poll_interval() -> u64 {
    2000
}

fn default_max_poll_interval() -> u64 {
    5000
}

fn default_backoff_period() -> u64 {
    180_000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            minimum_command_status_poll_interval: default_min_poll_interval(),
            max_command_status_poll_interval: default_max_poll_interval(),
            command_status_backoff_period: default_backoff_period(),
            executor: ExecutorKind::default(),
            resources: ResourceConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &std::path::Path) -> BioflowResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> BioflowResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> BioflowResult<()> {
        if self.concurrency == 0 {
            return Err(BioflowError::InvalidConfig {
                reason: "concurrency must be at least 1".into(),
                help: None,
            });
        }

        if self.minimum_command_status_poll_interval == 0 {
            return Err(BioflowError::InvalidConfig {
                reason: "minimum_command_status_poll_interval must be greater than 0".into(),
                help: None,
            });
        }

        if self.max_command_status_poll_interval <= self.minimum_command_status_poll_interval {
            return Err(BioflowError::InvalidConfig {
                reason: "max_command_status_poll_interval must exceed the minimum interval".into(),
                help: Some("the backoff formula needs a positive interval range".into()),
            });
        }

        if self.command_status_backoff_period == 0 {
            return Err(BioflowError::InvalidConfig {
                reason: "command_status_backoff_period must be greater than 0".into(),
                help: None,
            });
        }

        Ok(())
    }
}

/// Backend executor selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// Run commands directly in a local shell
    #[default]
    Local,

    /// Delegate to a user-provided start/status/stop script
    CustomScript {
        /// Path to the management script
        script: PathBuf,
    },

    /// Submit to an LSF batch scheduler
    Lsf,
}

/// Resource requests forwarded to batch backends
///
/// Every field is optional; unset fields are simply not passed through to
/// the backend environment or submit command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Accounting project the job is billed to
    #[serde(default)]
    pub account: Option<String>,

    /// Wall-time limit, in the backend's native format
    #[serde(default)]
    pub walltime: Option<String>,

    /// Memory request
    #[serde(default)]
    pub memory: Option<String>,

    /// Processor count
    #[serde(default)]
    pub procs: Option<u32>,

    /// Target queue
    #[serde(default)]
    pub queue: Option<String>,

    /// Job name override shown by the scheduler
    #[serde(default)]
    pub jobname: Option<String>,
}
