// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Local shell executor
//!
//! Runs the command directly in a local `bash -c` child process. The
//! concurrency permit is held for the life of the command, so the gate
//! bounds simultaneous local processes, not just submissions.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::{Child, Command};
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use super::{job_dir, CommandExecutor, CommandStatus, ConcurrencyGate};
use crate::config::RunConfig;
use crate::errors::{BioflowError, BioflowResult};

/// Executor running commands in a local shell
pub struct LocalExecutor {
    workdir: PathBuf,
    id: Option<String>,
    child: Option<Child>,
    exit_code: Option<i32>,
    permit: Option<OwnedSemaphorePermit>,
}

impl LocalExecutor {
    /// Create an executor rooted at a working directory
    pub fn new(workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            id: None,
            child: None,
            exit_code: None,
            permit: None,
        }
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn start(
        &mut self,
        _config: &RunConfig,
        id: &str,
        name: &str,
        cmd: &str,
    ) -> BioflowResult<()> {
        let permit = ConcurrencyGate::acquire().await;

        let dir = job_dir(&self.workdir, id);
        tokio::fs::create_dir_all(&dir).await?;

        debug!(stage = name, id, "spawning local command");

        let command_line = format!("bash -c '{cmd}'");
        let child = Command::new("bash")
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.workdir)
            .spawn()
            .map_err(|e| {
                BioflowError::start_failed(name, &command_line, -1, "", &e.to_string())
            })?;

        self.id = Some(id.to_string());
        self.child = Some(child);
        self.permit = Some(permit);
        Ok(())
    }

    async fn status(&mut self) -> BioflowResult<CommandStatus> {
        if self.exit_code.is_some() {
            return Ok(CommandStatus::Complete);
        }

        let Some(child) = self.child.as_mut() else {
            return Ok(CommandStatus::Unknown);
        };

        match child.try_wait()? {
            Some(status) => {
                self.exit_code = Some(status.code().unwrap_or(-1));
                Ok(CommandStatus::Complete)
            }
            None => Ok(CommandStatus::Running),
        }
    }

    async fn wait_for(&mut self) -> BioflowResult<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }

        let id = self.id.clone().unwrap_or_default();
        let Some(child) = self.child.as_mut() else {
            return Err(BioflowError::StatusFailed {
                id,
                message: "no command was started".into(),
            });
        };

        let status = child.wait().await?;
        let code = status.code().unwrap_or(-1);
        self.exit_code = Some(code);
        self.permit.take();
        Ok(code)
    }

    async fn stop(&mut self) -> BioflowResult<()> {
        if let Some(child) = self.child.as_mut() {
            if self.exit_code.is_none() {
                // Already-exited children make start_kill a no-op
                let _ = child.start_kill();
            }
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.permit.take();
    }
}
