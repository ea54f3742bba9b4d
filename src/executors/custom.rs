// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Custom-script executor
//!
//! Delegates job management to a user-provided shell script with three
//! entry points: `start` (environment carries the job description,
//! stdout returns the backend id), `status <id>` (first token is the
//! state, second the exit code when COMPLETE) and `stop <id>`. This is
//! the generic adapter for schedulers bioflow has no native dialect for.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    job_dir, CommandExecutor, CommandStatus, ConcurrencyGate, PollSettings, MAX_STATUS_ERRORS,
    STATUS_RETRY_SLEEP_MS,
};
use crate::config::RunConfig;
use crate::errors::{BioflowError, BioflowResult};

/// Stop failures whose stderr matches one of these is an already-gone
/// job, not an error
const STOP_IGNORABLE: &[&str] = &["Unknown Job Id", "invalid state for job - COMPLETE"];

/// Attempts made to stop a job before giving up
const STOP_RETRIES: u32 = 3;

/// Executor delegating to a user-provided management script
pub struct CustomScriptExecutor {
    script: PathBuf,
    workdir: PathBuf,
    poll: PollSettings,
    job_id: Option<String>,
    exit_code: Option<i32>,
}

impl CustomScriptExecutor {
    /// Create an executor around a management script
    pub fn new(script: PathBuf, workdir: &Path, poll: PollSettings) -> Self {
        Self {
            script,
            workdir: workdir.to_path_buf(),
            poll,
            job_id: None,
            exit_code: None,
        }
    }

    fn script_display(&self) -> String {
        self.script.display().to_string()
    }

    fn known_id(&self) -> String {
        self.job_id.clone().unwrap_or_else(|| "<unstarted>".into())
    }

    async fn invoke(&self, args: &[&str], env: &[(String, String)]) -> BioflowResult<Output> {
        let _permit = ConcurrencyGate::acquire().await;

        let mut command = Command::new(&self.script);
        command.args(args).current_dir(&self.workdir);
        for (key, value) in env {
            command.env(key, value);
        }

        Ok(command.output().await?)
    }
}

#[async_trait]
impl CommandExecutor for CustomScriptExecutor {
    async fn start(
        &mut self,
        config: &RunConfig,
        id: &str,
        name: &str,
        cmd: &str,
    ) -> BioflowResult<()> {
        let dir = job_dir(&self.workdir, id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut env = vec![
            ("NAME".to_string(), name.to_string()),
            ("JOBDIR".to_string(), dir.display().to_string()),
            ("COMMAND".to_string(), cmd.to_string()),
        ];

        let resources = &config.resources;
        for (key, value) in [
            ("ACCOUNT", resources.account.clone()),
            ("WALLTIME", resources.walltime.clone()),
            ("MEMORY", resources.memory.clone()),
            ("PROCS", resources.procs.map(|p| p.to_string())),
            ("QUEUE", resources.queue.clone()),
        ] {
            if let Some(value) = value {
                env.push((key.to_string(), value));
            }
        }

        let output = self.invoke(&["start"], &env).await?;
        let command_line = format!("{} start", self.script_display());
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(BioflowError::start_failed(
                name,
                &command_line,
                output.status.code().unwrap_or(-1),
                &stdout,
                &stderr,
            ));
        }

        let job_id = stdout.trim();
        if job_id.is_empty() {
            return Err(BioflowError::start_failed(
                name,
                &command_line,
                0,
                &stdout,
                "start script printed no job id",
            ));
        }

        debug!(stage = name, job_id, "job submitted via management script");
        self.job_id = Some(job_id.to_string());
        Ok(())
    }

    async fn status(&mut self) -> BioflowResult<CommandStatus> {
        let id = self.known_id();
        let Some(job_id) = self.job_id.clone() else {
            return Ok(CommandStatus::Unknown);
        };

        let output = self.invoke(&["status", job_id.as_str()], &[]).await?;

        if !output.status.success() {
            return Err(BioflowError::StatusFailed {
                id,
                message: format!(
                    "status script exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut tokens = stdout.split_whitespace();

        let status = tokens
            .next()
            .and_then(CommandStatus::from_token)
            .ok_or_else(|| BioflowError::StatusFailed {
                id: id.clone(),
                message: format!("unrecognised status output: {}", stdout.trim()),
            })?;

        if status == CommandStatus::Complete {
            let code = tokens
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| BioflowError::StatusFailed {
                    id,
                    message: format!("COMPLETE without an exit code: {}", stdout.trim()),
                })?;
            self.exit_code = Some(code);
        }

        Ok(status)
    }

    async fn wait_for(&mut self) -> BioflowResult<i32> {
        let started = Instant::now();
        let mut errors: u32 = 0;

        loop {
            match self.status().await {
                Ok(CommandStatus::Complete) => {
                    return Ok(self.exit_code.unwrap_or(-1));
                }
                Ok(_) => {
                    errors = 0;
                    let elapsed = started.elapsed().as_millis() as u64;
                    tokio::time::sleep(Duration::from_millis(self.poll.sleep_for(elapsed))).await;
                }
                Err(e) => {
                    errors += 1;
                    warn!(attempt = errors, "transient status failure: {e}");
                    if errors >= MAX_STATUS_ERRORS {
                        return Err(BioflowError::StatusExhausted {
                            id: self.known_id(),
                            attempts: errors,
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(STATUS_RETRY_SLEEP_MS)).await;
                }
            }
        }
    }

    async fn stop(&mut self) -> BioflowResult<()> {
        let Some(job_id) = self.job_id.clone() else {
            return Ok(());
        };

        let mut last_message = String::new();

        for _attempt in 0..STOP_RETRIES {
            let output = self.invoke(&["stop", job_id.as_str()], &[]).await?;
            if output.status.success() {
                return Ok(());
            }

            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if STOP_IGNORABLE.iter().any(|p| stderr.contains(p)) {
                // The job already finished or the backend forgot it
                return Ok(());
            }

            last_message = format!(
                "stop script exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
            tokio::time::sleep(Duration::from_millis(STATUS_RETRY_SLEEP_MS)).await;
        }

        Err(BioflowError::StopFailed {
            id: job_id,
            message: last_message,
        })
    }

    async fn cleanup(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fast_poll() -> PollSettings {
        PollSettings {
            min_sleep_ms: 10,
            max_sleep_ms: 20,
            backoff_period_ms: 1000,
        }
    }

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("backend.sh");
        std::fs::write(&path, format!("#!/bin/bash\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn executor_for(temp: &TempDir, body: &str) -> CustomScriptExecutor {
        let script = write_script(temp.path(), body);
        CustomScriptExecutor::new(script, temp.path(), fast_poll())
    }

    #[tokio::test]
    async fn test_start_parses_job_id_and_passes_environment() {
        let temp = TempDir::new().unwrap();
        let mut executor = executor_for(
            &temp,
            r#"
case "$1" in
  start) echo "$NAME:$QUEUE" > seen.env; echo "J42" ;;
esac
"#,
        );

        let mut config = RunConfig::default();
        config.resources.queue = Some("batch".into());

        executor
            .start(&config, "1", "align", "echo hi")
            .await
            .unwrap();

        assert_eq!(executor.job_id.as_deref(), Some("J42"));
        let seen = std::fs::read_to_string(temp.path().join("seen.env")).unwrap();
        assert_eq!(seen.trim(), "align:batch");
        assert!(job_dir(temp.path(), "1").is_dir());
    }

    #[tokio::test]
    async fn test_start_failure_carries_output() {
        let temp = TempDir::new().unwrap();
        let mut executor = executor_for(
            &temp,
            r#"
case "$1" in
  start) echo "queue closed" >&2; exit 7 ;;
esac
"#,
        );

        let err = executor
            .start(&RunConfig::default(), "1", "align", "echo hi")
            .await
            .unwrap_err();

        match err {
            BioflowError::StartFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 7);
                assert!(stderr.contains("queue closed"));
            }
            other => panic!("expected StartFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_job_id_is_a_start_failure() {
        let temp = TempDir::new().unwrap();
        let mut executor = executor_for(&temp, r#"exit 0"#);

        let err = executor
            .start(&RunConfig::default(), "1", "align", "echo hi")
            .await
            .unwrap_err();
        assert!(matches!(err, BioflowError::StartFailed { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_polls_until_complete() {
        let temp = TempDir::new().unwrap();
        let mut executor = executor_for(
            &temp,
            r#"
case "$1" in
  start) echo "J42" ;;
  status)
    n=$(cat polls 2>/dev/null || echo 0)
    n=$((n+1)); echo $n > polls
    if [ "$n" -le 3 ]; then echo "RUNNING"; else echo "COMPLETE 0"; fi ;;
esac
"#,
        );

        executor
            .start(&RunConfig::default(), "1", "align", "echo hi")
            .await
            .unwrap();

        assert_eq!(executor.wait_for().await.unwrap(), 0);
        let polls: u32 = std::fs::read_to_string(temp.path().join("polls"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(polls, 4);
    }

    #[tokio::test]
    async fn test_wait_for_fails_after_four_consecutive_status_errors() {
        let temp = TempDir::new().unwrap();
        let mut executor = executor_for(
            &temp,
            r#"
case "$1" in
  start) echo "J9" ;;
  status) exit 1 ;;
esac
"#,
        );

        executor
            .start(&RunConfig::default(), "1", "align", "echo hi")
            .await
            .unwrap();

        let err = executor.wait_for().await.unwrap_err();
        match err {
            BioflowError::StatusExhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected StatusExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_for_recovers_after_three_status_errors() {
        let temp = TempDir::new().unwrap();
        let mut executor = executor_for(
            &temp,
            r#"
case "$1" in
  start) echo "J9" ;;
  status)
    n=$(cat fails 2>/dev/null || echo 0)
    n=$((n+1)); echo $n > fails
    if [ "$n" -le 3 ]; then exit 1; fi
    echo "COMPLETE 5" ;;
esac
"#,
        );

        executor
            .start(&RunConfig::default(), "1", "align", "echo hi")
            .await
            .unwrap();

        assert_eq!(executor.wait_for().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_stop_ignores_known_already_finished_errors() {
        let temp = TempDir::new().unwrap();
        let mut executor = executor_for(
            &temp,
            r#"
case "$1" in
  start) echo "J1" ;;
  stop) echo "Unknown Job Id" >&2; exit 1 ;;
esac
"#,
        );

        executor
            .start(&RunConfig::default(), "1", "align", "echo hi")
            .await
            .unwrap();
        executor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_with_unknown_cause_fails_after_retries() {
        let temp = TempDir::new().unwrap();
        let mut executor = executor_for(
            &temp,
            r#"
case "$1" in
  start) echo "J1" ;;
  stop)
    n=$(cat stops 2>/dev/null || echo 0)
    echo $((n+1)) > stops
    echo "backend on fire" >&2; exit 1 ;;
esac
"#,
        );

        executor
            .start(&RunConfig::default(), "1", "align", "echo hi")
            .await
            .unwrap();

        let err = executor.stop().await.unwrap_err();
        assert!(matches!(err, BioflowError::StopFailed { .. }));

        let attempts: u32 = std::fs::read_to_string(temp.path().join("stops"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(attempts, STOP_RETRIES);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let mut executor = executor_for(&temp, "exit 0");
        executor.stop().await.unwrap();
    }
}
