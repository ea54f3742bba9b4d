// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! LSF batch scheduler executor
//!
//! Submission is file-based: a wrapper script `cmd.sh` in the job
//! workdir runs the user command, captures stdout to `cmd.out` and the
//! numeric exit code to `cmd.exit`. `status` is derived from what
//! exists in the job workdir plus the in-memory job id from `start`;
//! `wait_for` only polls for `cmd.exit`, so it can read a finished
//! job's exit code straight off disk. Background forwarders stream
//! `cmd.out`/`cmd.err` back to the driver's own stdout/stderr.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{job_dir, CommandExecutor, CommandStatus, ConcurrencyGate, PollSettings};
use crate::config::RunConfig;
use crate::errors::{BioflowError, BioflowResult};

/// Retries when `cmd.exit` exists but holds no valid integer
const EXIT_PARSE_RETRIES: u32 = 10;
const EXIT_PARSE_SLEEP_MS: u64 = 500;

/// Attempts made to stop a job before giving up
const STOP_RETRIES: u32 = 3;

/// Forwarder poll interval for `cmd.out`/`cmd.err`
const FORWARD_INTERVAL_MS: u64 = 500;

/// Stop failures whose stderr matches one of these is an already-gone job
const STOP_IGNORABLE: &[&str] = &["already finished", "No matching job found"];

/// Executor submitting to an LSF batch scheduler
pub struct LsfExecutor {
    workdir: PathBuf,
    poll: PollSettings,
    submit_command: String,
    stop_command: String,
    job_dir: Option<PathBuf>,
    job_id: Option<String>,
    forwarders: Vec<JoinHandle<()>>,
}

impl LsfExecutor {
    /// Create an executor rooted at a working directory
    pub fn new(workdir: &Path, poll: PollSettings) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            poll,
            submit_command: "bsub".into(),
            stop_command: "bkill".into(),
            job_dir: None,
            job_id: None,
            forwarders: Vec::new(),
        }
    }

    /// Override the scheduler commands; used to point at site wrappers
    pub fn with_commands(mut self, submit: &str, stop: &str) -> Self {
        self.submit_command = submit.into();
        self.stop_command = stop.into();
        self
    }

    /// The wrapper script LSF executes: runs the user command from the
    /// pipeline workdir, captures stdout, records the exit code, and
    /// exits with it so the scheduler sees the same result.
    fn wrapper_script(&self, dir: &Path, cmd: &str) -> String {
        format!(
            "#!/bin/bash\n\
             cd \"{workdir}\"\n\
             (\n\
             {cmd}\n\
             ) > \"{out}\"\n\
             result=$?\n\
             echo $result > \"{exit}\"\n\
             exit $result\n",
            workdir = self.workdir.display(),
            out = dir.join("cmd.out").display(),
            exit = dir.join("cmd.exit").display(),
        )
    }

    /// Extract the job id from the scheduler's announcement line,
    /// e.g. `Job <12345> is submitted to queue normal.`
    fn parse_job_id(stdout: &str) -> Option<String> {
        let announcement =
            Regex::new(r"Job <(\d+)> is submitted").expect("invalid job id pattern");
        announcement
            .captures(stdout)
            .map(|c| c[1].to_string())
    }

    /// Stream new content of `path` to the driver, dropping lines that
    /// match any of the suppression patterns
    fn spawn_forwarder(path: PathBuf, to_stderr: bool, suppress: Vec<String>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let patterns: Vec<Regex> = suppress
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect();
            let mut offset = 0usize;
            let mut ticker =
                tokio::time::interval(Duration::from_millis(FORWARD_INTERVAL_MS));

            loop {
                ticker.tick().await;
                let Ok(content) = tokio::fs::read_to_string(&path).await else {
                    continue;
                };
                if content.len() <= offset {
                    continue;
                }
                let fresh = &content[offset..];
                offset = content.len();

                for line in fresh.lines() {
                    if patterns.iter().any(|p| p.is_match(line)) {
                        continue;
                    }
                    if to_stderr {
                        eprintln!("{line}");
                    } else {
                        println!("{line}");
                    }
                }
            }
        })
    }

    async fn read_exit_code(&self, exit_file: &Path) -> i32 {
        for _attempt in 0..EXIT_PARSE_RETRIES {
            if let Ok(content) = tokio::fs::read_to_string(exit_file).await {
                if let Ok(code) = content.trim().parse() {
                    return code;
                }
            }
            tokio::time::sleep(Duration::from_millis(EXIT_PARSE_SLEEP_MS)).await;
        }

        warn!(file = %exit_file.display(), "exit file never held a valid code");
        -1
    }
}

#[async_trait]
impl CommandExecutor for LsfExecutor {
    async fn start(
        &mut self,
        config: &RunConfig,
        id: &str,
        name: &str,
        cmd: &str,
    ) -> BioflowResult<()> {
        let dir = job_dir(&self.workdir, id);
        tokio::fs::create_dir_all(&dir).await?;

        let script = dir.join("cmd.sh");
        tokio::fs::write(&script, self.wrapper_script(&dir, cmd)).await?;
        self.job_dir = Some(dir.clone());

        let resources = &config.resources;
        let mut args: Vec<String> = Vec::new();
        if let Some(queue) = &resources.queue {
            args.push("-q".into());
            args.push(queue.clone());
        }
        let jobname = resources.jobname.clone().unwrap_or_else(|| name.to_string());
        args.push("-J".into());
        args.push(jobname);

        let command_line = format!(
            "{} {} < {}",
            self.submit_command,
            args.join(" "),
            script.display()
        );

        let err_file = std::fs::File::create(dir.join("cmd.err"))?;
        let script_file = std::fs::File::open(&script)?;

        let output = {
            let _permit = ConcurrencyGate::acquire().await;
            Command::new(&self.submit_command)
                .args(&args)
                .current_dir(&self.workdir)
                .stdin(Stdio::from(script_file))
                .stdout(Stdio::piped())
                .stderr(Stdio::from(err_file))
                .output()
                .await
                .map_err(|e| {
                    BioflowError::start_failed(name, &command_line, -1, "", &e.to_string())
                })?
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = tokio::fs::read_to_string(dir.join("cmd.err"))
                .await
                .unwrap_or_default();
            return Err(BioflowError::start_failed(
                name,
                &command_line,
                output.status.code().unwrap_or(-1),
                &stdout,
                &stderr,
            ));
        }

        let job_id = Self::parse_job_id(&stdout).ok_or_else(|| {
            BioflowError::start_failed(
                name,
                &command_line,
                0,
                &stdout,
                "no job announcement in scheduler output",
            )
        })?;

        debug!(stage = name, job_id, "job submitted to scheduler");
        self.job_id = Some(job_id);

        let suppress = self.ignorable_outputs().unwrap_or_default();
        self.forwarders.push(Self::spawn_forwarder(
            dir.join("cmd.out"),
            false,
            Vec::new(),
        ));
        self.forwarders.push(Self::spawn_forwarder(
            dir.join("cmd.err"),
            true,
            suppress,
        ));

        Ok(())
    }

    async fn status(&mut self) -> BioflowResult<CommandStatus> {
        let Some(dir) = &self.job_dir else {
            return Ok(CommandStatus::Unknown);
        };

        if !dir.join("cmd.sh").exists() {
            return Ok(CommandStatus::Unknown);
        }

        if self.job_id.is_none() {
            return Ok(CommandStatus::Queueing);
        }

        if dir.join("cmd.exit").exists() {
            Ok(CommandStatus::Complete)
        } else {
            Ok(CommandStatus::Running)
        }
    }

    async fn wait_for(&mut self) -> BioflowResult<i32> {
        let dir = self.job_dir.clone().ok_or_else(|| BioflowError::StatusFailed {
            id: "<unstarted>".into(),
            message: "no job was submitted".into(),
        })?;

        let exit_file = dir.join("cmd.exit");
        let started = Instant::now();

        while !exit_file.exists() {
            let elapsed = started.elapsed().as_millis() as u64;
            tokio::time::sleep(Duration::from_millis(self.poll.sleep_for(elapsed))).await;
        }

        Ok(self.read_exit_code(&exit_file).await)
    }

    async fn stop(&mut self) -> BioflowResult<()> {
        let Some(job_id) = self.job_id.clone() else {
            return Ok(());
        };

        let mut last_message = String::new();

        for _attempt in 0..STOP_RETRIES {
            let output = {
                let _permit = ConcurrencyGate::acquire().await;
                Command::new(&self.stop_command)
                    .arg(&job_id)
                    .current_dir(&self.workdir)
                    .output()
                    .await?
            };

            // Exit code zero is the only success; anything else is a
            // failure unless the job is known to be already gone
            if output.status.success() {
                return Ok(());
            }

            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if STOP_IGNORABLE.iter().any(|p| stderr.contains(p)) {
                return Ok(());
            }

            last_message = format!(
                "{} exited with {}: {}",
                self.stop_command,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Err(BioflowError::StopFailed {
            id: job_id,
            message: last_message,
        })
    }

    async fn cleanup(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }

    fn ignorable_outputs(&self) -> Option<Vec<String>> {
        Some(vec![
            r"^Job <\d+> is submitted to queue".to_string(),
            r"^<<Waiting for dispatch".to_string(),
            r"^<<Starting on ".to_string(),
        ])
    }
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

    fn write_stub(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/bash\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[test]
    fn test_parse_job_id_from_announcement() {
        let id = LsfExecutor::parse_job_id("Job <12345> is submitted to queue normal.\n");
        assert_eq!(id.as_deref(), Some("12345"));
        assert!(LsfExecutor::parse_job_id("Request aborted").is_none());
    }

    #[test]
    fn test_wrapper_script_records_exit_code() {
        let temp = TempDir::new().unwrap();
        let executor = LsfExecutor::new(temp.path(), fast_poll());
        let script = executor.wrapper_script(&temp.path().join("job"), "echo hi");

        assert!(script.contains("cmd.out"));
        assert!(script.contains("cmd.exit"));
        assert!(script.ends_with("exit $result\n"));
    }

    #[tokio::test]
    async fn test_status_is_derived_from_job_workdir() {
        let temp = TempDir::new().unwrap();
        let mut executor = LsfExecutor::new(temp.path(), fast_poll());

        // Nothing submitted yet
        assert_eq!(executor.status().await.unwrap(), CommandStatus::Unknown);

        let dir = job_dir(temp.path(), "5");
        std::fs::create_dir_all(&dir).unwrap();
        executor.job_dir = Some(dir.clone());
        assert_eq!(executor.status().await.unwrap(), CommandStatus::Unknown);

        std::fs::write(dir.join("cmd.sh"), "#!/bin/bash\n").unwrap();
        assert_eq!(executor.status().await.unwrap(), CommandStatus::Queueing);

        executor.job_id = Some("5001".into());
        assert_eq!(executor.status().await.unwrap(), CommandStatus::Running);

        std::fs::write(dir.join("cmd.exit"), "0\n").unwrap();
        assert_eq!(executor.status().await.unwrap(), CommandStatus::Complete);
    }

    #[tokio::test]
    async fn test_submit_and_wait_through_stub_scheduler() {
        let temp = TempDir::new().unwrap();

        // Stub scheduler: announce a job id, run the wrapper in the background
        let bsub = write_stub(
            temp.path(),
            "bsub",
            "cat > job.sh\nchmod +x job.sh\n(bash job.sh &) \necho 'Job <12345> is submitted to queue normal.'",
        );
        let bkill = write_stub(temp.path(), "bkill", "exit 0");

        let mut executor =
            LsfExecutor::new(temp.path(), fast_poll()).with_commands(&bsub, &bkill);

        executor
            .start(&RunConfig::default(), "9", "count", "printf 1 > counted.txt")
            .await
            .unwrap();

        assert_eq!(executor.job_id.as_deref(), Some("12345"));
        assert_eq!(executor.wait_for().await.unwrap(), 0);
        assert!(temp.path().join("counted.txt").exists());

        let exit = std::fs::read_to_string(job_dir(temp.path(), "9").join("cmd.exit")).unwrap();
        assert_eq!(exit.trim(), "0");

        executor.cleanup().await;
    }

    #[tokio::test]
    async fn test_submit_failure_carries_scheduler_stderr() {
        let temp = TempDir::new().unwrap();
        let bsub = write_stub(temp.path(), "bsub", "echo 'queue unavailable' >&2\nexit 255");

        let mut executor =
            LsfExecutor::new(temp.path(), fast_poll()).with_commands(&bsub, "bkill");

        let err = executor
            .start(&RunConfig::default(), "9", "count", "true")
            .await
            .unwrap_err();

        match err {
            BioflowError::StartFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 255);
                assert!(stderr.contains("queue unavailable"));
            }
            other => panic!("expected StartFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_accepts_already_finished_jobs() {
        let temp = TempDir::new().unwrap();
        let bkill = write_stub(
            temp.path(),
            "bkill",
            "echo 'Job <12345>: Job has already finished' >&2\nexit 1",
        );

        let mut executor =
            LsfExecutor::new(temp.path(), fast_poll()).with_commands("bsub", &bkill);
        executor.job_id = Some("12345".into());

        executor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_treats_other_nonzero_exits_as_failure() {
        let temp = TempDir::new().unwrap();
        let bkill = write_stub(temp.path(), "bkill", "echo 'permission denied' >&2\nexit 1");

        let mut executor =
            LsfExecutor::new(temp.path(), fast_poll()).with_commands("bsub", &bkill);
        executor.job_id = Some("777".into());

        let err = executor.stop().await.unwrap_err();
        assert!(matches!(err, BioflowError::StopFailed { .. }));
    }

    #[tokio::test]
    async fn test_unparseable_exit_file_recovers_when_rewritten() {
        let temp = TempDir::new().unwrap();
        let executor = LsfExecutor::new(temp.path(), fast_poll());

        let exit_file = temp.path().join("cmd.exit");
        std::fs::write(&exit_file, "garbage").unwrap();

        let rewriter = {
            let exit_file = exit_file.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(700)).await;
                tokio::fs::write(&exit_file, "4\n").await.unwrap();
            })
        };

        assert_eq!(executor.read_exit_code(&exit_file).await, 4);
        rewriter.await.unwrap();
    }
}
