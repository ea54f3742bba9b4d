// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Per-stage execution context
//!
//! A stage body reads its inputs from the context, declares the outputs
//! it will produce, and issues shell commands with [`StageContext::exec`].
//! Declared output names are qualified with the branch name so parallel
//! branches never collide on paths.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::errors::{BioflowError, BioflowResult};
use crate::executors::create_executor;
use crate::graph::DependencyGraph;
use crate::meta::MetaStore;
use crate::utils::mtime_millis;

/// One command issued by a stage body, with the outputs it was declared
/// to produce and their pre-run mtimes
#[derive(Debug, Clone)]
pub struct TrackedCommand {
    /// The shell command as issued
    pub command: String,
    /// Outputs declared at the time the command ran
    pub outputs: Vec<String>,
    /// mtime of each output before the command ran; `None` = absent
    pub pre_mtimes: Vec<Option<i64>>,
}

/// Mutable state a stage body works against
pub struct StageContext {
    /// Name of the running stage
    pub stage_name: String,
    /// Branch label for fan-out children; empty at the root
    pub branch: String,
    /// Inputs handed to this stage
    pub input: Vec<String>,
    /// Declared outputs, branch-qualified
    pub output: Vec<String>,
    /// Declared outputs before any later merge rewrites
    pub raw_output: Vec<String>,
    /// What the stage forwards to the next stage; defaults applied
    /// after the body returns
    pub next_inputs: Option<Vec<String>>,
    /// Commands issued through `exec`, in order
    pub tracked_outputs: Vec<TrackedCommand>,

    workdir: PathBuf,
    config: RunConfig,
    command_ids: Arc<AtomicU64>,
}

impl StageContext {
    /// Create a context for one stage run
    pub fn new(
        stage_name: &str,
        branch: &str,
        input: Vec<String>,
        workdir: &Path,
        config: RunConfig,
        command_ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            branch: branch.to_string(),
            input,
            output: Vec::new(),
            raw_output: Vec::new(),
            next_inputs: None,
            tracked_outputs: Vec::new(),
            workdir: workdir.to_path_buf(),
            config,
            command_ids,
        }
    }

    /// The pipeline working directory
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Declare outputs this stage will produce. Names are qualified
    /// with the branch label, once: `sorted.bam` on branch `chr1`
    /// becomes `sorted.chr1.bam`.
    pub fn produce(&mut self, outputs: &[&str]) -> &[String] {
        let start = self.output.len();
        for output in outputs {
            let qualified = branch_qualified(output, &self.branch);
            self.raw_output.push(qualified.clone());
            self.output.push(qualified);
        }
        &self.output[start..]
    }

    /// Declare what the next stage receives as inputs
    pub fn forward(&mut self, next: &[&str]) {
        self.next_inputs = Some(next.iter().map(|s| s.to_string()).collect());
    }

    /// Run a shell command through the configured backend, blocking
    /// until it completes. A command whose declared outputs are already
    /// up to date against the stage inputs is not dispatched at all.
    /// Declared outputs are snapshotted so the driver can tell which
    /// files the command actually produced.
    pub async fn exec(&mut self, cmd: &str) -> BioflowResult<()> {
        if !self.output.is_empty() {
            let store = MetaStore::new(&self.workdir);
            let records = store.scan()?;
            if !records.is_empty() {
                let graph = DependencyGraph::build(records)?;
                // Outputs neither on disk nor recorded have never been
                // built and always need the command
                let known = self
                    .output
                    .iter()
                    .all(|o| self.workdir.join(o).exists() || graph.meta_for(o).is_some());
                if known && graph.check_up_to_date(&self.output, &self.input, &self.workdir) {
                    info!(
                        stage = %self.stage_name,
                        "outputs up to date, skipping command"
                    );
                    return Ok(());
                }
            }
        }

        let outputs = self.output.clone();
        let pre_mtimes = outputs
            .iter()
            .map(|o| mtime_millis(&self.workdir.join(o)))
            .collect();

        let id = self.command_ids.fetch_add(1, Ordering::SeqCst).to_string();
        debug!(stage = %self.stage_name, id, "dispatching command");

        let mut executor = create_executor(&self.config, &self.workdir);
        executor
            .start(&self.config, &id, &self.stage_name, cmd)
            .await?;

        let waited = executor.wait_for().await;
        if waited.is_err() {
            // Never leak a submitted job
            let _ = executor.stop().await;
        }
        executor.cleanup().await;
        let code = waited?;

        if code != 0 {
            return Err(BioflowError::StageFailed {
                stage: self.stage_name.clone(),
                message: format!("command exited with {code}: {cmd}"),
            });
        }

        self.tracked_outputs.push(TrackedCommand {
            command: cmd.to_string(),
            outputs,
            pre_mtimes,
        });
        Ok(())
    }
}

/// Insert a branch label before the file extension, unless the name
/// already carries it
fn branch_qualified(path: &str, branch: &str) -> String {
    if branch.is_empty() {
        return path.to_string();
    }

    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, path),
    };

    let marker = format!(".{branch}.");
    if file.contains(&marker) || file.ends_with(&format!(".{branch}")) {
        return path.to_string();
    }

    let renamed = match file.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}.{branch}.{ext}"),
        None => format!("{file}.{branch}"),
    };

    match dir {
        Some(dir) => format!("{dir}/{renamed}"),
        None => renamed,
    }
}
