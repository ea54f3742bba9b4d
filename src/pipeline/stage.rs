// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Stage definitions and single-stage execution
//!
//! A stage is a name plus a body run against a [`StageContext`]. After
//! the body returns, the driver validates the declared outputs and
//! persists one metadata record per output each tracked command
//! produced. An output whose mtime never moved and which already has a
//! record was not produced by this stage and is left untouched.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::pipeline::CompletedStage;
use super::StageContext;
use crate::errors::{BioflowError, BioflowResult};
use crate::meta::{fingerprint, MetaStore, OutputMeta};
use crate::utils::{mtime_millis, normalize_path, now_millis};

/// User-supplied work a stage performs
#[async_trait]
pub trait StageBody: Send + Sync {
    /// Run against the stage's context
    async fn run(&self, ctx: &mut StageContext) -> BioflowResult<()>;
}

/// A named stage in a pipeline expression
#[derive(Clone)]
pub struct StageDef {
    /// Stage name; merged stages align on it across branches
    pub name: String,
    /// The body to run
    pub body: Arc<dyn StageBody>,
}

impl StageDef {
    /// Create a stage definition
    pub fn new(name: &str, body: impl StageBody + 'static) -> Self {
        Self {
            name: name.to_string(),
            body: Arc::new(body),
        }
    }
}

impl std::fmt::Debug for StageDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDef").field("name", &self.name).finish()
    }
}

/// The common stage body: declare outputs, run one shell command.
///
/// The command may reference `$input` (first input), `$inputs` (all,
/// space-separated), `$output` (first declared output) and `$outputs`.
pub struct ShellBody {
    /// Command template
    pub command: String,
    /// Outputs the command produces, before branch qualification
    pub outputs: Vec<String>,
}

impl ShellBody {
    /// Create a shell stage body
    pub fn new(command: &str, outputs: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl StageBody for ShellBody {
    async fn run(&self, ctx: &mut StageContext) -> BioflowResult<()> {
        let names: Vec<&str> = self.outputs.iter().map(String::as_str).collect();
        let declared = ctx.produce(&names).to_vec();
        let command = substitute(&self.command, &ctx.input, &declared);
        ctx.exec(&command).await
    }
}

/// Expand `$inputs`/`$input`/`$outputs`/`$output` references
fn substitute(template: &str, inputs: &[String], outputs: &[String]) -> String {
    template
        .replace("$inputs", &inputs.join(" "))
        .replace("$input", inputs.first().map(String::as_str).unwrap_or(""))
        .replace("$outputs", &outputs.join(" "))
        .replace("$output", outputs.first().map(String::as_str).unwrap_or(""))
}

/// Run one stage body and persist what it produced
pub async fn run_stage(
    def: &StageDef,
    ctx: &mut StageContext,
    store: &MetaStore,
) -> BioflowResult<CompletedStage> {
    debug!(stage = %def.name, branch = %ctx.branch, "running stage");

    def.body.run(ctx).await?;

    // Every declared output must exist, or carry a record explaining
    // why it is allowed to be absent
    for output in &ctx.output {
        let path = ctx.workdir().join(output);
        if path.exists() {
            continue;
        }
        let explained = matches!(store.lookup(output)?, Some(meta) if meta.cleaned);
        if !explained {
            return Err(BioflowError::MissingOutput {
                path: output.clone(),
                stage: def.name.clone(),
            });
        }
    }

    // One record per output of each tracked command
    for tracked in &ctx.tracked_outputs {
        for (index, output) in tracked.outputs.iter().enumerate() {
            let file = ctx.workdir().join(output);
            let current_mtime = mtime_millis(&file);

            // Untouched pre-existing output with a record: the command
            // did not produce it on this run
            let unchanged = tracked.pre_mtimes[index].is_some()
                && tracked.pre_mtimes[index] == current_mtime;
            if unchanged && store.lookup(output)?.is_some() {
                continue;
            }

            let mut meta = OutputMeta::new(file);
            meta.output_path = normalize_path(Path::new(output));
            meta.inputs = ctx.input.clone();
            meta.command = tracked.command.clone();
            meta.fingerprint = fingerprint(&tracked.command, &meta.output_path);
            meta.timestamp = current_mtime.unwrap_or_else(now_millis);
            store.save(&mut meta).await?;
        }
    }

    // A stage producing no new outputs is transparent to the next stage
    if ctx.next_inputs.is_none() && ctx.output.is_empty() {
        ctx.next_inputs = Some(ctx.input.clone());
    }

    Ok(CompletedStage {
        stage_name: def.name.clone(),
        branch: ctx.branch.clone(),
        input: ctx.input.clone(),
        output: ctx.output.clone(),
        raw_output: ctx.raw_output.clone(),
        next_inputs: ctx.next_inputs.clone(),
        synthetic: false,
    })
}
