// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Pipeline expressions and their interpreter
//!
//! A pipeline is an explicit AST: a stage, a sequence, or a fan-out of
//! segments over branch keys. `+` composes sequentially and a key set
//! multiplied by a segment list fans out, so expressions read the way
//! pipelines are spoken: `align + (chromosomes * vec![sort + index])`.
//! Interpretation is a recursive walk; fan-out branches run as
//! concurrent tasks and the concurrency gate bounds their backend calls.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::{debug, info};

use super::pattern::split_inputs;
use super::pipeline::{CompletedStage, Pipeline};
use super::stage::{run_stage, StageBody, StageDef};
use super::StageContext;
use crate::config::RunConfig;
use crate::errors::{BioflowError, BioflowResult};
use crate::executors::ConcurrencyGate;
use crate::meta::MetaStore;

/// A node in a pipeline expression
#[derive(Debug, Clone)]
pub enum PipelineNode {
    /// A single named stage
    Stage(StageDef),
    /// Stages run one after another, each fed the previous one's outputs
    Seq(Vec<PipelineNode>),
    /// Segments fanned out over branch keys, run concurrently
    Fanout(FanoutKeys, Vec<PipelineNode>),
}

/// How a fan-out derives its branches
#[derive(Debug, Clone)]
pub enum FanoutKeys {
    /// Explicit keys (chromosomes, samples, regions); every branch
    /// receives the full input list
    Branches(Vec<String>),
    /// A `%`/`*` filename pattern; each branch receives its matches
    Pattern(String),
}

impl FanoutKeys {
    /// Fan out over explicit branch keys
    pub fn branches(keys: &[&str]) -> Self {
        Self::Branches(keys.iter().map(|s| s.to_string()).collect())
    }

    /// Fan out over a filename pattern
    pub fn pattern(pattern: &str) -> Self {
        Self::Pattern(pattern.to_string())
    }
}

/// A single stage expression
pub fn stage(name: &str, body: impl StageBody + 'static) -> PipelineNode {
    PipelineNode::Stage(StageDef::new(name, body))
}

/// A sequential expression
pub fn seq(nodes: Vec<PipelineNode>) -> PipelineNode {
    PipelineNode::Seq(nodes)
}

/// A fan-out expression
pub fn fanout(keys: FanoutKeys, segments: Vec<PipelineNode>) -> PipelineNode {
    PipelineNode::Fanout(keys, segments)
}

impl std::ops::Add for PipelineNode {
    type Output = PipelineNode;

    fn add(self, rhs: PipelineNode) -> PipelineNode {
        match self {
            PipelineNode::Seq(mut nodes) => {
                nodes.push(rhs);
                PipelineNode::Seq(nodes)
            }
            other => PipelineNode::Seq(vec![other, rhs]),
        }
    }
}

impl std::ops::Mul<Vec<PipelineNode>> for FanoutKeys {
    type Output = PipelineNode;

    fn mul(self, segments: Vec<PipelineNode>) -> PipelineNode {
        PipelineNode::Fanout(self, segments)
    }
}

type BoxedRun<'a> = Pin<Box<dyn std::future::Future<Output = BioflowResult<Vec<String>>> + Send + 'a>>;

/// Walks a pipeline expression, running stages against a working
/// directory and persisting output metadata as stages complete
#[derive(Clone)]
pub struct PipelineRunner {
    workdir: PathBuf,
    config: RunConfig,
    store: Arc<MetaStore>,
    command_ids: Arc<AtomicU64>,
}

impl PipelineRunner {
    /// Create a runner; initialises the process-wide concurrency gate
    /// from the configuration
    pub fn new(workdir: &Path, config: RunConfig) -> Self {
        ConcurrencyGate::initialize(config.concurrency);
        Self {
            workdir: workdir.to_path_buf(),
            store: Arc::new(MetaStore::new(workdir)),
            config,
            command_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// The metadata store this runner writes to
    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    /// Run a pipeline expression over the given inputs
    pub async fn run(&self, node: &PipelineNode, inputs: Vec<String>) -> BioflowResult<Pipeline> {
        info!(workdir = %self.workdir.display(), "starting pipeline run");
        let mut pipeline = Pipeline::new("");
        self.run_node(node, inputs, &mut pipeline, "").await?;
        info!(stages = pipeline.stages.len(), "pipeline run finished");
        Ok(pipeline)
    }

    fn run_node<'a>(
        &'a self,
        node: &'a PipelineNode,
        inputs: Vec<String>,
        pipeline: &'a mut Pipeline,
        branch: &'a str,
    ) -> BoxedRun<'a> {
        Box::pin(async move {
            match node {
                PipelineNode::Stage(def) => {
                    let mut ctx = StageContext::new(
                        &def.name,
                        branch,
                        inputs,
                        &self.workdir,
                        self.config.clone(),
                        self.command_ids.clone(),
                    );
                    let completed = run_stage(def, &mut ctx, &self.store).await?;
                    let carried = completed.carried_outputs();
                    pipeline.stages.push(completed);
                    Ok(carried)
                }

                PipelineNode::Seq(nodes) => {
                    let mut current = inputs;
                    for node in nodes {
                        current = self.run_node(node, current, pipeline, branch).await?;
                    }
                    Ok(current)
                }

                PipelineNode::Fanout(keys, segments) => {
                    self.run_fanout(keys, segments, inputs, pipeline, branch).await
                }
            }
        })
    }

    async fn run_fanout(
        &self,
        keys: &FanoutKeys,
        segments: &[PipelineNode],
        inputs: Vec<String>,
        pipeline: &mut Pipeline,
        branch: &str,
    ) -> BioflowResult<Vec<String>> {
        let branches: Vec<(String, Vec<String>)> = match keys {
            FanoutKeys::Branches(keys) => {
                let mut sorted = keys.clone();
                sorted.sort();
                sorted
                    .into_iter()
                    .map(|key| (key, inputs.clone()))
                    .collect()
            }
            FanoutKeys::Pattern(pattern) => {
                let prior: Vec<Vec<String>> =
                    pipeline.stages.iter().map(|s| s.input.clone()).collect();
                split_inputs(pattern, &inputs, &prior)?
                    .into_iter()
                    .collect()
            }
        };

        debug!(
            branches = branches.len(),
            segments = segments.len(),
            "forking fan-out"
        );

        let mut handles = Vec::new();
        for (key, branch_inputs) in branches {
            for segment in segments {
                let runner = self.clone();
                let segment = segment.clone();
                let branch_inputs = branch_inputs.clone();
                let child_branch = if branch.is_empty() {
                    key.clone()
                } else {
                    format!("{branch}.{key}")
                };
                handles.push(tokio::spawn(async move {
                    runner.run_branch(segment, branch_inputs, child_branch).await
                }));
            }
        }

        let mut children = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(child) => children.push(child),
                Err(join_error) => {
                    let mut child = Pipeline::new("<lost>");
                    child.fail(format!("branch task panicked: {join_error}"));
                    children.push(child);
                }
            }
        }

        if children.iter().any(|c| c.failed) {
            let messages: Vec<String> = children
                .iter()
                .flat_map(|c| c.fail_messages.clone())
                .collect();
            pipeline.children = children;
            return Err(BioflowError::from_branches(messages));
        }

        Ok(pipeline.merge_children(children))
    }

    /// One forked branch: a fresh child pipeline with a synthetic prior
    /// stage carrying the branch inputs. Failures are recorded on the
    /// child so the parent can aggregate them after all siblings finish.
    async fn run_branch(
        self,
        segment: PipelineNode,
        inputs: Vec<String>,
        branch_name: String,
    ) -> Pipeline {
        let mut child = Pipeline::new(&branch_name);
        let branch = child.apply_name().unwrap_or_default();
        child.stages.push(CompletedStage::prior(&branch, inputs.clone()));

        if let Err(error) = self.run_node(&segment, inputs, &mut child, &branch).await {
            child.fail(error.to_string());
        }

        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ShellBody;
    use tempfile::TempDir;

    fn runner_in(temp: &TempDir) -> PipelineRunner {
        PipelineRunner::new(temp.path(), RunConfig::default())
    }

    #[test]
    fn test_add_builds_flat_sequences() {
        let expr = stage("a", ShellBody::new("true", &[]))
            + stage("b", ShellBody::new("true", &[]))
            + stage("c", ShellBody::new("true", &[]));

        match expr {
            PipelineNode::Seq(nodes) => assert_eq!(nodes.len(), 3),
            other => panic!("expected Seq, got {other:?}"),
        }
    }

    #[test]
    fn test_mul_builds_fanout() {
        let expr = FanoutKeys::branches(&["chr1", "chr2"])
            * vec![stage("sort", ShellBody::new("true", &[]))];

        match expr {
            PipelineNode::Fanout(FanoutKeys::Branches(keys), segments) => {
                assert_eq!(keys, vec!["chr1", "chr2"]);
                assert_eq!(segments.len(), 1);
            }
            other => panic!("expected Fanout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sequential_stages_chain_outputs() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("in.txt"), "1\n2\n").unwrap();

        let expr = stage("copy", ShellBody::new("cat $input > $output", &["copied.txt"]))
            + stage("count", ShellBody::new("wc -l < $input > $output", &["counted.txt"]));

        let runner = runner_in(&temp);
        let pipeline = runner.run(&expr, vec!["in.txt".into()]).await.unwrap();

        assert_eq!(pipeline.stages.len(), 2);
        assert_eq!(pipeline.stages[1].input, vec!["copied.txt"]);
        assert!(temp.path().join("counted.txt").exists());

        // Both outputs got metadata records
        let records = runner.store().scan().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_fanout_forks_merges_and_orders_branches() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("in.txt"), "data").unwrap();

        // Two branch keys, two segments: four children
        let expr = FanoutKeys::branches(&["chr2", "chr1"])
            * vec![
                stage("s1", ShellBody::new("echo 1 > $output", &["s1.txt"]))
                    + stage("s2", ShellBody::new("cat $input > $output", &["s2.txt"])),
                stage("s3", ShellBody::new("echo 3 > $output", &["s3.txt"])),
            ];

        let runner = runner_in(&temp);
        let pipeline = runner.run(&expr, vec!["in.txt".into()]).await.unwrap();

        assert_eq!(pipeline.children.len(), 4);

        // Keys sorted: chr1 branches precede chr2 regardless of
        // declaration order
        assert_eq!(pipeline.children[0].name, "chr1");
        assert_eq!(pipeline.children[2].name, "chr2");

        // Branch outputs are branch-qualified on disk
        assert!(temp.path().join("s1.chr1.txt").exists());
        assert!(temp.path().join("s2.chr2.txt").exists());
        assert!(temp.path().join("s3.chr1.txt").exists());

        // The merged pipeline aligns like-named stages
        let s2 = pipeline
            .stages
            .iter()
            .find(|s| s.stage_name == "s2")
            .unwrap();
        assert_eq!(s2.raw_output, vec!["s2.chr1.txt", "s2.chr2.txt"]);
    }

    #[tokio::test]
    async fn test_second_run_skips_current_outputs() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("in.txt"), "data").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let expr = stage("copy", ShellBody::new("cat $input > $output", &["copied.txt"]));
        let runner = runner_in(&temp);
        let inputs = vec!["in.txt".to_string()];

        runner.run(&expr, inputs.clone()).await.unwrap();
        let produced = temp.path().join("copied.txt");
        let first_mtime = crate::utils::mtime_millis(&produced).unwrap();

        // Nothing changed: the command must not run again
        std::thread::sleep(std::time::Duration::from_millis(20));
        runner.run(&expr, inputs.clone()).await.unwrap();
        assert_eq!(crate::utils::mtime_millis(&produced).unwrap(), first_mtime);

        // Touching the input forward forces a rebuild
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(temp.path().join("in.txt"), "updated").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        runner.run(&expr, inputs).await.unwrap();
        assert!(crate::utils::mtime_millis(&produced).unwrap() > first_mtime);
    }

    #[tokio::test]
    async fn test_fanout_determinism_across_runs() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("in.txt"), "data").unwrap();

        let expr = FanoutKeys::branches(&["b", "a", "c"])
            * vec![stage("mk", ShellBody::new("echo x > $output", &["out.txt"]))];

        let runner = runner_in(&temp);
        let first = runner.run(&expr, vec!["in.txt".into()]).await.unwrap();
        let second = runner.run(&expr, vec!["in.txt".into()]).await.unwrap();

        let finals = |p: &Pipeline| {
            p.stages
                .last()
                .map(CompletedStage::carried_outputs)
                .unwrap_or_default()
        };

        assert_eq!(finals(&first), vec!["out.a.txt", "out.b.txt", "out.c.txt"]);
        assert_eq!(finals(&first), finals(&second));
    }

    #[tokio::test]
    async fn test_pattern_fanout_splits_by_sample() {
        let temp = TempDir::new().unwrap();
        for name in ["sample_A_R1.fastq", "sample_A_R2.fastq", "sample_B_R1.fastq"] {
            std::fs::write(temp.path().join(name), "reads").unwrap();
        }

        let expr = FanoutKeys::pattern("sample_%_R*.fastq")
            * vec![stage("merge", ShellBody::new("cat $inputs > $output", &["merged.fastq"]))];

        let runner = runner_in(&temp);
        let inputs = vec![
            "sample_A_R1.fastq".to_string(),
            "sample_A_R2.fastq".to_string(),
            "sample_B_R1.fastq".to_string(),
        ];
        let pipeline = runner.run(&expr, inputs).await.unwrap();

        assert_eq!(pipeline.children.len(), 2);
        assert_eq!(pipeline.children[0].name, "A");
        assert_eq!(pipeline.children[1].name, "B");

        // Branch A saw both of its reads
        let merge_a = &pipeline.children[0].stages[1];
        assert_eq!(
            merge_a.input,
            vec!["sample_A_R1.fastq", "sample_A_R2.fastq"]
        );
        assert!(temp.path().join("merged.A.fastq").exists());
    }

    #[tokio::test]
    async fn test_branch_failures_aggregate_after_all_finish() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("in.txt"), "data").unwrap();

        let expr = FanoutKeys::branches(&["chr1", "chr2"])
            * vec![
                stage("boom", ShellBody::new("exit 1", &[])),
                stage("fine", ShellBody::new("echo ok > $output", &["ok.txt"])),
            ];

        let runner = runner_in(&temp);
        let err = runner
            .run(&expr, vec!["in.txt".into()])
            .await
            .unwrap_err();

        match err {
            BioflowError::Branch { messages } => {
                // Identical failures from both branches collapse to one
                assert_eq!(messages.len(), 1);
                assert!(messages[0].contains("boom"));
            }
            other => panic!("expected Branch, got {other:?}"),
        }

        // The healthy siblings still ran to completion
        assert!(temp.path().join("ok.chr1.txt").exists());
        assert!(temp.path().join("ok.chr2.txt").exists());
    }
}
