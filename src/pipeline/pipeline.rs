// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Pipelines and branch merging
//!
//! A [`Pipeline`] records the stages that ran, in order, plus the child
//! pipelines a fan-out forked. When every branch of a fan-out has
//! finished, the children's stages are folded back into the parent:
//! like-named stages align across branches and their outputs are
//! concatenated, so a downstream stage sees the parallel segment as if
//! it had been one sequential stage.

/// One stage instance that has finished running
#[derive(Debug, Clone)]
pub struct CompletedStage {
    /// The stage's declared name
    pub stage_name: String,
    /// Branch label the stage ran under; empty at the root
    pub branch: String,
    /// Inputs the stage received
    pub input: Vec<String>,
    /// Outputs the stage declared
    pub output: Vec<String>,
    /// Outputs before merge rewrites
    pub raw_output: Vec<String>,
    /// What the stage forwards downstream, when set explicitly
    pub next_inputs: Option<Vec<String>>,
    /// Synthetic stages (priors, joiners) are invisible to merging
    pub synthetic: bool,
}

impl CompletedStage {
    /// What the next stage receives: explicit `next_inputs` first, then
    /// declared outputs, then the stage's own inputs (transparent stage)
    pub fn carried_outputs(&self) -> Vec<String> {
        if let Some(next) = &self.next_inputs {
            next.clone()
        } else if !self.output.is_empty() {
            self.output.clone()
        } else {
            self.input.clone()
        }
    }

    /// Synthetic stage planted ahead of a branch's first real stage, so
    /// downstream input resolution finds the branch inputs
    pub fn prior(branch: &str, outputs: Vec<String>) -> Self {
        Self {
            stage_name: "<prior>".into(),
            branch: branch.to_string(),
            input: outputs.clone(),
            output: outputs.clone(),
            raw_output: outputs.clone(),
            next_inputs: Some(outputs),
            synthetic: true,
        }
    }
}

/// An ordered run of stages, with any forked children
#[derive(Debug, Default)]
pub struct Pipeline {
    /// Pipeline name; the branch key for fan-out children
    pub name: String,
    /// Guard against applying the branch name to outputs twice
    pub name_applied: bool,
    /// Stages in completion order
    pub stages: Vec<CompletedStage>,
    /// Children forked by fan-outs, in sorted branch order
    pub children: Vec<Pipeline>,
    /// Whether this pipeline failed
    pub failed: bool,
    /// Messages from the failures observed on this pipeline
    pub fail_messages: Vec<String>,
}

impl Pipeline {
    /// Create an empty pipeline
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Take the branch label to apply to this pipeline's stage
    /// contexts. Yields the name only once: nested fan-outs must not
    /// stack the same label onto output paths again.
    pub fn apply_name(&mut self) -> Option<String> {
        if self.name_applied || self.name.is_empty() {
            return None;
        }
        self.name_applied = true;
        Some(self.name.clone())
    }

    /// Record a failure on this pipeline
    pub fn fail(&mut self, message: String) {
        self.failed = true;
        self.fail_messages.push(message);
    }

    /// Fold completed children back into this pipeline.
    ///
    /// Children must arrive in sorted branch order. Their stage lists
    /// (synthetic stages excluded) are padded to equal length and
    /// transposed; at each index, stages group by name and each group
    /// becomes one merged stage whose outputs concatenate the members'
    /// carried outputs. A final synthetic stage carries the
    /// de-duplicated outputs of the last layer, which is what this
    /// fan-out hands downstream.
    pub fn merge_children(&mut self, children: Vec<Pipeline>) -> Vec<String> {
        let rows: Vec<Vec<&CompletedStage>> = children
            .iter()
            .map(|c| c.stages.iter().filter(|s| !s.synthetic).collect())
            .collect();
        let depth = rows.iter().map(Vec::len).max().unwrap_or(0);

        for index in 0..depth {
            // Group like-named stages across branches, preserving the
            // order the first branch introduced them
            let mut groups: Vec<(String, Vec<&CompletedStage>)> = Vec::new();
            for row in &rows {
                // Shorter branches pad out with nothing at this index
                let Some(stage) = row.get(index) else {
                    continue;
                };
                match groups.iter_mut().find(|(name, _)| *name == stage.stage_name) {
                    Some((_, members)) => members.push(stage),
                    None => groups.push((stage.stage_name.clone(), vec![stage])),
                }
            }

            for (name, members) in groups {
                let outputs: Vec<String> = members
                    .iter()
                    .flat_map(|s| s.carried_outputs())
                    .collect();
                let inputs: Vec<String> =
                    members.iter().flat_map(|s| s.input.clone()).collect();

                self.stages.push(CompletedStage {
                    stage_name: name,
                    branch: String::new(),
                    input: inputs,
                    output: outputs.clone(),
                    raw_output: outputs.clone(),
                    next_inputs: Some(outputs),
                    synthetic: false,
                });
            }
        }

        // Downstream sees each branch's final outputs, deduplicated,
        // in branch order
        let mut seen = std::collections::HashSet::new();
        let final_outputs: Vec<String> = rows
            .iter()
            .filter_map(|row| row.last())
            .flat_map(|s| s.carried_outputs())
            .filter(|o| seen.insert(o.clone()))
            .collect();

        if depth > 0 {
            self.stages.push(CompletedStage {
                stage_name: "<merge>".into(),
                branch: String::new(),
                input: final_outputs.clone(),
                output: final_outputs.clone(),
                raw_output: final_outputs.clone(),
                next_inputs: Some(final_outputs.clone()),
                synthetic: true,
            });
        }

        self.children = children;
        final_outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, branch: &str, outputs: &[&str]) -> CompletedStage {
        CompletedStage {
            stage_name: name.into(),
            branch: branch.into(),
            input: vec!["in.txt".into()],
            output: outputs.iter().map(|s| s.to_string()).collect(),
            raw_output: outputs.iter().map(|s| s.to_string()).collect(),
            next_inputs: None,
            synthetic: false,
        }
    }

    fn child(name: &str, stages: Vec<CompletedStage>) -> Pipeline {
        Pipeline {
            name: name.into(),
            stages,
            ..Pipeline::default()
        }
    }

    #[test]
    fn test_carried_outputs_precedence() {
        let mut s = stage("a", "", &["out.txt"]);
        assert_eq!(s.carried_outputs(), vec!["out.txt"]);

        s.next_inputs = Some(vec!["explicit.txt".into()]);
        assert_eq!(s.carried_outputs(), vec!["explicit.txt"]);

        let transparent = stage("b", "", &[]);
        assert_eq!(transparent.carried_outputs(), vec!["in.txt"]);
    }

    #[test]
    fn test_apply_name_only_once() {
        let mut pipeline = Pipeline::new("chr1");
        assert_eq!(pipeline.apply_name().as_deref(), Some("chr1"));
        assert_eq!(pipeline.apply_name(), None);
    }

    #[test]
    fn test_merge_aligns_like_stages_across_branches() {
        let mut parent = Pipeline::new("");

        let chr1 = child(
            "chr1",
            vec![
                CompletedStage::prior("chr1", vec!["in.txt".into()]),
                stage("sort", "chr1", &["sorted.chr1.bam"]),
                stage("index", "chr1", &["sorted.chr1.bai"]),
            ],
        );
        let chr2 = child(
            "chr2",
            vec![
                CompletedStage::prior("chr2", vec!["in.txt".into()]),
                stage("sort", "chr2", &["sorted.chr2.bam"]),
                stage("index", "chr2", &["sorted.chr2.bai"]),
            ],
        );

        let finals = parent.merge_children(vec![chr1, chr2]);
        assert_eq!(finals, vec!["sorted.chr1.bai", "sorted.chr2.bai"]);

        // One merged stage per name, branches concatenated in order
        let sort = parent.stages.iter().find(|s| s.stage_name == "sort").unwrap();
        assert_eq!(sort.raw_output, vec!["sorted.chr1.bam", "sorted.chr2.bam"]);

        let index = parent
            .stages
            .iter()
            .find(|s| s.stage_name == "index")
            .unwrap();
        assert_eq!(index.raw_output, vec!["sorted.chr1.bai", "sorted.chr2.bai"]);

        assert_eq!(parent.children.len(), 2);
    }

    #[test]
    fn test_merge_pads_shorter_branches() {
        let mut parent = Pipeline::new("");

        let long = child(
            "a",
            vec![stage("s1", "a", &["x.a.txt"]), stage("s2", "a", &["y.a.txt"])],
        );
        let short = child("b", vec![stage("s1", "b", &["x.b.txt"])]);

        let finals = parent.merge_children(vec![long, short]);
        assert_eq!(finals, vec!["y.a.txt", "x.b.txt"]);

        let s1 = parent.stages.iter().find(|s| s.stage_name == "s1").unwrap();
        assert_eq!(s1.raw_output, vec!["x.a.txt", "x.b.txt"]);
    }

    #[test]
    fn test_merge_deduplicates_final_outputs() {
        let mut parent = Pipeline::new("");

        let a = child("a", vec![stage("s1", "a", &["shared.txt"])]);
        let b = child("b", vec![stage("s1", "b", &["shared.txt", "own.txt"])]);

        let finals = parent.merge_children(vec![a, b]);
        assert_eq!(finals, vec!["shared.txt", "own.txt"]);
    }

    #[test]
    fn test_merge_of_no_children() {
        let mut parent = Pipeline::new("");
        let finals = parent.merge_children(Vec::new());
        assert!(finals.is_empty());
        assert!(parent.stages.is_empty());
    }
}
