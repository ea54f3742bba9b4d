// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Filename-pattern branch splitting
//!
//! Fan-out patterns use `%` to capture the branch id and `*` as a free
//! wildcard: `sample_%_R*.fastq` groups files by the captured sample
//! id. Matching is against file names, not full paths. When nothing in
//! the current inputs matches, prior stages' inputs are searched
//! backwards so a pattern can reach upstream data.

use regex::Regex;
use std::collections::BTreeMap;

use crate::errors::{BioflowError, BioflowResult};

/// The branch key used when a pattern has no `%` capture
const IMPLICIT_BRANCH: &str = "all";

/// Split inputs into branches keyed by the pattern's `%` capture.
///
/// Returns branch id to matching files, in input order within each
/// branch, keys sorted. `prior` holds earlier stages' input lists,
/// most recent last; they are searched backwards when the current
/// inputs produce no match. An empty match is fatal unless the pattern
/// is `"*"`, which folds every input into one implicit branch.
pub fn split_inputs(
    pattern: &str,
    inputs: &[String],
    prior: &[Vec<String>],
) -> BioflowResult<BTreeMap<String, Vec<String>>> {
    let regex = pattern_to_regex(pattern)?;

    let groups = match_against(&regex, inputs);
    if !groups.is_empty() {
        return Ok(groups);
    }

    for earlier in prior.iter().rev() {
        let groups = match_against(&regex, earlier);
        if !groups.is_empty() {
            return Ok(groups);
        }
    }

    if pattern == "*" {
        return Ok(BTreeMap::from([(
            IMPLICIT_BRANCH.to_string(),
            inputs.to_vec(),
        )]));
    }

    Err(BioflowError::PatternMatch {
        pattern: pattern.to_string(),
    })
}

fn match_against(regex: &Regex, inputs: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for input in inputs {
        let name = input.rsplit('/').next().unwrap_or(input);
        if let Some(captures) = regex.captures(name) {
            let key = captures
                .get(1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| IMPLICIT_BRANCH.to_string());
            groups.entry(key).or_default().push(input.clone());
        }
    }

    groups
}

/// Translate a `%`/`*` filename pattern into an anchored regex
fn pattern_to_regex(pattern: &str) -> BioflowResult<Regex> {
    let mut translated = String::from("^");
    for c in pattern.chars() {
        match c {
            '%' => translated.push_str("(.*?)"),
            '*' => translated.push_str(".*"),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');

    Regex::new(&translated).map_err(|e| BioflowError::PatternMatch {
        pattern: format!("{pattern} ({e})"),
    })
}
