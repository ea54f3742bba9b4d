// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! One metadata record per produced output file
//!
//! The on-disk format is a UTF-8 text file of `key=value` lines with a
//! `#` header comment. Computed fields (`up_to_date`, `max_timestamp`)
//! exist only in memory and are never written.

use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};

use crate::errors::{BioflowError, BioflowResult};
use crate::utils::{mtime_millis, normalize_path};

/// Metadata describing how one output file was produced
#[derive(Debug, Clone, PartialEq)]
pub struct OutputMeta {
    /// The output file this record describes
    pub output_file: PathBuf,

    /// Normalised forward-slash form of the output path
    pub output_path: String,

    /// Paths that produced this output, in the order the stage saw them
    pub inputs: Vec<String>,

    /// The shell command that produced the output
    pub command: String,

    /// Stable hash of command and output path
    pub fingerprint: String,

    /// Milliseconds since the epoch; refreshed from the filesystem
    /// while the output file exists
    pub timestamp: i64,

    /// User-pinned: never a cleanup candidate
    pub preserve: bool,

    /// The file was intentionally removed by this system
    pub cleaned: bool,

    /// Computed during graph analysis; never persisted
    pub up_to_date: Option<bool>,

    /// Computed during graph analysis; never persisted
    pub max_timestamp: i64,

    /// Where this record lives on disk, once read or saved
    pub property_file: Option<PathBuf>,
}

impl OutputMeta {
    /// Create a record for an output file, normalising the path
    pub fn new(output_file: impl Into<PathBuf>) -> Self {
        let output_file = output_file.into();
        let output_path = normalize_path(&output_file);
        Self {
            output_file,
            output_path,
            inputs: Vec::new(),
            command: String::new(),
            fingerprint: String::new(),
            timestamp: 0,
            preserve: false,
            cleaned: false,
            up_to_date: None,
            max_timestamp: 0,
            property_file: None,
        }
    }

    /// Whether the output file currently exists on disk
    pub fn exists(&self) -> bool {
        self.output_file.exists()
    }

    /// Refresh `timestamp` from the output file's mtime, if it exists.
    /// The filesystem is authoritative while the file is present.
    pub fn refresh_timestamp(&mut self) {
        if let Some(mtime) = mtime_millis(&self.output_file) {
            self.timestamp = mtime;
        }
    }

    /// Serialise to the key/value wire format.
    /// Computed fields are stripped; lists are comma-joined.
    pub fn to_properties(&self) -> String {
        let mut out = String::from("# bioflow output metadata\n");
        out.push_str(&format!("outputFile={}\n", self.output_file.display()));
        out.push_str(&format!("outputPath={}\n", self.output_path));
        out.push_str(&format!("inputs={}\n", self.inputs.join(",")));
        out.push_str(&format!("command={}\n", self.command));
        out.push_str(&format!("fingerprint={}\n", self.fingerprint));
        out.push_str(&format!("timestamp={}\n", self.timestamp));
        out.push_str(&format!("preserve={}\n", self.preserve));
        out.push_str(&format!("cleaned={}\n", self.cleaned));
        out
    }

    /// Parse a record from the key/value wire format.
    /// `source` names the file in parse errors.
    pub fn from_properties(content: &str, source: &Path) -> BioflowResult<Self> {
        let parse_err = |reason: String| BioflowError::MetaParse {
            path: source.to_path_buf(),
            reason,
        };

        let mut meta = OutputMeta::new("");

        for line in content.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| parse_err(format!("line without '=': {line}")))?;

            match key {
                "outputFile" => meta.output_file = PathBuf::from(value),
                "outputPath" => meta.output_path = value.to_string(),
                "inputs" => {
                    meta.inputs = if value.is_empty() {
                        Vec::new()
                    } else {
                        value.split(',').map(str::to_string).collect()
                    };
                }
                "command" => meta.command = value.to_string(),
                "fingerprint" => meta.fingerprint = value.to_string(),
                "timestamp" => {
                    meta.timestamp = value
                        .parse()
                        .map_err(|_| parse_err(format!("invalid timestamp '{value}'")))?;
                }
                "preserve" => {
                    meta.preserve = parse_bool(value)
                        .ok_or_else(|| parse_err(format!("invalid preserve flag '{value}'")))?;
                }
                "cleaned" => {
                    meta.cleaned = parse_bool(value)
                        .ok_or_else(|| parse_err(format!("invalid cleaned flag '{value}'")))?;
                }
                // Unknown keys are tolerated so newer records stay readable
                _ => {}
            }
        }

        if meta.output_file.as_os_str().is_empty() {
            return Err(parse_err("missing required key 'outputFile'".into()));
        }

        if meta.output_path.is_empty() {
            meta.output_path = normalize_path(&meta.output_file);
        }

        Ok(meta)
    }
}

/// Fingerprint of a command and the output it produces.
/// Depends only on the exact bytes of both arguments.
pub fn fingerprint(command: &str, output_path: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(command.as_bytes());
    hasher.update(b"_");
    hasher.update(output_path.as_bytes());
    hex::encode(hasher.finalize())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
