// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Filesystem store for output metadata records
//!
//! One text file per output under `<workdir>/.bioflow/outputs/`. Writes
//! are atomic (temp file + rename) so a crashed run never leaves a
//! half-written record behind.

use std::path::{Path, PathBuf};

use crate::errors::{BioflowError, BioflowResult};
use crate::meta::OutputMeta;

/// Store of per-output metadata records
pub struct MetaStore {
    dir: PathBuf,
}

impl MetaStore {
    /// Create a store rooted at a working directory
    pub fn new(workdir: &Path) -> Self {
        Self {
            dir: workdir.join(".bioflow").join("outputs"),
        }
    }

    /// The metadata directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read every record in the store, sorted ascending by timestamp.
    ///
    /// A missing directory yields an empty list. A malformed record is
    /// fatal, with the offending file named in the error.
    pub fn scan(&self) -> BioflowResult<Vec<OutputMeta>> {
        let mut metas = Vec::new();

        if !self.dir.exists() {
            return Ok(metas);
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("properties"))
            .collect();

        // Stable scan order before the timestamp sort
        files.sort();

        for file in files {
            metas.push(self.read(&file)?);
        }

        metas.sort_by_key(|m| m.timestamp);
        Ok(metas)
    }

    /// Parse a single record file.
    ///
    /// If the underlying output file exists, the record's timestamp is
    /// refreshed from its mtime: the filesystem is authoritative while
    /// the file is present.
    pub fn read(&self, path: &Path) -> BioflowResult<OutputMeta> {
        let content = std::fs::read_to_string(path).map_err(|e| BioflowError::MetaParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut meta = OutputMeta::from_properties(&content, path)?;
        meta.property_file = Some(path.to_path_buf());
        meta.refresh_timestamp();
        Ok(meta)
    }

    /// The record for an output path, if one exists
    pub fn lookup(&self, output_path: &str) -> BioflowResult<Option<OutputMeta>> {
        let path = self.property_path(output_path);
        if !path.exists() {
            return Ok(None);
        }
        self.read(&path).map(Some)
    }

    /// Atomically write a record, recording where it landed on disk
    pub async fn save(&self, meta: &mut OutputMeta) -> BioflowResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.property_path(&meta.output_path);
        let tmp = path.with_extension("properties.tmp");

        tokio::fs::write(&tmp, meta.to_properties()).await?;
        tokio::fs::rename(&tmp, &path).await?;

        meta.property_file = Some(path);
        Ok(())
    }

    /// Where the record for an output path lives
    fn property_path(&self, output_path: &str) -> PathBuf {
        let name: String = output_path
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{name}.properties"))
    }
}
