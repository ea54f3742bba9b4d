// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Path normalisation and filesystem timestamps

use std::path::Path;
use std::time::UNIX_EPOCH;

/// Normalise a path to forward slashes for stable cross-platform comparison
pub fn normalize_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.contains('\\') {
        s.replace('\\', "/")
    } else {
        s.into_owned()
    }
}

/// Modification time of a file in milliseconds since the epoch
///
/// Returns `None` when the file does not exist or its mtime is unreadable.
pub fn mtime_millis(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let duration = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(duration.as_millis() as i64)
}

/// Current wall-clock time in milliseconds since the epoch
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
