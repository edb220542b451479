//! Read API over the memory root: line-ranged `get` and substring
//! `search`, both path-safe. Search walks only plain files; a symlink
//! planted inside the tree is skipped, never followed.

use std::fs;
use std::path::PathBuf;

use hm_domain::{Error, Result};

use crate::paths::MemoryRoot;

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    /// Path relative to the memory root.
    pub path: String,
    /// 1-based line number.
    pub line: usize,
    pub text: String,
}

/// Read lines `from_line..=to_line` (1-based, inclusive) of a memory
/// file. The relative path is fully validated before any file is opened.
pub fn get(root: &MemoryRoot, rel: &str, from_line: usize, to_line: usize) -> Result<String> {
    if from_line == 0 || to_line < from_line {
        return Err(Error::Validation(format!(
            "invalid line range {from_line}..{to_line}"
        )));
    }
    let path = root.safe_path(rel)?;
    if !path.is_file() {
        return Err(Error::NotFound(format!("memory file {rel}")));
    }
    let raw = fs::read_to_string(&path)?;
    let lines: Vec<&str> = raw
        .lines()
        .skip(from_line - 1)
        .take(to_line - from_line + 1)
        .collect();
    Ok(lines.join("\n"))
}

/// Case-insensitive substring search across `daily/` and `sessions/`.
/// Returns at most `max_results` hits, newest files first.
pub fn search(root: &MemoryRoot, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let limit = if max_results == 0 { 20 } else { max_results };

    let mut files: Vec<PathBuf> = Vec::new();
    for dir in [root.daily_dir(), root.sessions_dir()] {
        if !dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e != "md").unwrap_or(true) {
                continue;
            }
            // Symlinks are skipped, not followed.
            if !root.is_plain_file(&path) {
                tracing::debug!(path = %path.display(), "skipping non-plain file in search");
                continue;
            }
            files.push(path);
        }
    }
    // Newest first by file name (both trees are date-prefixed).
    files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut hits = Vec::new();
    'outer: for path in files {
        let raw = fs::read_to_string(&path)?;
        let rel = path
            .strip_prefix(root.path())
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        for (i, line) in raw.lines().enumerate() {
            if line.to_lowercase().contains(&query) {
                hits.push(SearchHit {
                    path: rel.clone(),
                    line: i + 1,
                    text: line.to_string(),
                });
                if hits.len() >= limit {
                    break 'outer;
                }
            }
        }
    }
    Ok(hits)
}
