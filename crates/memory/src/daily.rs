//! Daily durable-note files (`daily/YYYY-MM-DD.md`).
//!
//! One line per note:
//! `- <iso-ts> [<kind>] <text> [#tags …] (source=<run_id>)`.
//! Appends deduplicate on `kind | normalized text | sorted tags`, so the
//! same fact flushed twice on one day is written once.

use std::fs;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use hm_coordinator::fsio;
use hm_domain::Result;

use crate::paths::MemoryRoot;
use crate::redact::Redactor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    Pref,
    Decision,
    Todo,
    Note,
}

impl NoteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NoteKind::Pref => "pref",
            NoteKind::Decision => "decision",
            NoteKind::Todo => "todo",
            NoteKind::Note => "note",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DailyNote {
    pub timestamp: DateTime<Utc>,
    pub kind: NoteKind,
    pub text: String,
    pub tags: Vec<String>,
    pub source: Option<String>,
}

impl DailyNote {
    /// Render as a daily-file line (tags sorted, source last).
    fn render(&self) -> String {
        let mut line = format!(
            "- {} [{}] {}",
            self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            self.kind.as_str(),
            self.text.trim()
        );
        let mut tags = self.tags.clone();
        tags.sort();
        tags.dedup();
        for tag in &tags {
            line.push_str(&format!(" #{tag}"));
        }
        if let Some(source) = &self.source {
            line.push_str(&format!(" (source={source})"));
        }
        line
    }

    /// Dedupe key: `kind | normalized text | sorted tags`.
    pub fn dedupe_key(&self) -> String {
        let mut tags = self.tags.clone();
        tags.sort();
        tags.dedup();
        format!(
            "{}|{}|{}",
            self.kind.as_str(),
            normalize_text(&self.text),
            tags.join(",")
        )
    }
}

/// Lowercase + whitespace-collapse for dedupe comparisons.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Parse the dedupe key out of an existing daily line, if it is one of
/// ours.
fn parse_line_key(line: &str) -> Option<String> {
    let rest = line.strip_prefix("- ")?;
    let (_, rest) = rest.split_once(" [")?;
    let (kind, rest) = rest.split_once("] ")?;
    // Strip trailing source marker.
    let body = match rest.rfind(" (source=") {
        Some(i) => &rest[..i],
        None => rest,
    };
    // Split trailing #tags off the text.
    let mut tags = Vec::new();
    let mut text = body.trim();
    while let Some(i) = text.rfind(" #") {
        let candidate = &text[i + 2..];
        if candidate.is_empty() || candidate.contains(char::is_whitespace) {
            break;
        }
        tags.push(candidate.to_string());
        text = text[..i].trim_end();
    }
    tags.sort();
    tags.dedup();
    Some(format!("{}|{}|{}", kind, normalize_text(text), tags.join(",")))
}

/// Append notes to `daily/<date>.md`, skipping duplicates already present
/// that day. Every line is redacted before it reaches disk. Returns how
/// many notes were written.
pub fn append_daily(
    root: &MemoryRoot,
    date: NaiveDate,
    notes: &[DailyNote],
    redactor: &Redactor,
) -> Result<usize> {
    if notes.is_empty() {
        return Ok(0);
    }
    let rel = format!("daily/{}.md", date.format("%Y-%m-%d"));
    let path = root.safe_path_for_write(&rel)?;

    fsio::with_lock(&path, || {
        let existing = if path.is_file() {
            fs::read_to_string(&path)?
        } else {
            String::new()
        };
        let mut seen: std::collections::HashSet<String> =
            existing.lines().filter_map(parse_line_key).collect();

        let mut written = 0;
        for note in notes {
            let key = note.dedupe_key();
            if !seen.insert(key) {
                continue;
            }
            let line = redactor.apply(&note.render());
            fsio::append_line(&path, &line)?;
            written += 1;
        }
        Ok(written)
    })
}
