//! Durable-note extraction ("flush") from free text, typically an
//! auto-compaction summary.
//!
//! Lines are stripped of bullet markers, screened by a prompt-injection
//! heuristic, classified into {pref, decision, todo, note}, and the
//! non-note kinds are appended to today's daily file with dedupe.

use chrono::{NaiveDate, Utc};

use hm_domain::Result;

use crate::daily::{append_daily, DailyNote, NoteKind};
use crate::paths::MemoryRoot;
use crate::redact::Redactor;

/// Lines containing any of these never become durable notes. The list is
/// deliberately blunt: a false positive drops one note, a false negative
/// persists an instruction to the next session's prompt.
const INJECTION_MARKERS: &[&str] = &[
    "ignore previous",
    "ignore all previous",
    "disregard previous",
    "disregard all previous",
    "ignore the above",
    "you are now",
    "rm -rf",
    "sudo rm",
    "curl | sh",
    "忽略之前",
    "忽略上面",
    "忽略以上",
    "无视之前",
];

const PREF_MARKERS: &[&str] = &[
    "prefer", "prefers", "preference", "likes", "always use", "偏好", "喜欢", "习惯",
];

const DECISION_MARKERS: &[&str] = &[
    "decided", "decision", "chose", "chosen", "agreed", "settled on", "决定", "选择", "定为",
];

const TODO_MARKERS: &[&str] = &[
    "todo", "to-do", "need to", "needs to", "remember to", "follow up", "follow-up", "待办",
    "记得", "需要",
];

/// Whether a line trips the prompt-injection screen.
pub fn looks_like_injection(line: &str) -> bool {
    let lower = line.to_lowercase();
    INJECTION_MARKERS.iter().any(|m| lower.contains(m))
}

/// Strip leading bullet/numbering markers.
fn strip_bullet(line: &str) -> &str {
    let trimmed = line.trim_start();
    for marker in ["- ", "* ", "• ", "– "] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            return rest.trim_start();
        }
    }
    // Numbered bullets: "1. text" / "12) text".
    let mut chars = trimmed.char_indices();
    let digits_end = chars
        .by_ref()
        .take_while(|(_, c)| c.is_ascii_digit())
        .map(|(i, c)| i + c.len_utf8())
        .last();
    if let Some(end) = digits_end {
        let rest = &trimmed[end..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest.trim_start();
        }
    }
    trimmed
}

/// Classify a stripped line by keyword.
pub fn classify(line: &str) -> NoteKind {
    let lower = line.to_lowercase();
    if TODO_MARKERS.iter().any(|m| lower.contains(m)) {
        NoteKind::Todo
    } else if PREF_MARKERS.iter().any(|m| lower.contains(m)) {
        NoteKind::Pref
    } else if DECISION_MARKERS.iter().any(|m| lower.contains(m)) {
        NoteKind::Decision
    } else {
        NoteKind::Note
    }
}

/// Pull trailing `#tags` off a line; returns (text, tags).
fn split_tags(line: &str) -> (String, Vec<String>) {
    let mut text = line.trim_end().to_string();
    let mut tags = Vec::new();
    loop {
        let Some(i) = text.rfind(" #") else { break };
        let candidate = text[i + 2..].to_string();
        if candidate.is_empty() || candidate.contains(char::is_whitespace) {
            break;
        }
        tags.push(candidate);
        text.truncate(i);
        text.truncate(text.trim_end().len());
    }
    tags.reverse();
    (text, tags)
}

/// Extract durable notes from a text block. Note-kind lines are kept out
/// (only pref/decision/todo survive to the daily file).
pub fn extract_durable_notes(text: &str, source_run: Option<&str>) -> Vec<DailyNote> {
    let now = Utc::now();
    let mut notes = Vec::new();
    for raw in text.lines() {
        let line = strip_bullet(raw);
        if line.is_empty() || looks_like_injection(line) {
            continue;
        }
        let kind = classify(line);
        if kind == NoteKind::Note {
            continue;
        }
        let (text, tags) = split_tags(line);
        if text.trim().is_empty() {
            continue;
        }
        notes.push(DailyNote {
            timestamp: now,
            kind,
            text,
            tags,
            source: source_run.map(|s| s.to_string()),
        });
    }
    notes
}

/// Extract + append to the given day's daily file. Returns the number of
/// new lines written.
pub fn flush_to_daily(
    root: &MemoryRoot,
    text: &str,
    source_run: Option<&str>,
    date: NaiveDate,
    redactor: &Redactor,
) -> Result<usize> {
    let notes = extract_durable_notes(text, source_run);
    if notes.is_empty() {
        return Ok(0);
    }
    let written = append_daily(root, date, &notes, redactor)?;
    if written > 0 {
        tracing::debug!(written, date = %date, "flushed durable notes");
    }
    Ok(written)
}
