//! Session capture: a redacted Markdown artifact per run per day,
//! distilled from the primary's `history.jsonl`.
//!
//! Capture is idempotent: a size+mtime fingerprint per run is kept in
//! `index/flush_state.json`, and an unchanged history is not re-captured.

use std::collections::{BTreeMap, HashMap};
use std::fs;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use hm_coordinator::fsio;
use hm_domain::llm::{ContentPart, Message, MessageContent, Role, COMPACTION_MARKER_PREFIX};
use hm_domain::Result;

use crate::paths::MemoryRoot;
use crate::redact::Redactor;

/// Default number of trailing messages captured.
pub const DEFAULT_CAPTURE_MESSAGES: usize = 60;
/// Upper bound regardless of configuration.
pub const MAX_CAPTURE_MESSAGES: usize = 200;

// Role-aware character caps per captured line.
const USER_CAP: usize = 2_000;
const ASSISTANT_CAP: usize = 2_000;
const TOOL_CAP: usize = 800;
const SYSTEM_CAP: usize = 600;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FlushState {
    /// run_id → fingerprint of the history file at last capture.
    #[serde(default)]
    captured: BTreeMap<String, Fingerprint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Fingerprint {
    size: u64,
    mtime: i64,
}

fn flush_state_path(root: &MemoryRoot) -> std::path::PathBuf {
    root.index_dir().join("flush_state.json")
}

fn read_flush_state(root: &MemoryRoot) -> FlushState {
    let path = flush_state_path(root);
    if !path.is_file() {
        return FlushState::default();
    }
    fsio::read_json(&path).unwrap_or_default()
}

/// Capture the session artifact for `run_id`. Returns `true` when a new
/// artifact was written, `false` when the fingerprint was unchanged.
pub fn capture_session_from_history(
    root: &MemoryRoot,
    run_id: &str,
    messages: &[Message],
    fingerprint: (u64, i64),
    date: NaiveDate,
    max_messages: usize,
    redactor: &Redactor,
) -> Result<bool> {
    let state_path = flush_state_path(root);
    let fp = Fingerprint {
        size: fingerprint.0,
        mtime: fingerprint.1,
    };

    fsio::with_lock(&state_path, || {
        let mut state = read_flush_state(root);
        if state.captured.get(run_id) == Some(&fp) {
            return Ok(false);
        }

        let rel = format!("sessions/{}-{}.md", date.format("%Y-%m-%d"), run_id);
        let path = root.safe_path_for_write(&rel)?;
        let content = render_session(run_id, messages, max_messages, redactor);
        fs::write(&path, content)?;

        state.captured.insert(run_id.to_string(), fp);
        fsio::write_json_atomic(&state_path, &state)?;
        tracing::debug!(run_id, path = %path.display(), "session captured");
        Ok(true)
    })
}

fn cap_for(role: Role) -> usize {
    match role {
        Role::User => USER_CAP,
        Role::Assistant => ASSISTANT_CAP,
        Role::Tool => TOOL_CAP,
        Role::System => SYSTEM_CAP,
    }
}

/// Truncate on a char boundary with an ellipsis marker.
fn cap_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let capped: String = text.chars().take(max).collect();
    format!("{capped}…")
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::Tool => "Tool",
        Role::System => "System",
    }
}

/// Find the last auto-compaction summary in the history, if any.
fn find_compaction_summary(messages: &[Message]) -> Option<String> {
    messages.iter().rev().find_map(|m| {
        if m.role != Role::System {
            return None;
        }
        let text = m.content.extract_all_text();
        text.starts_with(COMPACTION_MARKER_PREFIX).then_some(text)
    })
}

fn render_session(
    run_id: &str,
    messages: &[Message],
    max_messages: usize,
    redactor: &Redactor,
) -> String {
    let limit = if max_messages == 0 {
        DEFAULT_CAPTURE_MESSAGES
    } else {
        max_messages.min(MAX_CAPTURE_MESSAGES)
    };

    // Map tool_use ids to tool names so tool results can be tagged.
    let mut tool_names: HashMap<String, String> = HashMap::new();
    for msg in messages {
        if let MessageContent::Parts(parts) = &msg.content {
            for part in parts {
                if let ContentPart::ToolUse { id, name, .. } = part {
                    tool_names.insert(id.clone(), name.clone());
                }
            }
        }
    }

    let mut out = format!("# Session {run_id}\n");

    if let Some(summary) = find_compaction_summary(messages) {
        out.push_str("\n## Compaction summary\n\n");
        out.push_str(&redactor.apply(&summary));
        out.push('\n');
    }

    out.push_str("\n## Recent messages\n\n");
    let start = messages.len().saturating_sub(limit);
    for msg in &messages[start..] {
        let line = match (&msg.role, &msg.content) {
            (Role::Tool, MessageContent::Parts(parts)) => {
                let mut rendered = String::new();
                for part in parts {
                    if let ContentPart::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = part
                    {
                        let name = tool_names
                            .get(tool_use_id)
                            .map(|s| s.as_str())
                            .unwrap_or("unknown");
                        rendered.push_str(&format!(
                            "Tool[{name}]: {}",
                            cap_chars(content, TOOL_CAP)
                        ));
                    }
                }
                rendered
            }
            (role, content) => {
                let text = content.extract_all_text();
                if text.is_empty() {
                    continue;
                }
                format!("{}: {}", role_label(*role), cap_chars(&text, cap_for(*role)))
            }
        };
        if line.is_empty() {
            continue;
        }
        out.push_str("- ");
        out.push_str(&redactor.apply(&line).replace('\n', " "));
        out.push('\n');
    }
    out
}
