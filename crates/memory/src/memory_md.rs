//! Model-driven MEMORY.md maintenance.
//!
//! After each turn the model is asked to rewrite MEMORY.md with the
//! turn's digest folded in, under hard rules: whole-document output,
//! `# MEMORY` first line, bounded length, no secrets. The returned text
//! is re-checked against those rules before the atomic locked write.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use hm_coordinator::fsio;
use hm_domain::config::MemoryConfig;
use hm_domain::llm::{ChatClient, ChatRequest, Message};
use hm_domain::{Error, Result};

use crate::paths::MemoryRoot;
use crate::redact::Redactor;

/// Dedicated timeout for the MEMORY.md model call.
pub const MEMORY_MD_TIMEOUT: Duration = Duration::from_secs(90);

/// Required first line of the document.
const HEADER: &str = "# MEMORY";

// Caps applied to the turn digest before it enters the prompt.
const USER_DIGEST_CAP: usize = 2_000;
const ASSISTANT_DIGEST_CAP: usize = 2_000;
const TOOL_DIGEST_CAP: usize = 400;
const MAX_TOOL_RECORDS: usize = 12;

/// What one turn contributes to the update prompt.
#[derive(Debug, Clone, Default)]
pub struct TurnDigest {
    pub run_id: String,
    pub user_request: String,
    pub assistant_reply: String,
    /// `(tool_name, result_preview)` pairs in call order.
    pub tool_records: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub updated: bool,
}

pub struct MemoryMdUpdater {
    client: Arc<dyn ChatClient>,
    config: MemoryConfig,
    redactor: Redactor,
}

impl MemoryMdUpdater {
    pub fn new(client: Arc<dyn ChatClient>, config: MemoryConfig) -> Self {
        let redactor = Redactor::from_config(&config.redaction);
        Self {
            client,
            config,
            redactor,
        }
    }

    /// Refresh MEMORY.md from one turn. Returns `updated: false` when the
    /// model's output was unusable (the previous document stays intact).
    pub async fn update_from_turn(
        &self,
        root: &MemoryRoot,
        digest: &TurnDigest,
    ) -> Result<UpdateOutcome> {
        let path = root.memory_md_path();
        let existing = if path.is_file() {
            fs::read_to_string(&path)?
        } else {
            format!("{HEADER}\n\n## Preferences\n\n## TODO\n\n## Work Log\n\n## Notes\n")
        };

        let prompt = self.build_prompt(&existing, digest);
        let req = ChatRequest {
            messages: vec![Message::user(prompt)],
            temperature: Some(0.1),
            max_tokens: Some(2_000),
            ..Default::default()
        };

        let response = tokio::time::timeout(MEMORY_MD_TIMEOUT, self.client.chat(&req))
            .await
            .map_err(|_| Error::Other("MEMORY.md update timed out".into()))??;

        let Some(body) = self.post_process(&response.content, digest) else {
            tracing::warn!(run_id = %digest.run_id, "MEMORY.md update rejected; keeping previous document");
            return Ok(UpdateOutcome { updated: false });
        };

        // The write lock lives in index/ so the document itself stays a
        // plain Markdown file.
        let lock_target = root.index_dir().join(".memory_md");
        let _guard = fsio::FileLock::acquire_default(&lock_target)?;
        write_atomic(&path, &body)?;

        tracing::debug!(run_id = %digest.run_id, chars = body.chars().count(), "MEMORY.md updated");
        Ok(UpdateOutcome { updated: true })
    }

    fn build_prompt(&self, existing: &str, digest: &TurnDigest) -> String {
        let mut tools = String::new();
        for (name, preview) in digest.tool_records.iter().take(MAX_TOOL_RECORDS) {
            tools.push_str(&format!(
                "- {name}: {}\n",
                self.redactor.apply(&cap_chars(preview, TOOL_DIGEST_CAP))
            ));
        }
        if tools.is_empty() {
            tools.push_str("(no tools used)\n");
        }

        format!(
            "You maintain MEMORY.md, a compact long-lived memory file for a coding \
             assistant. Update it with anything durable from the latest turn.\n\n\
             HARD RULES:\n\
             1. Output the WHOLE updated Markdown document and nothing else.\n\
             2. The first line must be exactly `{HEADER}`.\n\
             3. Keep the sections: Preferences, TODO, Work Log, Notes.\n\
             4. The document must not exceed {cap} characters. Drop the least \
             important old material first.\n\
             5. Never include secrets, keys, tokens, or passwords.\n\
             6. Prefer ending each bullet with `(source={run_id})`.\n\n\
             CURRENT DOCUMENT:\n{existing}\n\n\
             LATEST TURN:\n\
             User request: {user}\n\
             Assistant reply: {assistant}\n\
             Tools:\n{tools}",
            cap = self.config.memory_md_max_chars,
            run_id = digest.run_id,
            user = self.redactor.apply(&cap_chars(&digest.user_request, USER_DIGEST_CAP)),
            assistant = self
                .redactor
                .apply(&cap_chars(&digest.assistant_reply, ASSISTANT_DIGEST_CAP)),
        )
    }

    /// Strip wrappers, enforce the header and cap, redact, and stamp.
    /// Returns `None` when the output cannot be salvaged.
    fn post_process(&self, raw: &str, digest: &TurnDigest) -> Option<String> {
        let mut body = strip_code_fence(raw.trim()).trim().to_string();
        if !body.starts_with(HEADER) {
            return None;
        }

        body = self.redactor.apply(&body);

        let stamped = insert_stamp(&body, &digest.run_id);
        Some(enforce_cap(stamped, self.config.memory_md_max_chars))
    }
}

/// Hard-truncate at the last newline inside the cap. The header and the
/// stamp sit on the first two lines, so trailing content goes first.
fn enforce_cap(body: String, cap: usize) -> String {
    if body.chars().count() <= cap {
        return body;
    }
    let capped: String = body.chars().take(cap).collect();
    let mut out = match capped.rfind('\n') {
        Some(i) => capped[..i].to_string(),
        None => capped,
    };
    out.push('\n');
    out
}

/// Remove a single ``` wrapper around the whole document, if present.
fn strip_code_fence(raw: &str) -> &str {
    let Some(rest) = raw.strip_prefix("```") else {
        return raw;
    };
    // Skip an optional language tag on the fence line.
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => return raw,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(raw)
}

/// Insert (or replace) the update stamp directly after the header line.
fn insert_stamp(body: &str, run_id: &str) -> String {
    let stamp = format!(
        "<!-- memory_md_update: at={} source={} -->",
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        run_id
    );

    let mut lines: Vec<&str> = body
        .lines()
        .filter(|l| !l.trim_start().starts_with("<!-- memory_md_update:"))
        .collect();
    let insert_at = lines.iter().position(|l| l.starts_with(HEADER)).map(|i| i + 1);
    match insert_at {
        Some(i) => lines.insert(i, &stamp),
        None => lines.insert(0, &stamp),
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn write_atomic(path: &std::path::Path, body: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Validation("MEMORY.md has no parent".into()))?;
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(".MEMORY.md.tmp-{}", std::process::id()));
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Sanitize MEMORY.md for prompt injection into the preamble: strip the
/// stamp comment and clamp length.
pub fn sanitized_for_prompt(root: &MemoryRoot, max_chars: usize) -> Option<String> {
    let raw = fs::read_to_string(root.memory_md_path()).ok()?;
    let cleaned: String = raw
        .lines()
        .filter(|l| !l.trim_start().starts_with("<!--"))
        .collect::<Vec<_>>()
        .join("\n");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == HEADER {
        return None;
    }
    Some(cap_chars(cleaned, max_chars))
}

fn cap_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}
