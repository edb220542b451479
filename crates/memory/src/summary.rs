//! Optional daily digest: at local midnight, that day's session captures
//! are summarized into the daily file under four fixed headings, at most
//! once per date.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use hm_coordinator::fsio;
use hm_domain::llm::{ChatClient, ChatRequest, Message};
use hm_domain::{Error, Result};

use crate::paths::MemoryRoot;
use crate::redact::Redactor;

/// Timeout for the daily-summary model call.
pub const DAILY_SUMMARY_TIMEOUT: Duration = Duration::from_secs(45);

/// Cap on the session text fed to the summarizer.
const INPUT_CAP: usize = 40_000;

fn marker(date: NaiveDate) -> String {
    format!("<!-- daily_summary: date={} -->", date.format("%Y-%m-%d"))
}

/// Collect all session captures for `date`, concatenated.
fn collect_session_text(root: &MemoryRoot, date: NaiveDate) -> Result<String> {
    let prefix = date.format("%Y-%m-%d").to_string();
    let dir = root.sessions_dir();
    if !dir.is_dir() {
        return Ok(String::new());
    }
    let mut names: Vec<_> = fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(&prefix))
                .unwrap_or(false)
                && root.is_plain_file(p)
        })
        .collect();
    names.sort();

    let mut out = String::new();
    for path in names {
        out.push_str(&fs::read_to_string(&path)?);
        out.push('\n');
        if out.chars().count() > INPUT_CAP {
            let capped: String = out.chars().take(INPUT_CAP).collect();
            return Ok(capped);
        }
    }
    Ok(out)
}

/// Write the digest for `date` into its daily file. Returns `false` when
/// there was nothing to summarize or the digest already exists.
pub async fn write_daily_summary(
    root: &MemoryRoot,
    client: &Arc<dyn ChatClient>,
    date: NaiveDate,
    redactor: &Redactor,
) -> Result<bool> {
    let rel = format!("daily/{}.md", date.format("%Y-%m-%d"));
    let path = root.safe_path_for_write(&rel)?;
    let marker = marker(date);

    let existing = if path.is_file() {
        fs::read_to_string(&path)?
    } else {
        String::new()
    };
    if existing.contains(&marker) {
        return Ok(false);
    }

    let sessions = collect_session_text(root, date)?;
    if sessions.trim().is_empty() {
        return Ok(false);
    }

    let prompt = format!(
        "Summarize the following session logs from {date} into a short bulleted \
         day digest under exactly these headings: Highlights, Decisions, TODO, \
         Risks/Questions. Be terse; skip empty headings' bullets but keep the \
         heading lines.\n\nSESSIONS:\n{sessions}"
    );
    let req = ChatRequest {
        messages: vec![Message::user(prompt)],
        temperature: Some(0.1),
        max_tokens: Some(1_000),
        ..Default::default()
    };

    let response = tokio::time::timeout(DAILY_SUMMARY_TIMEOUT, client.chat(&req))
        .await
        .map_err(|_| Error::Other("daily summary timed out".into()))??;
    if response.content.trim().is_empty() {
        return Ok(false);
    }

    fsio::with_lock(&path, || {
        // Re-check under the lock in case another process won the race.
        let current = if path.is_file() {
            fs::read_to_string(&path)?
        } else {
            String::new()
        };
        if current.contains(&marker) {
            return Ok(false);
        }
        let block = format!(
            "\n{marker}\n## Daily summary\n\n{}\n",
            redactor.apply(response.content.trim())
        );
        fsio::append_line(&path, block.trim_end_matches('\n'))?;
        Ok(true)
    })
}
