//! Verbatim message history for the primary agent (`history.jsonl`).
//!
//! Each line is one [`Message`] exactly as it was sent to or received
//! from the model, so a restarted process can rebuild the conversation
//! the model would see.

use std::fs;
use std::path::PathBuf;

use hm_domain::llm::Message;
use hm_domain::Result;

use crate::agent::PRIMARY_AGENT_ID;
use crate::fsio;
use crate::run::Coordinator;

impl Coordinator {
    /// `history.jsonl` for an agent; the primary's is the one the turn
    /// loop reads back.
    pub fn history_path(&self, run_id: &str, agent_id: &str) -> PathBuf {
        self.agent_dir(run_id, agent_id).join("history.jsonl")
    }

    /// Append messages to the primary's history in order.
    pub fn append_history(&self, run_id: &str, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.check_run_id(run_id)?;
        let path = self.history_path(run_id, PRIMARY_AGENT_ID);

        fsio::with_lock(&path, || {
            let mut buf = String::new();
            for msg in messages {
                buf.push_str(&serde_json::to_string(msg)?);
                buf.push('\n');
            }
            // One locked append keeps a turn's messages contiguous.
            fsio::append_line(&path, buf.trim_end_matches('\n'))
        })
    }

    /// Read the primary's full history. Malformed lines are skipped with
    /// a warning so one bad write doesn't orphan the whole session.
    pub fn read_history(&self, run_id: &str) -> Result<Vec<Message>> {
        self.check_run_id(run_id)?;
        let path = self.history_path(run_id, PRIMARY_AGENT_ID);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)?;
        let mut messages = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(m) => messages.push(m),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed history line");
                }
            }
        }
        Ok(messages)
    }

    /// Size + mtime of the history file, for idempotence markers.
    pub fn history_fingerprint(&self, run_id: &str) -> Result<Option<(u64, i64)>> {
        self.check_run_id(run_id)?;
        let path = self.history_path(run_id, PRIMARY_AGENT_ID);
        if !path.is_file() {
            return Ok(None);
        }
        let meta = fs::metadata(&path)?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(Some((meta.len(), mtime)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_domain::llm::{Message, Role};
    use tempfile::TempDir;

    #[test]
    fn append_and_read_preserves_order() {
        let dir = TempDir::new().unwrap();
        let c = Coordinator::new(dir.path());
        let run = c.create_run(None, None).unwrap();

        c.append_history(
            &run.id,
            &[
                Message::user("hello"),
                Message::assistant("hi"),
                Message::tool_result("tc_1", "ok"),
            ],
        )
        .unwrap();
        c.append_history(&run.id, &[Message::user("next")]).unwrap();

        let history = c.read_history(&run.id).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[3].content.extract_all_text(), "next");
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let dir = TempDir::new().unwrap();
        let c = Coordinator::new(dir.path());
        let run = c.create_run(None, None).unwrap();
        assert!(c.history_fingerprint(&run.id).unwrap().is_none());

        c.append_history(&run.id, &[Message::user("a")]).unwrap();
        let first = c.history_fingerprint(&run.id).unwrap().unwrap();

        c.append_history(&run.id, &[Message::user("bb")]).unwrap();
        let second = c.history_fingerprint(&run.id).unwrap().unwrap();
        assert!(second.0 > first.0);
    }
}
