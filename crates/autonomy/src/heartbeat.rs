//! The heartbeat runner: a periodic content-aware ping driven by a
//! human-maintained `HEARTBEAT.md`.
//!
//! Every interval (or on an external wake), the file is read; if it is
//! effectively empty the run is skipped silently. Otherwise one
//! worker-mode turn evaluates it, an `OK` reply suppresses delivery,
//! and non-OK output is deduplicated by content hash before being
//! emailed.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hm_coordinator::fsio;
use hm_domain::config::HeartbeatConfig;
use hm_domain::{Error, Result};
use hm_runtime::{TurnLoop, TurnOptions};

use crate::runner::DeliverySink;

/// Worker-mode step budget for heartbeat turns.
const HEARTBEAT_WORKER_STEPS: usize = 10;

/// Why a heartbeat run fired, in ascending priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    Interval,
    Hook,
    Manual,
}

impl WakeReason {
    fn as_str(self) -> &'static str {
        match self {
            WakeReason::Interval => "interval",
            WakeReason::Hook => "hook",
            WakeReason::Manual => "manual",
        }
    }
}

/// Persisted heartbeat state, used for dedup across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatState {
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_reason: Option<String>,
    #[serde(default)]
    pub last_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sent_hash: Option<String>,
    #[serde(default)]
    pub last_sent_preview: Option<String>,
}

/// Outcome of one heartbeat pass (primarily for tests and the run log).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    SkippedEmpty,
    SkippedOk,
    SkippedDuplicate,
    Sent,
    Failed(String),
}

pub struct HeartbeatRunner {
    config: HeartbeatConfig,
    workspace_root: PathBuf,
    turn: Arc<TurnLoop>,
    delivery: Arc<dyn DeliverySink>,
    recipients: Vec<String>,
}

impl HeartbeatRunner {
    pub fn new(
        config: HeartbeatConfig,
        workspace_root: PathBuf,
        turn: Arc<TurnLoop>,
        delivery: Arc<dyn DeliverySink>,
        recipients: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            workspace_root,
            turn,
            delivery,
            recipients,
        })
    }

    fn heartbeat_path(&self) -> PathBuf {
        self.workspace_root.join(&self.config.path)
    }

    fn state_path(&self) -> PathBuf {
        self.workspace_root.join("heartbeat").join("state.json")
    }

    fn run_log_path(&self) -> PathBuf {
        self.workspace_root.join("heartbeat").join("runs.jsonl")
    }

    fn read_state(&self) -> HeartbeatState {
        let path = self.state_path();
        if !path.is_file() {
            return HeartbeatState::default();
        }
        fsio::read_json(&path).unwrap_or_default()
    }

    fn write_state(&self, state: &HeartbeatState) -> Result<()> {
        let path = self.state_path();
        fsio::with_lock(&path, || fsio::write_json_atomic(&path, state))
    }

    fn append_run_log(&self, record: &serde_json::Value) {
        let path = self.run_log_path();
        let result = fsio::with_lock(&path, || {
            fsio::append_line(&path, &serde_json::to_string(record)?)
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to append heartbeat run log");
        }
    }

    /// The heartbeat loop: fire every `every`, or earlier on an external
    /// wake (coalescing rapid wakes, keeping the highest-priority
    /// reason).
    pub async fn run_loop(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut wake: mpsc::Receiver<WakeReason>,
    ) {
        let every = humantime::parse_duration(&self.config.every)
            .unwrap_or(Duration::from_secs(30 * 60));
        let coalesce = Duration::from_millis(self.config.coalesce_ms);

        loop {
            let reason = tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(every) => WakeReason::Interval,
                Some(first) = wake.recv() => {
                    // Coalesce the burst; the highest priority wins.
                    let mut reason = first;
                    tokio::time::sleep(coalesce).await;
                    while let Ok(r) = wake.try_recv() {
                        reason = reason.max(r);
                    }
                    reason
                }
            };

            let outcome = self.run_once(reason).await;
            if let HeartbeatOutcome::Failed(e) = &outcome {
                tracing::warn!(error = %e, "heartbeat run failed");
            }
        }
    }

    /// One heartbeat pass.
    pub async fn run_once(&self, reason: WakeReason) -> HeartbeatOutcome {
        let now = Utc::now();
        let content = fs::read_to_string(self.heartbeat_path()).unwrap_or_default();
        if is_effectively_empty(&content) {
            return HeartbeatOutcome::SkippedEmpty;
        }

        let mut state = self.read_state();
        state.last_run_at = Some(now);
        state.last_reason = Some(reason.as_str().into());

        let outcome = match self.evaluate(&content).await {
            Ok(reply) => {
                if is_ok_reply(&reply, &self.config.ok_token) {
                    state.last_error = None;
                    HeartbeatOutcome::SkippedOk
                } else if self.is_duplicate(&state, &reply, now) {
                    state.last_error = None;
                    HeartbeatOutcome::SkippedDuplicate
                } else {
                    match self.send(&reply).await {
                        Ok(()) => {
                            state.last_error = None;
                            state.last_sent_at = Some(now);
                            state.last_sent_hash = Some(content_hash(&reply));
                            state.last_sent_preview =
                                Some(reply.chars().take(200).collect());
                            HeartbeatOutcome::Sent
                        }
                        Err(e) => {
                            state.last_error = Some(e.to_string());
                            HeartbeatOutcome::Failed(e.to_string())
                        }
                    }
                }
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
                HeartbeatOutcome::Failed(e.to_string())
            }
        };

        if let Err(e) = self.write_state(&state) {
            tracing::warn!(error = %e, "failed to persist heartbeat state");
        }
        self.append_run_log(&serde_json::json!({
            "at": now.to_rfc3339(),
            "reason": reason.as_str(),
            "outcome": format!("{outcome:?}"),
        }));
        outcome
    }

    async fn evaluate(&self, content: &str) -> Result<String> {
        let run = self.resolve_run()?;
        let prompt = format!(
            "Heartbeat check at {} (local).\n\nHEARTBEAT.md:\n{}\n\n\
             Review the checklist above against the current time. If nothing \
             needs attention right now, reply with exactly `{}` and nothing \
             else. Otherwise reply with a short report of what needs attention.",
            Local::now().format("%Y-%m-%d %H:%M:%S %Z"),
            content,
            self.config.ok_token
        );
        let outcome = self
            .turn
            .run_turn(
                &run,
                &prompt,
                &TurnOptions::worker(HEARTBEAT_WORKER_STEPS),
                &mut |_| {},
            )
            .await?;
        Ok(outcome.final_text)
    }

    fn resolve_run(&self) -> Result<String> {
        let coordinator = self.turn.coordinator();
        let key = serde_json::json!("heartbeat");
        if let Some(run) = coordinator.find_run(|r| r.metadata.get("source") == Some(&key))? {
            return Ok(run.id);
        }
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("source".into(), key);
        Ok(coordinator.create_run(Some("heartbeat"), Some(metadata))?.id)
    }

    fn is_duplicate(&self, state: &HeartbeatState, reply: &str, now: DateTime<Utc>) -> bool {
        let (Some(hash), Some(sent_at)) = (&state.last_sent_hash, state.last_sent_at) else {
            return false;
        };
        if *hash != content_hash(reply) {
            return false;
        }
        now - sent_at < chrono::Duration::hours(self.config.dedupe_hours as i64)
    }

    async fn send(&self, reply: &str) -> Result<()> {
        if self.recipients.is_empty() {
            return Err(Error::Config("heartbeat has no recipients".into()));
        }
        let subject = format!("[Heartbeat] {}", Local::now().format("%Y-%m-%d"));
        self.delivery
            .deliver(&subject, reply, &self.recipients)
            .await
    }
}

/// Headers, blank lines, and empty list markers don't count as content.
pub fn is_effectively_empty(content: &str) -> bool {
    content.lines().all(|line| {
        let t = line.trim();
        t.is_empty()
            || t.starts_with('#')
            || t == "-"
            || t == "*"
            || t == "- [ ]"
            || t == "* [ ]"
    })
}

/// The reply means "all quiet": exactly the token, or a trivial
/// acknowledgement wrapped around it (quotes, punctuation, short fluff).
pub fn is_ok_reply(reply: &str, token: &str) -> bool {
    let trimmed = reply.trim().trim_matches(|c: char| {
        c == '"' || c == '\'' || c == '`' || c == '.' || c == '!'
    });
    if trimmed.eq_ignore_ascii_case(token) {
        return true;
    }
    // Trivial acknowledgement: contains the token and barely anything else.
    reply.to_lowercase().contains(&token.to_lowercase())
        && reply.trim().chars().count() <= token.chars().count() + 12
}

fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.trim().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hm_coordinator::Coordinator;
    use hm_domain::config::CompactionConfig;
    use hm_domain::llm::{ChatClient, ChatRequest, ChatResponse};
    use hm_runtime::ToolRegistry;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct FixedClient(String);

    #[async_trait]
    impl ChatClient for FixedClient {
        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse {
                content: self.0.clone(),
                ..Default::default()
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl DeliverySink for RecordingSink {
        async fn deliver(&self, subject: &str, body: &str, _to: &[String]) -> Result<()> {
            self.sent.lock().push((subject.into(), body.into()));
            Ok(())
        }
    }

    fn runner(dir: &TempDir, reply: &str) -> (Arc<HeartbeatRunner>, Arc<RecordingSink>) {
        let turn = Arc::new(TurnLoop::new(
            Arc::new(FixedClient(reply.into())),
            Arc::new(ToolRegistry::new()),
            Coordinator::new(dir.path()),
            CompactionConfig::default(),
            "heartbeat worker",
        ));
        let sink = Arc::new(RecordingSink::default());
        let config = HeartbeatConfig {
            enabled: true,
            ..Default::default()
        };
        let runner = HeartbeatRunner::new(
            config,
            dir.path().to_path_buf(),
            turn,
            sink.clone(),
            vec!["me@example.com".into()],
        );
        (runner, sink)
    }

    #[test]
    fn effectively_empty_detection() {
        assert!(is_effectively_empty(""));
        assert!(is_effectively_empty("# Heartbeat\n\n## Checks\n-\n* [ ]\n"));
        assert!(!is_effectively_empty("# Heartbeat\n- check the deploy\n"));
    }

    #[test]
    fn ok_reply_detection() {
        assert!(is_ok_reply("OK", "OK"));
        assert!(is_ok_reply("ok.", "OK"));
        assert!(is_ok_reply("\"OK\"", "OK"));
        assert!(is_ok_reply("OK, all good", "OK"));
        assert!(!is_ok_reply("OK but the deploy is stuck and needs a restart", "OK"));
        assert!(!is_ok_reply("the deploy is stuck", "OK"));
    }

    #[tokio::test]
    async fn empty_file_skips_silently() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = runner(&dir, "anything");
        fs::write(dir.path().join("HEARTBEAT.md"), "# Heartbeat\n-\n").unwrap();

        assert_eq!(runner.run_once(WakeReason::Interval).await, HeartbeatOutcome::SkippedEmpty);
        assert!(sink.sent.lock().is_empty());
        // Silent skip: no state write either.
        assert!(!runner.state_path().is_file());
    }

    #[tokio::test]
    async fn ok_reply_suppresses_delivery() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = runner(&dir, "OK");
        fs::write(dir.path().join("HEARTBEAT.md"), "- check the backups\n").unwrap();

        assert_eq!(runner.run_once(WakeReason::Interval).await, HeartbeatOutcome::SkippedOk);
        assert!(sink.sent.lock().is_empty());
        let state = runner.read_state();
        assert!(state.last_run_at.is_some());
        assert_eq!(state.last_reason.as_deref(), Some("interval"));
    }

    #[tokio::test]
    async fn alert_sent_once_then_deduped() {
        let dir = TempDir::new().unwrap();
        let (runner, sink) = runner(&dir, "backups are 3 days stale");
        fs::write(dir.path().join("HEARTBEAT.md"), "- check the backups\n").unwrap();

        assert_eq!(runner.run_once(WakeReason::Manual).await, HeartbeatOutcome::Sent);
        {
            let sent = sink.sent.lock();
            assert_eq!(sent.len(), 1);
            assert!(sent[0].0.starts_with("[Heartbeat] "));
            assert_eq!(sent[0].1, "backups are 3 days stale");
        }

        // Same content within the dedupe window: skipped.
        assert_eq!(
            runner.run_once(WakeReason::Interval).await,
            HeartbeatOutcome::SkippedDuplicate
        );
        assert_eq!(sink.sent.lock().len(), 1);

        let state = runner.read_state();
        assert!(state.last_sent_hash.is_some());
        assert_eq!(state.last_sent_preview.as_deref(), Some("backups are 3 days stale"));
    }

    #[tokio::test]
    async fn run_log_records_outcomes() {
        let dir = TempDir::new().unwrap();
        let (runner, _sink) = runner(&dir, "OK");
        fs::write(dir.path().join("HEARTBEAT.md"), "- item\n").unwrap();
        runner.run_once(WakeReason::Hook).await;

        let raw = fs::read_to_string(runner.run_log_path()).unwrap();
        assert!(raw.contains("\"reason\":\"hook\""));
        assert!(raw.contains("SkippedOk"));
    }
}
