//! Per-agent append-only event log (`events.jsonl`).
//!
//! Sequence numbers are assigned under the log's lock, so concurrent
//! appenders from any number of processes produce exactly `1..M` with no
//! gaps and no duplicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use hm_domain::{Error, Result};

use crate::agent::sanitize_agent_id;
use crate::fsio;
use crate::run::Coordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventKind {
    Spawned,
    WorkerStarted,
    ToolCallStarted,
    ToolCallFinished,
    WorkerFinished,
    ProcessExit,
}

/// One record in the log. `seq` is monotonic per agent, starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: AgentEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// An event as submitted by callers; the coordinator assigns `seq` and
/// the timestamp default.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub kind: AgentEventKind,
    pub payload: Option<serde_json::Value>,
    pub message: Option<String>,
}

impl NewEvent {
    pub fn new(kind: AgentEventKind) -> Self {
        Self {
            kind,
            payload: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl Coordinator {
    fn events_path(&self, run_id: &str, agent_id: &str) -> PathBuf {
        self.agent_dir(run_id, agent_id).join("events.jsonl")
    }

    /// Append an event; returns the assigned sequence number.
    pub fn append_event(&self, run_id: &str, agent_id: &str, event: NewEvent) -> Result<u64> {
        self.check_run_id(run_id)?;
        let agent_id = sanitize_agent_id(agent_id)?;
        let path = self.events_path(run_id, &agent_id);

        fsio::with_lock(&path, || {
            let seq = last_seq(&path)? + 1;
            let record = AgentEvent {
                seq,
                kind: event.kind,
                timestamp: Utc::now(),
                payload: event.payload,
                message: event.message,
            };
            let line = serde_json::to_string(&record)?;
            fsio::append_line(&path, &line)?;
            Ok(seq)
        })
    }

    /// Events with `seq > since_seq`, ordered, at most `limit` (0 = all).
    pub fn read_events(
        &self,
        run_id: &str,
        agent_id: &str,
        since_seq: u64,
        limit: usize,
    ) -> Result<Vec<AgentEvent>> {
        self.check_run_id(run_id)?;
        let agent_id = sanitize_agent_id(agent_id)?;
        let path = self.events_path(run_id, &agent_id);
        if !path.is_file() {
            return Ok(Vec::new());
        }

        let raw = fs::read_to_string(&path)?;
        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AgentEvent>(line) {
                Ok(ev) if ev.seq > since_seq => {
                    events.push(ev);
                    if limit > 0 && events.len() >= limit {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed event line");
                }
            }
        }
        Ok(events)
    }

    /// The highest sequence number currently in the log.
    pub fn last_event_seq(&self, run_id: &str, agent_id: &str) -> Result<u64> {
        self.check_run_id(run_id)?;
        let agent_id = sanitize_agent_id(agent_id)?;
        last_seq(&self.events_path(run_id, &agent_id))
    }
}

/// Read the seq of the last well-formed line, 0 for a missing/empty log.
fn last_seq(path: &std::path::Path) -> Result<u64> {
    if !path.is_file() {
        return Ok(0);
    }
    let raw = fs::read_to_string(path)?;
    for line in raw.lines().rev() {
        if line.trim().is_empty() {
            continue;
        }
        let ev: AgentEvent = serde_json::from_str(line)
            .map_err(|e| Error::Other(format!("corrupt event log {}: {e}", path.display())))?;
        return Ok(ev.seq);
    }
    Ok(0)
}
