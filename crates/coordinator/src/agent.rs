//! Agent registration and state: `spec.json`, `state.json`, `result.json`.
//!
//! Every run has exactly one primary agent (reserved ID `"primary"`),
//! created lazily when the first turn starts; children are registered by
//! orchestration tools. Terminal statuses are monotonic: once an agent is
//! completed, failed, or canceled its status never changes again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use hm_domain::{Error, Result};

use crate::fsio;
use crate::run::Coordinator;

/// Reserved ID of the run's primary agent.
pub const PRIMARY_AGENT_ID: &str = "primary";

const MAX_AGENT_ID_LEN: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Canceled
        )
    }
}

/// Immutable registration record written once at spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub agent_id: String,
    pub task: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Mutable agent state, re-written atomically on every change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub status: AgentStatus,
    /// PID of the owning worker process, when one is attached.
    #[serde(default)]
    pub pid: Option<u32>,
    pub task: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result_path: Option<String>,
}

impl AgentState {
    /// The timestamp used when deduplicating reported results. Falls
    /// back to `updated_at` when a terminal agent never recorded
    /// `finished_at`.
    pub fn effective_finished_at(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.updated_at)
    }
}

/// Terminal artifact written once when a worker finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Registration request for a new child agent.
#[derive(Debug, Clone, Default)]
pub struct NewAgent {
    /// Requested ID; sanitized before use. Empty → a short random ID.
    pub agent_id: String,
    pub task: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Sanitize an agent ID to the conservative charset `[A-Za-z0-9._-]`,
/// max 64 chars, non-empty, and not a dot path.
pub fn sanitize_agent_id(raw: &str) -> Result<String> {
    let id: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(MAX_AGENT_ID_LEN)
        .collect();
    if id.is_empty() || id == "." || id == ".." {
        return Err(Error::Validation(format!("invalid agent id: {raw:?}")));
    }
    Ok(id)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Coordinator operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Coordinator {
    fn spec_path(&self, run_id: &str, agent_id: &str) -> PathBuf {
        self.agent_dir(run_id, agent_id).join("spec.json")
    }

    fn state_path(&self, run_id: &str, agent_id: &str) -> PathBuf {
        self.agent_dir(run_id, agent_id).join("state.json")
    }

    fn result_path(&self, run_id: &str, agent_id: &str) -> PathBuf {
        self.agent_dir(run_id, agent_id).join("result.json")
    }

    /// Register a new agent in a run. Fails if the ID is already taken.
    pub fn create_agent(&self, run_id: &str, new: NewAgent) -> Result<(String, AgentState)> {
        self.ensure_run_exists(run_id)?;

        let agent_id = if new.agent_id.is_empty() {
            let short = uuid::Uuid::new_v4().simple().to_string();
            format!("agent-{}", &short[..8])
        } else {
            sanitize_agent_id(&new.agent_id)?
        };

        let spec_path = self.spec_path(run_id, &agent_id);
        // The spec.json lock serializes racing creators of the same ID.
        fsio::with_lock(&spec_path, || {
            if spec_path.is_file() {
                return Err(Error::Validation(format!(
                    "agent {agent_id} already exists in run {run_id}"
                )));
            }
            let now = Utc::now();
            let spec = AgentSpec {
                agent_id: agent_id.clone(),
                task: new.task.clone(),
                created_at: now,
                metadata: new.metadata.clone(),
            };
            let state = AgentState {
                agent_id: agent_id.clone(),
                status: AgentStatus::Pending,
                pid: None,
                task: new.task.clone(),
                started_at: None,
                updated_at: now,
                finished_at: None,
                error: None,
                result_path: None,
            };
            fsio::write_json_atomic(&spec_path, &spec)?;
            fsio::write_json_atomic(&self.state_path(run_id, &agent_id), &state)?;
            tracing::info!(run_id, agent_id = %agent_id, "agent registered");
            Ok((agent_id.clone(), state))
        })
    }

    /// Create the primary agent if it doesn't exist yet; return its state.
    pub fn ensure_primary(&self, run_id: &str) -> Result<AgentState> {
        match self.read_agent_state(run_id, PRIMARY_AGENT_ID) {
            Ok(state) => Ok(state),
            Err(Error::NotFound(_)) => {
                let (_, state) = self.create_agent(
                    run_id,
                    NewAgent {
                        agent_id: PRIMARY_AGENT_ID.into(),
                        task: String::new(),
                        metadata: BTreeMap::new(),
                    },
                )?;
                Ok(state)
            }
            Err(e) => Err(e),
        }
    }

    pub fn read_agent_state(&self, run_id: &str, agent_id: &str) -> Result<AgentState> {
        self.check_run_id(run_id)?;
        let agent_id = sanitize_agent_id(agent_id)?;
        let path = self.state_path(run_id, &agent_id);
        if !path.is_file() {
            return Err(Error::NotFound(format!("agent {run_id}/{agent_id}")));
        }
        fsio::read_json(&path)
    }

    /// Mutate an agent's state under its lock; bumps `updated_at`.
    ///
    /// Terminal statuses are monotonic: any attempt to change the status
    /// of a completed/failed/canceled agent is rejected.
    pub fn update_agent_state(
        &self,
        run_id: &str,
        agent_id: &str,
        f: impl FnOnce(&mut AgentState),
    ) -> Result<AgentState> {
        self.check_run_id(run_id)?;
        let agent_id = sanitize_agent_id(agent_id)?;
        let path = self.state_path(run_id, &agent_id);
        fsio::with_lock(&path, || {
            if !path.is_file() {
                return Err(Error::NotFound(format!("agent {run_id}/{agent_id}")));
            }
            let mut state: AgentState = fsio::read_json(&path)?;
            let prior_status = state.status;
            f(&mut state);

            if prior_status.is_terminal() && state.status != prior_status {
                return Err(Error::Validation(format!(
                    "agent {agent_id} is {prior_status:?}; terminal status is final"
                )));
            }
            if state.status.is_terminal() && state.finished_at.is_none() {
                state.finished_at = Some(Utc::now());
            }
            state.updated_at = Utc::now();
            fsio::write_json_atomic(&path, &state)?;
            Ok(state)
        })
    }

    /// All agents registered in a run (primary included), spec order by ID.
    pub fn list_agents(&self, run_id: &str) -> Result<Vec<AgentState>> {
        self.check_run_id(run_id)?;
        let dir = self.agents_dir(run_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut agents = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let state = entry.path().join("state.json");
            if !state.is_file() {
                continue;
            }
            match fsio::read_json::<AgentState>(&state) {
                Ok(s) => agents.push(s),
                Err(e) => {
                    tracing::warn!(path = %state.display(), error = %e, "skipping unreadable agent state");
                }
            }
        }
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }

    /// Write the terminal result artifact and point the state at it.
    pub fn write_agent_result(
        &self,
        run_id: &str,
        agent_id: &str,
        result: &AgentResult,
    ) -> Result<PathBuf> {
        self.check_run_id(run_id)?;
        let agent_id = sanitize_agent_id(agent_id)?;
        let path = self.result_path(run_id, &agent_id);
        fsio::write_json_atomic(&path, result)?;
        Ok(path)
    }

    pub fn read_agent_result(&self, run_id: &str, agent_id: &str) -> Result<AgentResult> {
        self.check_run_id(run_id)?;
        let agent_id = sanitize_agent_id(agent_id)?;
        let path = self.result_path(run_id, &agent_id);
        if !path.is_file() {
            return Err(Error::NotFound(format!("result {run_id}/{agent_id}")));
        }
        fsio::read_json(&path)
    }
}
