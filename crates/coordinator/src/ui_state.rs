//! Run UI state: which agent results the primary has already reported
//! back to the user, and which agents are manually hidden.
//!
//! Used to suppress re-summarization of the same finished child on
//! follow-up ticks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use hm_domain::Result;

use crate::agent::{AgentState, AgentStatus};
use crate::fsio;
use crate::run::Coordinator;

/// Snapshot of one reported result, keyed by agent ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportedResult {
    pub status: AgentStatus,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result_path: Option<String>,
    /// How much of the result preview was shown.
    #[serde(default)]
    pub preview_chars: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunUiState {
    #[serde(default)]
    pub reported_agent_results: BTreeMap<String, ReportedResult>,
    #[serde(default)]
    pub hidden_agents: BTreeSet<String>,
    #[serde(default)]
    pub reported_at: Option<DateTime<Utc>>,
}

impl RunUiState {
    /// Whether this agent's terminal state has already been reported.
    ///
    /// A re-finish is detected by timestamp: when the agent's effective
    /// finish time is newer than the recorded one, it counts as
    /// unreported again. `effective_finished_at` falls back to
    /// `updated_at` for agents that never recorded `finished_at`.
    pub fn is_reported(&self, state: &AgentState) -> bool {
        let Some(reported) = self.reported_agent_results.get(&state.agent_id) else {
            return false;
        };
        if reported.status != state.status {
            return false;
        }
        match reported.finished_at {
            Some(at) => state.effective_finished_at() <= at,
            None => true,
        }
    }
}

impl Coordinator {
    fn ui_state_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("ui_state.json")
    }

    /// Read the UI state; a missing file is an empty state.
    pub fn read_ui_state(&self, run_id: &str) -> Result<RunUiState> {
        self.check_run_id(run_id)?;
        let path = self.ui_state_path(run_id);
        if !path.is_file() {
            return Ok(RunUiState::default());
        }
        fsio::read_json(&path)
    }

    /// Record that the listed agent results were reported at `at`;
    /// returns the new state.
    pub fn mark_agent_results_reported(
        &self,
        run_id: &str,
        reports: &[(String, ReportedResult)],
        at: DateTime<Utc>,
    ) -> Result<RunUiState> {
        self.ensure_run_exists(run_id)?;
        let path = self.ui_state_path(run_id);
        fsio::with_lock(&path, || {
            let mut state: RunUiState = if path.is_file() {
                fsio::read_json(&path)?
            } else {
                RunUiState::default()
            };
            for (agent_id, report) in reports {
                state
                    .reported_agent_results
                    .insert(agent_id.clone(), report.clone());
            }
            state.reported_at = Some(at);
            fsio::write_json_atomic(&path, &state)?;
            Ok(state)
        })
    }

    /// Hide an agent from future reports.
    pub fn hide_agent(&self, run_id: &str, agent_id: &str) -> Result<RunUiState> {
        self.ensure_run_exists(run_id)?;
        let path = self.ui_state_path(run_id);
        fsio::with_lock(&path, || {
            let mut state: RunUiState = if path.is_file() {
                fsio::read_json(&path)?
            } else {
                RunUiState::default()
            };
            state.hidden_agents.insert(agent_id.to_string());
            fsio::write_json_atomic(&path, &state)?;
            Ok(state)
        })
    }
}
