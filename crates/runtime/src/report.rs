//! Agent-result reporting: the System-Message block that tells the
//! primary which children finished since the last report.
//!
//! Shared by the async poller (ticks between turns) and by the
//! `agent_wait` post-hook inside a turn, so the model sees the same
//! shape either way. Dedup against `ui_state.json` uses the terminal
//! agent's `finished_at`, falling back to `updated_at` when unset.

use chrono::Utc;

use hm_coordinator::{Coordinator, ReportedResult, PRIMARY_AGENT_ID};
use hm_domain::Result;

/// Preview length taken from each result's output.
pub const RESULT_PREVIEW_CHARS: usize = 400;

/// A rendered report plus the entries to mark as reported.
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub text: String,
    pub reports: Vec<(String, ReportedResult)>,
}

/// Build the report block for all newly-terminal, unreported, unhidden
/// children of a run. `None` when there is nothing new to say.
pub fn build_agent_report(coordinator: &Coordinator, run_id: &str) -> Result<Option<AgentReport>> {
    let ui = coordinator.read_ui_state(run_id)?;
    let mut lines = Vec::new();
    let mut reports = Vec::new();

    for state in coordinator.list_agents(run_id)? {
        if state.agent_id == PRIMARY_AGENT_ID
            || !state.status.is_terminal()
            || ui.hidden_agents.contains(&state.agent_id)
            || ui.is_reported(&state)
        {
            continue;
        }

        let (preview, result_path) = match coordinator.read_agent_result(run_id, &state.agent_id) {
            Ok(result) => {
                let preview: String = result.output.chars().take(RESULT_PREVIEW_CHARS).collect();
                (preview, state.result_path.clone())
            }
            Err(_) => (
                state.error.clone().unwrap_or_else(|| "(no result)".into()),
                None,
            ),
        };

        let status = format!("{:?}", state.status).to_lowercase();
        lines.push(format!(
            "- {} [{}]: {}",
            state.agent_id,
            status,
            preview.replace('\n', " ")
        ));
        reports.push((
            state.agent_id.clone(),
            ReportedResult {
                status: state.status,
                finished_at: Some(state.effective_finished_at()),
                result_path,
                preview_chars: preview.chars().count(),
            },
        ));
    }

    if lines.is_empty() {
        return Ok(None);
    }
    let text = format!(
        "[System Message] Finished agent results (summarize these for the user; \
         they will not be repeated):\n{}",
        lines.join("\n")
    );
    Ok(Some(AgentReport { text, reports }))
}

/// Persist the reported-set after the block has actually been delivered.
pub fn mark_reported(
    coordinator: &Coordinator,
    run_id: &str,
    report: &AgentReport,
) -> Result<()> {
    coordinator
        .mark_agent_results_reported(run_id, &report.reports, Utc::now())
        .map(|_| ())
}
