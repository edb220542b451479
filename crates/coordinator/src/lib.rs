//! Filesystem-backed run/agent coordinator.
//!
//! The coordinator owns the on-disk layout under
//! `W/multi_agent/runs/<run_id>/` and exposes a library API that any
//! process (primary TUI, child worker, cron runner) can use concurrently.
//! There is deliberately no in-process authority: every mutation goes
//! through a sibling `.lock` file and an atomic temp-file + rename write,
//! so independent processes coordinate purely through the filesystem.

pub mod agent;
pub mod events;
pub mod fsio;
pub mod history;
pub mod run;
pub mod ui_state;
pub mod workspace;

pub use agent::{sanitize_agent_id, AgentResult, AgentSpec, AgentState, AgentStatus, NewAgent,
                PRIMARY_AGENT_ID};
pub use events::{AgentEvent, AgentEventKind, NewEvent};
pub use run::{Coordinator, RunManifest};
pub use ui_state::{ReportedResult, RunUiState};
pub use workspace::{project_key, workspace_root};
