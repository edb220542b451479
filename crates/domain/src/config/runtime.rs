use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime (turn loop)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum model↔tools steps per turn.
    #[serde(default = "d_40")]
    pub max_steps: usize,

    /// Tool catalog shape for the primary chat agent.
    #[serde(default)]
    pub chat_tool_mode: ChatToolMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: 40,
            chat_tool_mode: ChatToolMode::Dispatcher,
        }
    }
}

/// Whether the primary agent sees the full tool catalog or only the
/// orchestration subset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatToolMode {
    /// Orchestration tools only; the primary delegates to workers.
    #[default]
    Dispatcher,
    /// Every registered tool.
    Full,
}

/// Who is running this turn: the conversational primary, or a worker
/// executing a delegated task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    Chat,
    Worker,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_40() -> usize {
    40
}
