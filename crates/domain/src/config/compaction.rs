use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auto-compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Recovery from model-side context overflow: summarize the prefix of the
/// conversation and retry with the tail kept verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,

    /// How many overflow→compact→retry rounds before giving up.
    #[serde(default = "d_2")]
    pub max_attempts: usize,

    /// Recent user turns kept verbatim after compaction. Minimum 1.
    #[serde(default = "d_2")]
    pub keep_last_user_turns: usize,

    /// Token budget for the summary request.
    #[serde(default = "d_summary_max_tokens")]
    pub summary_max_tokens: u32,

    /// Hard cap on the summary text itself.
    #[serde(default = "d_summary_max_chars")]
    pub summary_max_chars: usize,

    /// Cap on the prefix text fed to the summarizer (head/tail windowed).
    #[serde(default = "d_summary_input_max_chars")]
    pub summary_input_max_chars: usize,

    /// Pre-flight cap applied to every tool result before any model call.
    #[serde(default = "d_hard_max_tool_result_chars")]
    pub hard_max_tool_result_chars: usize,

    /// Tighter tool-result cap applied once an overflow has occurred.
    #[serde(default = "d_overflow_max_tool_result_chars")]
    pub overflow_max_tool_result_chars: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 2,
            keep_last_user_turns: 2,
            summary_max_tokens: d_summary_max_tokens(),
            summary_max_chars: d_summary_max_chars(),
            summary_input_max_chars: d_summary_input_max_chars(),
            hard_max_tool_result_chars: d_hard_max_tool_result_chars(),
            overflow_max_tool_result_chars: d_overflow_max_tool_result_chars(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_2() -> usize {
    2
}
fn d_summary_max_tokens() -> u32 {
    800
}
fn d_summary_max_chars() -> usize {
    4_000
}
fn d_summary_input_max_chars() -> usize {
    60_000
}
fn d_hard_max_tool_result_chars() -> usize {
    30_000
}
fn d_overflow_max_tool_result_chars() -> usize {
    8_000
}
