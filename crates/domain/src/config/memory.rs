use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable memory: session capture, daily notes, and the bounded
/// MEMORY.md document auto-loaded into the primary's system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,

    /// Base directory holding per-project workspaces. `~` expands to the
    /// user's home directory at load time.
    #[serde(default = "d_workspace_dir")]
    pub workspace_dir: String,

    /// Explicit project key. When unset, the key derives from the git
    /// remote URL, else from a hash of the working directory.
    #[serde(default)]
    pub project_key: Option<String>,

    /// IANA timezone name for daily-note boundaries; `"Local"` uses the
    /// host timezone.
    #[serde(default = "d_local")]
    pub timezone: String,

    /// Maximum hits returned by memory search.
    #[serde(default = "d_20")]
    pub max_results: usize,

    /// Character cap for MEMORY.md after every update.
    #[serde(default = "d_1000")]
    pub memory_md_max_chars: usize,

    /// Ask the model to refresh MEMORY.md after each turn.
    #[serde(default = "d_true")]
    pub auto_update_memory_md: bool,

    /// Inject sanitized MEMORY.md into the session preamble.
    #[serde(default = "d_true")]
    pub auto_load_memory_into_prompt: bool,

    #[serde(default)]
    pub redaction: RedactionConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workspace_dir: d_workspace_dir(),
            project_key: None,
            timezone: d_local(),
            max_results: 20,
            memory_md_max_chars: 1000,
            auto_update_memory_md: true,
            auto_load_memory_into_prompt: true,
            redaction: RedactionConfig::default(),
        }
    }
}

/// Secret redaction applied to every line the memory subsystem writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Extra substrings to redact; each match widens to the surrounding
    /// non-whitespace token.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: Vec::new(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_20() -> usize {
    20
}
fn d_1000() -> usize {
    1000
}
fn d_local() -> String {
    "Local".into()
}
fn d_workspace_dir() -> String {
    "~/.hivemind/workspaces".into()
}
