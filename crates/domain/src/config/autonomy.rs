use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heartbeat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Periodic self-check driven by a human-maintained HEARTBEAT.md file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Interval between scheduled heartbeat runs (duration literal,
    /// e.g. "30m").
    #[serde(default = "d_every")]
    pub every: String,

    /// Rapid external wakes within this window collapse into one run.
    #[serde(default = "d_coalesce_ms")]
    pub coalesce_ms: u64,

    /// Heartbeat file, relative to the project workspace root.
    #[serde(default = "d_hb_path")]
    pub path: String,

    /// Reply token meaning "nothing needs attention"; suppresses delivery.
    #[serde(default = "d_ok_token")]
    pub ok_token: String,

    /// Identical heartbeat content is not re-sent within this window.
    #[serde(default = "d_24")]
    pub dedupe_hours: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            every: d_every(),
            coalesce_ms: d_coalesce_ms(),
            path: d_hb_path(),
            ok_token: d_ok_token(),
            dedupe_hours: 24,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cron
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The file-locked cron job store and its runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Override for the job store path; defaults to `cron/jobs.json`
    /// under the project workspace root.
    #[serde(default)]
    pub store_path: Option<String>,

    /// Timezone applied to cron expressions that don't carry their own.
    #[serde(default = "d_local")]
    pub default_timezone: String,

    /// Upper bound on timer sleep, so external store edits are noticed
    /// at least this often (duration literal).
    #[serde(default = "d_max_timer_delay")]
    pub max_timer_delay: String,

    /// Per-job execution timeout when the job doesn't set one.
    #[serde(default = "d_default_timeout")]
    pub default_timeout: String,

    /// A job whose `running_at` is older than this is considered crashed
    /// and reclaimed with a failure.
    #[serde(default = "d_stuck_run")]
    pub stuck_run: String,

    /// Minimum gap between two fires of the same job.
    #[serde(default = "d_min_refire_gap")]
    pub min_refire_gap: String,

    /// Fleet-wide delivery recipients appended to each job's own list.
    #[serde(default)]
    pub email_to: Vec<String>,

    #[serde(default = "d_subject_prefix")]
    pub email_subject_prefix: String,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            store_path: None,
            default_timezone: d_local(),
            max_timer_delay: d_max_timer_delay(),
            default_timeout: d_default_timeout(),
            stuck_run: d_stuck_run(),
            min_refire_gap: d_min_refire_gap(),
            email_to: Vec::new(),
            email_subject_prefix: d_subject_prefix(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_every() -> String {
    "30m".into()
}
fn d_coalesce_ms() -> u64 {
    400
}
fn d_hb_path() -> String {
    "HEARTBEAT.md".into()
}
fn d_ok_token() -> String {
    "OK".into()
}
fn d_24() -> u32 {
    24
}
fn d_local() -> String {
    "Local".into()
}
fn d_max_timer_delay() -> String {
    "60s".into()
}
fn d_default_timeout() -> String {
    "10m".into()
}
fn d_stuck_run() -> String {
    "15m".into()
}
fn d_min_refire_gap() -> String {
    "30s".into()
}
fn d_subject_prefix() -> String {
    "[Cron]".into()
}
