//! Restart sentinel and in-process restart signal.
//!
//! `/restart` writes an atomic sentinel describing why the process is
//! exiting, then the process exits 0; a supervisor reads the sentinel and
//! relaunches. The in-process [`RestartSignal`] is checked by the turn
//! loop at every step so a requested restart returns promptly.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hm_domain::{Error, Result};

/// On-disk restart sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartSentinel {
    pub app: String,
    pub version: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl RestartSentinel {
    pub fn new(app: &str, version: &str, reason: &str) -> Self {
        Self {
            app: app.into(),
            version: version.into(),
            reason: reason.into(),
            note: None,
            run_id: None,
            at: Utc::now(),
        }
    }
}

/// Atomic temp-file + rename write of the sentinel.
pub fn write_sentinel(path: &Path, sentinel: &RestartSentinel) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Validation(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;
    let mut json = serde_json::to_string_pretty(sentinel)?;
    json.push('\n');
    let tmp = parent.join(format!(".restart.tmp-{}", std::process::id()));
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read the sentinel and remove it (the supervisor consumes it once).
pub fn take_sentinel(path: &Path) -> Result<Option<RestartSentinel>> {
    if !path.is_file() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    let sentinel = serde_json::from_str(&raw)?;
    fs::remove_file(path)?;
    Ok(Some(sentinel))
}

/// Shared flag flipped when a restart is requested. Cloneable; all
/// clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct RestartSignal {
    flag: Arc<AtomicBool>,
}

impl RestartSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
