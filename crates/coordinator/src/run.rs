//! Run manifests and the [`Coordinator`] value type.
//!
//! A run is a conversation session. Its directory *is* its registration:
//! a run exists iff `runs/<run_id>/manifest.json` does.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hm_domain::{Error, Result};

use crate::agent::sanitize_agent_id;
use crate::fsio;

/// Metadata key carrying the display title.
pub const META_TITLE: &str = "title";

/// A single run (conversation session).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Free-form metadata: `title`, `source`, the email thread
    /// descriptor, and anything callers attach.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl RunManifest {
    pub fn title(&self) -> Option<&str> {
        self.metadata.get(META_TITLE).and_then(|v| v.as_str())
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.metadata
            .insert(META_TITLE.into(), serde_json::Value::String(title.into()));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Coordinator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle to the on-disk registry. Cheap to clone; carries only the root
/// path, so any number of processes can hold one against the same tree.
#[derive(Debug, Clone)]
pub struct Coordinator {
    root: PathBuf,
}

impl Coordinator {
    /// `workspace_root` is the project-scoped `W/`; the registry lives
    /// under `W/multi_agent/`.
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            root: workspace_root.into().join("multi_agent"),
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    fn manifest_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("manifest.json")
    }

    pub(crate) fn agents_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("agents")
    }

    pub(crate) fn agent_dir(&self, run_id: &str, agent_id: &str) -> PathBuf {
        self.agents_dir(run_id).join(agent_id)
    }

    /// Reject IDs that could escape the runs directory. Run IDs are
    /// minted here as UUIDs, but every path-taking operation re-checks
    /// because other processes may hand us arbitrary strings.
    pub(crate) fn check_run_id(&self, run_id: &str) -> Result<()> {
        sanitize_agent_id(run_id)
            .map(|_| ())
            .map_err(|_| Error::Validation(format!("invalid run id: {run_id:?}")))
    }

    // ── Run CRUD ───────────────────────────────────────────────────

    /// Create a new run. The manifest write is what makes it listable.
    pub fn create_run(
        &self,
        title: Option<&str>,
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    ) -> Result<RunManifest> {
        let now = Utc::now();
        let mut manifest = RunManifest {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            metadata: metadata.unwrap_or_default(),
        };
        if let Some(t) = title {
            manifest.set_title(t);
        }

        let path = self.manifest_path(&manifest.id);
        fsio::write_json_atomic(&path, &manifest)?;
        tracing::info!(run_id = %manifest.id, title = manifest.title().unwrap_or(""), "run created");
        Ok(manifest)
    }

    /// Read a single run manifest.
    pub fn get_run(&self, run_id: &str) -> Result<RunManifest> {
        self.check_run_id(run_id)?;
        let path = self.manifest_path(run_id);
        if !path.is_file() {
            return Err(Error::NotFound(format!("run {run_id}")));
        }
        fsio::read_json(&path)
    }

    /// All runs, newest activity first. Corrupt manifests are skipped
    /// with a warning rather than failing the whole listing.
    pub fn list_runs(&self) -> Result<Vec<RunManifest>> {
        let dir = self.runs_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let manifest = entry.path().join("manifest.json");
            if !manifest.is_file() {
                continue;
            }
            match fsio::read_json::<RunManifest>(&manifest) {
                Ok(run) => runs.push(run),
                Err(e) => {
                    tracing::warn!(path = %manifest.display(), error = %e, "skipping unreadable run manifest");
                }
            }
        }
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(runs)
    }

    /// Remove a run and everything under it.
    pub fn delete_run(&self, run_id: &str) -> Result<()> {
        self.check_run_id(run_id)?;
        let dir = self.run_dir(run_id);
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("run {run_id}")));
        }
        fs::remove_dir_all(&dir)?;
        tracing::info!(run_id, "run deleted");
        Ok(())
    }

    /// Mutate a run manifest under its lock; bumps `updated_at`.
    pub fn update_run(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut RunManifest),
    ) -> Result<RunManifest> {
        self.check_run_id(run_id)?;
        let path = self.manifest_path(run_id);
        fsio::with_lock(&path, || {
            if !path.is_file() {
                return Err(Error::NotFound(format!("run {run_id}")));
            }
            let mut manifest: RunManifest = fsio::read_json(&path)?;
            f(&mut manifest);
            manifest.updated_at = Utc::now();
            fsio::write_json_atomic(&path, &manifest)?;
            Ok(manifest)
        })
    }

    /// Touch `updated_at` without other changes.
    pub fn touch_run(&self, run_id: &str) -> Result<RunManifest> {
        self.update_run(run_id, |_| {})
    }

    /// Find a run by a metadata predicate, newest first.
    pub fn find_run(
        &self,
        mut pred: impl FnMut(&RunManifest) -> bool,
    ) -> Result<Option<RunManifest>> {
        Ok(self.list_runs()?.into_iter().find(|r| pred(r)))
    }

    pub(crate) fn ensure_run_exists(&self, run_id: &str) -> Result<()> {
        self.check_run_id(run_id)?;
        if !self.manifest_path(run_id).is_file() {
            return Err(Error::NotFound(format!("run {run_id}")));
        }
        Ok(())
    }

    /// The registry root (for diagnostics and tests).
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn coordinator() -> (TempDir, Coordinator) {
        let dir = TempDir::new().unwrap();
        let c = Coordinator::new(dir.path());
        (dir, c)
    }

    #[test]
    fn create_list_delete_round_trip() {
        let (_dir, c) = coordinator();
        let run = c.create_run(Some("deploy plan"), None).unwrap();
        assert_eq!(run.title(), Some("deploy plan"));

        let listed = c.list_runs().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, run.id);

        c.delete_run(&run.id).unwrap();
        assert!(c.list_runs().unwrap().is_empty());
        assert!(matches!(c.get_run(&run.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn delete_missing_run_errors() {
        let (_dir, c) = coordinator();
        assert!(matches!(c.delete_run("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn list_sorted_by_updated_desc() {
        let (_dir, c) = coordinator();
        let first = c.create_run(Some("first"), None).unwrap();
        let second = c.create_run(Some("second"), None).unwrap();
        // Touch the older run so it becomes the most recent.
        std::thread::sleep(std::time::Duration::from_millis(5));
        c.touch_run(&first.id).unwrap();

        let listed = c.list_runs().unwrap();
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[test]
    fn update_run_mutates_metadata() {
        let (_dir, c) = coordinator();
        let run = c.create_run(None, None).unwrap();
        let updated = c
            .update_run(&run.id, |r| {
                r.metadata
                    .insert("source".into(), serde_json::json!("email"));
            })
            .unwrap();
        assert_eq!(updated.metadata["source"], "email");
        assert!(updated.updated_at >= run.updated_at);
    }

    #[test]
    fn traversal_run_id_rejected() {
        let (_dir, c) = coordinator();
        assert!(matches!(c.get_run("../escape"), Err(Error::Validation(_))));
        assert!(matches!(c.delete_run(".."), Err(Error::Validation(_))));
    }
}
