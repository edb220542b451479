//! Memory root layout and safe path resolution.
//!
//! Every path-taking operation in this crate goes through
//! [`MemoryRoot::safe_path`], which rejects absolute inputs, traversal,
//! non-`.md` targets, and symlinks on any component, including symlinks
//! planted after layout creation, since components are `lstat`-checked at
//! use time.

use std::fs;
use std::path::{Component, Path, PathBuf};

use hm_domain::{Error, Result};

/// Subdirectories created by [`MemoryRoot::ensure_layout`].
const LAYOUT_DIRS: &[&str] = &["daily", "sessions", "index"];

/// Handle to a project's memory directory (`W/memory/`).
#[derive(Debug, Clone)]
pub struct MemoryRoot {
    root: PathBuf,
}

impl MemoryRoot {
    /// Open the memory root under a workspace root, creating the layout.
    pub fn open(workspace_root: &Path) -> Result<Self> {
        let root = workspace_root.join("memory");
        let mr = Self { root };
        mr.ensure_layout()?;
        Ok(mr)
    }

    /// Wrap an existing directory without creating anything (tests).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn daily_dir(&self) -> PathBuf {
        self.root.join("daily")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn memory_md_path(&self) -> PathBuf {
        self.root.join("MEMORY.md")
    }

    /// Create the layout directories.
    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        for dir in LAYOUT_DIRS {
            fs::create_dir_all(self.root.join(dir))?;
        }
        Ok(())
    }

    /// Validate the root itself: it must exist, be a directory, and not
    /// be a symlink.
    fn check_root(&self) -> Result<()> {
        let meta = fs::symlink_metadata(&self.root).map_err(|_| {
            Error::PathSafety(format!("memory root {} does not exist", self.root.display()))
        })?;
        if meta.file_type().is_symlink() {
            return Err(Error::PathSafety(format!(
                "memory root {} is a symlink",
                self.root.display()
            )));
        }
        if !meta.is_dir() {
            return Err(Error::PathSafety(format!(
                "memory root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    /// Resolve a relative `.md` path inside the root, or fail without
    /// touching anything outside it.
    pub fn safe_path(&self, rel: &str) -> Result<PathBuf> {
        self.check_root()?;

        let rel_path = Path::new(rel);
        if rel_path.is_absolute() {
            return Err(Error::PathSafety(format!("absolute path rejected: {rel}")));
        }
        if !rel.ends_with(".md") {
            return Err(Error::PathSafety(format!("only .md paths allowed: {rel}")));
        }

        // Clean and validate component by component.
        let mut resolved = self.root.clone();
        for comp in rel_path.components() {
            match comp {
                Component::Normal(part) => {
                    resolved.push(part);
                    // lstat the component if it already exists: a symlink
                    // anywhere on the chain fails, even one planted after
                    // a previous successful call.
                    if let Ok(meta) = fs::symlink_metadata(&resolved) {
                        if meta.file_type().is_symlink() {
                            return Err(Error::PathSafety(format!(
                                "symlink on path component: {}",
                                resolved.display()
                            )));
                        }
                    }
                }
                Component::CurDir => {}
                _ => {
                    return Err(Error::PathSafety(format!(
                        "path traversal rejected: {rel}"
                    )));
                }
            }
        }

        // Belt and braces: the cleaned result must still sit inside root.
        if !resolved.starts_with(&self.root) {
            return Err(Error::PathSafety(format!(
                "resolved path escapes root: {rel}"
            )));
        }
        Ok(resolved)
    }

    /// Like [`safe_path`](Self::safe_path) but also creates the parent
    /// directory chain for a write.
    pub fn safe_path_for_write(&self, rel: &str) -> Result<PathBuf> {
        let path = self.safe_path(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// Whether a resolved file is safe to read during directory walks:
    /// skip anything that is (or sits behind) a symlink.
    pub fn is_plain_file(&self, path: &Path) -> bool {
        match fs::symlink_metadata(path) {
            Ok(meta) => meta.is_file() && !meta.file_type().is_symlink(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn root() -> (TempDir, MemoryRoot) {
        let dir = TempDir::new().unwrap();
        let mr = MemoryRoot::open(dir.path()).unwrap();
        (dir, mr)
    }

    #[test]
    fn layout_created() {
        let (_d, mr) = root();
        assert!(mr.daily_dir().is_dir());
        assert!(mr.sessions_dir().is_dir());
        assert!(mr.index_dir().is_dir());
    }

    #[test]
    fn traversal_rejected() {
        let (_d, mr) = root();
        assert!(matches!(
            mr.safe_path("../etc/passwd.md"),
            Err(Error::PathSafety(_))
        ));
        assert!(matches!(
            mr.safe_path("daily/../../x.md"),
            Err(Error::PathSafety(_))
        ));
    }

    #[test]
    fn absolute_rejected() {
        let (_d, mr) = root();
        assert!(matches!(
            mr.safe_path("/etc/passwd.md"),
            Err(Error::PathSafety(_))
        ));
    }

    #[test]
    fn non_md_rejected() {
        let (_d, mr) = root();
        assert!(matches!(
            mr.safe_path("daily/notes.txt"),
            Err(Error::PathSafety(_))
        ));
    }

    #[test]
    fn valid_path_resolves_inside_root() {
        let (_d, mr) = root();
        let p = mr.safe_path("daily/2026-01-01.md").unwrap();
        assert!(p.starts_with(mr.path()));
    }

    #[cfg(unix)]
    #[test]
    fn planted_symlink_rejected() {
        let (_d, mr) = root();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("outside.md");
        fs::write(&target, "secret").unwrap();

        // Symlink planted after layout creation.
        std::os::unix::fs::symlink(&target, mr.daily_dir().join("link.md")).unwrap();
        assert!(matches!(
            mr.safe_path("daily/link.md"),
            Err(Error::PathSafety(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_root_rejected() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real");
        fs::create_dir_all(real.join("memory")).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let mr = MemoryRoot::at(link.join("memory"));
        // The root chain contains a symlink only above the memory dir;
        // the memory dir itself is checked.
        let via_link = MemoryRoot::at(dir.path().join("sym-mem"));
        std::os::unix::fs::symlink(real.join("memory"), dir.path().join("sym-mem")).unwrap();
        assert!(matches!(
            via_link.safe_path("daily/x.md"),
            Err(Error::PathSafety(_))
        ));
        // A plain directory root passes.
        assert!(mr.safe_path("daily/x.md").is_ok());
    }
}
