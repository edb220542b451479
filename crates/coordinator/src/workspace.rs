//! Project-scoped workspace root resolution.
//!
//! The workspace root `W/` is `<memory.workspace_dir>/<project_key>/`.
//! The project key prefers the git remote URL (stable across clones of
//! the same repository); outside a git checkout it falls back to a hash
//! of the canonical working directory.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use hm_domain::config::MemoryConfig;

/// Compute the project key for `cwd`.
///
/// Order: explicit override → git remote URL (sanitized) → `cwd-<12 hex
/// chars of SHA-256 of the canonical path>`.
pub fn project_key(cwd: &Path, explicit: Option<&str>) -> String {
    if let Some(key) = explicit {
        let key = sanitize_key(key);
        if !key.is_empty() {
            return key;
        }
    }

    if let Some(remote) = first_git_remote(cwd) {
        let key = sanitize_key(&remote);
        if !key.is_empty() {
            return key;
        }
    }

    let canonical = cwd
        .canonicalize()
        .unwrap_or_else(|_| cwd.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    format!("cwd-{}", &hex::encode(digest)[..12])
}

/// Resolve the workspace root for the project at `cwd`.
pub fn workspace_root(config: &MemoryConfig, cwd: &Path) -> PathBuf {
    let base = expand_home(&config.workspace_dir);
    base.join(project_key(cwd, config.project_key.as_deref()))
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(raw)
}

/// Walk up from `cwd` looking for `.git/config` and return the first
/// `url = …` under a `[remote "…"]` section. Hand-parsed: the format is
/// stable and spawning `git` from library code is not worth a subprocess.
fn first_git_remote(cwd: &Path) -> Option<String> {
    let mut dir = Some(cwd);
    while let Some(d) = dir {
        let config = d.join(".git").join("config");
        if config.is_file() {
            return parse_remote_url(&fs::read_to_string(config).ok()?);
        }
        dir = d.parent();
    }
    None
}

fn parse_remote_url(raw: &str) -> Option<String> {
    let mut in_remote = false;
    for line in raw.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_remote = line.starts_with("[remote ");
            continue;
        }
        if in_remote {
            if let Some(rest) = line.strip_prefix("url") {
                let rest = rest.trim_start();
                if let Some(url) = rest.strip_prefix('=') {
                    let url = url.trim();
                    if !url.is_empty() {
                        return Some(url.to_string());
                    }
                }
            }
        }
    }
    None
}

/// Reduce arbitrary input to a filesystem-safe key: `[A-Za-z0-9._-]`,
/// runs of anything else collapse to a single `-`.
fn sanitize_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches(|c| c == '-' || c == '.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_key_wins() {
        let dir = TempDir::new().unwrap();
        assert_eq!(project_key(dir.path(), Some("my project!")), "my-project");
    }

    #[test]
    fn git_remote_key() {
        let dir = TempDir::new().unwrap();
        let git = dir.path().join(".git");
        fs::create_dir_all(&git).unwrap();
        fs::write(
            git.join("config"),
            "[core]\n\trepositoryformatversion = 0\n[remote \"origin\"]\n\turl = git@github.com:acme/widgets.git\n\tfetch = +refs/heads/*:refs/remotes/origin/*\n",
        )
        .unwrap();
        let key = project_key(dir.path(), None);
        assert_eq!(key, "git-github.com-acme-widgets.git");
    }

    #[test]
    fn cwd_hash_fallback_is_stable() {
        let dir = TempDir::new().unwrap();
        let a = project_key(dir.path(), None);
        let b = project_key(dir.path(), None);
        assert_eq!(a, b);
        assert!(a.starts_with("cwd-"));
        assert_eq!(a.len(), "cwd-".len() + 12);
    }

    #[test]
    fn sanitize_collapses_runs() {
        assert_eq!(sanitize_key("https://x.y/a b"), "https-x.y-a-b");
        assert_eq!(sanitize_key("///"), "");
    }
}
