//! Shared filesystem primitives: atomic JSON writes, locked appends, and
//! the sibling `.lock` protocol every mutating path goes through.
//!
//! Lock files are created with `O_CREAT|O_EXCL`, so acquisition is atomic
//! across unrelated processes. A holder that dies leaves the lock behind;
//! locks older than [`LOCK_STALE_AFTER`] are evicted by the next waiter.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use hm_domain::{Error, Result};

/// Default bound on how long a caller waits for a lock.
pub const LOCK_RETRY_DEFAULT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for a lock.
const LOCK_POLL: Duration = Duration::from_millis(25);

/// A lock file older than this is assumed abandoned and evicted.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FileLock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Advisory cross-process lock held for the lifetime of the guard.
/// Released (unlinked) on drop.
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock guarding `target` (the lock lives at
    /// `<target>.lock`), waiting up to `timeout`.
    pub fn acquire(target: &Path, timeout: Duration) -> Result<Self> {
        let path = lock_path(target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    // Contents are diagnostic only; the file's existence is
                    // the lock.
                    let _ = writeln!(
                        file,
                        "pid={} at={}",
                        std::process::id(),
                        chrono::Utc::now().to_rfc3339()
                    );
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    evict_if_stale(&path);
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout(format!(
                            "could not acquire {} within {timeout:?}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Acquire with the default bounded retry.
    pub fn acquire_default(target: &Path) -> Result<Self> {
        Self::acquire(target, LOCK_RETRY_DEFAULT)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock");
            }
        }
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    name.push_str(".lock");
    target.with_file_name(name)
}

/// Remove a lock file whose mtime is older than [`LOCK_STALE_AFTER`].
fn evict_if_stale(path: &Path) {
    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    let Ok(modified) = meta.modified() else {
        return;
    };
    let Ok(age) = modified.elapsed() else {
        return;
    };
    if age >= LOCK_STALE_AFTER {
        tracing::warn!(path = %path.display(), age_secs = age.as_secs(), "evicting stale lock");
        let _ = fs::remove_file(path);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Atomic JSON + locked appends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Write `value` as pretty UTF-8 JSON via temp-file + rename. The rename
/// is atomic on POSIX, so readers never observe a partial manifest.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Validation(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;

    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        std::process::id()
    ));
    fs::write(&tmp, json.as_bytes())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and deserialize a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Append one line (plus `\n`) with `O_APPEND`. Callers hold the sibling
/// lock so concurrent appends never interleave partial lines.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Run `f` while holding the lock that guards `target`.
pub fn with_lock<T>(target: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = FileLock::acquire_default(target)?;
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("store.json");

        let guard = FileLock::acquire(&target, Duration::from_millis(200)).unwrap();
        let second = FileLock::acquire(&target, Duration::from_millis(100));
        assert!(matches!(second, Err(Error::LockTimeout(_))));

        drop(guard);
        FileLock::acquire(&target, Duration::from_millis(200)).unwrap();
    }

    #[test]
    fn stale_lock_is_evicted() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("store.json");
        let lock = dir.path().join("store.json.lock");

        fs::write(&lock, "pid=0").unwrap();
        // Backdate the mtime beyond the stale horizon.
        let old = std::time::SystemTime::now() - (LOCK_STALE_AFTER + Duration::from_secs(60));
        let file = fs::OpenOptions::new().write(true).open(&lock).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        FileLock::acquire(&target, Duration::from_millis(500))
            .expect("stale lock should be evicted");
    }

    #[test]
    fn atomic_write_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/manifest.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        let back: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(back["a"], 1);
        // No temp file left behind.
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn append_line_accumulates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        append_line(&path, "one").unwrap();
        append_line(&path, "two").unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "one\ntwo\n");
    }
}
