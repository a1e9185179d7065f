// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Crash-safe file helpers.
//!
//! Every persisted JSON document is replaced with write-temp, fsync, rename.
//! The rename is the commit point: a reader sees either the previous complete
//! file or the new complete file, never a prefix.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::process::is_process_alive;

/// Atomically replace `path` with `content`.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("path has no parent"))?;
    fs::create_dir_all(parent)?;

    let tmp_path = parent.join(format!(
        ".{}.tmp-{}-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("state"),
        std::process::id(),
        uuid::Uuid::new_v4().simple(),
    ));

    let result = (|| {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        sync_parent_dir(parent)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    bytes.push(b'\n');
    atomic_write(path, &bytes)
}

/// Read a JSON document, treating a missing, empty or unparsable file as the
/// default value.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => T::default(),
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable state file, using default");
                T::default()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => T::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read state file, using default");
            T::default()
        }
    }
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> io::Result<()> {
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> io::Result<()> {
    Ok(())
}

/// Advisory lock held by exclusively creating a file.
///
/// The file holds the owner's pid and is removed when the guard drops. A lock
/// whose pid is no longer running is broken; one without a readable pid is
/// broken only once it is older than the stale threshold. Breakers serialize
/// on a sibling `.break` file and re-check the holder before removing, so a
/// lock re-created by another waiter is never deleted.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

impl FileLock {
    /// Acquire the lock, blocking the thread for up to `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> io::Result<Self> {
        let start = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if start.elapsed() >= timeout {
                return Err(timed_out(path));
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    /// Acquire the lock, yielding to the runtime for up to `timeout`.
    pub async fn acquire_async(path: &Path, timeout: Duration) -> io::Result<Self> {
        let start = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if start.elapsed() >= timeout {
                return Err(timed_out(path));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    /// One attempt. `Ok(None)` means a live holder has it.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..2 {
            match fs::OpenOptions::new().create_new(true).write(true).open(path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !break_stale(path) {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn timed_out(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::WouldBlock,
        format!("timed out waiting for {}", path.display()),
    )
}

/// Raw contents of `path` when its holder is gone.
fn stale_holder(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    match raw.trim().parse::<u32>() {
        Ok(pid) if pid == std::process::id() || is_process_alive(pid) => None,
        Ok(_) => Some(raw),
        // Holder has not written its pid yet, or never will.
        Err(_) => older_than(path, LOCK_STALE_AFTER).then_some(raw),
    }
}

fn break_stale(path: &Path) -> bool {
    let Some(holder) = stale_holder(path) else {
        return false;
    };

    let mut breaker_name = path.as_os_str().to_owned();
    breaker_name.push(".break");
    let breaker_path = PathBuf::from(breaker_name);
    let mut breaker = match fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&breaker_path)
    {
        Ok(file) => file,
        Err(_) => {
            // A breaker that crashed mid-way.
            if older_than(&breaker_path, LOCK_STALE_AFTER) {
                let _ = fs::remove_file(&breaker_path);
            }
            return false;
        }
    };
    let _ = write!(breaker, "{}", std::process::id());

    let broken = stale_holder(path).as_deref() == Some(holder.as_str()) && fs::remove_file(path).is_ok();
    if broken {
        debug!(path = %path.display(), holder = %holder.trim(), "Broke stale lock file");
    }
    let _ = fs::remove_file(&breaker_path);
    broken
}

fn older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|elapsed| elapsed > age)
        .unwrap_or(false)
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Doc {
        value: u32,
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doc.json");

        atomic_write_json(&path, &Doc { value: 1 }).unwrap();
        atomic_write_json(&path, &Doc { value: 2 }).unwrap();

        let doc: Doc = read_json_or_default(&path);
        assert_eq!(doc, Doc { value: 2 });
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doc.json");
        atomic_write_json(&path, &Doc { value: 7 }).unwrap();

        let entries: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_interrupted_write_keeps_previous_version() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doc.json");
        atomic_write_json(&path, &Doc { value: 3 }).unwrap();

        // A crash before the rename leaves only a half-written temp file.
        fs::write(temp.path().join(".doc.json.tmp-1-abc"), b"{\"value\": 9").unwrap();

        let doc: Doc = read_json_or_default(&path);
        assert_eq!(doc, Doc { value: 3 });
    }

    #[test]
    fn test_read_missing_or_partial_is_default() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("doc.json");
        let doc: Doc = read_json_or_default(&path);
        assert_eq!(doc, Doc::default());

        fs::write(&path, b"{\"val").unwrap();
        let doc: Doc = read_json_or_default(&path);
        assert_eq!(doc, Doc::default());

        fs::write(&path, b"  \n").unwrap();
        let doc: Doc = read_json_or_default(&path);
        assert_eq!(doc, Doc::default());
    }

    #[test]
    fn test_file_lock_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.lock");

        let guard = FileLock::acquire(&path, Duration::from_millis(50)).unwrap();
        let second = FileLock::acquire(&path, Duration::from_millis(30));
        assert!(second.is_err());

        drop(guard);
        assert!(!path.exists());
        FileLock::acquire(&path, Duration::from_millis(30)).unwrap();
    }

    #[cfg(unix)]
    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn backdate(path: &Path) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(120)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_of_dead_holder_is_broken() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.lock");
        fs::write(&path, dead_pid().to_string()).unwrap();

        let guard = FileLock::acquire(&path, Duration::from_millis(30)).unwrap();
        assert_eq!(fs::read_to_string(guard.path()).unwrap(), std::process::id().to_string());
        assert!(!temp.path().join("x.lock.break").exists());
    }

    #[test]
    fn test_old_lock_of_live_holder_is_kept() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.lock");
        fs::write(&path, std::process::id().to_string()).unwrap();
        backdate(&path);

        assert!(FileLock::acquire(&path, Duration::from_millis(30)).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), std::process::id().to_string());
    }

    #[test]
    fn test_pidless_lock_is_broken_only_when_old() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.lock");
        fs::write(&path, "").unwrap();
        assert!(FileLock::acquire(&path, Duration::from_millis(30)).is_err());

        backdate(&path);
        FileLock::acquire(&path, Duration::from_millis(30)).unwrap();
    }

    #[test]
    fn test_breaker_leaves_fresh_lock_alone() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.lock");
        // Another waiter already replaced the stale lock with a live one.
        let _fresh = FileLock::acquire(&path, Duration::from_millis(30)).unwrap();

        assert!(!break_stale(&path));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_async_acquire_waits_for_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.lock");
        let held = FileLock::acquire(&path, Duration::from_millis(30)).unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(held);
        });
        FileLock::acquire_async(&path, Duration::from_secs(2)).await.unwrap();
        releaser.await.unwrap();
    }
}
