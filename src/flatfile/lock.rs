//! Advisory lock for the flat-file store.
//!
//! A sibling `<file>.lock` is created with `create_new`, so only one process
//! can hold it. The lock records who took it; a lock whose owner is gone, or
//! that is older than [`LOCK_STALE_SECONDS`], is archived and taken over.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Locks older than this are considered abandoned.
pub const LOCK_STALE_SECONDS: i64 = 300;

/// Bounded exponential backoff for lock contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {path} held by pid {pid} since {since} ({operation})")]
    Contended {
        path: PathBuf,
        pid: u32,
        since: String,
        operation: String,
    },

    #[error("lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    created_at: String,
    operation: String,
}

/// Held lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

/// `<data file>.lock` next to the data file.
pub fn lock_path(data_path: &Path) -> PathBuf {
    sibling(data_path, "lock")
}

/// Append `.suffix` to the file name of `path`.
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

impl FileLock {
    /// Take the lock for `data_path`, retrying per `policy` while another
    /// live holder has it.
    pub fn acquire(
        data_path: &Path,
        operation: &str,
        policy: &RetryPolicy,
    ) -> Result<Self, LockError> {
        let path = lock_path(data_path);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::try_create(&path, operation) {
                Ok(lock) => return Ok(lock),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_err(e)),
            }

            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                // Released between our create and read.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(e)),
            };
            let holder = serde_json::from_str::<LockInfo>(&raw).ok();
            match holder {
                Some(info) if !is_stale(&info) => {
                    if attempt >= attempts {
                        return Err(LockError::Contended {
                            path: path.clone(),
                            pid: info.pid,
                            since: info.created_at,
                            operation: info.operation,
                        });
                    }
                    let delay = policy.delay(attempt);
                    log::debug!(
                        "flat-file lock busy (pid {}), retry {}/{} in {:?}",
                        info.pid,
                        attempt,
                        attempts,
                        delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Some(info) => {
                    log::warn!(
                        "Taking over stale flat-file lock from pid {} ({})",
                        info.pid,
                        info.created_at
                    );
                    archive_if_unchanged(&path, "stale", &raw).map_err(io_err)?;
                }
                None => {
                    // Unreadable or half-written; the holder may still be
                    // writing it, so give it one backoff before archiving.
                    if attempt >= attempts {
                        archive_if_unchanged(&path, "corrupt", &raw).map_err(io_err)?;
                    } else {
                        std::thread::sleep(policy.delay(attempt));
                        attempt += 1;
                    }
                }
            }
        }
    }

    fn try_create(path: &Path, operation: &str) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
        let info = LockInfo {
            pid: std::process::id(),
            created_at: Utc::now().to_rfc3339(),
            operation: operation.to_string(),
        };
        let lock = Self {
            path: path.to_path_buf(),
        };
        let payload = serde_json::to_string(&info).map_err(std::io::Error::other)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

fn is_stale(info: &LockInfo) -> bool {
    if !pid_is_alive(info.pid) {
        return true;
    }
    chrono::DateTime::parse_from_rfc3339(&info.created_at)
        .map(|created| Utc::now().signed_duration_since(created).num_seconds() > LOCK_STALE_SECONDS)
        .unwrap_or(false)
}

/// Move the lock at `path` aside, but only while it still holds `seen`.
///
/// Another contender may have taken over between our read and the rename.
/// The rename is re-checked against the archived content, and a lock that
/// turns out to be fresh is linked back into place.
fn archive_if_unchanged(path: &Path, reason: &str, seen: &str) -> std::io::Result<()> {
    match fs::read_to_string(path) {
        Ok(current) if current == seen => {}
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }

    let archived = sibling(
        path,
        &format!("{reason}.{}.{}", Utc::now().timestamp_millis(), std::process::id()),
    );
    match fs::rename(path, &archived) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        other => other?,
    }

    if fs::read_to_string(&archived)? != seen {
        log::warn!("Lock {} changed hands during takeover; restoring it", path.display());
        match fs::hard_link(&archived, path) {
            Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => return Err(e),
            _ => {}
        }
        fs::remove_file(&archived)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}
