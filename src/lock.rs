//! Named mutual exclusion across execution contexts.
//!
//! [`ProcessLocks`] serializes callers inside one process. [`FileLocks`] extends
//! that to several processes sharing a directory: the lock is a file holding the
//! owner's random token and an expiry, and a lock whose expiry has passed is
//! taken over.

use crate::error::SyncError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Wait for the named lock. Released when the guard is dropped.
    async fn acquire(&self, name: &str) -> Result<LockGuard>;
}

/// Held lock.
pub struct LockGuard {
    name: String,
    _held: Held,
}

#[allow(dead_code)]
enum Held {
    Process(OwnedMutexGuard<()>),
    File(LockFile),
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// In-process named locks.
pub struct ProcessLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    wait_timeout: Duration,
}

impl ProcessLocks {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            wait_timeout,
        }
    }

    fn lock_for(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl LockManager for ProcessLocks {
    async fn acquire(&self, name: &str) -> Result<LockGuard> {
        let mutex = self.lock_for(name);
        let guard = match mutex.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Waiting for lock '{}'", name);
                tokio::time::timeout(self.wait_timeout, mutex.lock_owned())
                    .await
                    .map_err(|_| SyncError::LockTimeout(name.to_string()))?
            }
        };
        Ok(LockGuard {
            name: name.to_string(),
            _held: Held::Process(guard),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    token: String,
    pid: u32,
    expires_at_ms: i64,
}

struct LockFile {
    path: PathBuf,
    token: String,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // Never delete a lock that was taken over after expiry.
        match read_record(&self.path) {
            Some(record) if record.token == self.token => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!("Failed to release lock file {:?}: {}", self.path, e);
                }
            }
            _ => debug!("Lock file {:?} no longer ours, leaving it", self.path),
        }
    }
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Lock files under a shared directory.
pub struct FileLocks {
    dir: PathBuf,
    ttl: Duration,
    wait_timeout: Duration,
    retry_interval: Duration,
}

impl FileLocks {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, wait_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            wait_timeout,
            retry_interval: Duration::from_millis(50),
        }
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }

    /// One attempt. The record is written to a private file first and hard-linked
    /// into place, so the lock path never holds a half-written record.
    fn try_acquire(&self, path: &Path, token: &str) -> Result<bool> {
        let record = LockRecord {
            token: token.to_string(),
            pid: std::process::id(),
            expires_at_ms: Utc::now().timestamp_millis() + self.ttl.as_millis() as i64,
        };
        let staging = path.with_extension(format!("lock.{}", token));
        fs::write(&staging, serde_json::to_vec(&record)?)
            .with_context(|| format!("Failed to write {:?}", staging))?;

        let linked = fs::hard_link(&staging, path);
        let _ = fs::remove_file(&staging);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to create lock {:?}", path)),
        }
    }

    /// Remove the lock at `path` when its holder's lease has run out.
    fn break_if_stale(&self, path: &Path, token: &str) -> bool {
        let now = Utc::now().timestamp_millis();
        let expired_token = match read_record(path) {
            Some(record) if record.expires_at_ms > now => return false,
            Some(record) => {
                info!(
                    "Taking over stale lock {:?} (pid {}, expired {} ms ago)",
                    path,
                    record.pid,
                    now - record.expires_at_ms
                );
                Some(record.token)
            }
            // Released between our attempt and the read.
            None if !path.exists() => return true,
            None => {
                warn!("Unreadable lock file {:?}, removing", path);
                None
            }
        };
        self.remove_if_unchanged(path, expired_token.as_deref(), token)
    }

    /// Move the lock aside and delete it only if it still holds `expected`.
    /// A record that changed since it was judged stale belongs to a live
    /// holder and is linked back.
    fn remove_if_unchanged(&self, path: &Path, expected: Option<&str>, token: &str) -> bool {
        let tombstone = path.with_extension(format!("lock.stale.{}", token));
        if let Err(e) = fs::rename(path, &tombstone) {
            // Another waiter got there first.
            return e.kind() == ErrorKind::NotFound;
        }

        let moved = read_record(&tombstone).map(|record| record.token);
        if moved.as_deref() == expected {
            let _ = fs::remove_file(&tombstone);
            return true;
        }

        debug!("Lock {:?} was renewed by {:?}, restoring it", path, moved);
        if let Err(e) = fs::hard_link(&tombstone, path) {
            warn!("Failed to restore lock {:?}: {}", path, e);
        }
        let _ = fs::remove_file(&tombstone);
        false
    }
}

#[async_trait]
impl LockManager for FileLocks {
    async fn acquire(&self, name: &str) -> Result<LockGuard> {
        fs::create_dir_all(&self.dir).with_context(|| format!("Failed to create lock dir {:?}", self.dir))?;
        let path = self.lock_path(name);
        let token = hex::encode(rand::random::<[u8; 16]>());
        let deadline = Instant::now() + self.wait_timeout;

        loop {
            if self.try_acquire(&path, &token)? {
                debug!("Acquired lock '{}'", name);
                return Ok(LockGuard {
                    name: name.to_string(),
                    _held: Held::File(LockFile { path, token }),
                });
            }
            if self.break_if_stale(&path, &token) {
                continue;
            }
            if Instant::now() >= deadline {
                return Err(SyncError::LockTimeout(name.to_string()).into());
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_process_lock_serializes() {
        let locks = Arc::new(ProcessLocks::new(Duration::from_secs(5)));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("install").await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_process_lock_names_are_independent() {
        let locks = ProcessLocks::new(Duration::from_millis(50));
        let a = locks.acquire("a").await.unwrap();
        let b = locks.acquire("b").await.unwrap();
        assert_eq!(a.name(), "a");
        assert_eq!(b.name(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_lock_timeout() {
        let locks = ProcessLocks::new(Duration::from_secs(1));
        let _held = locks.acquire("install").await.unwrap();

        let err = locks.acquire("install").await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::LockTimeout(name)) if name == "install"
        ));
    }

    #[tokio::test]
    async fn test_file_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileLocks::new(dir.path(), Duration::from_secs(60), Duration::from_millis(200));
        let path = locks.lock_path("install");

        {
            let _guard = assert_ok!(locks.acquire("install").await);
            assert!(path.exists());
        }
        assert!(!path.exists());
        let _again = assert_ok!(locks.acquire("install").await);
    }

    #[tokio::test]
    async fn test_file_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileLocks::new(dir.path(), Duration::from_secs(60), Duration::from_millis(150));
        let second = FileLocks::new(dir.path(), Duration::from_secs(60), Duration::from_millis(150));

        let _held = first.acquire("install").await.unwrap();
        let err = second.acquire("install").await.err().unwrap();
        assert!(matches!(err.downcast_ref::<SyncError>(), Some(SyncError::LockTimeout(_))));
    }

    #[tokio::test]
    async fn test_file_lock_takes_over_expired() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileLocks::new(dir.path(), Duration::from_secs(60), Duration::from_millis(200));
        let path = locks.lock_path("install");
        let stale = LockRecord {
            token: "dead".to_string(),
            pid: 1,
            expires_at_ms: Utc::now().timestamp_millis() - 1_000,
        };
        fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let guard = assert_ok!(locks.acquire("install").await);
        let record = read_record(&path).unwrap();
        assert_ne!(record.token, "dead");
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_takeover_spares_renewed_lock() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileLocks::new(dir.path(), Duration::from_secs(60), Duration::from_millis(200));
        let path = locks.lock_path("install");

        // The expired record was replaced by a live holder after we read it.
        let live = LockRecord {
            token: "live".to_string(),
            pid: 3,
            expires_at_ms: Utc::now().timestamp_millis() + 60_000,
        };
        fs::write(&path, serde_json::to_string(&live).unwrap()).unwrap();

        assert!(!locks.remove_if_unchanged(&path, Some("dead"), "mine"));
        assert_eq!(read_record(&path).unwrap().token, "live");
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_stale_takeover_removes_expired_record() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileLocks::new(dir.path(), Duration::from_secs(60), Duration::from_millis(200));
        let path = locks.lock_path("install");
        let stale = LockRecord {
            token: "dead".to_string(),
            pid: 1,
            expires_at_ms: Utc::now().timestamp_millis() - 1_000,
        };
        fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        assert!(locks.break_if_stale(&path, "mine"));
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        // Nothing left to take over.
        assert!(locks.remove_if_unchanged(&path, Some("dead"), "mine"));
    }

    #[tokio::test]
    async fn test_file_lock_keeps_foreign_lock_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let locks = FileLocks::new(dir.path(), Duration::from_secs(60), Duration::from_millis(200));
        let path = locks.lock_path("install");

        let guard = locks.acquire("install").await.unwrap();
        // Someone else took the lock over after our lease ran out.
        let foreign = LockRecord {
            token: "other".to_string(),
            pid: 2,
            expires_at_ms: Utc::now().timestamp_millis() + 60_000,
        };
        fs::write(&path, serde_json::to_string(&foreign).unwrap()).unwrap();

        drop(guard);
        assert_eq!(read_record(&path).unwrap().token, "other");
    }
}
