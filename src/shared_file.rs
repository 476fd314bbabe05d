//! JSON documents shared between processes.
//!
//! Readers always go to disk. Writers take a [`FileLocks`] lock named after the
//! file, reload, apply their change and replace the file by rename, so
//! concurrent writers never drop each other's changes.

use crate::lock::{FileLocks, LockManager};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_WRITE_LOCK_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_WRITE_LOCK_WAIT: Duration = Duration::from_secs(10);

pub struct SharedJsonFile {
    path: PathBuf,
    lock_name: String,
    locks: FileLocks,
}

fn lock_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

impl SharedJsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "shared".to_string());
        let locks = FileLocks::new(lock_dir(&path), DEFAULT_WRITE_LOCK_TTL, DEFAULT_WRITE_LOCK_WAIT);
        Self { path, lock_name, locks }
    }

    pub fn with_lock_timing(mut self, ttl: Duration, wait_timeout: Duration) -> Self {
        self.locks = FileLocks::new(lock_dir(&self.path), ttl, wait_timeout);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document. `None` when the file is missing or does not parse.
    pub fn read<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", self.path)),
        };
        match serde_json::from_str(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Failed to parse {:?}: {}, ignoring its content", self.path, e);
                Ok(None)
            }
        }
    }

    /// Locked read-modify-write. `init` supplies the document when there is none.
    pub async fn update<T, R, I, F>(&self, init: I, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned + Send,
        I: FnOnce() -> T + Send,
        F: FnOnce(&mut T) -> R + Send,
    {
        let _guard = self.locks.acquire(&self.lock_name).await?;
        let mut value = self.read()?.unwrap_or_else(init);
        let result = f(&mut value);
        self.write(&value)?;
        Ok(result)
    }

    fn write<T: Serialize>(&self, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        // Write-then-rename so readers never see a truncated document.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("Failed to replace {:?}", self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    type Counters = BTreeMap<String, u32>;

    #[tokio::test]
    async fn test_missing_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = SharedJsonFile::new(dir.path().join("doc.json"));
        assert!(file.read::<Counters>().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_returns_closure_result() {
        let dir = tempfile::tempdir().unwrap();
        let file = SharedJsonFile::new(dir.path().join("nested").join("doc.json"));

        let before = file
            .update(Counters::new, |c| c.insert("a".to_string(), 1))
            .await
            .unwrap();
        assert!(before.is_none());
        let before = file
            .update(Counters::new, |c| c.insert("a".to_string(), 2))
            .await
            .unwrap();
        assert_eq!(before, Some(1));
        assert_eq!(file.read::<Counters>().unwrap().unwrap()["a"], 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writers_on_separate_handles_keep_each_others_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");

        let mut handles = Vec::new();
        for i in 0..8 {
            let file = Arc::new(SharedJsonFile::new(&path));
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    file.update(Counters::new, |c| *c.entry(format!("w{}", i)).or_default() += 1)
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let counters: Counters = SharedJsonFile::new(&path).read().unwrap().unwrap();
        assert_eq!(counters.len(), 8);
        assert!(counters.values().all(|&n| n == 5));
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_from_init() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        fs::write(&path, "garbage").unwrap();
        let file = SharedJsonFile::new(&path);

        assert!(file.read::<Counters>().unwrap().is_none());
        file.update(Counters::new, |c| c.insert("a".to_string(), 1)).await.unwrap();
        assert_eq!(file.read::<Counters>().unwrap().unwrap().len(), 1);
    }
}
