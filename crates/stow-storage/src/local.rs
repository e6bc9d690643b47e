//! Local filesystem backend: objects live under a root directory
//!
//! Writes are atomic (unique temp file → fsync → rename) so a reader never
//! observes a partially written object, and two writers racing on the same
//! key simply rename identical content over each other.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use stow_core::{Missing, StowError, StowResult};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::backend::ObjectBackend;

const CREATE_ATTEMPTS: u32 = 16;

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBackend { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto the root, refusing keys that could escape it.
    fn path_for(&self, key: &str) -> StowResult<PathBuf> {
        let mut path = self.root.clone();
        let mut any = false;
        for part in key.split('/').filter(|p| !p.is_empty()) {
            if part == "." || part == ".." {
                return Err(StowError::conflict(format!("invalid object key: {key}")));
            }
            path.push(part);
            any = true;
        }
        if !any {
            return Err(StowError::conflict("empty object key"));
        }
        Ok(path)
    }

    /// Remove now-empty shard directories between `path` and the root.
    async fn prune_empty_parents(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            // remove_dir fails on non-empty directories, which ends the walk
            if fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

/// Create `tmp` next to `path`, recreating the shard directories if a
/// concurrent delete pruned them in between.
async fn create_in_shard(path: &Path, tmp: &Path) -> std::io::Result<fs::File> {
    let mut attempt = 0;
    loop {
        let created = match path.parent() {
            Some(parent) => fs::create_dir_all(parent).await,
            None => Ok(()),
        };
        let result = match created {
            Ok(()) => fs::File::create(tmp).await,
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && attempt < CREATE_ATTEMPTS => {
                attempt += 1;
                debug!(path = %tmp.display(), attempt, "local: shard pruned under us, retrying");
            }
            other => return other,
        }
    }
}

#[async_trait]
impl ObjectBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> StowResult<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let mut file = create_in_shard(&path, &tmp).await?;

        let written = match file.write_all(&data).await {
            Ok(()) => file.sync_all().await,
            Err(e) => Err(e),
        };
        drop(file);
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        // the temp file keeps the shard non-empty, so pruning cannot race the rename
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(key, bytes = data.len(), "local: wrote object");
        Ok(())
    }

    async fn read(&self, key: &str) -> StowResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StowError::NotFound(Missing::Object { key: key.to_string() }))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> StowResult<bool> {
        let path = self.path_for(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> StowResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key, "local: deleted object");
                self.prune_empty_parents(&path).await;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(key, "local: delete failed: {e}");
                Err(e.into())
            }
        }
    }

    async fn check(&self) -> StowResult<()> {
        fs::create_dir_all(&self.root).await?;
        let meta = fs::metadata(&self.root).await?;
        if meta.permissions().readonly() {
            return Err(StowError::Storage(format!(
                "backend root is read-only: {}",
                self.root.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend() -> (LocalBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        (LocalBackend::new(dir.path().join("objects")), dir)
    }

    #[tokio::test]
    async fn write_read_delete() {
        let (b, _tmp) = backend();
        b.write("ab/cd/abcd", b"hello".to_vec()).await.unwrap();
        assert!(b.exists("ab/cd/abcd").await.unwrap());
        assert_eq!(b.read("ab/cd/abcd").await.unwrap(), b"hello");

        b.delete("ab/cd/abcd").await.unwrap();
        assert!(!b.exists("ab/cd/abcd").await.unwrap());
        // shard dirs pruned back to the root
        assert!(!b.root().join("ab").exists());
    }

    #[tokio::test]
    async fn read_missing_is_object_not_found() {
        let (b, _tmp) = backend();
        let err = b.read("zz/zz/zzzz").await.unwrap_err();
        assert!(err.is_data_loss(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let (b, _tmp) = backend();
        b.delete("nothing/here").await.unwrap();
    }

    #[tokio::test]
    async fn rewrite_same_key_is_idempotent() {
        let (b, _tmp) = backend();
        b.write("k", b"same".to_vec()).await.unwrap();
        b.write("k", b"same".to_vec()).await.unwrap();
        assert_eq!(b.read("k").await.unwrap(), b"same");
    }

    #[tokio::test]
    async fn concurrent_writers_same_key() {
        let (b, _tmp) = backend();
        let b = std::sync::Arc::new(b);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = b.clone();
            handles.push(tokio::spawn(async move {
                b.write("ab/race", vec![42u8; 4096]).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(b.read("ab/race").await.unwrap(), vec![42u8; 4096]);
        let leftovers: Vec<_> = std::fs::read_dir(b.root().join("ab"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn writes_survive_concurrent_shard_pruning() {
        let (b, _tmp) = backend();
        let b = std::sync::Arc::new(b);

        let pruner = {
            let b = b.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    b.write("a/y", b"churn".to_vec()).await.unwrap();
                    b.delete("a/y").await.unwrap();
                }
            })
        };
        let mut writers = Vec::new();
        for i in 0..200 {
            let b = b.clone();
            writers.push(tokio::spawn(async move {
                b.write(&format!("a/x{i}"), vec![i as u8; 64]).await
            }));
        }
        for w in writers {
            w.await.unwrap().unwrap();
        }
        pruner.await.unwrap();

        for i in 0..200 {
            assert_eq!(b.read(&format!("a/x{i}")).await.unwrap(), vec![i as u8; 64]);
        }
    }

    #[tokio::test]
    async fn failed_write_leaves_no_temp_file() {
        let (b, _tmp) = backend();
        // a non-empty directory at the object path makes the final step fail
        std::fs::create_dir_all(b.root().join("sh/taken/child")).unwrap();

        assert!(b.write("sh/taken", b"data".to_vec()).await.is_err());
        let leftovers: Vec<_> = std::fs::read_dir(b.root().join("sh"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn keys_cannot_escape_root() {
        let (b, _tmp) = backend();
        assert!(b.path_for("../etc/passwd").is_err());
        assert!(b.path_for("").is_err());
        assert!(b.path_for("a/./b").is_err());
    }

    #[test]
    fn check_creates_root() {
        let (b, _tmp) = backend();
        tokio_test::block_on(b.check()).unwrap();
        assert!(b.root().is_dir());
    }
}
