//! Restore Engine: materialize a fileset under a destination root
//!
//! Each member lands at `destination/relative_path`. Files already present
//! with the right content are left alone, so a second materialize of the
//! same fileset writes nothing and a locally deleted file is simply fetched
//! again. Writes go through a unique temp file in the target directory and a
//! rename, so readers never observe a partial file.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stow_core::config::RestoreConfig;
use stow_core::{Digest, Missing, RelPath, StowError, StowResult};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::blob_store::BlobStore;
use crate::catalog::{Catalog, FilesetMember};

/// Outcome of one materialize call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Absolute paths of every member, in member (path) order
    pub paths: Vec<PathBuf>,
    /// Members already present with matching content
    pub reused: usize,
    /// Members fetched from the blob store and written
    pub fetched: usize,
}

#[derive(Clone)]
pub struct RestoreEngine {
    blobs: BlobStore,
    catalog: Arc<Catalog>,
    concurrency: usize,
    verify_existing: bool,
}

impl RestoreEngine {
    pub fn new(blobs: BlobStore, catalog: Arc<Catalog>, config: &RestoreConfig) -> Self {
        RestoreEngine {
            blobs,
            catalog,
            concurrency: config.concurrency.max(1),
            verify_existing: config.verify_existing,
        }
    }

    /// Materialize `fileset` under `destination` and return the member paths.
    pub async fn materialize(&self, fileset: &Digest, destination: &Path) -> StowResult<Vec<PathBuf>> {
        Ok(self.materialize_report(fileset, destination).await?.paths)
    }

    pub async fn materialize_report(
        &self,
        fileset: &Digest,
        destination: &Path,
    ) -> StowResult<MaterializeReport> {
        let record = self
            .catalog
            .fileset(fileset)
            .ok_or(StowError::NotFound(Missing::Fileset(*fileset)))?;

        let restores: Vec<_> = record
            .members
            .iter()
            .map(|member| self.restore_member(member, destination))
            .collect();
        let outcomes: Vec<(PathBuf, bool)> = stream::iter(restores)
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let mut report = MaterializeReport::default();
        for (path, fetched) in outcomes {
            if fetched {
                report.fetched += 1;
            } else {
                report.reused += 1;
            }
            report.paths.push(path);
        }

        info!(
            fileset = %fileset,
            destination = %destination.display(),
            reused = report.reused,
            fetched = report.fetched,
            "materialized fileset"
        );
        Ok(report)
    }

    /// Returns the target path and whether it had to be fetched.
    async fn restore_member(&self, member: &FilesetMember, destination: &Path) -> StowResult<(PathBuf, bool)> {
        let target = member.path.to_path(destination);

        if self.is_current(&target, member).await? {
            debug!(path = %member.path, "already materialized");
            return Ok((target, false));
        }

        let data = self.blobs.get(&member.blob).await.map_err(|e| {
            if e.is_data_loss() {
                warn!(path = %member.path, blob = %member.blob, "backing object missing, cannot restore");
                StowError::NotFound(Missing::Member {
                    path: member.path.clone(),
                    digest: member.blob,
                })
            } else {
                e
            }
        })?;

        write_atomic(&target, &member.path, &data).await?;
        debug!(path = %member.path, bytes = data.len(), "restored file");
        Ok((target, true))
    }

    async fn is_current(&self, target: &Path, member: &FilesetMember) -> StowResult<bool> {
        let meta = match fs::metadata(target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() || meta.len() != member.size {
            return Ok(false);
        }
        if !self.verify_existing {
            return Ok(true);
        }

        let path = target.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || stow_hash::hash_file_streaming(&path))
            .await
            .map_err(|e| StowError::Other(e.into()))??;
        if digest != member.blob {
            warn!(path = %member.path, "existing file differs from stored content, replacing");
            return Ok(false);
        }
        Ok(true)
    }
}

async fn write_atomic(target: &Path, rel: &RelPath, data: &[u8]) -> StowResult<()> {
    let parent = target.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).await?;

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| rel.to_string());
    let tmp = parent.join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    if let Err(e) = fs::write(&tmp, data).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&tmp, target).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FileEntry, FilesetIndex};
    use stow_storage::{build_memory_operator, ObjectLayout, RemoteBackend};

    struct Fixture {
        index: FilesetIndex,
        blobs: BlobStore,
        engine: RestoreEngine,
    }

    fn fixture(verify_existing: bool) -> Fixture {
        let catalog = Arc::new(Catalog::in_memory());
        let backend = RemoteBackend::new(build_memory_operator().unwrap(), "memory");
        let blobs = BlobStore::new(Arc::new(backend), catalog.clone(), ObjectLayout::default());
        let config = RestoreConfig {
            concurrency: 2,
            verify_existing,
        };
        Fixture {
            index: FilesetIndex::new(blobs.clone(), catalog.clone(), 0),
            engine: RestoreEngine::new(blobs.clone(), catalog, &config),
            blobs,
        }
    }

    fn entries() -> Vec<FileEntry> {
        vec![
            FileEntry::new(RelPath::new("a/one.dat").unwrap(), b"one".to_vec()),
            FileEntry::new(RelPath::new("a/b/two.dat").unwrap(), b"two".to_vec()),
            FileEntry::new(RelPath::new("three.dat").unwrap(), b"three".to_vec()),
        ]
    }

    #[tokio::test]
    async fn materialize_writes_every_member_in_order() {
        let fx = fixture(true);
        let d = fx.index.resolve(&entries()).await.unwrap();
        let dest = tempfile::tempdir().unwrap();

        let report = fx.engine.materialize_report(&d, dest.path()).await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(report.reused, 0);
        assert_eq!(
            report.paths,
            vec![
                dest.path().join("a/b/two.dat"),
                dest.path().join("a/one.dat"),
                dest.path().join("three.dat"),
            ]
        );
        assert_eq!(std::fs::read(dest.path().join("a/b/two.dat")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn second_materialize_is_all_hits_and_heals_deletions() {
        let fx = fixture(true);
        let d = fx.index.resolve(&entries()).await.unwrap();
        let dest = tempfile::tempdir().unwrap();
        fx.engine.materialize(&d, dest.path()).await.unwrap();

        let again = fx.engine.materialize_report(&d, dest.path()).await.unwrap();
        assert_eq!((again.reused, again.fetched), (3, 0));

        std::fs::remove_file(dest.path().join("three.dat")).unwrap();
        let healed = fx.engine.materialize_report(&d, dest.path()).await.unwrap();
        assert_eq!((healed.reused, healed.fetched), (2, 1));
        assert_eq!(std::fs::read(dest.path().join("three.dat")).unwrap(), b"three");
    }

    #[tokio::test]
    async fn same_size_corruption_is_replaced_when_verifying() {
        let fx = fixture(true);
        let d = fx.index.resolve(&entries()).await.unwrap();
        let dest = tempfile::tempdir().unwrap();
        fx.engine.materialize(&d, dest.path()).await.unwrap();

        std::fs::write(dest.path().join("a/one.dat"), b"ONE").unwrap();
        let report = fx.engine.materialize_report(&d, dest.path()).await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(std::fs::read(dest.path().join("a/one.dat")).unwrap(), b"one");
    }

    #[tokio::test]
    async fn size_only_check_trusts_present_files() {
        let fx = fixture(false);
        let d = fx.index.resolve(&entries()).await.unwrap();
        let dest = tempfile::tempdir().unwrap();
        fx.engine.materialize(&d, dest.path()).await.unwrap();

        std::fs::write(dest.path().join("a/one.dat"), b"ONE").unwrap();
        let report = fx.engine.materialize_report(&d, dest.path()).await.unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(std::fs::read(dest.path().join("a/one.dat")).unwrap(), b"ONE");
    }

    #[tokio::test]
    async fn lost_object_reports_member_and_keeps_restored_files() {
        let fx = fixture(true);
        let d = fx.index.resolve(&entries()).await.unwrap();
        let dest = tempfile::tempdir().unwrap();
        fx.engine.materialize(&d, dest.path()).await.unwrap();

        let lost = stow_hash::hash_bytes(b"three");
        let key = fx.blobs.record(&lost).unwrap().key;
        fx.blobs.backend().delete(&key).await.unwrap();
        std::fs::remove_file(dest.path().join("three.dat")).unwrap();

        let err = fx.engine.materialize(&d, dest.path()).await.unwrap_err();
        match err {
            StowError::NotFound(Missing::Member { path, digest }) => {
                assert_eq!(path.as_str(), "three.dat");
                assert_eq!(digest, lost);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(dest.path().join("a/one.dat").exists());
        assert!(dest.path().join("a/b/two.dat").exists());
    }

    #[tokio::test]
    async fn unknown_fileset_is_not_found() {
        let fx = fixture(true);
        let dest = tempfile::tempdir().unwrap();
        let err = fx
            .engine
            .materialize(&stow_hash::hash_bytes(b"?"), dest.path())
            .await
            .unwrap_err();
        assert!(matches!(err, StowError::NotFound(Missing::Fileset(_))));
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let fx = fixture(true);
        let d = fx.index.resolve(&entries()).await.unwrap();
        let dest = tempfile::tempdir().unwrap();
        fx.engine.materialize(&d, dest.path()).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dest.path().join("a"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
