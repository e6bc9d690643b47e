//! `AttachmentStore`: the public face of the store
//!
//! Wires one backend, one catalog and the four engines together and keeps
//! the catalog persisted after every mutating call. Cloning is cheap and
//! every clone shares the same state, so one store can serve many tasks.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stow_core::config::StowConfig;
use stow_core::{Digest, RowKey, StowError, StowResult};
use stow_storage::{build_backend, ObjectBackend, ObjectLayout};
use tracing::info;

use crate::blob_store::BlobStore;
use crate::catalog::{AuditReport, Catalog, CatalogStats};
use crate::index::{FileEntry, FilesetIndex};
use crate::restore::RestoreEngine;
use crate::source::{read_entries, FileSource};
use crate::tracker::ReferenceTracker;

/// Summary of a store's contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub store: String,
    pub backend: String,
    #[serde(flatten)]
    pub catalog: CatalogStats,
}

#[derive(Clone)]
pub struct AttachmentStore {
    name: String,
    stage: PathBuf,
    exclude_patterns: Arc<Vec<String>>,
    catalog: Arc<Catalog>,
    blobs: BlobStore,
    index: FilesetIndex,
    tracker: ReferenceTracker,
    restore: RestoreEngine,
}

impl AttachmentStore {
    /// Build the configured backend and open (or create) the catalog.
    pub fn open(config: &StowConfig) -> StowResult<Self> {
        config.validate()?;
        let backend = build_backend(&config.store)?;
        let catalog = match &config.store.catalog {
            Some(path) => Catalog::open(path)?,
            None => Catalog::in_memory(),
        };
        Self::with_backend(config, backend, catalog)
    }

    /// Assemble a store over an already-built backend and catalog.
    pub fn with_backend(
        config: &StowConfig,
        backend: Arc<dyn ObjectBackend>,
        catalog: Catalog,
    ) -> StowResult<Self> {
        config.validate()?;
        let catalog = Arc::new(catalog);
        let blobs = BlobStore::new(backend, catalog.clone(), ObjectLayout::from_config(&config.store));
        let index = FilesetIndex::new(blobs.clone(), catalog.clone(), config.ingest.max_retries);
        let restore = RestoreEngine::new(blobs.clone(), catalog.clone(), &config.restore);

        info!(
            store = %config.store.name,
            backend = blobs.backend().name(),
            stage = %config.store.stage.display(),
            "attachment store ready"
        );

        Ok(AttachmentStore {
            name: config.store.name.clone(),
            stage: config.store.stage.clone(),
            exclude_patterns: Arc::new(config.ingest.exclude_patterns.clone()),
            tracker: ReferenceTracker::new(catalog.clone()),
            catalog,
            blobs,
            index,
            restore,
        })
    }

    /// Ingest the files of `source` and bind them to `row`.
    pub async fn insert_fileset(
        &self,
        row: impl Into<RowKey>,
        source: impl Into<FileSource>,
    ) -> StowResult<Digest> {
        let row = row.into();
        if let Some(existing) = self.catalog.row(&row) {
            return Err(StowError::conflict(format!(
                "row {row} is already bound to fileset {}",
                existing.fileset
            )));
        }
        let entries = read_entries(&source.into(), &self.stage, &self.exclude_patterns).await?;
        self.insert_entries(row, &entries).await
    }

    /// Bind `row` to a fileset built from in-memory entries.
    pub async fn insert_entries(&self, row: impl Into<RowKey>, entries: &[FileEntry]) -> StowResult<Digest> {
        let row = row.into();
        let digest = self.index.resolve_bound(&row, entries).await?;
        self.catalog.flush()?;
        info!(row = %row, fileset = %digest, files = entries.len(), "inserted fileset");
        Ok(digest)
    }

    /// Materialize the fileset bound to `row` under `destination`.
    pub async fn fetch_files(&self, row: impl Into<RowKey>, destination: &Path) -> StowResult<Vec<PathBuf>> {
        let row = row.into();
        let fileset = self.tracker.fileset_for(&row)?;
        self.restore.materialize(&fileset, destination).await
    }

    /// Restore the fileset bound to `row` to where it was staged from.
    pub async fn fetch_to_stage(&self, row: impl Into<RowKey>) -> StowResult<Vec<PathBuf>> {
        self.fetch_files(row, &self.stage).await
    }

    /// The row was deleted from the external table: release its fileset.
    pub fn delete_row(&self, row: impl Into<RowKey>) -> StowResult<()> {
        let row = row.into();
        let fileset = self.tracker.detach(&row)?;
        self.catalog.flush()?;
        info!(row = %row, fileset = %fileset, "deleted row");
        Ok(())
    }

    /// Remove orphaned filesets. Returns how many were removed.
    pub fn collect_filesets(&self) -> StowResult<usize> {
        let removed = self.tracker.collect_filesets();
        self.catalog.flush()?;
        Ok(removed)
    }

    /// Remove unreferenced blobs, and their objects when `delete_physical`.
    pub async fn collect_blobs(&self, delete_physical: bool) -> StowResult<usize> {
        let collected = self.blobs.collect(delete_physical).await;
        // records removed before a failed delete are still worth persisting
        self.catalog.flush()?;
        collected
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            store: self.name.clone(),
            backend: self.blobs.backend().name().to_string(),
            catalog: self.catalog.stats(),
        }
    }

    pub fn audit(&self) -> AuditReport {
        self.tracker.audit()
    }

    pub async fn check_health(&self) -> StowResult<()> {
        stow_storage::check_health(self.blobs.backend().as_ref()).await
    }

    pub fn flush(&self) -> StowResult<()> {
        self.catalog.flush()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> &Path {
        &self.stage
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn index(&self) -> &FilesetIndex {
        &self.index
    }

    pub fn tracker(&self) -> &ReferenceTracker {
        &self.tracker
    }

    pub fn restore(&self) -> &RestoreEngine {
        &self.restore
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stow_core::config::Protocol;
    use stow_core::{Missing, RelPath};

    fn memory_config(stage: &Path) -> StowConfig {
        let mut config = StowConfig::default();
        config.store.protocol = Protocol::Memory;
        config.store.stage = stage.to_path_buf();
        config.store.location = "attach".into();
        config
    }

    #[tokio::test]
    async fn open_memory_store_and_roundtrip_entries() {
        let stage = tempfile::tempdir().unwrap();
        let store = AttachmentStore::open(&memory_config(stage.path())).unwrap();
        store.check_health().await.unwrap();

        let entries = vec![FileEntry::new(RelPath::new("x/y.dat").unwrap(), b"payload".to_vec())];
        let d = store.insert_entries(5u64, &entries).await.unwrap();
        assert_eq!(store.tracker().fileset_for(&RowKey::from(5u64)).unwrap(), d);

        let paths = store.fetch_to_stage(5u64).await.unwrap();
        assert_eq!(paths, vec![stage.path().join("x/y.dat")]);

        let stats = store.stats();
        assert_eq!(stats.backend, "memory");
        assert_eq!((stats.catalog.blobs, stats.catalog.filesets, stats.catalog.rows), (1, 1, 1));
    }

    #[tokio::test]
    async fn insert_into_bound_row_conflicts_without_reading_files() {
        let stage = tempfile::tempdir().unwrap();
        let store = AttachmentStore::open(&memory_config(stage.path())).unwrap();
        store.insert_entries("r", &[]).await.unwrap();

        let err = store
            .insert_fileset("r", FileSource::Directory("does-not-exist".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StowError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_unknown_row_is_not_found() {
        let stage = tempfile::tempdir().unwrap();
        let store = AttachmentStore::open(&memory_config(stage.path())).unwrap();
        let err = store.delete_row(99u64).unwrap_err();
        assert!(matches!(err, StowError::NotFound(Missing::Row(_))));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = memory_config(Path::new("stage"));
        config.restore.concurrency = 0;
        assert!(matches!(AttachmentStore::open(&config), Err(StowError::Config(_))));
    }

    #[tokio::test]
    async fn catalog_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StowConfig::default();
        config.store.stage = dir.path().join("stage");
        config.store.location = dir.path().join("objects").to_string_lossy().into_owned();
        config.store.catalog = Some(dir.path().join("catalog.json"));

        let digest = {
            let store = AttachmentStore::open(&config).unwrap();
            let entries = vec![FileEntry::new(RelPath::new("a.dat").unwrap(), b"kept".to_vec())];
            store.insert_entries(1u64, &entries).await.unwrap()
        };

        let reopened = AttachmentStore::open(&config).unwrap();
        assert_eq!(reopened.tracker().fileset_for(&RowKey::from(1u64)).unwrap(), digest);
        let dest = tempfile::tempdir().unwrap();
        reopened.fetch_files(1u64, dest.path()).await.unwrap();
        assert_eq!(std::fs::read(dest.path().join("a.dat")).unwrap(), b"kept");
    }
}
