//! Blob Store: content-addressed, deduplicated blobs over any object backend
//!
//! Object key = `ObjectLayout::key_for(digest)`. The catalog holds one
//! `BlobRecord` per digest; the backend holds the bytes.
//!
//! `put` and `collect` on the same digest are serialized by a striped async
//! lock, so a collect can never delete an object that a concurrent put has
//! just decided to reuse. Different digests proceed in parallel.

use std::sync::Arc;
use stow_core::{Digest, Missing, StowError, StowResult};
use stow_storage::{ObjectBackend, ObjectLayout};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::{BlobRecord, Catalog};

const LOCK_STRIPES: usize = 64;

/// What `put` had to do for a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Object written (first ingest, or re-upload of a lost object)
    Stored,
    /// Record and object already present; nothing written
    Deduplicated,
}

#[derive(Clone)]
pub struct BlobStore {
    backend: Arc<dyn ObjectBackend>,
    catalog: Arc<Catalog>,
    layout: ObjectLayout,
    stripes: Arc<Vec<Mutex<()>>>,
}

impl BlobStore {
    pub fn new(backend: Arc<dyn ObjectBackend>, catalog: Arc<Catalog>, layout: ObjectLayout) -> Self {
        BlobStore {
            backend,
            catalog,
            layout,
            stripes: Arc::new((0..LOCK_STRIPES).map(|_| Mutex::new(())).collect()),
        }
    }

    fn stripe(&self, digest: &Digest) -> &Mutex<()> {
        &self.stripes[digest.as_bytes()[0] as usize % LOCK_STRIPES]
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    pub fn layout(&self) -> &ObjectLayout {
        &self.layout
    }

    /// Store `data` and return its digest. Idempotent.
    pub async fn put(&self, data: &[u8]) -> StowResult<Digest> {
        let digest = stow_hash::hash_bytes(data);
        self.put_hashed(digest, data).await?;
        Ok(digest)
    }

    /// `put` for callers that already hashed `data` (the fileset index hashes in parallel).
    pub(crate) async fn put_hashed(&self, digest: Digest, data: &[u8]) -> StowResult<PutOutcome> {
        let _guard = self.stripe(&digest).lock().await;

        if let Some(record) = self.catalog.blob(&digest) {
            if self.backend.exists(&record.key).await? {
                debug!(blob = %digest, "dedup: blob already stored");
                return Ok(PutOutcome::Deduplicated);
            }
            warn!(blob = %digest, key = %record.key, "blob object missing from backend, re-uploading");
        }

        let key = self.layout.key_for(&digest);
        self.backend.write(&key, data.to_vec()).await?;
        self.catalog.upsert_blob(digest, data.len() as u64, key);
        debug!(blob = %digest, bytes = data.len(), "stored blob");
        Ok(PutOutcome::Stored)
    }

    /// Fetch a blob's bytes, verifying them against the digest.
    ///
    /// `NotFound(Blob)` means the digest was never stored (or was collected);
    /// `NotFound(Object)` means the record is live but the backend lost the
    /// object.
    pub async fn get(&self, digest: &Digest) -> StowResult<Vec<u8>> {
        let record = self
            .catalog
            .blob(digest)
            .ok_or(StowError::NotFound(Missing::Blob(*digest)))?;

        let data = self.backend.read(&record.key).await.map_err(|e| {
            if e.is_data_loss() {
                warn!(blob = %digest, key = %record.key, "blob record is live but object is gone");
            }
            e
        })?;

        let actual = stow_hash::hash_bytes(&data);
        if actual != *digest {
            return Err(StowError::Integrity {
                key: record.key,
                expected: *digest,
                actual,
            });
        }
        Ok(data)
    }

    /// Lower a blob's count by one. Never deletes.
    pub fn decrement(&self, digest: &Digest) -> StowResult<u64> {
        self.catalog.decrement_blob(digest)
    }

    /// Remove every blob record at count zero; with `delete_physical`, delete
    /// the backend objects too. Returns the number of records removed.
    pub async fn collect(&self, delete_physical: bool) -> StowResult<usize> {
        let mut removed = 0usize;
        for digest in self.catalog.unreferenced_blobs() {
            let _guard = self.stripe(&digest).lock().await;

            // re-checked under the catalog lock: a fileset may have claimed it since
            let Some(record) = self.catalog.remove_blob_if_unreferenced(&digest) else {
                debug!(blob = %digest, "blob revived before collection, keeping");
                continue;
            };

            if delete_physical {
                if let Err(e) = self.backend.delete(&record.key).await {
                    warn!(blob = %digest, key = %record.key, "physical delete failed: {e}");
                    self.catalog.reinstate_blob(record);
                    return Err(e);
                }
            }
            removed += 1;
        }

        info!(removed, delete_physical, backend = self.backend.name(), "collected blobs");
        Ok(removed)
    }

    pub fn record(&self, digest: &Digest) -> Option<BlobRecord> {
        self.catalog.blob(digest)
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.catalog.blob(digest).is_some()
    }

    /// Number of blob records
    pub fn len(&self) -> usize {
        self.catalog.blob_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
