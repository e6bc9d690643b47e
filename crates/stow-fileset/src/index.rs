//! Fileset Index: deduplicates whole filesets into shared records
//!
//! A fileset's identity is the digest of its sorted (relative path, blob
//! digest) pairs, so two rows that attach byte- and path-identical file
//! groups share one `FilesetRecord`. Member blob counts are bumped exactly
//! once, when the record is created; rows reusing it only bump the fileset.

use std::collections::BTreeSet;
use std::sync::Arc;
use stow_core::{Digest, Missing, RelPath, RowKey, StowError, StowResult};
use tracing::{debug, info, warn};

use crate::blob_store::{BlobStore, PutOutcome};
use crate::catalog::{Catalog, FilesetMember, FilesetRecord, FilesetUpsert};

/// One file of a fileset: where it goes and what it contains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: RelPath,
    pub data: Arc<[u8]>,
}

impl FileEntry {
    pub fn new(path: RelPath, data: impl Into<Vec<u8>>) -> Self {
        FileEntry {
            path,
            data: Arc::from(data.into()),
        }
    }
}

#[derive(Clone)]
pub struct FilesetIndex {
    blobs: BlobStore,
    catalog: Arc<Catalog>,
    max_retries: u32,
}

impl FilesetIndex {
    pub fn new(blobs: BlobStore, catalog: Arc<Catalog>, max_retries: u32) -> Self {
        FilesetIndex {
            blobs,
            catalog,
            max_retries,
        }
    }

    /// Ingest the entries and return the fileset digest.
    ///
    /// Creates the record at count 0 when it is new; no row is bound. Rows
    /// are attached through the reference tracker.
    pub async fn resolve(&self, entries: &[FileEntry]) -> StowResult<Digest> {
        self.resolve_with(entries, None).await
    }

    /// Ingest the entries and bind `row` to the fileset in the same catalog
    /// step that creates or reuses it.
    pub async fn resolve_bound(&self, row: &RowKey, entries: &[FileEntry]) -> StowResult<Digest> {
        self.resolve_with(entries, Some(row)).await
    }

    async fn resolve_with(&self, entries: &[FileEntry], row: Option<&RowKey>) -> StowResult<Digest> {
        validate_entries(entries)?;
        if let Some(row) = row {
            if let Some(existing) = self.catalog.row(row) {
                return Err(StowError::conflict(format!(
                    "row {row} is already bound to fileset {}",
                    existing.fileset
                )));
            }
        }

        let datas: Vec<Arc<[u8]>> = entries.iter().map(|e| e.data.clone()).collect();
        let blob_digests = tokio::task::spawn_blocking(move || stow_hash::hash_many(&datas))
            .await
            .map_err(|e| StowError::Other(e.into()))?;

        let members: Vec<FilesetMember> = entries
            .iter()
            .zip(&blob_digests)
            .map(|(e, d)| FilesetMember {
                path: e.path.clone(),
                blob: *d,
                size: e.data.len() as u64,
            })
            .collect();
        let digest = stow_hash::fileset_digest(members.iter().map(|m| (&m.path, &m.blob)));

        let mut attempt = 0u32;
        loop {
            let mut stored = 0usize;
            for (entry, blob) in entries.iter().zip(&blob_digests) {
                if self.blobs.put_hashed(*blob, &entry.data).await? == PutOutcome::Stored {
                    stored += 1;
                }
            }

            let result = match row {
                Some(row) => self.catalog.bind_row(row, digest, &members),
                None => self.catalog.upsert_fileset(digest, &members),
            };

            match result {
                Ok(outcome) => {
                    info!(
                        fileset = %digest,
                        files = entries.len(),
                        stored_blobs = stored,
                        created = outcome == FilesetUpsert::Created,
                        row = row.map(|r| r.as_str()),
                        "resolved fileset"
                    );
                    return Ok(digest);
                }
                Err(StowError::NotFound(Missing::Blob(blob))) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        fileset = %digest,
                        blob = %blob,
                        attempt,
                        "member blob collected during resolve, re-ingesting"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The (relative path, blob digest) pairs of a fileset, sorted by path.
    pub fn members(&self, digest: &Digest) -> StowResult<Vec<(RelPath, Digest)>> {
        let record = self.record(digest)?;
        Ok(record.members.into_iter().map(|m| (m.path, m.blob)).collect())
    }

    pub fn record(&self, digest: &Digest) -> StowResult<FilesetRecord> {
        self.catalog
            .fileset(digest)
            .ok_or(StowError::NotFound(Missing::Fileset(*digest)))
    }

    /// One referencing row went away. At zero the fileset is orphaned but
    /// stays until `collect_filesets`.
    pub fn release(&self, digest: &Digest) -> StowResult<u64> {
        let remaining = self.catalog.release_fileset(digest)?;
        debug!(fileset = %digest, remaining, "released fileset");
        Ok(remaining)
    }
}

/// Reject malformed input before any blob is written.
fn validate_entries(entries: &[FileEntry]) -> StowResult<()> {
    let mut seen = BTreeSet::new();
    for entry in entries {
        if !seen.insert(&entry.path) {
            return Err(StowError::conflict(format!(
                "duplicate relative path in fileset: {}",
                entry.path
            )));
        }
    }
    Ok(())
}
