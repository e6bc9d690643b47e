//! Metadata catalog: blob, fileset and row-binding tables with reference counts.
//!
//! The catalog is the only place reference counts live. Every public method
//! is a single atomic step under one mutex, so a count is never read and
//! written back with a gap another caller could observe, and cleanup
//! re-validates `ref_count == 0` in the same step that removes a record.
//!
//! Tables are keyed by digest / row key (arena style, no pointer graph):
//!   - blobs:    digest → BlobRecord    (ref_count = filesets containing it)
//!   - filesets: digest → FilesetRecord (ref_count = rows bound to it)
//!   - rows:     row key → RowBinding
//!
//! The tables are held in memory and optionally persisted as JSON, flushed
//! atomically via temp+rename.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use stow_core::{Digest, Missing, RelPath, RowKey, StowError, StowResult};

/// A stored blob, shared by every fileset that contains its content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub digest: Digest,
    pub size: u64,
    /// Backend object key
    pub key: String,
    pub ref_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetMember {
    pub path: RelPath,
    pub blob: Digest,
    pub size: u64,
}

/// A deduplicated group of (relative path → blob) pairs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetRecord {
    pub digest: Digest,
    /// Sorted by path
    pub members: Vec<FilesetMember>,
    pub ref_count: u64,
}

impl FilesetRecord {
    /// Each blob once, however many paths carry it.
    pub fn distinct_blobs(&self) -> BTreeSet<Digest> {
        self.members.iter().map(|m| m.blob).collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.members.iter().map(|m| m.size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBinding {
    pub row: RowKey,
    pub fileset: Digest,
}

/// Whether an upsert created the fileset or found it already present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesetUpsert {
    Created,
    Reused,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub blobs: usize,
    pub unreferenced_blobs: usize,
    pub stored_bytes: u64,
    pub filesets: usize,
    pub orphaned_filesets: usize,
    pub rows: usize,
}

/// Result of checking both reference-count invariants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub problems: Vec<String>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    blobs: BTreeMap<Digest, BlobRecord>,
    #[serde(default)]
    filesets: BTreeMap<Digest, FilesetRecord>,
    #[serde(default)]
    rows: BTreeMap<RowKey, RowBinding>,
}

struct Inner {
    tables: Tables,
    /// JSON file the tables persist to; `None` for a memory-only catalog
    db_path: Option<PathBuf>,
    dirty: bool,
}

pub struct Catalog {
    inner: Mutex<Inner>,
}

impl Catalog {
    /// A catalog that lives only as long as the process.
    pub fn in_memory() -> Self {
        Catalog {
            inner: Mutex::new(Inner {
                tables: Tables::default(),
                db_path: None,
                dirty: false,
            }),
        }
    }

    /// Load or create a catalog persisted at `db_path`.
    pub fn open(db_path: &Path) -> StowResult<Self> {
        let tables = if db_path.exists() {
            let content = std::fs::read_to_string(db_path)?;
            serde_json::from_str(&content).map_err(|e| {
                StowError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("parsing catalog {}: {e}", db_path.display()),
                ))
            })?
        } else {
            Tables::default()
        };

        Ok(Catalog {
            inner: Mutex::new(Inner {
                tables,
                db_path: Some(db_path.to_path_buf()),
                dirty: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic under the lock is an invariant violation that already
        // surfaced; the tables themselves are still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write dirty tables to disk (write then rename). No-op when memory-only.
    pub fn flush(&self) -> StowResult<()> {
        let mut inner = self.lock();
        flush_locked(&mut inner)
    }

    // ── blobs ────────────────────────────────────────────────────────────

    /// Insert a blob record with count 0, or leave an existing one untouched.
    ///
    /// Returns true when the record was created.
    pub fn upsert_blob(&self, digest: Digest, size: u64, key: String) -> bool {
        let mut inner = self.lock();
        if inner.tables.blobs.contains_key(&digest) {
            return false;
        }
        inner.tables.blobs.insert(
            digest,
            BlobRecord {
                digest,
                size,
                key,
                ref_count: 0,
            },
        );
        inner.dirty = true;
        true
    }

    pub fn blob(&self, digest: &Digest) -> Option<BlobRecord> {
        self.lock().tables.blobs.get(digest).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.lock().tables.blobs.len()
    }

    pub fn blobs(&self) -> Vec<BlobRecord> {
        self.lock().tables.blobs.values().cloned().collect()
    }

    /// Lower a blob's count by one. Panics on underflow.
    pub fn decrement_blob(&self, digest: &Digest) -> StowResult<u64> {
        let mut inner = self.lock();
        let Some(record) = inner.tables.blobs.get_mut(digest) else {
            return Err(StowError::NotFound(Missing::Blob(*digest)));
        };
        let remaining = decrement(&mut record.ref_count, "blob", digest);
        inner.dirty = true;
        Ok(remaining)
    }

    pub fn unreferenced_blobs(&self) -> Vec<Digest> {
        self.lock()
            .tables
            .blobs
            .values()
            .filter(|b| b.ref_count == 0)
            .map(|b| b.digest)
            .collect()
    }

    /// Remove a blob record only if its count is still zero right now.
    pub fn remove_blob_if_unreferenced(&self, digest: &Digest) -> Option<BlobRecord> {
        let mut inner = self.lock();
        match inner.tables.blobs.get(digest) {
            Some(record) if record.ref_count == 0 => {}
            _ => return None,
        }
        inner.dirty = true;
        inner.tables.blobs.remove(digest)
    }

    /// Put back a record whose physical deletion failed, unless one was re-created meanwhile.
    pub fn reinstate_blob(&self, record: BlobRecord) {
        let mut inner = self.lock();
        if !inner.tables.blobs.contains_key(&record.digest) {
            inner.tables.blobs.insert(record.digest, record);
            inner.dirty = true;
        }
    }

    // ── filesets ─────────────────────────────────────────────────────────

    pub fn fileset(&self, digest: &Digest) -> Option<FilesetRecord> {
        self.lock().tables.filesets.get(digest).cloned()
    }

    pub fn fileset_count(&self) -> usize {
        self.lock().tables.filesets.len()
    }

    /// Reuse the fileset if present, else create it with count 0 and bump
    /// each distinct member blob once.
    ///
    /// Fails with `NotFound(Blob)` when a member blob record is gone (a
    /// concurrent collect removed it); nothing is modified in that case.
    pub fn upsert_fileset(
        &self,
        digest: Digest,
        members: &[FilesetMember],
    ) -> StowResult<FilesetUpsert> {
        let mut inner = self.lock();
        let outcome = upsert_fileset_locked(&mut inner.tables, digest, members)?;
        inner.dirty |= outcome == FilesetUpsert::Created;
        Ok(outcome)
    }

    /// Lower a fileset's count by one (a referencing row went away).
    pub fn release_fileset(&self, digest: &Digest) -> StowResult<u64> {
        let mut inner = self.lock();
        let Some(record) = inner.tables.filesets.get_mut(digest) else {
            return Err(StowError::NotFound(Missing::Fileset(*digest)));
        };
        let remaining = decrement(&mut record.ref_count, "fileset", digest);
        inner.dirty = true;
        Ok(remaining)
    }

    /// Remove every fileset at count zero and decrement its member blobs.
    pub fn collect_filesets(&self) -> Vec<FilesetRecord> {
        let mut inner = self.lock();
        let orphaned: Vec<Digest> = inner
            .tables
            .filesets
            .values()
            .filter(|f| f.ref_count == 0)
            .map(|f| f.digest)
            .collect();

        let mut removed = Vec::with_capacity(orphaned.len());
        for digest in orphaned {
            let Some(record) = inner.tables.filesets.remove(&digest) else {
                continue;
            };
            for blob in record.distinct_blobs() {
                match inner.tables.blobs.get_mut(&blob) {
                    Some(b) => {
                        decrement(&mut b.ref_count, "blob", &blob);
                    }
                    None => panic!(
                        "fileset {digest} references blob {blob} that has no catalog record"
                    ),
                }
            }
            removed.push(record);
        }
        if !removed.is_empty() {
            inner.dirty = true;
        }
        removed
    }

    // ── rows ─────────────────────────────────────────────────────────────

    pub fn row(&self, row: &RowKey) -> Option<RowBinding> {
        self.lock().tables.rows.get(row).cloned()
    }

    /// Upsert the fileset and bind `row` to it, as one step.
    ///
    /// Rejects an already-bound row with `Conflict` before touching anything.
    pub fn bind_row(
        &self,
        row: &RowKey,
        digest: Digest,
        members: &[FilesetMember],
    ) -> StowResult<FilesetUpsert> {
        let mut inner = self.lock();
        ensure_unbound(&inner.tables, row)?;
        let outcome = upsert_fileset_locked(&mut inner.tables, digest, members)?;
        bind_locked(&mut inner.tables, row, digest);
        inner.dirty = true;
        Ok(outcome)
    }

    /// Bind `row` to a fileset that already exists. Returns the new count.
    pub fn attach_row(&self, row: &RowKey, digest: &Digest) -> StowResult<u64> {
        let mut inner = self.lock();
        ensure_unbound(&inner.tables, row)?;
        if !inner.tables.filesets.contains_key(digest) {
            return Err(StowError::NotFound(Missing::Fileset(*digest)));
        }
        let count = bind_locked(&mut inner.tables, row, *digest);
        inner.dirty = true;
        Ok(count)
    }

    /// Drop the row's binding and release its fileset.
    ///
    /// Returns the fileset digest and its remaining count.
    pub fn detach_row(&self, row: &RowKey) -> StowResult<(Digest, u64)> {
        let mut inner = self.lock();
        let Some(binding) = inner.tables.rows.remove(row) else {
            return Err(StowError::NotFound(Missing::Row(row.clone())));
        };
        let digest = binding.fileset;
        let Some(record) = inner.tables.filesets.get_mut(&digest) else {
            panic!("row {row} was bound to fileset {digest} that has no catalog record");
        };
        let remaining = decrement(&mut record.ref_count, "fileset", &digest);
        inner.dirty = true;
        Ok((digest, remaining))
    }

    pub fn rows_referencing(&self, digest: &Digest) -> Vec<RowKey> {
        self.lock()
            .tables
            .rows
            .values()
            .filter(|b| b.fileset == *digest)
            .map(|b| b.row.clone())
            .collect()
    }

    // ── reporting ────────────────────────────────────────────────────────

    pub fn stats(&self) -> CatalogStats {
        let inner = self.lock();
        let t = &inner.tables;
        CatalogStats {
            blobs: t.blobs.len(),
            unreferenced_blobs: t.blobs.values().filter(|b| b.ref_count == 0).count(),
            stored_bytes: t.blobs.values().map(|b| b.size).sum(),
            filesets: t.filesets.len(),
            orphaned_filesets: t.filesets.values().filter(|f| f.ref_count == 0).count(),
            rows: t.rows.len(),
        }
    }

    /// Recount references from scratch and compare with the stored counts.
    pub fn audit(&self) -> AuditReport {
        let inner = self.lock();
        let t = &inner.tables;
        let mut problems = Vec::new();

        let mut row_refs: BTreeMap<Digest, u64> = BTreeMap::new();
        for binding in t.rows.values() {
            if !t.filesets.contains_key(&binding.fileset) {
                problems.push(format!(
                    "row {} is bound to missing fileset {}",
                    binding.row, binding.fileset
                ));
            }
            *row_refs.entry(binding.fileset).or_default() += 1;
        }

        let mut blob_refs: BTreeMap<Digest, u64> = BTreeMap::new();
        for fileset in t.filesets.values() {
            let bound = row_refs.get(&fileset.digest).copied().unwrap_or(0);
            if bound != fileset.ref_count {
                problems.push(format!(
                    "fileset {} has count {} but {} bound rows",
                    fileset.digest, fileset.ref_count, bound
                ));
            }
            for blob in fileset.distinct_blobs() {
                if !t.blobs.contains_key(&blob) {
                    problems.push(format!(
                        "fileset {} references missing blob {blob}",
                        fileset.digest
                    ));
                }
                *blob_refs.entry(blob).or_default() += 1;
            }
        }

        for blob in t.blobs.values() {
            let holders = blob_refs.get(&blob.digest).copied().unwrap_or(0);
            if holders != blob.ref_count {
                problems.push(format!(
                    "blob {} has count {} but {} filesets contain it",
                    blob.digest, blob.ref_count, holders
                ));
            }
        }

        AuditReport { problems }
    }
}

impl Drop for Catalog {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.dirty {
            if let Err(e) = flush_locked(inner) {
                tracing::warn!("failed to flush catalog on drop: {e}");
            }
        }
    }
}

fn flush_locked(inner: &mut Inner) -> StowResult<()> {
    let Some(db_path) = inner.db_path.clone() else {
        inner.dirty = false;
        return Ok(());
    };
    if !inner.dirty {
        return Ok(());
    }

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(&inner.tables).map_err(|e| {
        StowError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("serializing catalog: {e}"),
        ))
    })?;

    let tmp_path = db_path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &db_path)?;

    inner.dirty = false;
    Ok(())
}

/// Decrement a count; reaching below zero means a release without a prior
/// increment, which is a bug in the caller, not a recoverable condition.
fn decrement(count: &mut u64, what: &str, digest: &Digest) -> u64 {
    match count.checked_sub(1) {
        Some(n) => {
            *count = n;
            n
        }
        None => panic!("reference count underflow on {what} {digest}"),
    }
}

fn ensure_unbound(tables: &Tables, row: &RowKey) -> StowResult<()> {
    match tables.rows.get(row) {
        Some(existing) => Err(StowError::conflict(format!(
            "row {row} is already bound to fileset {}",
            existing.fileset
        ))),
        None => Ok(()),
    }
}

fn upsert_fileset_locked(
    tables: &mut Tables,
    digest: Digest,
    members: &[FilesetMember],
) -> StowResult<FilesetUpsert> {
    if tables.filesets.contains_key(&digest) {
        return Ok(FilesetUpsert::Reused);
    }

    let mut sorted = members.to_vec();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    let record = FilesetRecord {
        digest,
        members: sorted,
        ref_count: 0,
    };

    let distinct = record.distinct_blobs();
    if let Some(missing) = distinct.iter().find(|b| !tables.blobs.contains_key(b)) {
        return Err(StowError::NotFound(Missing::Blob(*missing)));
    }
    for blob in &distinct {
        if let Some(b) = tables.blobs.get_mut(blob) {
            b.ref_count += 1;
        }
    }

    tables.filesets.insert(digest, record);
    Ok(FilesetUpsert::Created)
}

/// Caller has checked the row is unbound and the fileset exists.
fn bind_locked(tables: &mut Tables, row: &RowKey, digest: Digest) -> u64 {
    tables.rows.insert(
        row.clone(),
        RowBinding {
            row: row.clone(),
            fileset: digest,
        },
    );
    match tables.filesets.get_mut(&digest) {
        Some(f) => {
            f.ref_count += 1;
            f.ref_count
        }
        None => panic!("binding row {row} to fileset {digest} that has no catalog record"),
    }
}
