//! Reference Tracker: row → fileset bindings and two-phase cleanup
//!
//! Fileset lifecycle:
//!
//! ```text
//! ACTIVE (count > 0) --last release--> ORPHANED (count == 0) --collect_filesets--> REMOVED
//! ```
//!
//! Releasing is synchronous; removal only happens in an explicit
//! `collect_filesets` pass, which also decrements every member blob. Blob
//! storage is reclaimed later still, by `BlobStore::collect`.

use std::sync::Arc;
use stow_core::{Digest, Missing, RowKey, StowError, StowResult};
use tracing::{debug, info};

use crate::catalog::{AuditReport, Catalog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesetState {
    Active(u64),
    Orphaned,
    Removed,
}

#[derive(Clone)]
pub struct ReferenceTracker {
    catalog: Arc<Catalog>,
}

impl ReferenceTracker {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        ReferenceTracker { catalog }
    }

    /// Bind a row to an existing fileset. Returns the fileset's new count.
    pub fn attach(&self, row: &RowKey, fileset: &Digest) -> StowResult<u64> {
        let count = self.catalog.attach_row(row, fileset)?;
        debug!(row = %row, fileset = %fileset, count, "attached row");
        Ok(count)
    }

    /// Row delete cascade: drop the binding and release the fileset.
    pub fn detach(&self, row: &RowKey) -> StowResult<Digest> {
        let (fileset, remaining) = self.catalog.detach_row(row)?;
        if remaining == 0 {
            info!(row = %row, fileset = %fileset, "fileset orphaned");
        } else {
            debug!(row = %row, fileset = %fileset, remaining, "detached row");
        }
        Ok(fileset)
    }

    pub fn fileset_for(&self, row: &RowKey) -> StowResult<Digest> {
        self.catalog
            .row(row)
            .map(|b| b.fileset)
            .ok_or_else(|| StowError::NotFound(Missing::Row(row.clone())))
    }

    pub fn state(&self, fileset: &Digest) -> FilesetState {
        match self.catalog.fileset(fileset) {
            Some(f) if f.ref_count > 0 => FilesetState::Active(f.ref_count),
            Some(_) => FilesetState::Orphaned,
            None => FilesetState::Removed,
        }
    }

    /// Remove every orphaned fileset, decrementing its member blobs.
    /// Returns how many filesets were removed.
    pub fn collect_filesets(&self) -> usize {
        let removed = self.catalog.collect_filesets();
        for record in &removed {
            debug!(
                fileset = %record.digest,
                files = record.members.len(),
                bytes = record.total_bytes(),
                "removed fileset"
            );
        }
        info!(removed = removed.len(), "collected filesets");
        removed.len()
    }

    /// Row keys currently bound to `fileset`.
    pub fn rows_referencing(&self, fileset: &Digest) -> Vec<RowKey> {
        self.catalog.rows_referencing(fileset)
    }

    pub fn audit(&self) -> AuditReport {
        self.catalog.audit()
    }
}
