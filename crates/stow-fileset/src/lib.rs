//! stow-fileset: deduplicating attachment store for external tables
//!
//! A row of some external table owns a *fileset*: a group of files kept
//! relative to the store's stage root. Identical file contents are stored
//! once as blobs, identical filesets once as fileset records, and both are
//! reference counted so cleanup can reclaim storage in two explicit passes
//! (`collect_filesets`, then `collect_blobs`).
//!
//! ```text
//! insert_fileset ─► FileSource ─► FilesetIndex ─► BlobStore ─► ObjectBackend
//!                                      │              │
//!                                      └── Catalog ◄──┘
//! fetch_files ─► ReferenceTracker ─► RestoreEngine ─► destination root
//! ```

pub mod blob_store;
pub mod catalog;
pub mod index;
pub mod restore;
pub mod source;
pub mod store;
pub mod tracker;

pub use blob_store::{BlobStore, PutOutcome};
pub use catalog::{AuditReport, BlobRecord, Catalog, CatalogStats, FilesetMember, FilesetRecord};
pub use index::{FileEntry, FilesetIndex};
pub use restore::{MaterializeReport, RestoreEngine};
pub use source::FileSource;
pub use store::{AttachmentStore, StoreStats};
pub use tracker::{FilesetState, ReferenceTracker};
