//! The capability every object backend provides to the blob store

use async_trait::async_trait;
use stow_core::StowResult;

/// Key → bytes object storage.
///
/// Keys are `/`-separated and produced by [`crate::ObjectLayout`]. All
/// implementations must agree on these semantics:
/// - `write` is idempotent: writing the same bytes to the same key twice is
///   harmless, and concurrent writers of identical content do not diverge.
/// - `read` of an absent key fails with `NotFound(Missing::Object)`.
/// - `delete` of an absent key succeeds.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Short name used in logs ("local", "s3", "memory").
    fn name(&self) -> &str;

    async fn write(&self, key: &str, data: Vec<u8>) -> StowResult<()>;

    async fn read(&self, key: &str) -> StowResult<Vec<u8>>;

    async fn exists(&self, key: &str) -> StowResult<bool>;

    async fn delete(&self, key: &str) -> StowResult<()>;

    /// Verify the backend is reachable and writable.
    async fn check(&self) -> StowResult<()>;
}
