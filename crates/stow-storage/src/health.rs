//! Storage health check

use stow_core::StowResult;

use crate::backend::ObjectBackend;

/// Verify the backend is reachable
pub async fn check_health(backend: &dyn ObjectBackend) -> StowResult<()> {
    backend.check().await.map_err(|e| {
        tracing::warn!(backend = backend.name(), "storage health check failed: {e}");
        e
    })
}

/// Returns true if storage is reachable, false otherwise (non-panicking)
pub async fn is_healthy(backend: &dyn ObjectBackend) -> bool {
    check_health(backend).await.is_ok()
}
