//! OpenDAL Operator and backend factories for stow stores

use opendal::Operator;
use std::sync::Arc;
use std::time::Duration;
use stow_core::config::{Protocol, S3Config, StoreConfig};
use stow_core::{StowError, StowResult};

use crate::backend::ObjectBackend;
use crate::local::LocalBackend;
use crate::remote::RemoteBackend;

/// Build an OpenDAL Operator for an S3-compatible endpoint.
///
/// Uses path-style addressing (the opendal default), which MinIO and
/// SeaweedFS require. Each call is bounded by `timeout` and retried with
/// jitter by the retry layer; the blob store itself never retries.
pub fn build_s3_operator(cfg: &S3Config, timeout: Duration) -> StowResult<Operator> {
    if cfg.endpoint.starts_with("http://") {
        if cfg.enforce_tls {
            return Err(StowError::Config(format!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set store.s3.enforce_tls = false for local development.",
                cfg.endpoint
            )));
        }
        tracing::warn!(
            endpoint = %cfg.endpoint,
            "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
        );
    }

    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);

    let op = Operator::new(builder)
        .map_err(|e| StowError::Config(format!("creating OpenDAL S3 operator: {e}")))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(opendal::layers::TimeoutLayer::new().with_timeout(timeout))
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// In-process memory operator (tests and ephemeral stores)
pub fn build_memory_operator() -> StowResult<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .map_err(|e| StowError::Config(format!("creating memory operator: {e}")))?
        .finish())
}

/// Build the backend a store configuration asks for.
pub fn build_backend(store: &StoreConfig) -> StowResult<Arc<dyn ObjectBackend>> {
    let backend: Arc<dyn ObjectBackend> = match store.protocol {
        Protocol::File => Arc::new(LocalBackend::new(&store.location)),
        Protocol::S3 => {
            let timeout = Duration::from_secs(store.op_timeout_secs.max(1));
            Arc::new(RemoteBackend::new(build_s3_operator(&store.s3, timeout)?, "s3"))
        }
        Protocol::Memory => Arc::new(RemoteBackend::new(build_memory_operator()?, "memory")),
    };
    tracing::debug!(store = %store.name, backend = backend.name(), "built object backend");
    Ok(backend)
}
