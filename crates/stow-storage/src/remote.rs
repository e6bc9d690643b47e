//! Remote backend over any OpenDAL operator (S3-compatible storage, memory)

use async_trait::async_trait;
use opendal::{ErrorKind, Operator};
use stow_core::{Missing, StowError, StowResult};
use tracing::debug;

use crate::backend::ObjectBackend;

#[derive(Clone)]
pub struct RemoteBackend {
    op: Operator,
    name: String,
}

impl RemoteBackend {
    pub fn new(op: Operator, name: impl Into<String>) -> Self {
        RemoteBackend {
            op,
            name: name.into(),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }
}

fn storage_error(action: &str, key: &str, e: opendal::Error) -> StowError {
    StowError::Storage(format!("{action} {key}: {e}"))
}

#[async_trait]
impl ObjectBackend for RemoteBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> StowResult<()> {
        let len = data.len();
        self.op
            .write(key, data)
            .await
            .map_err(|e| storage_error("writing", key, e))?;
        debug!(key, bytes = len, backend = %self.name, "remote: wrote object");
        Ok(())
    }

    async fn read(&self, key: &str) -> StowResult<Vec<u8>> {
        match self.op.read(key).await {
            Ok(buf) => Ok(buf.to_vec()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StowError::NotFound(Missing::Object { key: key.to_string() }))
            }
            Err(e) => Err(storage_error("reading", key, e)),
        }
    }

    async fn exists(&self, key: &str) -> StowResult<bool> {
        self.op
            .exists(key)
            .await
            .map_err(|e| storage_error("stat", key, e))
    }

    async fn delete(&self, key: &str) -> StowResult<()> {
        self.op
            .delete(key)
            .await
            .map_err(|e| storage_error("deleting", key, e))?;
        debug!(key, backend = %self.name, "remote: deleted object");
        Ok(())
    }

    async fn check(&self) -> StowResult<()> {
        // Listing the root is the lightest reachability check
        self.op
            .list("/")
            .await
            .map(|_| ())
            .map_err(|e| StowError::Storage(format!("storage health check failed: {e}")))
    }
}
