use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{StowError, StowResult};

/// Top-level configuration (loaded from stow.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StowConfig {
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub ingest: IngestConfig,
    pub restore: RestoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive (default: info). RUST_LOG takes precedence.
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Which backend holds the blob objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Local directory tree rooted at `location`
    File,
    /// S3-compatible object storage; `location` is the key prefix
    S3,
    /// In-process OpenDAL memory service (tests, ephemeral stores)
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store name, used in logs
    pub name: String,
    pub protocol: Protocol,
    /// Root that fileset relative paths are computed against and restored to
    pub stage: PathBuf,
    /// Backend root directory (file) or key prefix (s3, memory)
    pub location: String,
    /// Lengths of the leading hex slices used as directory levels
    pub subfolding: Vec<usize>,
    /// JSON catalog file; the catalog is memory-only when unset
    pub catalog: Option<PathBuf>,
    /// Per-call timeout for remote backend operations
    pub op_timeout_secs: u64,
    pub s3: S3Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Glob patterns matched against file names; matches are skipped
    pub exclude_patterns: Vec<String>,
    /// How often resolve re-puts blobs that a concurrent collect removed
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Maximum in-flight blob fetches during materialize
    pub concurrency: usize,
    /// Hash files already present at the destination before trusting them
    pub verify_existing: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "repo".into(),
            protocol: Protocol::File,
            stage: PathBuf::from("./stage"),
            location: "./store".into(),
            subfolding: vec![2, 2],
            catalog: None,
            op_timeout_secs: 60,
            s3: S3Config::default(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "stow".into(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            enforce_tls: false,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            verify_existing: true,
        }
    }
}

impl StowConfig {
    /// Load from a TOML file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> StowResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)
            .map_err(|e| StowError::Config(format!("parsing {}: {e}", path.display())))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> StowResult<Self> {
        let config: StowConfig =
            toml::from_str(content).map_err(|e| StowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StowResult<()> {
        if self.store.stage.as_os_str().is_empty() {
            return Err(StowError::Config("store.stage must be set".into()));
        }
        if self.store.subfolding.iter().any(|&n| n == 0) {
            return Err(StowError::Config("store.subfolding entries must be > 0".into()));
        }
        if self.store.subfolding.iter().sum::<usize>() >= 64 {
            return Err(StowError::Config(
                "store.subfolding consumes the whole digest".into(),
            ));
        }
        if self.restore.concurrency == 0 {
            return Err(StowError::Config("restore.concurrency must be > 0".into()));
        }
        Ok(())
    }
}
