use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Component, Path};

use crate::error::{StowError, StowResult};

/// A 32-byte BLAKE3 content digest, displayed as 64 lowercase hex chars
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }

    /// Parse a 64-char hex string
    pub fn from_hex(hex: &str) -> StowResult<Self> {
        blake3::Hash::from_hex(hex)
            .map(Digest::from)
            .map_err(|e| StowError::conflict(format!("invalid digest '{hex}': {e}")))
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Digest(*hash.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Digest::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Key of the row that owns a fileset in the external table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(String);

impl RowKey {
    pub fn new(key: impl Into<String>) -> Self {
        RowKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for RowKey {
    fn from(n: u64) -> Self {
        RowKey(n.to_string())
    }
}

impl From<&str> for RowKey {
    fn from(s: &str) -> Self {
        RowKey(s.to_string())
    }
}

impl From<&RowKey> for RowKey {
    fn from(key: &RowKey) -> Self {
        key.clone()
    }
}

impl From<String> for RowKey {
    fn from(s: String) -> Self {
        RowKey(s)
    }
}

/// A validated relative path with `/` separators.
///
/// Never empty, never absolute, and contains no `.` or `..` components, so
/// joining it onto a destination root cannot escape that root. Names are
/// UTF-8 without `\`, so every stored path restores to the same file name
/// on every platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelPath(String);

impl RelPath {
    pub fn new(path: &str) -> StowResult<Self> {
        if path.is_empty() {
            return Err(StowError::conflict("relative path is empty"));
        }
        if path.starts_with('/') {
            return Err(StowError::conflict(format!("path is absolute: {path}")));
        }
        if path.contains('\0') {
            return Err(StowError::conflict(format!("path contains NUL: {path:?}")));
        }
        if path.contains('\\') {
            return Err(StowError::conflict(format!("path contains a backslash: {path:?}")));
        }
        let mut parts = Vec::new();
        for part in path.split('/') {
            match part {
                "" => continue,
                "." | ".." => {
                    return Err(StowError::conflict(format!(
                        "path has a '{part}' component: {path}"
                    )))
                }
                p => parts.push(p),
            }
        }
        if parts.is_empty() {
            return Err(StowError::conflict(format!("path names no file: {path}")));
        }
        Ok(RelPath(parts.join("/")))
    }

    /// Derive the path of `path` relative to `root`.
    ///
    /// Relative inputs are taken as already relative to `root`.
    pub fn from_path(root: &Path, path: &Path) -> StowResult<Self> {
        let rel = match path.strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) if path.is_relative() => path,
            Err(_) => {
                return Err(StowError::conflict(format!(
                    "{} is outside the stage root {}",
                    path.display(),
                    root.display()
                )))
            }
        };
        let mut parts = Vec::new();
        for comp in rel.components() {
            match comp {
                Component::Normal(s) => match s.to_str() {
                    Some(name) => parts.push(name),
                    None => {
                        return Err(StowError::conflict(format!(
                            "file name is not valid UTF-8: {}",
                            rel.display()
                        )))
                    }
                },
                Component::CurDir => continue,
                _ => {
                    return Err(StowError::conflict(format!(
                        "unsupported path component in {}",
                        rel.display()
                    )))
                }
            }
        }
        RelPath::new(&parts.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Join onto a root using platform separators.
    pub fn to_path(&self, root: &Path) -> std::path::PathBuf {
        self.0.split('/').fold(root.to_path_buf(), |acc, p| acc.join(p))
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RelPath {
    type Error = StowError;

    fn try_from(s: String) -> StowResult<Self> {
        RelPath::new(&s)
    }
}

impl From<RelPath> for String {
    fn from(p: RelPath) -> Self {
        p.0
    }
}
