//! Digest → object key addressing shared by all backends
//!
//! Key format: `{prefix}/{hex[0..a]}/{hex[a..a+b]}/.../{hex}` where `a, b, ...`
//! are the subfolding levels. With the default `[2, 2]`, digest `abcd12...`
//! lands at `{prefix}/ab/cd/abcd12...`.

use stow_core::config::{Protocol, StoreConfig};
use stow_core::Digest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLayout {
    prefix: String,
    subfolding: Vec<usize>,
}

impl ObjectLayout {
    pub fn new(prefix: &str, subfolding: Vec<usize>) -> Self {
        ObjectLayout {
            prefix: prefix.trim_matches('/').to_string(),
            subfolding,
        }
    }

    /// Layout for a configured store.
    ///
    /// A `file` store's location is the backend root directory, so keys carry
    /// no prefix; for object storage the location is the key prefix.
    pub fn from_config(store: &StoreConfig) -> Self {
        match store.protocol {
            Protocol::File => ObjectLayout::new("", store.subfolding.clone()),
            Protocol::S3 | Protocol::Memory => {
                ObjectLayout::new(&store.location, store.subfolding.clone())
            }
        }
    }

    pub fn key_for(&self, digest: &Digest) -> String {
        let hex = digest.to_hex();
        let mut parts: Vec<&str> = Vec::with_capacity(self.subfolding.len() + 2);
        if !self.prefix.is_empty() {
            parts.push(&self.prefix);
        }
        let mut start = 0;
        for &len in &self.subfolding {
            let end = (start + len).min(hex.len());
            parts.push(&hex[start..end]);
            start = end;
        }
        parts.push(&hex);
        parts.join("/")
    }
}

impl Default for ObjectLayout {
    fn default() -> Self {
        ObjectLayout::new("", vec![2, 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> Digest {
        Digest::from_hex(&format!("abcd{}", "0".repeat(60))).unwrap()
    }

    #[test]
    fn default_layout_two_levels() {
        let key = ObjectLayout::default().key_for(&digest());
        assert_eq!(key, format!("ab/cd/abcd{}", "0".repeat(60)));
    }

    #[test]
    fn prefix_is_trimmed() {
        let layout = ObjectLayout::new("/stow/repo/", vec![2]);
        assert_eq!(
            layout.key_for(&digest()),
            format!("stow/repo/ab/abcd{}", "0".repeat(60))
        );
    }

    #[test]
    fn no_subfolding_is_flat() {
        let layout = ObjectLayout::new("blobs", vec![]);
        assert_eq!(layout.key_for(&digest()), format!("blobs/{}", digest()));
    }

    #[test]
    fn file_protocol_ignores_location_prefix() {
        let store = StoreConfig {
            location: "/data/store".into(),
            ..Default::default()
        };
        assert_eq!(ObjectLayout::from_config(&store), ObjectLayout::default());

        let s3 = StoreConfig {
            protocol: Protocol::S3,
            location: "attachments".into(),
            ..Default::default()
        };
        assert!(ObjectLayout::from_config(&s3)
            .key_for(&digest())
            .starts_with("attachments/ab/cd/"));
    }
}
