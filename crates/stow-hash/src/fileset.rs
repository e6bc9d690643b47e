//! Fileset digests: one identity for a whole group of (relative path, blob) pairs
//!
//! Pairs are sorted by relative path before hashing, so the digest does not
//! depend on the order files were listed or discovered in. Each path is
//! length-prefixed so that no two distinct sequences produce the same byte
//! stream, and the hasher is keyed with a derivation context so a fileset
//! digest never collides with a blob digest of the same bytes.

use stow_core::{Digest, RelPath};

const FILESET_CONTEXT: &str = "stow 2026-01 fileset digest v1";

/// Digest of a fileset. Input order is irrelevant; duplicates must already be rejected.
pub fn fileset_digest<'a, I>(members: I) -> Digest
where
    I: IntoIterator<Item = (&'a RelPath, &'a Digest)>,
{
    let mut pairs: Vec<(&RelPath, &Digest)> = members.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = blake3::Hasher::new_derive_key(FILESET_CONTEXT);
    hasher.update(&(pairs.len() as u64).to_le_bytes());
    for (path, blob) in pairs {
        let bytes = path.as_str().as_bytes();
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
        hasher.update(blob.as_bytes());
    }
    Digest::from(hasher.finalize())
}
