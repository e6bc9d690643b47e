//! BLAKE3 content hashing for blobs held in memory or on disk
//!
//! The digest is the blob's identity in the store: identical bytes always map
//! to the same digest, whatever the file is called or where it lives.

use rayon::prelude::*;
use std::io::Read;
use std::path::Path;
use stow_core::{Digest, StowError, StowResult};

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> Digest {
    Digest::from(blake3::hash(data))
}

/// Hash many independent blobs in parallel (one rayon task per blob).
///
/// Output order matches input order.
pub fn hash_many<B: AsRef<[u8]> + Sync>(blobs: &[B]) -> Vec<Digest> {
    blobs.par_iter().map(|b| hash_bytes(b.as_ref())).collect()
}

/// Hash a file from disk by reading it fully.
pub fn hash_file(path: &Path) -> StowResult<Digest> {
    let data = std::fs::read(path).map_err(|e| io_context(e, "reading file for hashing", path))?;
    Ok(hash_bytes(&data))
}

/// Hash a file using the streaming interface (for files too large to read fully)
pub fn hash_file_streaming(path: &Path) -> StowResult<Digest> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| io_context(e, "opening file for streaming hash", path))?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| io_context(e, "reading for hash", path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(Digest::from(hasher.finalize()))
}

fn io_context(e: std::io::Error, what: &str, path: &Path) -> StowError {
    StowError::Io(std::io::Error::new(
        e.kind(),
        format!("{what}: {}: {e}", path.display()),
    ))
}
