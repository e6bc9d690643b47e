//! stow-hash: content identity for blobs and filesets
//!
//! - `blake3`: deterministic blob digests (single, streaming, parallel)
//! - `fileset`: order-independent digest over (relative path, blob digest) pairs

pub mod blake3;
pub mod fileset;

pub use self::blake3::{hash_bytes, hash_file, hash_file_streaming, hash_many};
pub use self::fileset::fileset_digest;
pub use stow_core::Digest;
