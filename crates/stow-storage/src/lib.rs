//! stow-storage: object backends for the blob store
//!
//! One capability trait ([`ObjectBackend`]) with two implementations: a local
//! directory tree and an OpenDAL operator (S3-compatible or in-memory). Both
//! share the digest-derived key scheme in [`ObjectLayout`].

pub mod backend;
pub mod health;
pub mod layout;
pub mod local;
pub mod operator;
pub mod remote;

pub use backend::ObjectBackend;
pub use health::{check_health, is_healthy};
pub use layout::ObjectLayout;
pub use local::LocalBackend;
pub use operator::{build_backend, build_memory_operator, build_s3_operator};
pub use remote::RemoteBackend;
