pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{ErrorKind, Missing, StowError, StowResult};
pub use types::{Digest, RelPath, RowKey};
