use spacesync_core::CoreError;
use spacesync_storage::StorageError;
use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("network error: {0}")]
    Network(#[from] RemoteError),

    /// Rejected input. Logged and skipped; nothing was mutated.
    #[error("validation error: {0}")]
    Validation(String),

    /// The mutation targets an entity that does not exist.
    #[error("state invariant violated: {0}")]
    StateInvariant(String),

    #[error("not found: {0}")]
    NotFound(String),
}
