use spacesync_core::{ids::SpaceId, model::Space, operations::OperationBatch};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote is unreachable")]
    Offline,

    #[error("remote request timed out")]
    Timeout,

    #[error("remote responded with status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status(404))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status(401))
    }
}

/// The remote source of truth. Implementations are expected to give up
/// after the configured remote timeout and report `RemoteError::Timeout`.
pub trait RemoteApi {
    /// `GET /space/{id}`
    fn fetch_space(&mut self, space_id: SpaceId) -> Result<Space, RemoteError>;

    /// `POST /operations` with the batch's ordered `{name, body}` list.
    fn send_operations(&mut self, batch: &OperationBatch) -> Result<(), RemoteError>;

    /// `POST /space/multiple`
    fn create_spaces(&mut self, spaces: &[Space]) -> Result<(), RemoteError>;
}
