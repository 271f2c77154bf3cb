use spacesync_core::{
    ids::SpaceId,
    model::Space,
    operations::Operation,
    SpaceFieldValue,
};

use crate::error::StorageError;

/// A space snapshot as read back from the local cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSpace {
    pub space: Space,
    /// Unix milliseconds of the most recent write to any field of the snapshot.
    pub cached_at: i64,
}

/// An operation waiting in the durable queue, with its queue position.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
    pub seq: i64,
    pub operation: Operation,
}

/// Per-space snapshot persistence.
pub trait SpaceCache {
    /// Persists one top-level field of a space snapshot, creating the
    /// snapshot if needed, and moves its cache timestamp to `cached_at`.
    fn write_field(
        &mut self,
        space_id: SpaceId,
        value: &SpaceFieldValue,
        cached_at: i64,
    ) -> Result<(), StorageError>;

    fn save_space(&mut self, space: &Space, cached_at: i64) -> Result<(), StorageError>;

    /// Loads a snapshot. Soft-removed spaces read as absent.
    fn load_space(&self, space_id: SpaceId) -> Result<Option<CachedSpace>, StorageError>;

    fn remove_space(&mut self, space_id: SpaceId, removed_at: i64) -> Result<(), StorageError>;

    fn restore_space(&mut self, space_id: SpaceId) -> Result<(), StorageError>;

    fn remove_space_permanent(&mut self, space_id: SpaceId) -> Result<(), StorageError>;

    /// Every snapshot that is not soft-removed, oldest cache write first.
    fn all_spaces(&self) -> Result<Vec<CachedSpace>, StorageError>;
}

/// The durable outbound operation queue.
pub trait OperationStore {
    /// Appends an operation and returns its queue position.
    fn push_operation(&mut self, operation: &Operation) -> Result<i64, StorageError>;

    /// Pending operations in queue order.
    fn pending_operations(&self) -> Result<Vec<QueuedOperation>, StorageError>;

    /// Drops every operation at or before `seq`. Returns how many were removed.
    fn remove_operations_through(&mut self, seq: i64) -> Result<usize, StorageError>;

    fn pending_count(&self) -> Result<u64, StorageError>;
}
