use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use spacesync_core::{
    ids::SpaceId,
    model::Space,
    operations::{Operation, OperationBatch},
};
use spacesync_engine::{RemoteApi, RemoteError};
use tracing::debug;

#[derive(Default)]
struct RemoteState {
    online: bool,
    fail_with: Option<u16>,
    latency_ms: u64,
    timeout_ms: u64,
    spaces: HashMap<SpaceId, Space>,
    batches: Vec<OperationBatch>,
    created: Vec<Space>,
}

/// In-process stand-in for the HTTP remote. Clones share one server, so a
/// test can keep a handle while the session owns another.
#[derive(Clone)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState {
                online: true,
                timeout_ms: 5_000,
                ..RemoteState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        // a panicking test already failed; keep serving the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    /// Every request answers with `status` until cleared with `None`.
    pub fn fail_with(&self, status: Option<u16>) {
        self.state().fail_with = status;
    }

    /// Simulated response time. Requests slower than the timeout fail with
    /// `RemoteError::Timeout`.
    pub fn set_latency(&self, latency_ms: u64, timeout_ms: u64) {
        let mut state = self.state();
        state.latency_ms = latency_ms;
        state.timeout_ms = timeout_ms;
    }

    pub fn put_space(&self, space: Space) {
        self.state().spaces.insert(space.id, space);
    }

    pub fn batches(&self) -> Vec<OperationBatch> {
        self.state().batches.clone()
    }

    /// Operations received so far, in delivery order.
    pub fn operations(&self) -> Vec<Operation> {
        self.state()
            .batches
            .iter()
            .flat_map(|batch| batch.operations.iter().cloned())
            .collect()
    }

    pub fn operation_names(&self) -> Vec<&'static str> {
        self.operations().iter().map(Operation::name).collect()
    }

    pub fn created_spaces(&self) -> Vec<Space> {
        self.state().created.clone()
    }

    fn check(state: &RemoteState) -> Result<(), RemoteError> {
        if !state.online {
            return Err(RemoteError::Offline);
        }
        if state.latency_ms > state.timeout_ms {
            return Err(RemoteError::Timeout);
        }
        match state.fail_with {
            Some(status) => Err(RemoteError::Status(status)),
            None => Ok(()),
        }
    }
}

impl RemoteApi for FakeRemote {
    fn fetch_space(&mut self, space_id: SpaceId) -> Result<Space, RemoteError> {
        let state = self.state();
        Self::check(&state)?;
        state
            .spaces
            .get(&space_id)
            .cloned()
            .ok_or(RemoteError::Status(404))
    }

    fn send_operations(&mut self, batch: &OperationBatch) -> Result<(), RemoteError> {
        let mut state = self.state();
        Self::check(&state)?;
        debug!(operations = batch.len(), checksum = %batch.checksum_hex(), "remote received batch");
        state.batches.push(batch.clone());
        Ok(())
    }

    fn create_spaces(&mut self, spaces: &[Space]) -> Result<(), RemoteError> {
        let mut state = self.state();
        Self::check(&state)?;
        for space in spaces {
            state.spaces.insert(space.id, space.clone());
        }
        state.created.extend_from_slice(spaces);
        Ok(())
    }
}
