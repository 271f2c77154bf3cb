use std::path::Path;
use std::sync::Arc;

use spacesync_core::{
    ids::{CardId, UserId},
    model::{Card, User},
    ManualClock, SyncConfig,
};
use spacesync_engine::{EngineError, Session};
use spacesync_storage::SqliteStorage;

use crate::FakeRemote;

/// One collaborator: a session on a virtual clock talking to a fake remote.
pub struct TestPeer {
    pub session: Session,
    pub clock: ManualClock,
    pub remote: FakeRemote,
}

impl TestPeer {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_remote(FakeRemote::new(), ManualClock::new(1_000_000))
    }

    pub fn with_remote(remote: FakeRemote, clock: ManualClock) -> Result<Self, EngineError> {
        let storage = SqliteStorage::open_in_memory()?;
        Self::with_storage(storage, remote, clock, SyncConfig::default())
    }

    /// A peer whose cache and queue live in the database at `path`.
    pub fn open(path: &Path, remote: FakeRemote, clock: ManualClock) -> Result<Self, EngineError> {
        let storage = SqliteStorage::open(&path.to_string_lossy())?;
        Self::with_storage(storage, remote, clock, SyncConfig::default())
    }

    pub fn with_storage(
        storage: SqliteStorage,
        remote: FakeRemote,
        clock: ManualClock,
        config: SyncConfig,
    ) -> Result<Self, EngineError> {
        remote.set_latency(0, config.queue.remote_timeout_ms);
        let user = User {
            id: UserId::new(),
            name: "tester".into(),
            color: "#c0ffee".into(),
        };
        let session = Session::new(
            config,
            storage,
            Box::new(remote.clone()),
            Arc::new(clock.clone()),
            user,
        )?;
        Ok(Self {
            session,
            clock,
            remote,
        })
    }

    /// Advances this peer's clock and runs its timers.
    pub fn advance(&mut self, ms: i64) {
        self.clock.advance(ms);
        self.session.tick();
    }

    pub fn card(&self, id: CardId) -> Option<&Card> {
        self.session.store().card(id)
    }

    pub fn queued_names(&self) -> Vec<&'static str> {
        self.session.queue().pending().map(|op| op.name()).collect()
    }
}
