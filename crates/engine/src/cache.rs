use spacesync_core::{
    config::CacheConfig,
    ids::SpaceId,
    model::{Card, Space},
    Debouncer, SpaceFieldValue,
};
use spacesync_storage::SpaceCache;
use tracing::debug;

use crate::error::EngineError;

/// Front of the local cache. Card lists written during continuous gestures
/// are coalesced; every other field is written through immediately.
pub struct CacheWriter {
    cards: Debouncer<(SpaceId, Vec<Card>)>,
    writes: u64,
}

impl CacheWriter {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            cards: Debouncer::new(config.debounce_ms),
            writes: 0,
        }
    }

    /// Number of storage writes issued so far.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn write_field(
        &mut self,
        store: &mut impl SpaceCache,
        space_id: SpaceId,
        value: SpaceFieldValue,
        now: i64,
    ) -> Result<(), EngineError> {
        if matches!(value, SpaceFieldValue::Cards(_)) {
            // supersedes a pending debounced write
            self.write_other_space(store, space_id, now)?;
        }
        store.write_field(space_id, &value, now)?;
        self.writes += 1;
        Ok(())
    }

    /// Schedules a debounced write of the live card list. A pending write for
    /// another space is written out first.
    pub fn schedule_cards(
        &mut self,
        store: &mut impl SpaceCache,
        space_id: SpaceId,
        cards: Vec<Card>,
        now: i64,
    ) -> Result<(), EngineError> {
        self.write_other_space(store, space_id, now)?;
        self.cards.schedule(now, (space_id, cards));
        Ok(())
    }

    /// Writes the pending card list once its window has elapsed.
    pub fn tick(&mut self, store: &mut impl SpaceCache, now: i64) -> Result<bool, EngineError> {
        match self.cards.poll(now) {
            Some((space_id, cards)) => {
                self.write_cards(store, space_id, cards, now)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Writes the pending card list immediately.
    pub fn flush(&mut self, store: &mut impl SpaceCache, now: i64) -> Result<bool, EngineError> {
        match self.cards.flush() {
            Some((space_id, cards)) => {
                self.write_cards(store, space_id, cards, now)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn save_space(
        &mut self,
        store: &mut impl SpaceCache,
        space: &Space,
        now: i64,
    ) -> Result<(), EngineError> {
        self.write_other_space(store, space.id, now)?;
        store.save_space(space, now)?;
        self.writes += 1;
        Ok(())
    }

    /// Drops a pending card list for `space_id` (about to be superseded) and
    /// writes out one that belongs to any other space.
    fn write_other_space(
        &mut self,
        store: &mut impl SpaceCache,
        space_id: SpaceId,
        now: i64,
    ) -> Result<(), EngineError> {
        match self.cards.flush() {
            Some((pending_space, pending)) if pending_space != space_id => {
                self.write_cards(store, pending_space, pending, now)
            }
            _ => Ok(()),
        }
    }

    fn write_cards(
        &mut self,
        store: &mut impl SpaceCache,
        space_id: SpaceId,
        cards: Vec<Card>,
        now: i64,
    ) -> Result<(), EngineError> {
        debug!(space = %space_id, cards = cards.len(), "writing debounced cards");
        store.write_field(space_id, &SpaceFieldValue::Cards(cards), now)?;
        self.writes += 1;
        Ok(())
    }
}

/// Whether a freshly fetched remote snapshot replaces the cached one: only
/// when it is strictly newer. Without a cached snapshot the remote wins.
pub fn remote_supersedes(cached_at: Option<i64>, remote: &Space) -> bool {
    match (cached_at, remote.updated_at_ms()) {
        (None, _) => true,
        (Some(cached_at), Some(remote_at)) => remote_at > cached_at,
        (Some(_), None) => false,
    }
}
