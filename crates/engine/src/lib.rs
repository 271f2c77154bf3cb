pub mod cache;
pub mod card_map;
pub mod error;
pub mod history;
pub mod queue;
pub mod relay;
pub mod remote;
pub mod store;

pub use cache::{remote_supersedes, CacheWriter};
pub use card_map::{build_card_map, CardMap, CardMapBuilder, CardMapEntry};
pub use error::EngineError;
pub use history::{AddOptions, History, HistoryEntry};
pub use queue::OperationQueue;
pub use relay::{BroadcastRelay, Transport};
pub use remote::{RemoteApi, RemoteError};
pub use store::{EntityStore, Removal, RemovalKind};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use spacesync_core::{
    broadcast::{BroadcastMessage, BroadcastType, CardMoves, ConnectionPaths, Handler},
    geometry::{connection_path, Rect},
    ids::*,
    model::{round_coordinate, Card, CardPatch, CardPosition, Connection, ConnectionType, Space, User},
    operations::{OperationPayload, RemovedCardsScope, SpaceRef, SpaceUpdate},
    Clock, SpaceField, SpaceFieldValue, SyncConfig,
};
use spacesync_storage::{CachedSpace, SpaceCache, SqliteStorage};
use tracing::{debug, error, info, warn};

/// Where a mutation came from. Remote mutations are applied and persisted
/// but never queued, re-broadcast, or recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Pre-classified conditions surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    SpaceNotFound(SpaceId),
    Unauthorized,
}

/// Which snapshot a space load settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Cache,
    Remote,
    Empty,
}

/// Input for a new card. Unset fields take the usual defaults.
#[derive(Debug, Clone, Default)]
pub struct NewCard {
    pub id: Option<CardId>,
    pub x: f64,
    pub y: f64,
    pub name: String,
    pub background_color: Option<String>,
}

impl NewCard {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

struct DragState {
    before: Vec<Card>,
    positions: Vec<CardPosition>,
}

/// Per-session context: owns the entity store and every piece of machinery
/// that keeps it in sync with the cache, the remote and the other peers.
pub struct Session {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    user: User,
    storage: SqliteStorage,
    remote: Box<dyn RemoteApi>,
    store: EntityStore,
    cache: CacheWriter,
    queue: OperationQueue,
    relay: BroadcastRelay,
    card_map: CardMapBuilder,
    history: History,
    notifications: Vec<Notification>,
    viewport: Rect,
    zoom: f64,
    drag: Option<DragState>,
}

impl Session {
    pub fn new(
        config: SyncConfig,
        storage: SqliteStorage,
        remote: Box<dyn RemoteApi>,
        clock: Arc<dyn Clock>,
        user: User,
    ) -> Result<Self, EngineError> {
        let now = clock.now_ms();
        let queue = OperationQueue::open(&storage, &config.queue, now)?;
        let card_map = CardMapBuilder::new(&config.card_map)?;
        Ok(Self {
            store: EntityStore::new(config.cards.z_threshold()),
            cache: CacheWriter::new(&config.cache),
            history: History::new(config.history.max_depth),
            relay: BroadcastRelay::new(),
            notifications: Vec::new(),
            viewport: Rect::new(0.0, 0.0, 1280.0, 800.0),
            zoom: 1.0,
            drag: None,
            queue,
            card_map,
            config,
            clock,
            user,
            storage,
            remote,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn relay(&self) -> &BroadcastRelay {
        &self.relay
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn cache_writes(&self) -> u64 {
        self.cache.writes()
    }

    pub fn card_map(&self) -> &CardMap {
        self.card_map.current()
    }

    pub fn space_id(&self) -> Option<SpaceId> {
        let id = self.store.space_id();
        (!id.is_nil()).then_some(id)
    }

    pub fn set_transport(&mut self, transport: Option<Box<dyn Transport>>) {
        self.relay.set_transport(transport);
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Runs every timer that is due: debounced cache writes, card map
    /// requests and results, and queue flushes or retries.
    pub fn tick(&mut self) {
        let now = self.clock.now_ms();
        if let Err(err) = self.cache.tick(&mut self.storage, now) {
            error!(error = %err, "debounced cache write failed");
        }
        self.card_map.tick(now);
        let result = self.queue.tick(&mut self.storage, self.remote.as_mut(), now);
        self.note_remote_result(result.map(|_| ()));
    }

    /// Flushes the operation queue now. Returns the number of operations
    /// the remote accepted.
    pub fn flush_queue(&mut self) -> usize {
        let now = self.clock.now_ms();
        let result = self.queue.flush(&mut self.storage, self.remote.as_mut(), now);
        match result {
            Ok(sent) => sent,
            Err(err) => {
                self.note_remote_result(Err(err));
                0
            }
        }
    }

    /// Writes any debounced card list immediately.
    pub fn flush_cache(&mut self) {
        let now = self.clock.now_ms();
        if let Err(err) = self.cache.flush(&mut self.storage, now) {
            error!(error = %err, "cache flush failed");
        }
    }

    /// Going back online retries whatever is queued straight away.
    pub fn set_online(&mut self, online: bool) {
        info!(online, "connectivity changed");
        if self.queue.set_online(online) {
            self.flush_queue();
        }
    }

    pub fn set_viewport(&mut self, viewport: Rect, zoom: f64) {
        self.viewport = viewport;
        self.zoom = zoom;
        self.schedule_card_map();
    }

    /// Sends any pending card map request and blocks until its result is in.
    pub fn wait_for_card_map(&mut self, timeout: Duration) -> bool {
        self.card_map.flush();
        self.card_map.wait_for_latest(timeout)
    }

    // ========================================================================
    // Cards
    // ========================================================================

    pub fn add_card(&mut self, new_card: NewCard) -> Option<CardId> {
        let card = self.build_card(new_card)?;
        let id = card.id;
        if !self.insert_card(card.clone()) {
            return None;
        }
        self.history.add(HistoryEntry::Created { cards: vec![card] });
        Some(id)
    }

    /// Adds several cards as one gesture.
    pub fn add_cards(&mut self, cards: Vec<Card>) -> usize {
        let Some(space_id) = self.space_id() else {
            warn!("add_cards without a loaded space");
            return 0;
        };
        let mut added = Vec::new();
        for mut card in cards {
            if card.id.is_nil() {
                card.id = CardId::new();
            }
            if card.z == 0 {
                card.z = self.store.next_z();
            }
            card.user_id = self.user.id;
            card.space_id = space_id;
            if self.insert_card(card.clone()) {
                added.push(card);
            }
        }
        let count = added.len();
        if count > 0 {
            self.history.add(HistoryEntry::Created { cards: added });
        }
        count
    }

    /// Adds a copy of `card` under a new id, nudged off any card already
    /// sitting at the same position.
    pub fn paste_card(&mut self, mut card: Card) -> Option<CardId> {
        let space_id = self.space_id()?;
        card.id = CardId::new();
        card.space_id = space_id;
        card.user_id = self.user.id;
        card.z = self.store.next_z();
        let (x, y) = self.unique_position(card.x, card.y);
        card.x = x;
        card.y = y;
        let id = card.id;
        if !self.insert_card(card.clone()) {
            return None;
        }
        self.history.add(HistoryEntry::Created { cards: vec![card] });
        Some(id)
    }

    pub fn update_card(&mut self, patch: CardPatch) -> bool {
        let Some(before) = self.apply_update(patch.clone(), BroadcastType::UpdateCard) else {
            return false;
        };
        self.history.add(HistoryEntry::Diff {
            before: vec![before],
            after: vec![patch],
        });
        true
    }

    /// Widens or narrows cards by `delta_x`, never below the minimum width.
    pub fn resize_cards(&mut self, card_ids: &[CardId], delta_x: f64) -> usize {
        let min = self.config.cards.min_resize_width as f64;
        let mut before = Vec::new();
        let mut after = Vec::new();
        for id in card_ids {
            let Some(card) = self.store.card(*id) else {
                continue;
            };
            let width = (card.effective_width() as f64 + delta_x).max(min).round() as u32;
            let patch = CardPatch {
                resize_width: Some(Some(width)),
                ..CardPatch::new(*id)
            };
            if let Some(prior) = self.apply_update(patch.clone(), BroadcastType::ResizeCard) {
                before.push(prior);
                after.push(patch);
            }
        }
        self.record_diff(before, after)
    }

    /// Clears explicit resize widths.
    pub fn remove_resize(&mut self, card_ids: &[CardId]) -> usize {
        let mut before = Vec::new();
        let mut after = Vec::new();
        for id in card_ids {
            if self.store.card(*id).is_none_or(|card| card.resize_width.is_none()) {
                continue;
            }
            let patch = CardPatch {
                resize_width: Some(None),
                ..CardPatch::new(*id)
            };
            if let Some(prior) = self.apply_update(patch.clone(), BroadcastType::ResizeCard) {
                before.push(prior);
                after.push(patch);
            }
        }
        self.record_diff(before, after)
    }

    pub fn bring_to_front(&mut self, card_id: CardId) -> bool {
        let changes = self.store.bring_to_front(card_id);
        if changes.is_empty() {
            return false;
        }
        for (id, z) in changes {
            self.send_update(CardPatch::z(id, z), BroadcastType::UpdateCard);
        }
        self.schedule_cards();
        self.schedule_card_map();
        true
    }

    pub fn bring_selected_to_front(&mut self, card_ids: &[CardId]) -> usize {
        card_ids
            .iter()
            .filter(|id| self.bring_to_front(**id))
            .count()
    }

    pub fn clear_all_zs(&mut self) -> usize {
        let changed = self.store.clear_all_zs();
        for id in &changed {
            self.send_update(CardPatch::z(*id, 0), BroadcastType::UpdateCard);
        }
        if !changed.is_empty() {
            self.schedule_cards();
            self.schedule_card_map();
        }
        changed.len()
    }

    /// Moves cards in one step, outside of a drag gesture.
    pub fn move_cards(&mut self, positions: &[CardPosition]) -> usize {
        let before = self.cards_by_id(positions.iter().map(|p| p.id));
        let applied = self.commit_moves(positions);
        let after = self.cards_by_id(applied.iter().map(|p| p.id));
        if let Some(entry) = HistoryEntry::for_changes(&before, &after, AddOptions::default()) {
            self.history.add(entry);
        }
        applied.len()
    }

    /// Starts a drag of `card_ids`. Locked cards stay put. History is paused
    /// until the gesture ends.
    pub fn begin_drag(&mut self, card_ids: &[CardId]) -> bool {
        let before: Vec<Card> = card_ids
            .iter()
            .filter_map(|id| self.store.card(*id))
            .filter(|card| !card.is_locked)
            .cloned()
            .collect();
        if before.is_empty() {
            return false;
        }
        let positions = before.iter().map(CardPosition::of).collect();
        self.history.pause();
        self.drag = Some(DragState { before, positions });
        true
    }

    /// One frame of a drag. Only peers' visual overlays see it; the store,
    /// queue and cache are untouched until `end_drag`.
    pub fn drag_cards(&mut self, delta_x: f64, delta_y: f64) -> bool {
        let Some(drag) = self.drag.as_mut() else {
            return false;
        };
        // cards resting on an edge don't push the others past it
        let mut dx = delta_x;
        let mut dy = delta_y;
        for position in &drag.positions {
            if position.x <= 0.0 {
                dx = dx.max(0.0);
            }
            if position.y <= 0.0 {
                dy = dy.max(0.0);
            }
        }
        for position in &mut drag.positions {
            position.x = round_coordinate((position.x + dx).max(0.0)) as f64;
            position.y = round_coordinate((position.y + dy).max(0.0)) as f64;
        }
        let positions = drag.positions.clone();

        let connections = self.paths_for_positions(&positions);
        self.relay.broadcast(
            BroadcastType::MoveCards,
            Handler::MoveCardsWhileDragging(CardMoves { cards: positions }),
        );
        if !connections.is_empty() {
            self.relay.broadcast(
                BroadcastType::UpdateConnectionPaths,
                Handler::UpdateConnectionPathsWhileDragging(ConnectionPaths { connections }),
            );
        }
        true
    }

    /// Commits a drag: one store move, one op per card, one move broadcast,
    /// one path update and one history entry.
    pub fn end_drag(&mut self) -> bool {
        let Some(drag) = self.drag.take() else {
            return false;
        };
        self.history.resume();
        let applied = self.commit_moves(&drag.positions);
        let after = self.cards_by_id(applied.iter().map(|p| p.id));
        if let Some(entry) =
            HistoryEntry::for_changes(&drag.before, &after, AddOptions { use_snapshot: true })
        {
            self.history.add(entry);
        }
        !applied.is_empty()
    }

    pub fn is_dragging(&self) -> bool {
        self.drag.is_some()
    }

    /// Named cards are soft-removed, empty ones deleted. Connections to the
    /// card are removed either way.
    pub fn remove_card(&mut self, card_id: CardId) -> bool {
        let Some(removal) = self.drop_card(card_id) else {
            return false;
        };
        if removal.kind == RemovalKind::Soft {
            self.history.add(HistoryEntry::Removed {
                cards: vec![removal.card],
                connections: removal.connections,
            });
        }
        true
    }

    /// Permanently deletes a live or removed card.
    pub fn delete_card(&mut self, card_id: CardId) -> bool {
        self.purge_card(card_id).is_some()
    }

    pub fn delete_all_removed(&mut self) -> usize {
        let Some(space_id) = self.space_id() else {
            return 0;
        };
        let deleted = self.store.delete_all_removed();
        if deleted.is_empty() {
            return 0;
        }
        self.enqueue(OperationPayload::DeleteAllRemovedCards(RemovedCardsScope {
            user_id: self.user.id,
            space_id,
        }));
        for card in &deleted {
            self.relay
                .broadcast(BroadcastType::DeleteCard, Handler::DeleteCard(card.clone()));
        }
        self.write_field(SpaceField::RemovedCards);
        deleted.len()
    }

    pub fn restore_removed_card(&mut self, card_id: CardId) -> bool {
        let Some(card) = self.store.removed_card(card_id).cloned() else {
            debug!(card = %card_id, "not in removed cards");
            return false;
        };
        self.restore_card(card)
    }

    /// Reconciles live cards with a list fetched from the remote, applying
    /// only the fields that differ. Unknown cards are skipped. Nothing is
    /// queued, broadcast or recorded in history.
    pub fn merge_remote_cards(&mut self, cards: &[Card]) -> usize {
        let applied = self.store.merge_unique(cards);
        if applied.is_empty() {
            return 0;
        }
        debug!(cards = applied.len(), origin = ?Origin::Remote, "merged remote cards");
        self.schedule_cards();
        if applied.iter().any(CardPatch::touches_layout) {
            self.schedule_card_map();
        }
        applied.len()
    }

    /// Removes cards the remote no longer lists, as a peer's removal would.
    pub fn merge_remove_cards(&mut self, cards: &[Card]) -> usize {
        let mut removed = 0;
        for card in cards {
            match self.store.remove(card.id) {
                Ok(removal) => {
                    self.persist_removal(&removal, true);
                    removed += 1;
                }
                Err(err) => debug!(card = %card.id, error = %err, "remote removal skipped"),
            }
        }
        removed
    }

    /// Copies cards, the connections between them and those connections'
    /// types into another cached space under fresh ids. With
    /// `remove_originals` the cards then leave the current space as one
    /// undoable removal. Returns the number of cards copied.
    pub fn move_cards_to_space(
        &mut self,
        card_ids: &[CardId],
        space_id: SpaceId,
        remove_originals: bool,
    ) -> usize {
        let copied = match self.copy_to_space(card_ids, space_id) {
            Ok(copied) => copied,
            Err(err) => {
                log_failure("copy cards to space", &err);
                return 0;
            }
        };
        if remove_originals && copied > 0 {
            let mut cards = Vec::new();
            let mut connections = Vec::new();
            let originals: Vec<CardId> = card_ids
                .iter()
                .copied()
                .filter(|id| self.store.card(*id).is_some())
                .collect();
            for id in originals {
                if let Some(removal) = self.drop_card(id) {
                    if removal.kind == RemovalKind::Soft {
                        cards.push(removal.card);
                    }
                    connections.extend(removal.connections);
                }
            }
            if !cards.is_empty() {
                self.history.add(HistoryEntry::Removed { cards, connections });
            }
        }
        copied
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Connects two cards. Without an explicit type the most recent type is
    /// used, creating one if the space has none.
    pub fn add_connection(
        &mut self,
        start_card_id: CardId,
        end_card_id: CardId,
        connection_type_id: Option<ConnectionTypeId>,
    ) -> Option<ConnectionId> {
        let space_id = self.space_id()?;
        if self.store.connection_exists(start_card_id, end_card_id) {
            debug!(start = %start_card_id, end = %end_card_id, "connection already exists");
            return None;
        }
        let (start, end) = (self.store.card(start_card_id)?, self.store.card(end_card_id)?);
        let path = connection_path(start, end);
        let connection_type_id = match connection_type_id {
            Some(id) => id,
            None => match self.store.last_connection_type() {
                Some(last) => last.id,
                None => self.add_connection_type(None)?.id,
            },
        };
        let connection = Connection {
            id: ConnectionId::new(),
            start_card_id,
            end_card_id,
            connection_type_id,
            path,
            space_id,
        };
        let id = connection.id;
        self.insert_connection(connection).then_some(id)
    }

    pub fn remove_connection(&mut self, connection_id: ConnectionId) -> bool {
        match self.store.remove_connection(connection_id) {
            Ok(connection) => {
                self.enqueue(OperationPayload::RemoveConnection(connection.clone()));
                self.relay.broadcast(
                    BroadcastType::RemoveConnection,
                    Handler::RemoveConnection(connection),
                );
                self.write_field(SpaceField::Connections);
                true
            }
            Err(err) => {
                log_failure("remove connection", &err);
                false
            }
        }
    }

    pub fn update_connection_type_for_connection(
        &mut self,
        connection_id: ConnectionId,
        connection_type_id: ConnectionTypeId,
    ) -> bool {
        let Some(mut connection) = self.store.connection(connection_id).cloned() else {
            return false;
        };
        connection.connection_type_id = connection_type_id;
        match self.store.update_connection(connection.clone()) {
            Ok(_) => {
                self.enqueue(OperationPayload::UpdateConnection(connection));
                self.write_field(SpaceField::Connections);
                true
            }
            Err(err) => {
                log_failure("update connection type", &err);
                false
            }
        }
    }

    // ========================================================================
    // Connection Types
    // ========================================================================

    /// Adds a connection type with a random light colour, named after its
    /// position unless a name is given.
    pub fn add_connection_type(&mut self, name: Option<String>) -> Option<ConnectionType> {
        let space_id = self.space_id()?;
        let connection_type = ConnectionType {
            id: ConnectionTypeId::new(),
            name: name.unwrap_or_else(|| {
                format!("Connection {}", self.store.connection_types().len() + 1)
            }),
            color: random_light_color(),
            space_id,
        };
        if let Err(err) = self.store.add_connection_type(connection_type.clone()) {
            log_failure("add connection type", &err);
            return None;
        }
        self.enqueue(OperationPayload::CreateConnectionType(connection_type.clone()));
        self.relay.broadcast(
            BroadcastType::CreateConnectionType,
            Handler::AddConnectionType(connection_type.clone()),
        );
        self.write_field(SpaceField::ConnectionTypes);
        Some(connection_type)
    }

    pub fn update_connection_type(&mut self, connection_type: ConnectionType) -> bool {
        if let Err(err) = self.store.update_connection_type(connection_type.clone()) {
            log_failure("update connection type", &err);
            return false;
        }
        self.enqueue(OperationPayload::UpdateConnectionType(connection_type.clone()));
        self.relay.broadcast(
            BroadcastType::UpdateConnectionType,
            Handler::UpdateConnectionType(connection_type),
        );
        self.write_field(SpaceField::ConnectionTypes);
        true
    }

    pub fn remove_unused_connection_types(&mut self) -> usize {
        let unused = self.store.unused_connection_types();
        for connection_type in &unused {
            if self.store.remove_connection_type(connection_type.id).is_ok() {
                self.enqueue(OperationPayload::RemoveConnectionType(connection_type.clone()));
            }
        }
        if !unused.is_empty() {
            self.write_field(SpaceField::ConnectionTypes);
        }
        unused.len()
    }

    // ========================================================================
    // Spaces
    // ========================================================================

    /// Shows the cached snapshot right away, then asks the remote for a newer
    /// one. A 404 leaves local state alone and raises `SpaceNotFound`.
    pub fn load_space(&mut self, space_id: SpaceId) -> LoadSource {
        self.flush_cache();
        self.drag = None;
        self.history.clear();
        self.relay.clear_overlay();

        let cached = match self.storage.load_space(space_id) {
            Ok(cached) => cached,
            Err(err) => {
                error!(space = %space_id, error = %err, "failed to read cached space");
                None
            }
        };
        let cached_at = cached.as_ref().map(|c| c.cached_at);
        let mut source = match cached {
            Some(CachedSpace { space, .. }) => {
                self.store.restore(space);
                LoadSource::Cache
            }
            None => {
                self.store.restore(Space::empty(space_id));
                LoadSource::Empty
            }
        };
        self.schedule_card_map();

        match self.remote.fetch_space(space_id) {
            Ok(mut remote) => {
                remote.id = space_id;
                if remote_supersedes(cached_at, &remote) {
                    info!(space = %space_id, "remote snapshot is newer, restoring it");
                    self.store.restore(remote.clone());
                    let now = self.clock.now_ms();
                    if let Err(err) = self.cache.save_space(&mut self.storage, &remote, now) {
                        error!(space = %space_id, error = %err, "failed to cache remote space");
                    }
                    self.schedule_card_map();
                    source = LoadSource::Remote;
                } else {
                    debug!(space = %space_id, "cached snapshot is current");
                }
            }
            Err(err) => self.note_remote_error(Some(space_id), &err),
        }
        source
    }

    /// Creates a space owned by the current user, caches it, queues it for the
    /// remote and makes it current.
    pub fn create_space(&mut self, name: impl Into<String>) -> Option<SpaceId> {
        self.flush_cache();
        let id = SpaceId::new();
        let mut space = Space::empty(id);
        space.name = name.into();
        space.users = vec![self.user.clone()];
        space.connection_types = vec![ConnectionType {
            id: ConnectionTypeId::new(),
            name: "Connection 1".into(),
            color: random_light_color(),
            space_id: id,
        }];

        let now = self.clock.now_ms();
        if let Err(err) = self.cache.save_space(&mut self.storage, &space, now) {
            error!(space = %id, error = %err, "failed to cache new space");
            return None;
        }
        self.history.clear();
        self.store.restore(space.clone());
        self.enqueue(OperationPayload::CreateSpace(space));
        self.schedule_card_map();
        Some(id)
    }

    pub fn update_space_name(&mut self, name: impl Into<String>) -> bool {
        let Some(id) = self.space_id() else {
            return false;
        };
        let name = name.into();
        self.store.set_name(name.clone());
        self.write_field(SpaceField::Name);
        self.enqueue(OperationPayload::UpdateSpace(SpaceUpdate {
            id,
            name: Some(name),
        }));
        true
    }

    /// Hides the current space from the cache and queues its removal.
    pub fn remove_current_space(&mut self) -> bool {
        let Some(id) = self.space_id() else {
            return false;
        };
        self.flush_cache();
        let now = self.clock.now_ms();
        if let Err(err) = self.storage.remove_space(id, now) {
            warn!(space = %id, error = %err, "space was not cached");
        }
        self.enqueue(OperationPayload::RemoveSpace(SpaceRef { id }));
        self.store.clear();
        self.history.clear();
        true
    }

    /// Un-hides a soft-removed space in the local cache.
    pub fn restore_space(&mut self, space_id: SpaceId) -> bool {
        match self.storage.restore_space(space_id) {
            Ok(()) => true,
            Err(err) => {
                warn!(space = %space_id, error = %err, "could not restore space");
                false
            }
        }
    }

    pub fn remove_space_permanent(&mut self, space_id: SpaceId) -> bool {
        if self.space_id() == Some(space_id) {
            self.flush_cache();
            self.store.clear();
            self.history.clear();
        }
        if let Err(err) = self.storage.remove_space_permanent(space_id) {
            error!(space = %space_id, error = %err, "failed to drop cached space");
        }
        self.enqueue(OperationPayload::RemoveSpacePermanent(SpaceRef { id: space_id }));
        true
    }

    /// Every space in the local cache, for a first sync.
    pub fn cached_spaces(&self) -> Vec<Space> {
        match self.storage.all_spaces() {
            Ok(spaces) => spaces.into_iter().map(|cached| cached.space).collect(),
            Err(err) => {
                error!(error = %err, "failed to list cached spaces");
                Vec::new()
            }
        }
    }

    /// Uploads every cached space in one request. Returns how many were sent.
    pub fn create_spaces_on_remote(&mut self) -> usize {
        self.flush_cache();
        let spaces = self.cached_spaces();
        if spaces.is_empty() {
            return 0;
        }
        match self.remote.create_spaces(&spaces) {
            Ok(()) => {
                info!(spaces = spaces.len(), "uploaded cached spaces");
                spaces.len()
            }
            Err(err) => {
                self.note_remote_error(None, &err);
                0
            }
        }
    }

    // ========================================================================
    // Inbound Broadcasts
    // ========================================================================

    /// Applies a peer's JSON broadcast. Malformed input is dropped.
    pub fn receive_broadcast(&mut self, text: &str) -> bool {
        match self.relay.decode(text) {
            Some(message) => self.receive_message(message),
            None => false,
        }
    }

    /// Applies a peer's mutation through the same entry points as local
    /// edits, without queueing, re-broadcasting or recording history.
    pub fn receive_message(&mut self, message: BroadcastMessage) -> bool {
        let handler = message.handler;
        if self.relay.record_visual(&handler) {
            return true;
        }
        self.relay.settle(&handler);
        if self.space_id().is_none() {
            debug!(handler = handler.name(), "broadcast before any space is loaded");
            return false;
        }
        let result = self.apply_remote(handler);
        match result {
            Ok(()) => true,
            Err(err) => {
                log_failure("apply broadcast", &err);
                false
            }
        }
    }

    fn apply_remote(&mut self, handler: Handler) -> Result<(), EngineError> {
        debug!(handler = handler.name(), origin = ?Origin::Remote, "applying broadcast");
        match handler {
            Handler::CreateCard(card) => {
                self.store.create(card)?;
                self.write_field(SpaceField::Cards);
                self.schedule_card_map();
            }
            Handler::UpdateCard(patch) => {
                let touches_layout = patch.touches_layout();
                self.store.update(&patch)?;
                self.schedule_cards();
                if touches_layout {
                    self.schedule_card_map();
                }
            }
            Handler::RemoveCard(card) => {
                let removal = self.store.remove(card.id)?;
                self.persist_removal(&removal, true);
            }
            Handler::DeleteCard(card) => {
                let was_live = self.store.card(card.id).is_some();
                let removal = self.store.delete_card(card.id)?;
                self.persist_removal(&removal, was_live);
            }
            Handler::RestoreRemovedCard(card) => {
                self.store.restore_removed(card)?;
                self.write_field(SpaceField::Cards);
                self.write_field(SpaceField::RemovedCards);
                self.schedule_card_map();
            }
            Handler::MoveCards(moves) => {
                self.store.move_cards(&moves.cards);
                self.schedule_cards();
                self.schedule_card_map();
            }
            Handler::AddConnection(connection) => {
                self.store.add_connection(connection)?;
                self.write_field(SpaceField::Connections);
            }
            Handler::RemoveConnection(connection) => {
                self.store.remove_connection(connection.id)?;
                self.write_field(SpaceField::Connections);
            }
            Handler::UpdateConnectionPaths(paths) => {
                for connection in paths.connections {
                    if let Err(err) = self.store.update_connection(connection) {
                        log_failure("update connection path", &err);
                    }
                }
                self.write_field(SpaceField::Connections);
            }
            Handler::AddConnectionType(connection_type) => {
                self.store.add_connection_type(connection_type)?;
                self.write_field(SpaceField::ConnectionTypes);
            }
            Handler::UpdateConnectionType(connection_type) => {
                self.store.update_connection_type(connection_type)?;
                self.write_field(SpaceField::ConnectionTypes);
            }
            Handler::MoveCardsWhileDragging(_) | Handler::UpdateConnectionPathsWhileDragging(_) => {}
        }
        Ok(())
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Reverts the last gesture through the normal local mutation path, so
    /// the reversal is queued and broadcast like any edit.
    pub fn undo(&mut self) -> bool {
        let Some(entry) = self.history.pop_undo() else {
            return false;
        };
        match &entry {
            HistoryEntry::Diff { before, .. } => {
                for patch in before {
                    self.apply_update(patch.clone(), BroadcastType::UpdateCard);
                }
            }
            HistoryEntry::Snapshot { before, .. } => self.restore_card_states(before),
            HistoryEntry::Created { cards } => {
                for card in cards {
                    self.purge_card(card.id);
                }
            }
            HistoryEntry::Removed { cards, connections } => {
                for card in cards {
                    self.restore_card(card.clone());
                }
                for connection in connections {
                    self.insert_connection(connection.clone());
                }
            }
        }
        self.history.push_redo(entry);
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(entry) = self.history.pop_redo() else {
            return false;
        };
        match &entry {
            HistoryEntry::Diff { after, .. } => {
                for patch in after {
                    self.apply_update(patch.clone(), BroadcastType::UpdateCard);
                }
            }
            HistoryEntry::Snapshot { after, .. } => self.restore_card_states(after),
            HistoryEntry::Created { cards } => {
                for card in cards {
                    self.insert_card(card.clone());
                }
            }
            HistoryEntry::Removed { cards, .. } => {
                for card in cards {
                    self.drop_card(card.id);
                }
            }
        }
        self.history.push_undo(entry);
        true
    }

    // ========================================================================
    // Local Mutation Plumbing
    // ========================================================================

    fn copy_to_space(&mut self, card_ids: &[CardId], space_id: SpaceId) -> Result<usize, EngineError> {
        if self.space_id() == Some(space_id) {
            return Err(EngineError::Validation("cards are already in this space".into()));
        }
        self.flush_cache();
        let mut target = self
            .storage
            .load_space(space_id)?
            .ok_or_else(|| EngineError::NotFound(format!("space {space_id} is not cached")))?
            .space;

        let selected: HashSet<CardId> = card_ids.iter().copied().collect();
        let mut cards: Vec<Card> = self
            .store
            .cards()
            .filter(|card| selected.contains(&card.id))
            .cloned()
            .collect();
        if cards.is_empty() {
            return Ok(0);
        }
        let connections: Vec<Connection> = self
            .store
            .connections()
            .filter(|c| selected.contains(&c.start_card_id) && selected.contains(&c.end_card_id))
            .cloned()
            .collect();
        let used_types: HashSet<ConnectionTypeId> =
            connections.iter().map(|c| c.connection_type_id).collect();
        let types: Vec<ConnectionType> = self
            .store
            .connection_types()
            .iter()
            .filter(|t| used_types.contains(&t.id))
            .cloned()
            .collect();

        // stacked above the target's cards, keeping their relative order
        cards.sort_by_key(|card| card.z);
        let mut z = target.cards.iter().map(|card| card.z).max().unwrap_or(0);
        let mut new_card_ids = HashMap::new();
        for card in &mut cards {
            let id = CardId::new();
            new_card_ids.insert(card.id, id);
            z += 1;
            card.id = id;
            card.z = z;
            card.space_id = space_id;
        }
        let mut new_type_ids = HashMap::new();
        let types: Vec<ConnectionType> = types
            .into_iter()
            .map(|mut connection_type| {
                let id = ConnectionTypeId::new();
                new_type_ids.insert(connection_type.id, id);
                connection_type.id = id;
                connection_type.space_id = space_id;
                connection_type
            })
            .collect();
        let connections: Vec<Connection> = connections
            .into_iter()
            .filter_map(|mut connection| {
                connection.start_card_id = *new_card_ids.get(&connection.start_card_id)?;
                connection.end_card_id = *new_card_ids.get(&connection.end_card_id)?;
                connection.connection_type_id = *new_type_ids.get(&connection.connection_type_id)?;
                connection.id = ConnectionId::new();
                connection.space_id = space_id;
                Some(connection)
            })
            .collect();

        target.cards.extend(cards.iter().cloned());
        target.connection_types.extend(types.iter().cloned());
        target.connections.extend(connections.iter().cloned());
        let now = self.clock.now_ms();
        self.cache.save_space(&mut self.storage, &target, now)?;

        for card in &cards {
            self.enqueue(OperationPayload::CreateCard(card.clone()));
        }
        for connection_type in types {
            self.enqueue(OperationPayload::CreateConnectionType(connection_type));
        }
        for connection in connections {
            self.enqueue(OperationPayload::CreateConnection(connection));
        }
        info!(space = %space_id, cards = cards.len(), "copied cards to another space");
        Ok(cards.len())
    }

    fn build_card(&self, new_card: NewCard) -> Option<Card> {
        let Some(space_id) = self.space_id() else {
            warn!("add_card without a loaded space");
            return None;
        };
        let mut card = Card::new(
            new_card.id.unwrap_or_default(),
            round_coordinate(new_card.x.max(0.0)),
            round_coordinate(new_card.y.max(0.0)),
        );
        if card.id.is_nil() {
            card.id = CardId::new();
        }
        card.z = self.store.next_z();
        card.name = new_card.name;
        card.background_color = new_card.background_color;
        card.width = self.config.cards.default_width;
        card.height = self.config.cards.default_height;
        card.user_id = self.user.id;
        card.space_id = space_id;
        Some(card)
    }

    fn unique_position(&self, x: i64, y: i64) -> (i64, i64) {
        let offset = self.config.cards.paste_offset.max(1);
        let taken: HashSet<(i64, i64)> = self.store.cards().map(|c| (c.x, c.y)).collect();
        let (mut x, mut y) = (x, y);
        while taken.contains(&(x, y)) {
            x += offset;
            y += offset;
        }
        (x, y)
    }

    fn insert_card(&mut self, card: Card) -> bool {
        if let Err(err) = self.store.create(card.clone()) {
            log_failure("create card", &err);
            return false;
        }
        self.enqueue(OperationPayload::CreateCard(card.clone()));
        self.relay
            .broadcast(BroadcastType::CreateCard, Handler::CreateCard(card));
        self.write_field(SpaceField::Cards);
        self.schedule_card_map();
        true
    }

    /// Store update, op, broadcast and debounced cache write for one patch.
    /// Returns the prior values of the touched fields.
    fn apply_update(&mut self, patch: CardPatch, kind: BroadcastType) -> Option<CardPatch> {
        let before = match self.store.update(&patch) {
            Ok(Some(before)) => before,
            Ok(None) => return None,
            Err(err) => {
                log_failure("update card", &err);
                return None;
            }
        };
        let card_id = patch.id;
        let touches_layout = patch.touches_layout();
        self.send_update(patch, kind);
        self.schedule_cards();
        if touches_layout {
            self.refresh_paths(&[card_id]);
            self.schedule_card_map();
        }
        Some(before)
    }

    fn send_update(&mut self, patch: CardPatch, kind: BroadcastType) {
        self.enqueue(OperationPayload::UpdateCard(patch.clone()));
        self.relay.broadcast(kind, Handler::UpdateCard(patch));
    }

    fn record_diff(&mut self, before: Vec<CardPatch>, after: Vec<CardPatch>) -> usize {
        let count = after.len();
        if count > 0 {
            self.history.add(HistoryEntry::Diff { before, after });
        }
        count
    }

    /// Brings cards back to recorded states, one update per changed card.
    fn restore_card_states(&mut self, cards: &[Card]) {
        for target in cards {
            let patch = self
                .store
                .card(target.id)
                .and_then(|current| current.diff(target));
            if let Some(patch) = patch {
                self.apply_update(patch, BroadcastType::UpdateCard);
            }
        }
    }

    fn commit_moves(&mut self, positions: &[CardPosition]) -> Vec<CardPosition> {
        let applied = self.store.move_cards(positions);
        if applied.is_empty() {
            return applied;
        }
        for position in &applied {
            self.enqueue(OperationPayload::UpdateCard(CardPatch::position(
                position.id,
                position.x,
                position.y,
            )));
        }
        self.relay.broadcast(
            BroadcastType::MoveCards,
            Handler::MoveCards(CardMoves {
                cards: applied.clone(),
            }),
        );
        let ids: Vec<CardId> = applied.iter().map(|p| p.id).collect();
        self.refresh_paths(&ids);
        self.schedule_cards();
        self.schedule_card_map();
        applied
    }

    /// Recomputes connection paths for the given cards, queueing and
    /// broadcasting the ones that changed.
    fn refresh_paths(&mut self, card_ids: &[CardId]) {
        let mut changed: Vec<Connection> = Vec::new();
        for id in card_ids {
            for connection in self.store.update_paths_for_card(*id) {
                if let Some(existing) = changed.iter_mut().find(|c| c.id == connection.id) {
                    *existing = connection;
                } else {
                    changed.push(connection);
                }
            }
        }
        if changed.is_empty() {
            return;
        }
        for connection in &changed {
            self.enqueue(OperationPayload::UpdateConnection(connection.clone()));
        }
        self.relay.broadcast(
            BroadcastType::UpdateConnectionPaths,
            Handler::UpdateConnectionPaths(ConnectionPaths {
                connections: changed,
            }),
        );
        self.write_field(SpaceField::Connections);
    }

    /// Paths of connections touching cards at in-flight drag positions.
    fn paths_for_positions(&self, positions: &[CardPosition]) -> Vec<Connection> {
        let moved: HashMap<CardId, &CardPosition> = positions.iter().map(|p| (p.id, p)).collect();
        let placed = |id: CardId| -> Option<Card> {
            let mut card = self.store.card(id)?.clone();
            if let Some(position) = moved.get(&id) {
                card.x = position.x as i64;
                card.y = position.y as i64;
            }
            Some(card)
        };
        self.store
            .connections()
            .filter(|c| moved.contains_key(&c.start_card_id) || moved.contains_key(&c.end_card_id))
            .filter_map(|c| {
                let start = placed(c.start_card_id)?;
                let end = placed(c.end_card_id)?;
                let mut connection = c.clone();
                connection.path = connection_path(&start, &end);
                Some(connection)
            })
            .collect()
    }

    /// Soft-removes or deletes a live card and its connections.
    fn drop_card(&mut self, card_id: CardId) -> Option<Removal> {
        let removal = match self.store.remove(card_id) {
            Ok(removal) => removal,
            Err(err) => {
                log_failure("remove card", &err);
                return None;
            }
        };
        let payload = match removal.kind {
            RemovalKind::Soft => OperationPayload::RemoveCard(removal.card.clone()),
            RemovalKind::Permanent => OperationPayload::DeleteCard(removal.card.clone()),
        };
        self.enqueue(payload);
        let (kind, handler) = match removal.kind {
            RemovalKind::Soft => (BroadcastType::RemoveCard, Handler::RemoveCard(removal.card.clone())),
            RemovalKind::Permanent => (BroadcastType::DeleteCard, Handler::DeleteCard(removal.card.clone())),
        };
        self.relay.broadcast(kind, handler);
        self.after_removal(&removal, true);
        Some(removal)
    }

    /// Permanently deletes a live or removed card.
    fn purge_card(&mut self, card_id: CardId) -> Option<Removal> {
        let was_live = self.store.card(card_id).is_some();
        let removal = match self.store.delete_card(card_id) {
            Ok(removal) => removal,
            Err(err) => {
                log_failure("delete card", &err);
                return None;
            }
        };
        self.enqueue(OperationPayload::DeleteCard(removal.card.clone()));
        self.relay.broadcast(
            BroadcastType::DeleteCard,
            Handler::DeleteCard(removal.card.clone()),
        );
        self.after_removal(&removal, was_live);
        Some(removal)
    }

    /// Peers cascade connections on their own, so cascaded connections are
    /// queued for the remote but not broadcast.
    fn after_removal(&mut self, removal: &Removal, was_live: bool) {
        for connection in &removal.connections {
            self.enqueue(OperationPayload::RemoveConnection(connection.clone()));
        }
        if let Some(drag) = self.drag.as_mut() {
            drag.positions.retain(|p| p.id != removal.card.id);
            drag.before.retain(|c| c.id != removal.card.id);
        }
        self.persist_removal(removal, was_live);
    }

    /// Cache writes and card map refresh after a card left the live list
    /// (`was_live`) or the removed list.
    fn persist_removal(&mut self, removal: &Removal, was_live: bool) {
        if was_live {
            self.write_field(SpaceField::Cards);
            self.schedule_card_map();
        }
        if removal.kind == RemovalKind::Soft || !was_live {
            self.write_field(SpaceField::RemovedCards);
        }
        if !removal.connections.is_empty() {
            self.write_field(SpaceField::Connections);
        }
    }

    fn restore_card(&mut self, card: Card) -> bool {
        if let Err(err) = self.store.restore_removed(card.clone()) {
            log_failure("restore card", &err);
            return false;
        }
        self.enqueue(OperationPayload::RestoreRemovedCard(card.clone()));
        self.relay.broadcast(
            BroadcastType::RestoreRemovedCard,
            Handler::RestoreRemovedCard(card),
        );
        self.write_field(SpaceField::Cards);
        self.write_field(SpaceField::RemovedCards);
        self.schedule_card_map();
        true
    }

    fn insert_connection(&mut self, connection: Connection) -> bool {
        if let Err(err) = self.store.add_connection(connection.clone()) {
            log_failure("add connection", &err);
            return false;
        }
        self.enqueue(OperationPayload::CreateConnection(connection.clone()));
        self.relay.broadcast(
            BroadcastType::CreateConnection,
            Handler::AddConnection(connection),
        );
        self.write_field(SpaceField::Connections);
        true
    }

    fn cards_by_id(&self, ids: impl Iterator<Item = CardId>) -> Vec<Card> {
        ids.filter_map(|id| self.store.card(id).cloned()).collect()
    }

    fn enqueue(&mut self, payload: OperationPayload) {
        let now = self.clock.now_ms();
        if let Err(err) = self.queue.enqueue(&mut self.storage, payload, now) {
            error!(error = %err, "failed to queue operation");
        }
    }

    /// Immediate write of one top-level field of the current space.
    fn write_field(&mut self, field: SpaceField) {
        let Some(space_id) = self.space_id() else {
            return;
        };
        let value = match field {
            SpaceField::Name => SpaceFieldValue::Name(self.store.name().to_string()),
            SpaceField::Cards => SpaceFieldValue::Cards(self.store.cards().cloned().collect()),
            SpaceField::RemovedCards => {
                SpaceFieldValue::RemovedCards(self.store.removed_cards().cloned().collect())
            }
            SpaceField::Connections => {
                SpaceFieldValue::Connections(self.store.connections().cloned().collect())
            }
            SpaceField::ConnectionTypes => {
                SpaceFieldValue::ConnectionTypes(self.store.connection_types().to_vec())
            }
            SpaceField::Users => SpaceFieldValue::Users(self.store.users().to_vec()),
        };
        let now = self.clock.now_ms();
        if let Err(err) = self.cache.write_field(&mut self.storage, space_id, value, now) {
            error!(space = %space_id, field = field.as_str(), error = %err, "cache write failed");
        }
    }

    /// Debounced write of the live card list.
    fn schedule_cards(&mut self) {
        let Some(space_id) = self.space_id() else {
            return;
        };
        let cards = self.store.cards().cloned().collect();
        let now = self.clock.now_ms();
        if let Err(err) = self
            .cache
            .schedule_cards(&mut self.storage, space_id, cards, now)
        {
            error!(space = %space_id, error = %err, "cache write failed");
        }
    }

    fn schedule_card_map(&mut self) {
        let cards = self.store.cards().cloned().collect();
        let now = self.clock.now_ms();
        self.card_map.schedule(cards, self.viewport, self.zoom, now);
    }

    fn note_remote_result(&mut self, result: Result<(), EngineError>) {
        if let Err(err) = result {
            match err {
                EngineError::Network(remote) => self.note_remote_error(None, &remote),
                other => error!(error = %other, "queue flush failed"),
            }
        }
    }

    fn note_remote_error(&mut self, space_id: Option<SpaceId>, err: &RemoteError) {
        if err.is_unauthorized() {
            warn!("remote rejected credentials");
            self.notify(Notification::Unauthorized);
        } else if let (true, Some(space_id)) = (err.is_not_found(), space_id) {
            warn!(space = %space_id, "space not found on remote, keeping local state");
            self.notify(Notification::SpaceNotFound(space_id));
        } else {
            warn!(error = %err, "remote request failed");
        }
    }

    fn notify(&mut self, notification: Notification) {
        if !self.notifications.contains(&notification) {
            self.notifications.push(notification);
        }
    }
}

fn log_failure(action: &str, err: &EngineError) {
    match err {
        EngineError::Validation(_) | EngineError::StateInvariant(_) => {
            warn!(action, error = %err, "mutation skipped")
        }
        _ => error!(action, error = %err, "mutation failed"),
    }
}

/// A random pastel colour as `#rrggbb`.
fn random_light_color() -> String {
    let mut rng = rand::thread_rng();
    let [r, g, b]: [u8; 3] = std::array::from_fn(|_| rng.gen_range(160..=255));
    format!("#{r:02x}{g:02x}{b:02x}")
}
