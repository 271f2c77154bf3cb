use std::collections::{HashMap, HashSet, VecDeque};

use spacesync_core::{
    config::MAX_SAFE_INTEGER,
    geometry::connection_path,
    ids::*,
    model::{round_coordinate, Card, CardPatch, CardPosition, Connection, ConnectionType, RemoteTimestamp, Space, User},
};
use tracing::{debug, warn};

use crate::error::EngineError;

/// Whether a removed card went to the removed list or was dropped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalKind {
    Soft,
    Permanent,
}

/// Everything a card removal touched.
#[derive(Debug, Clone, PartialEq)]
pub struct Removal {
    pub card: Card,
    pub kind: RemovalKind,
    /// Connections that referenced the card, in store order.
    pub connections: Vec<Connection>,
}

/// Normalized in-memory state of one space. The single mutation authority
/// for cards, connections and connection types.
#[derive(Debug)]
pub struct EntityStore {
    space_id: SpaceId,
    name: String,
    card_ids: Vec<CardId>,
    cards: HashMap<CardId, Card>,
    /// Most recently removed first.
    removed: VecDeque<Card>,
    connection_ids: Vec<ConnectionId>,
    connections: HashMap<ConnectionId, Connection>,
    connection_types: Vec<ConnectionType>,
    users: Vec<User>,
    updated_at: Option<RemoteTimestamp>,
    z_threshold: u64,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new(MAX_SAFE_INTEGER - 2000)
    }
}

impl EntityStore {
    /// `z_threshold` is the highest z tolerated before bring-to-front
    /// renormalizes the whole space.
    pub fn new(z_threshold: u64) -> Self {
        Self {
            space_id: SpaceId::nil(),
            name: String::new(),
            card_ids: Vec::new(),
            cards: HashMap::new(),
            removed: VecDeque::new(),
            connection_ids: Vec::new(),
            connections: HashMap::new(),
            connection_types: Vec::new(),
            users: Vec::new(),
            updated_at: None,
            z_threshold,
        }
    }

    // ========================================================================
    // Space
    // ========================================================================

    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn add_user(&mut self, user: User) {
        if !self.users.iter().any(|u| u.id == user.id) {
            self.users.push(user);
        }
    }

    pub fn clear(&mut self) {
        let z_threshold = self.z_threshold;
        *self = Self::new(z_threshold);
    }

    /// Replaces the whole state with `space`. Duplicate cards and connections
    /// with a missing endpoint are dropped.
    pub fn restore(&mut self, space: Space) {
        self.clear();
        self.space_id = space.id;
        self.name = space.name;
        self.users = space.users;
        self.updated_at = space.updated_at;

        for card in space.cards {
            if card.id.is_nil() || self.cards.contains_key(&card.id) {
                warn!(card = %card.id, "skipping invalid or duplicate card in snapshot");
                continue;
            }
            self.card_ids.push(card.id);
            self.cards.insert(card.id, card);
        }

        let mut seen_removed = HashSet::new();
        for card in space.removed_cards {
            if self.cards.contains_key(&card.id) || !seen_removed.insert(card.id) {
                warn!(card = %card.id, "removed card also present in cards, dropping");
                continue;
            }
            self.removed.push_back(card);
        }

        for connection in space.connections {
            let endpoints_exist = self.cards.contains_key(&connection.start_card_id)
                && self.cards.contains_key(&connection.end_card_id);
            if !endpoints_exist || self.connections.contains_key(&connection.id) {
                warn!(connection = %connection.id, "dropping connection with missing endpoint");
                continue;
            }
            self.connection_ids.push(connection.id);
            self.connections.insert(connection.id, connection);
        }

        for connection_type in space.connection_types {
            if self.connection_type(connection_type.id).is_none() {
                self.connection_types.push(connection_type);
            }
        }

        debug!(
            space = %self.space_id,
            cards = self.card_ids.len(),
            removed = self.removed.len(),
            connections = self.connection_ids.len(),
            "restored space"
        );
    }

    pub fn snapshot(&self) -> Space {
        Space {
            id: self.space_id,
            name: self.name.clone(),
            cards: self.cards().cloned().collect(),
            removed_cards: self.removed.iter().cloned().collect(),
            connections: self.connections().cloned().collect(),
            connection_types: self.connection_types.clone(),
            users: self.users.clone(),
            updated_at: self.updated_at.clone(),
        }
    }

    // ========================================================================
    // Cards
    // ========================================================================

    pub fn card(&self, id: CardId) -> Option<&Card> {
        self.cards.get(&id)
    }

    /// Live cards in creation order.
    pub fn cards(&self) -> impl Iterator<Item = &Card> {
        self.card_ids.iter().filter_map(|id| self.cards.get(id))
    }

    pub fn card_count(&self) -> usize {
        self.card_ids.len()
    }

    pub fn removed_cards(&self) -> impl Iterator<Item = &Card> {
        self.removed.iter()
    }

    pub fn removed_card(&self, id: CardId) -> Option<&Card> {
        self.removed.iter().find(|card| card.id == id)
    }

    pub fn max_z(&self) -> u64 {
        self.cards.values().map(|card| card.z).max().unwrap_or(0)
    }

    /// z for a card added on top of everything else.
    pub fn next_z(&self) -> u64 {
        self.max_z().saturating_add(1)
    }

    pub fn create(&mut self, card: Card) -> Result<(), EngineError> {
        if card.id.is_nil() {
            return Err(EngineError::Validation("card without id".into()));
        }
        if self.cards.contains_key(&card.id) || self.removed_card(card.id).is_some() {
            return Err(EngineError::Validation(format!("card {} already exists", card.id)));
        }
        self.card_ids.push(card.id);
        self.cards.insert(card.id, card);
        Ok(())
    }

    /// Merges `patch` into its card. Returns the prior values of the touched
    /// fields, or `None` when the patch was empty.
    pub fn update(&mut self, patch: &CardPatch) -> Result<Option<CardPatch>, EngineError> {
        if patch.is_empty() {
            return Ok(None);
        }
        let card = self
            .cards
            .get_mut(&patch.id)
            .ok_or_else(|| EngineError::StateInvariant(format!("update of missing card {}", patch.id)))?;
        let before = card.project(patch);
        card.apply(patch);
        Ok(Some(before))
    }

    /// Moves several cards in one pass. Positions are clamped to the positive
    /// quadrant and rounded; unknown cards are skipped. Returns what was applied.
    pub fn move_cards(&mut self, positions: &[CardPosition]) -> Vec<CardPosition> {
        let mut applied = Vec::with_capacity(positions.len());
        for position in positions {
            let Some(card) = self.cards.get_mut(&position.id) else {
                debug!(card = %position.id, "move of unknown card skipped");
                continue;
            };
            card.x = round_coordinate(position.x.max(0.0));
            card.y = round_coordinate(position.y.max(0.0));
            applied.push(CardPosition::of(card));
        }
        applied
    }

    fn take_card(&mut self, id: CardId) -> Option<Card> {
        let card = self.cards.remove(&id)?;
        self.card_ids.retain(|existing| *existing != id);
        Some(card)
    }

    /// Named cards are soft-removed to the front of the removed list, empty
    /// ones are deleted. Connections touching the card go either way.
    pub fn remove(&mut self, id: CardId) -> Result<Removal, EngineError> {
        let card = self
            .take_card(id)
            .ok_or_else(|| EngineError::StateInvariant(format!("remove of missing card {id}")))?;
        let connections = self.remove_connections_for_card(id);
        let kind = if card.has_content() {
            self.removed.push_front(card.clone());
            RemovalKind::Soft
        } else {
            RemovalKind::Permanent
        };
        Ok(Removal {
            card,
            kind,
            connections,
        })
    }

    /// Permanently deletes a card, live or removed.
    pub fn delete_card(&mut self, id: CardId) -> Result<Removal, EngineError> {
        if let Some(card) = self.take_card(id) {
            let connections = self.remove_connections_for_card(id);
            return Ok(Removal {
                card,
                kind: RemovalKind::Permanent,
                connections,
            });
        }
        let index = self
            .removed
            .iter()
            .position(|card| card.id == id)
            .ok_or_else(|| EngineError::StateInvariant(format!("delete of missing card {id}")))?;
        let card = self
            .removed
            .remove(index)
            .ok_or_else(|| EngineError::StateInvariant(format!("delete of missing card {id}")))?;
        Ok(Removal {
            card,
            kind: RemovalKind::Permanent,
            connections: Vec::new(),
        })
    }

    pub fn delete_all_removed(&mut self) -> Vec<Card> {
        self.removed.drain(..).collect()
    }

    /// Moves a card back from the removed list, taking the fields of `card`.
    pub fn restore_removed(&mut self, card: Card) -> Result<(), EngineError> {
        if card.id.is_nil() {
            return Err(EngineError::Validation("restore of card without id".into()));
        }
        if self.cards.contains_key(&card.id) {
            return Err(EngineError::Validation(format!("card {} is not removed", card.id)));
        }
        self.removed.retain(|removed| removed.id != card.id);
        self.card_ids.push(card.id);
        self.cards.insert(card.id, card);
        Ok(())
    }

    /// Applies only the fields of each incoming card that differ from the
    /// current one. Unknown cards are skipped. Returns the applied patches.
    pub fn merge_unique(&mut self, incoming: &[Card]) -> Vec<CardPatch> {
        let mut applied = Vec::new();
        for card in incoming {
            let Some(current) = self.cards.get_mut(&card.id) else {
                continue;
            };
            if let Some(patch) = current.diff(card) {
                current.apply(&patch);
                applied.push(patch);
            }
        }
        applied
    }

    // ========================================================================
    // Z-Order
    // ========================================================================

    /// Raises a card above every other card. Locked and unknown cards are
    /// ignored. Returns every `(id, z)` that changed, the raised card last.
    pub fn bring_to_front(&mut self, id: CardId) -> Vec<(CardId, u64)> {
        match self.cards.get(&id) {
            Some(card) if !card.is_locked => {}
            _ => return Vec::new(),
        }

        let mut changes = Vec::new();
        if self.max_z() > self.z_threshold {
            changes = self.renormalize_z();
        }

        let z = self.next_z();
        if let Some(card) = self.cards.get_mut(&id) {
            card.z = z;
        }
        changes.retain(|(changed, _)| *changed != id);
        changes.push((id, z));
        changes
    }

    /// Reassigns every z to its dense rank in the current z order, ties
    /// broken by creation order.
    fn renormalize_z(&mut self) -> Vec<(CardId, u64)> {
        let mut order: Vec<(u64, usize, CardId)> = self
            .card_ids
            .iter()
            .enumerate()
            .filter_map(|(index, id)| self.cards.get(id).map(|card| (card.z, index, *id)))
            .collect();
        order.sort_unstable();

        let mut changes = Vec::new();
        for (rank, (old_z, _, id)) in order.into_iter().enumerate() {
            let rank = rank as u64;
            if old_z != rank {
                if let Some(card) = self.cards.get_mut(&id) {
                    card.z = rank;
                }
                changes.push((id, rank));
            }
        }
        debug!(space = %self.space_id, changed = changes.len(), "renormalized z order");
        changes
    }

    /// Sets every card's z to 0. Returns the cards that changed.
    pub fn clear_all_zs(&mut self) -> Vec<CardId> {
        let mut changed = Vec::new();
        for id in &self.card_ids {
            if let Some(card) = self.cards.get_mut(id) {
                if card.z != 0 {
                    card.z = 0;
                    changed.push(*id);
                }
            }
        }
        changed
    }

    // ========================================================================
    // Connections
    // ========================================================================

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connection_ids.iter().filter_map(|id| self.connections.get(id))
    }

    pub fn connection_exists(&self, start: CardId, end: CardId) -> bool {
        self.connections()
            .any(|c| c.start_card_id == start && c.end_card_id == end)
    }

    pub fn connections_by_card(&self, card_id: CardId) -> Vec<Connection> {
        self.connections()
            .filter(|c| c.references(card_id))
            .cloned()
            .collect()
    }

    pub fn add_connection(&mut self, connection: Connection) -> Result<(), EngineError> {
        if connection.id.is_nil() || self.connections.contains_key(&connection.id) {
            return Err(EngineError::Validation(format!(
                "connection {} has no id or already exists",
                connection.id
            )));
        }
        if !self.cards.contains_key(&connection.start_card_id)
            || !self.cards.contains_key(&connection.end_card_id)
        {
            return Err(EngineError::Validation(format!(
                "connection {} references a missing card",
                connection.id
            )));
        }
        if self.connection_exists(connection.start_card_id, connection.end_card_id) {
            return Err(EngineError::Validation(format!(
                "cards {} and {} are already connected",
                connection.start_card_id, connection.end_card_id
            )));
        }
        self.connection_ids.push(connection.id);
        self.connections.insert(connection.id, connection);
        Ok(())
    }

    /// Replaces a connection. Returns the previous value.
    pub fn update_connection(&mut self, connection: Connection) -> Result<Connection, EngineError> {
        let current = self.connections.get_mut(&connection.id).ok_or_else(|| {
            EngineError::StateInvariant(format!("update of missing connection {}", connection.id))
        })?;
        Ok(std::mem::replace(current, connection))
    }

    pub fn remove_connection(&mut self, id: ConnectionId) -> Result<Connection, EngineError> {
        let connection = self
            .connections
            .remove(&id)
            .ok_or_else(|| EngineError::StateInvariant(format!("remove of missing connection {id}")))?;
        self.connection_ids.retain(|existing| *existing != id);
        Ok(connection)
    }

    fn remove_connections_for_card(&mut self, card_id: CardId) -> Vec<Connection> {
        let doomed: Vec<ConnectionId> = self
            .connections()
            .filter(|c| c.references(card_id))
            .map(|c| c.id)
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| self.remove_connection(id).ok())
            .collect()
    }

    /// Recomputes the path of every connection touching `card_id` from the
    /// current card geometry. Returns the connections whose path changed.
    pub fn update_paths_for_card(&mut self, card_id: CardId) -> Vec<Connection> {
        let mut updated = Vec::new();
        for id in &self.connection_ids {
            let Some(connection) = self.connections.get(id) else {
                continue;
            };
            if !connection.references(card_id) {
                continue;
            }
            let (Some(start), Some(end)) = (
                self.cards.get(&connection.start_card_id),
                self.cards.get(&connection.end_card_id),
            ) else {
                continue;
            };
            let path = connection_path(start, end);
            if let Some(connection) = self.connections.get_mut(id) {
                if connection.path != path {
                    connection.path = path;
                    updated.push(connection.clone());
                }
            }
        }
        updated
    }

    // ========================================================================
    // Connection Types
    // ========================================================================

    pub fn connection_type(&self, id: ConnectionTypeId) -> Option<&ConnectionType> {
        self.connection_types.iter().find(|t| t.id == id)
    }

    pub fn connection_types(&self) -> &[ConnectionType] {
        &self.connection_types
    }

    pub fn last_connection_type(&self) -> Option<&ConnectionType> {
        self.connection_types.last()
    }

    pub fn add_connection_type(&mut self, connection_type: ConnectionType) -> Result<(), EngineError> {
        if connection_type.id.is_nil() || self.connection_type(connection_type.id).is_some() {
            return Err(EngineError::Validation(format!(
                "connection type {} has no id or already exists",
                connection_type.id
            )));
        }
        self.connection_types.push(connection_type);
        Ok(())
    }

    /// Replaces a connection type. Returns the previous value.
    pub fn update_connection_type(
        &mut self,
        connection_type: ConnectionType,
    ) -> Result<ConnectionType, EngineError> {
        let current = self
            .connection_types
            .iter_mut()
            .find(|t| t.id == connection_type.id)
            .ok_or_else(|| {
                EngineError::StateInvariant(format!(
                    "update of missing connection type {}",
                    connection_type.id
                ))
            })?;
        Ok(std::mem::replace(current, connection_type))
    }

    pub fn remove_connection_type(
        &mut self,
        id: ConnectionTypeId,
    ) -> Result<ConnectionType, EngineError> {
        let index = self
            .connection_types
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| EngineError::StateInvariant(format!("remove of missing connection type {id}")))?;
        Ok(self.connection_types.remove(index))
    }

    /// Connection types no connection refers to.
    pub fn unused_connection_types(&self) -> Vec<ConnectionType> {
        let used: HashSet<ConnectionTypeId> =
            self.connections().map(|c| c.connection_type_id).collect();
        self.connection_types
            .iter()
            .filter(|t| !used.contains(&t.id))
            .cloned()
            .collect()
    }
}
