use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};

use crate::ids::*;

/// Position a card lands on when the stored snapshot carries none.
pub const DEFAULT_POSITION: i64 = 100;
pub const DEFAULT_CARD_WIDTH: u32 = 76;
pub const DEFAULT_CARD_HEIGHT: u32 = 32;

fn default_position() -> i64 {
    DEFAULT_POSITION
}

fn default_width() -> u32 {
    DEFAULT_CARD_WIDTH
}

fn default_height() -> u32 {
    DEFAULT_CARD_HEIGHT
}

fn default_true() -> bool {
    true
}

/// Distinguishes an explicit `null` from an absent key on patch fields.
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Rounds a canvas coordinate to the integer grid cards are stored on.
pub fn round_coordinate(value: f64) -> i64 {
    if value.is_finite() { value.round() as i64 } else { 0 }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    #[serde(default)]
    pub id: CardId,
    #[serde(default = "default_position")]
    pub x: i64,
    #[serde(default = "default_position")]
    pub y: i64,
    #[serde(default)]
    pub z: u64,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub frame_id: u32,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub background_color: Option<String>,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub resize_width: Option<u32>,
    #[serde(default = "default_true")]
    pub comment_is_visible: bool,
    #[serde(default)]
    pub space_id: SpaceId,
}

impl Card {
    pub fn new(id: CardId, x: i64, y: i64) -> Self {
        Self {
            id,
            x,
            y,
            z: 0,
            width: DEFAULT_CARD_WIDTH,
            height: DEFAULT_CARD_HEIGHT,
            name: String::new(),
            frame_id: 0,
            user_id: UserId::nil(),
            background_color: None,
            is_locked: false,
            resize_width: None,
            comment_is_visible: true,
            space_id: SpaceId::nil(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Cards with a name are soft-removed; empty cards are deleted outright.
    pub fn has_content(&self) -> bool {
        !self.name.is_empty()
    }

    /// Width used for layout: an explicit resize wins over the measured width.
    pub fn effective_width(&self) -> u32 {
        self.resize_width.unwrap_or(self.width)
    }

    /// Shallow merge of every field present in `patch`. Coordinates are rounded.
    pub fn apply(&mut self, patch: &CardPatch) {
        if let Some(x) = patch.x {
            self.x = round_coordinate(x);
        }
        if let Some(y) = patch.y {
            self.y = round_coordinate(y);
        }
        if let Some(z) = patch.z {
            self.z = z;
        }
        if let Some(width) = patch.width {
            self.width = width;
        }
        if let Some(height) = patch.height {
            self.height = height;
        }
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(frame_id) = patch.frame_id {
            self.frame_id = frame_id;
        }
        if let Some(color) = &patch.background_color {
            self.background_color = color.clone();
        }
        if let Some(is_locked) = patch.is_locked {
            self.is_locked = is_locked;
        }
        if let Some(resize_width) = patch.resize_width {
            self.resize_width = resize_width;
        }
        if let Some(visible) = patch.comment_is_visible {
            self.comment_is_visible = visible;
        }
    }

    /// Current values of exactly the fields `patch` touches. Used to build
    /// inverse patches for undo.
    pub fn project(&self, patch: &CardPatch) -> CardPatch {
        CardPatch {
            id: self.id,
            x: patch.x.map(|_| self.x as f64),
            y: patch.y.map(|_| self.y as f64),
            z: patch.z.map(|_| self.z),
            width: patch.width.map(|_| self.width),
            height: patch.height.map(|_| self.height),
            name: patch.name.as_ref().map(|_| self.name.clone()),
            frame_id: patch.frame_id.map(|_| self.frame_id),
            background_color: patch
                .background_color
                .as_ref()
                .map(|_| self.background_color.clone()),
            is_locked: patch.is_locked.map(|_| self.is_locked),
            resize_width: patch.resize_width.map(|_| self.resize_width),
            comment_is_visible: patch.comment_is_visible.map(|_| self.comment_is_visible),
        }
    }

    /// Fields of `incoming` that differ from `self`, or `None` when equal.
    pub fn diff(&self, incoming: &Card) -> Option<CardPatch> {
        let mut patch = CardPatch::new(self.id);
        if self.x != incoming.x {
            patch.x = Some(incoming.x as f64);
        }
        if self.y != incoming.y {
            patch.y = Some(incoming.y as f64);
        }
        if self.z != incoming.z {
            patch.z = Some(incoming.z);
        }
        if self.width != incoming.width {
            patch.width = Some(incoming.width);
        }
        if self.height != incoming.height {
            patch.height = Some(incoming.height);
        }
        if self.name != incoming.name {
            patch.name = Some(incoming.name.clone());
        }
        if self.frame_id != incoming.frame_id {
            patch.frame_id = Some(incoming.frame_id);
        }
        if self.background_color != incoming.background_color {
            patch.background_color = Some(incoming.background_color.clone());
        }
        if self.is_locked != incoming.is_locked {
            patch.is_locked = Some(incoming.is_locked);
        }
        if self.resize_width != incoming.resize_width {
            patch.resize_width = Some(incoming.resize_width);
        }
        if self.comment_is_visible != incoming.comment_is_visible {
            patch.comment_is_visible = Some(incoming.comment_is_visible);
        }
        (!patch.is_empty()).then_some(patch)
    }
}

/// Partial card update. Only fields that are `Some` are merged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardPatch {
    #[serde(default)]
    pub id: CardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u32>,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub background_color: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_locked: Option<bool>,
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub resize_width: Option<Option<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_is_visible: Option<bool>,
}

impl CardPatch {
    pub fn new(id: CardId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn position(id: CardId, x: f64, y: f64) -> Self {
        Self {
            id,
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    pub fn z(id: CardId, z: u64) -> Self {
        Self {
            id,
            z: Some(z),
            ..Self::default()
        }
    }

    pub fn name(id: CardId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// True when the patch carries no field besides the id.
    pub fn is_empty(&self) -> bool {
        self.x.is_none()
            && self.y.is_none()
            && self.z.is_none()
            && self.width.is_none()
            && self.height.is_none()
            && self.name.is_none()
            && self.frame_id.is_none()
            && self.background_color.is_none()
            && self.is_locked.is_none()
            && self.resize_width.is_none()
            && self.comment_is_visible.is_none()
    }

    pub fn touches_position(&self) -> bool {
        self.x.is_some() || self.y.is_some()
    }

    /// Whether applying the patch can change a card's rendered bounds.
    pub fn touches_layout(&self) -> bool {
        self.touches_position()
            || self.width.is_some()
            || self.height.is_some()
            || self.name.is_some()
            || self.resize_width.is_some()
            || self.z.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardPosition {
    pub id: CardId,
    pub x: f64,
    pub y: f64,
}

impl CardPosition {
    pub fn of(card: &Card) -> Self {
        Self {
            id: card.id,
            x: card.x as f64,
            y: card.y as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(default)]
    pub id: ConnectionId,
    pub start_card_id: CardId,
    pub end_card_id: CardId,
    #[serde(default)]
    pub connection_type_id: ConnectionTypeId,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub space_id: SpaceId,
}

impl Connection {
    pub fn references(&self, card_id: CardId) -> bool {
        self.start_card_id == card_id || self.end_card_id == card_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionType {
    #[serde(default)]
    pub id: ConnectionTypeId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub space_id: SpaceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: String,
}

/// `updatedAt` as the remote reports it: unix milliseconds or an RFC 3339 string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteTimestamp {
    Millis(i64),
    Text(String),
}

impl RemoteTimestamp {
    /// Normalizes to unix milliseconds. Unparseable text yields `None`.
    pub fn to_unix_ms(&self) -> Option<i64> {
        match self {
            Self::Millis(ms) => Some(*ms),
            Self::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.timestamp_millis())
                .or_else(|| text.parse::<i64>().ok()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    pub id: SpaceId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cards: Vec<Card>,
    #[serde(default)]
    pub removed_cards: Vec<Card>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub connection_types: Vec<ConnectionType>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<RemoteTimestamp>,
}

impl Space {
    pub fn empty(id: SpaceId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn updated_at_ms(&self) -> Option<i64> {
        self.updated_at.as_ref().and_then(RemoteTimestamp::to_unix_ms)
    }
}
