use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::{Card, Connection, ConnectionType, Space, User};

/// Top-level fields of a space snapshot that the local cache stores separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceField {
    Name,
    Cards,
    RemovedCards,
    Connections,
    ConnectionTypes,
    Users,
}

impl SpaceField {
    pub const ALL: [SpaceField; 6] = [
        Self::Name,
        Self::Cards,
        Self::RemovedCards,
        Self::Connections,
        Self::ConnectionTypes,
        Self::Users,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Cards => "cards",
            Self::RemovedCards => "removedCards",
            Self::Connections => "connections",
            Self::ConnectionTypes => "connectionTypes",
            Self::Users => "users",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| CoreError::InvalidData(format!("unknown space field: {s}")))
    }
}

/// One top-level field value of a space snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpaceFieldValue {
    Name(String),
    Cards(Vec<Card>),
    RemovedCards(Vec<Card>),
    Connections(Vec<Connection>),
    ConnectionTypes(Vec<ConnectionType>),
    Users(Vec<User>),
}

impl SpaceFieldValue {
    pub fn field(&self) -> SpaceField {
        match self {
            Self::Name(_) => SpaceField::Name,
            Self::Cards(_) => SpaceField::Cards,
            Self::RemovedCards(_) => SpaceField::RemovedCards,
            Self::Connections(_) => SpaceField::Connections,
            Self::ConnectionTypes(_) => SpaceField::ConnectionTypes,
            Self::Users(_) => SpaceField::Users,
        }
    }

    /// Splits a full snapshot into its per-field values.
    pub fn split(space: &Space) -> Vec<SpaceFieldValue> {
        vec![
            Self::Name(space.name.clone()),
            Self::Cards(space.cards.clone()),
            Self::RemovedCards(space.removed_cards.clone()),
            Self::Connections(space.connections.clone()),
            Self::ConnectionTypes(space.connection_types.clone()),
            Self::Users(space.users.clone()),
        ]
    }

    /// Writes this value into the matching field of `space`.
    pub fn apply_to(self, space: &mut Space) {
        match self {
            Self::Name(name) => space.name = name,
            Self::Cards(cards) => space.cards = cards,
            Self::RemovedCards(cards) => space.removed_cards = cards,
            Self::Connections(connections) => space.connections = connections,
            Self::ConnectionTypes(types) => space.connection_types = types,
            Self::Users(users) => space.users = users,
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec_named(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
