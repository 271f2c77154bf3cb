use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::{Card, CardPatch, CardPosition, Connection, ConnectionType};

/// Semantic tag of a broadcast, independent of the handler that replays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BroadcastType {
    CreateCard,
    UpdateCard,
    MoveCards,
    RemoveCard,
    DeleteCard,
    ResizeCard,
    RestoreRemovedCard,
    CreateConnection,
    RemoveConnection,
    UpdateConnectionPaths,
    CreateConnectionType,
    UpdateConnectionType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardMoves {
    pub cards: Vec<CardPosition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPaths {
    pub connections: Vec<Connection>,
}

/// The mutation entry point a receiving peer runs, with its typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "handler", content = "updates")]
pub enum Handler {
    #[serde(rename = "cards/create")]
    CreateCard(Card),
    #[serde(rename = "cards/update")]
    UpdateCard(CardPatch),
    #[serde(rename = "cards/remove")]
    RemoveCard(Card),
    #[serde(rename = "cards/delete")]
    DeleteCard(Card),
    #[serde(rename = "cards/restoreRemoved")]
    RestoreRemovedCard(Card),
    #[serde(rename = "cards/move")]
    MoveCards(CardMoves),
    #[serde(rename = "cards/moveWhileDragging")]
    MoveCardsWhileDragging(CardMoves),
    #[serde(rename = "connections/add")]
    AddConnection(Connection),
    #[serde(rename = "connections/remove")]
    RemoveConnection(Connection),
    #[serde(rename = "connections/updatePaths")]
    UpdateConnectionPaths(ConnectionPaths),
    #[serde(rename = "connections/updatePathsWhileDragging")]
    UpdateConnectionPathsWhileDragging(ConnectionPaths),
    #[serde(rename = "connectionTypes/add")]
    AddConnectionType(ConnectionType),
    #[serde(rename = "connectionTypes/update")]
    UpdateConnectionType(ConnectionType),
}

impl Handler {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateCard(_) => "cards/create",
            Self::UpdateCard(_) => "cards/update",
            Self::RemoveCard(_) => "cards/remove",
            Self::DeleteCard(_) => "cards/delete",
            Self::RestoreRemovedCard(_) => "cards/restoreRemoved",
            Self::MoveCards(_) => "cards/move",
            Self::MoveCardsWhileDragging(_) => "cards/moveWhileDragging",
            Self::AddConnection(_) => "connections/add",
            Self::RemoveConnection(_) => "connections/remove",
            Self::UpdateConnectionPaths(_) => "connections/updatePaths",
            Self::UpdateConnectionPathsWhileDragging(_) => "connections/updatePathsWhileDragging",
            Self::AddConnectionType(_) => "connectionTypes/add",
            Self::UpdateConnectionType(_) => "connectionTypes/update",
        }
    }

    /// Drag echoes only move things on screen; they never reach the store.
    pub fn is_visual_only(&self) -> bool {
        matches!(
            self,
            Self::MoveCardsWhileDragging(_) | Self::UpdateConnectionPathsWhileDragging(_)
        )
    }
}

/// `{type, handler, updates}` as exchanged between collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMessage {
    pub kind: BroadcastType,
    pub handler: Handler,
}

impl BroadcastMessage {
    pub fn new(kind: BroadcastType, handler: Handler) -> Self {
        Self { kind, handler }
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        let mut value =
            serde_json::to_value(&self.handler).map_err(|e| CoreError::Serialization(e.to_string()))?;
        let kind =
            serde_json::to_value(self.kind).map_err(|e| CoreError::Serialization(e.to_string()))?;
        value
            .as_object_mut()
            .ok_or_else(|| CoreError::Serialization("handler is not an object".into()))?
            .insert("type".into(), kind);
        serde_json::to_string(&value).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        let mut value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| CoreError::Serialization(e.to_string()))?;
        let kind = value
            .as_object_mut()
            .and_then(|object| object.remove("type"))
            .ok_or_else(|| CoreError::InvalidData("broadcast without type".into()))?;
        let kind: BroadcastType =
            serde_json::from_value(kind).map_err(|e| CoreError::InvalidData(e.to_string()))?;
        let handler: Handler =
            serde_json::from_value(value).map_err(|e| CoreError::InvalidData(e.to_string()))?;
        Ok(Self { kind, handler })
    }
}
