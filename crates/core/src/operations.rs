use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::*;
use crate::model::{Card, CardPatch, Connection, ConnectionType, Space};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedCardsScope {
    pub user_id: UserId,
    pub space_id: SpaceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceUpdate {
    pub id: SpaceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceRef {
    pub id: SpaceId,
}

/// Every mutation the remote API accepts. Serialized as `{name, body}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "body", rename_all = "camelCase")]
pub enum OperationPayload {
    CreateCard(Card),
    UpdateCard(CardPatch),
    RemoveCard(Card),
    DeleteCard(Card),
    RestoreRemovedCard(Card),
    DeleteAllRemovedCards(RemovedCardsScope),
    CreateConnection(Connection),
    UpdateConnection(Connection),
    RemoveConnection(Connection),
    CreateConnectionType(ConnectionType),
    UpdateConnectionType(ConnectionType),
    RemoveConnectionType(ConnectionType),
    CreateSpace(Space),
    UpdateSpace(SpaceUpdate),
    RemoveSpace(SpaceRef),
    RemoveSpacePermanent(SpaceRef),
}

impl OperationPayload {
    /// Wire name of the operation, as the remote API dispatches on it.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateCard(_) => "createCard",
            Self::UpdateCard(_) => "updateCard",
            Self::RemoveCard(_) => "removeCard",
            Self::DeleteCard(_) => "deleteCard",
            Self::RestoreRemovedCard(_) => "restoreRemovedCard",
            Self::DeleteAllRemovedCards(_) => "deleteAllRemovedCards",
            Self::CreateConnection(_) => "createConnection",
            Self::UpdateConnection(_) => "updateConnection",
            Self::RemoveConnection(_) => "removeConnection",
            Self::CreateConnectionType(_) => "createConnectionType",
            Self::UpdateConnectionType(_) => "updateConnectionType",
            Self::RemoveConnectionType(_) => "removeConnectionType",
            Self::CreateSpace(_) => "createSpace",
            Self::UpdateSpace(_) => "updateSpace",
            Self::RemoveSpace(_) => "removeSpace",
            Self::RemoveSpacePermanent(_) => "removeSpacePermanent",
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec_named(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// `{"name": ..., "body": ...}`
    pub fn to_json(&self) -> Result<serde_json::Value, CoreError> {
        serde_json::to_value(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// One durable outbound mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub op_id: OpId,
    pub payload: OperationPayload,
    pub enqueued_at: i64,
}

impl Operation {
    pub fn new(payload: OperationPayload, enqueued_at: i64) -> Self {
        Self {
            op_id: OpId::new(),
            payload,
            enqueued_at,
        }
    }

    pub fn name(&self) -> &'static str {
        self.payload.name()
    }

    /// Wire form: the payload's `{name, body}` plus `opId` and `enqueuedAt`.
    pub fn to_json(&self) -> Result<serde_json::Value, CoreError> {
        let mut value = self.payload.to_json()?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| CoreError::Serialization("operation is not an object".into()))?;
        object.insert("opId".into(), serde_json::Value::String(self.op_id.to_string()));
        object.insert("enqueuedAt".into(), serde_json::Value::from(self.enqueued_at));
        Ok(value)
    }
}

/// An ordered batch of operations sent in a single request. The checksum
/// covers the encoded payloads and op ids, so a retried batch is recognizable.
#[derive(Debug, Clone)]
pub struct OperationBatch {
    pub checksum: [u8; 32],
    pub operations: Vec<Operation>,
}

impl OperationBatch {
    pub fn new(operations: Vec<Operation>) -> Result<Self, CoreError> {
        let mut hasher = blake3::Hasher::new();
        for op in &operations {
            hasher.update(op.op_id.as_bytes());
            hasher.update(&op.payload.to_msgpack()?);
        }
        let checksum = *hasher.finalize().as_bytes();
        Ok(Self {
            checksum,
            operations,
        })
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn checksum_hex(&self) -> String {
        self.checksum.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Request body for `POST /operations`: the ordered array of operations.
    pub fn to_json(&self) -> Result<serde_json::Value, CoreError> {
        self.operations
            .iter()
            .map(Operation::to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(serde_json::Value::Array)
    }
}
