use std::collections::HashMap;

use spacesync_core::{
    broadcast::{BroadcastMessage, BroadcastType, Handler},
    ids::{CardId, ConnectionId},
    model::CardPosition,
};
use tracing::{debug, warn};

use crate::remote::RemoteError;

/// Realtime channel to the other collaborators of a space.
pub trait Transport {
    fn send(&mut self, message: &BroadcastMessage) -> Result<(), RemoteError>;
}

/// Sends local mutations to peers and keeps the visual overlay of peer drags.
///
/// Drag echoes never reach the entity store; they are recorded here until
/// the peer commits the move.
#[derive(Default)]
pub struct BroadcastRelay {
    transport: Option<Box<dyn Transport>>,
    sent: u64,
    peer_drag_positions: HashMap<CardId, CardPosition>,
    peer_drag_paths: HashMap<ConnectionId, String>,
}

impl BroadcastRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            ..Self::default()
        }
    }

    pub fn set_transport(&mut self, transport: Option<Box<dyn Transport>>) {
        self.transport = transport;
    }

    /// Messages handed to the transport so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Sends a mutation that has already been committed locally. Transport
    /// failures are logged; broadcasts are best effort.
    pub fn broadcast(&mut self, kind: BroadcastType, handler: Handler) {
        let Some(transport) = self.transport.as_mut() else {
            debug!(handler = handler.name(), "no transport, broadcast skipped");
            return;
        };
        let message = BroadcastMessage::new(kind, handler);
        match transport.send(&message) {
            Ok(()) => self.sent += 1,
            Err(err) => warn!(handler = message.handler.name(), error = %err, "broadcast failed"),
        }
    }

    /// Parses an inbound message. Malformed input is logged and dropped.
    pub fn decode(&self, text: &str) -> Option<BroadcastMessage> {
        match BroadcastMessage::from_json(text) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(error = %err, "dropping malformed broadcast");
                None
            }
        }
    }

    /// Records a peer's in-flight drag. Returns false for handlers that are
    /// not visual only.
    pub fn record_visual(&mut self, handler: &Handler) -> bool {
        if !handler.is_visual_only() {
            return false;
        }
        match handler {
            Handler::MoveCardsWhileDragging(moves) => {
                for position in &moves.cards {
                    self.peer_drag_positions.insert(position.id, *position);
                }
            }
            Handler::UpdateConnectionPathsWhileDragging(paths) => {
                for connection in &paths.connections {
                    self.peer_drag_paths
                        .insert(connection.id, connection.path.clone());
                }
            }
            _ => {}
        }
        true
    }

    /// Forgets overlay entries once the peer has committed its move.
    pub fn settle(&mut self, handler: &Handler) {
        match handler {
            Handler::MoveCards(moves) => {
                for position in &moves.cards {
                    self.peer_drag_positions.remove(&position.id);
                }
            }
            Handler::UpdateConnectionPaths(paths) => {
                for connection in &paths.connections {
                    self.peer_drag_paths.remove(&connection.id);
                }
            }
            Handler::RemoveCard(card) | Handler::DeleteCard(card) => {
                self.peer_drag_positions.remove(&card.id);
            }
            _ => {}
        }
    }

    pub fn peer_drag_positions(&self) -> &HashMap<CardId, CardPosition> {
        &self.peer_drag_positions
    }

    pub fn peer_drag_path(&self, connection_id: ConnectionId) -> Option<&str> {
        self.peer_drag_paths.get(&connection_id).map(String::as_str)
    }

    pub fn clear_overlay(&mut self) {
        self.peer_drag_positions.clear();
        self.peer_drag_paths.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use spacesync_core::{broadcast::CardMoves, model::Card};

    #[derive(Clone, Default)]
    struct Outbox(Arc<Mutex<Vec<String>>>);

    impl Transport for Outbox {
        fn send(&mut self, message: &BroadcastMessage) -> Result<(), RemoteError> {
            let json = message
                .to_json()
                .map_err(|e| RemoteError::Transport(e.to_string()))?;
            self.0.lock().unwrap().push(json);
            Ok(())
        }
    }

    struct Broken;

    fn blank_card() -> Card {
        Card::new(CardId::new(), 0, 0)
    }

    impl Transport for Broken {
        fn send(&mut self, _message: &BroadcastMessage) -> Result<(), RemoteError> {
            Err(RemoteError::Offline)
        }
    }

    #[test]
    fn broadcast_goes_through_transport() {
        let outbox = Outbox::default();
        let mut relay = BroadcastRelay::with_transport(Box::new(outbox.clone()));
        let card = Card::new(CardId::new(), 0, 0);
        relay.broadcast(BroadcastType::CreateCard, Handler::CreateCard(card.clone()));

        assert_eq!(relay.sent(), 1);
        let sent = outbox.0.lock().unwrap();
        let message = relay.decode(&sent[0]).unwrap();
        assert_eq!(message.handler, Handler::CreateCard(card));
    }

    #[test]
    fn failures_and_missing_transport_are_not_counted() {
        let mut relay = BroadcastRelay::new();
        relay.broadcast(BroadcastType::RemoveCard, Handler::RemoveCard(blank_card()));
        relay.set_transport(Some(Box::new(Broken)));
        relay.broadcast(BroadcastType::RemoveCard, Handler::RemoveCard(blank_card()));
        assert_eq!(relay.sent(), 0);
    }

    #[test]
    fn malformed_messages_are_dropped() {
        let relay = BroadcastRelay::new();
        assert!(relay.decode("{not json").is_none());
        assert!(relay.decode(r#"{"handler":"cards/create","updates":{}}"#).is_none());
        assert!(relay.decode(r#"{"type":"createCard","handler":"nope","updates":{}}"#).is_none());
    }

    #[test]
    fn drag_overlay_until_settled() {
        let mut relay = BroadcastRelay::new();
        let position = CardPosition { id: CardId::new(), x: 40.0, y: 60.0 };
        let dragging = Handler::MoveCardsWhileDragging(CardMoves { cards: vec![position] });
        assert!(relay.record_visual(&dragging));
        assert_eq!(relay.peer_drag_positions().get(&position.id), Some(&position));

        let committed = Handler::MoveCards(CardMoves { cards: vec![position] });
        assert!(!relay.record_visual(&committed));
        relay.settle(&committed);
        assert!(relay.peer_drag_positions().is_empty());
    }
}
