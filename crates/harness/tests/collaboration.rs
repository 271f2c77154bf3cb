use spacesync_core::{
    broadcast::{BroadcastMessage, BroadcastType, CardMoves, Handler},
    ids::*,
    model::{Card, CardPatch, CardPosition},
};
use spacesync_engine::{LoadSource, NewCard};
use spacesync_harness::{init_tracing, TestNetwork};
use spacesync_storage::SpaceCache;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Two peers looking at the same space, both caught up.
fn shared_space() -> Result<(TestNetwork, SpaceId), Box<dyn std::error::Error>> {
    init_tracing();
    let mut network = TestNetwork::new();
    let alice = network.add_peer()?;
    let bob = network.add_peer()?;

    let space_id = network
        .peer_mut(alice)
        .session
        .create_space("Shared")
        .ok_or("space not created")?;
    assert_eq!(network.peer_mut(alice).session.create_spaces_on_remote(), 1);
    assert_eq!(network.peer_mut(bob).session.load_space(space_id), LoadSource::Remote);
    Ok((network, space_id))
}

/// Live card ids, removed card ids and connection count of one peer.
fn card_state(network: &TestNetwork, peer: usize) -> (Vec<CardId>, Vec<CardId>, usize) {
    let store = network.peer(peer).session.store();
    (
        store.cards().map(|c| c.id).collect(),
        store.removed_cards().map(|c| c.id).collect(),
        store.connections().count(),
    )
}

#[test]
fn local_edits_reach_other_peers() -> TestResult {
    let (mut network, _) = shared_space()?;
    let card = network
        .peer_mut(0)
        .session
        .add_card(NewCard::at(100.0, 100.0).named("hello"))
        .ok_or("no card")?;
    assert_eq!(network.in_flight(), 1);
    assert_eq!(network.deliver(), 1);

    let seen = network.peer(1).card(card).ok_or("bob never saw the card")?;
    assert_eq!(seen.name, "hello");
    assert_eq!((seen.x, seen.y), (100, 100));

    assert!(network.peer_mut(0).session.update_card(CardPatch::name(card, "renamed")));
    network.deliver();
    assert_eq!(network.peer(1).card(card).map(|c| c.name.as_str()), Some("renamed"));
    Ok(())
}

#[test]
fn inbound_broadcasts_are_not_queued_or_echoed() -> TestResult {
    let (mut network, _) = shared_space()?;
    let bob_queue = network.peer(1).session.queue().len();
    let bob_history = network.peer(1).session.history().undo_depth();

    let a = network
        .peer_mut(0)
        .session
        .add_card(NewCard::at(0.0, 0.0).named("A"))
        .ok_or("no card")?;
    let b = network
        .peer_mut(0)
        .session
        .add_card(NewCard::at(200.0, 0.0).named("B"))
        .ok_or("no card")?;
    network.peer_mut(0).session.add_connection(a, b, None).ok_or("not connected")?;
    assert!(network.peer_mut(0).session.remove_card(a));
    network.deliver();

    let bob = network.peer(1);
    assert_eq!(bob.session.queue().len(), bob_queue);
    assert_eq!(bob.session.history().undo_depth(), bob_history);
    assert_eq!(bob.session.relay().sent(), 0);
    assert_eq!(network.in_flight(), 0);

    let store = bob.session.store();
    assert_eq!(store.removed_cards().next().map(|c| c.id), Some(a));
    assert!(store.card(b).is_some());
    assert_eq!(store.connections().count(), 0);
    Ok(())
}

#[test]
fn inbound_changes_are_cached() -> TestResult {
    let (mut network, space_id) = shared_space()?;
    let card = network
        .peer_mut(0)
        .session
        .add_card(NewCard::at(10.0, 10.0).named("cached"))
        .ok_or("no card")?;
    network.deliver();

    network.peer_mut(1).session.flush_cache();
    let bob = network.peer_mut(1);
    bob.remote.set_online(false);
    assert_eq!(bob.session.load_space(space_id), LoadSource::Cache);
    assert!(bob.card(card).is_some());
    bob.remote.set_online(true);
    Ok(())
}

#[test]
fn drag_frames_only_touch_the_overlay() -> TestResult {
    let (mut network, _) = shared_space()?;
    let a = network
        .peer_mut(0)
        .session
        .add_card(NewCard::at(100.0, 100.0).named("A"))
        .ok_or("no card")?;
    let b = network
        .peer_mut(0)
        .session
        .add_card(NewCard::at(300.0, 100.0).named("B"))
        .ok_or("no card")?;
    let connection = network
        .peer_mut(0)
        .session
        .add_connection(a, b, None)
        .ok_or("not connected")?;
    network.deliver();
    let committed_path = network
        .peer(1)
        .session
        .store()
        .connection(connection)
        .ok_or("bob has no connection")?
        .path
        .clone();

    let alice = network.peer_mut(0);
    assert!(alice.session.begin_drag(&[a]));
    for _ in 0..3 {
        alice.session.drag_cards(20.0, 0.0);
    }
    network.deliver();

    let bob = network.peer(1);
    let overlay = bob.session.relay().peer_drag_positions();
    assert_eq!(overlay.get(&a).map(|p| p.x), Some(160.0));
    assert_eq!(bob.card(a).map(|c| c.x), Some(100));
    assert!(bob.session.relay().peer_drag_path(connection).is_some());
    assert_eq!(
        bob.session.store().connection(connection).map(|c| c.path.as_str()),
        Some(committed_path.as_str())
    );

    assert!(network.peer_mut(0).session.end_drag());
    network.deliver();
    let bob = network.peer(1);
    assert_eq!(bob.card(a).map(|c| c.x), Some(160));
    assert!(bob.session.relay().peer_drag_positions().is_empty());
    assert!(bob.session.relay().peer_drag_path(connection).is_none());
    assert_ne!(
        bob.session.store().connection(connection).map(|c| c.path.clone()),
        Some(committed_path)
    );
    Ok(())
}

#[test]
fn restore_and_z_changes_propagate() -> TestResult {
    let (mut network, _) = shared_space()?;
    let a = network
        .peer_mut(0)
        .session
        .add_card(NewCard::at(0.0, 0.0).named("A"))
        .ok_or("no card")?;
    let b = network
        .peer_mut(0)
        .session
        .add_card(NewCard::at(0.0, 0.0).named("B"))
        .ok_or("no card")?;
    assert!(network.peer_mut(0).session.bring_to_front(a));
    assert!(network.peer_mut(0).session.remove_card(b));
    assert!(network.peer_mut(0).session.restore_removed_card(b));
    network.deliver();

    let alice = network.peer(0).session.store().snapshot();
    let bob = network.peer(1).session.store().snapshot();
    assert_eq!(alice.cards.len(), 2);
    let z_of = |cards: &[Card], id: CardId| cards.iter().find(|c| c.id == id).map(|c| c.z);
    assert_eq!(z_of(bob.cards.as_slice(), a), z_of(alice.cards.as_slice(), a));
    assert!(bob.removed_cards.is_empty());
    Ok(())
}

#[test]
fn connection_types_propagate() -> TestResult {
    let (mut network, _) = shared_space()?;
    let mut added = network
        .peer_mut(0)
        .session
        .add_connection_type(Some("blocks".into()))
        .ok_or("type not added")?;
    added.color = "#abcdef".into();
    assert!(network.peer_mut(0).session.update_connection_type(added.clone()));
    network.deliver();

    let types = network.peer(1).session.store().connection_types().to_vec();
    assert_eq!(types.last(), Some(&added));
    Ok(())
}

#[test]
fn malformed_and_unknown_messages_are_dropped() -> TestResult {
    let (mut network, _) = shared_space()?;
    let bob = network.peer_mut(1);
    assert!(!bob.session.receive_broadcast("not json"));
    assert!(!bob.session.receive_broadcast(r#"{"type":"createCard","handler":"cards/explode","updates":{}}"#));

    // an update for a card this peer never saw
    let stray = BroadcastMessage::new(
        BroadcastType::UpdateCard,
        Handler::UpdateCard(CardPatch::name(CardId::new(), "ghost")),
    );
    assert!(!bob.session.receive_message(stray));

    let moves = BroadcastMessage::new(
        BroadcastType::MoveCards,
        Handler::MoveCards(CardMoves {
            cards: vec![CardPosition { id: CardId::new(), x: 1.0, y: 1.0 }],
        }),
    );
    assert!(bob.session.receive_broadcast(&moves.to_json()?));
    assert_eq!(bob.session.store().card_count(), 0);
    Ok(())
}

#[test]
fn raw_wire_message_is_applied() -> TestResult {
    let (mut network, space_id) = shared_space()?;
    let id = CardId::new();
    let json = serde_json::json!({
        "type": "createCard",
        "handler": "cards/create",
        "updates": {"id": id.to_string(), "x": 5, "y": 7, "name": "wire", "spaceId": space_id.to_string()},
    })
    .to_string();

    let bob = network.peer_mut(1);
    assert!(bob.session.receive_broadcast(&json));
    let card = bob.card(id).ok_or("card not applied")?;
    assert_eq!((card.x, card.y, card.name.as_str()), (5, 7, "wire"));
    Ok(())
}

// ============================================================================
// Removal and deletion convergence
// ============================================================================

#[test]
fn permanent_delete_leaves_nothing_on_peers() -> TestResult {
    let (mut network, space_id) = shared_space()?;
    let alice = network.peer_mut(0);
    let a = alice.session.add_card(NewCard::at(100.0, 100.0).named("A")).ok_or("no card")?;
    let b = alice.session.add_card(NewCard::at(300.0, 300.0).named("B")).ok_or("no card")?;
    alice.session.add_connection(a, b, None).ok_or("not connected")?;
    network.deliver();

    assert!(network.peer_mut(0).session.delete_card(a));
    assert_eq!(network.deliver(), 1);

    assert_eq!(card_state(&network, 1), (vec![b], vec![], 0));
    assert_eq!(card_state(&network, 0), card_state(&network, 1));

    network.peer_mut(1).session.flush_cache();
    let cached = network
        .peer(1)
        .session
        .storage()
        .load_space(space_id)?
        .ok_or("bob has no cached space")?;
    assert!(cached.space.removed_cards.is_empty());
    assert_eq!(cached.space.cards.len(), 1);
    Ok(())
}

#[test]
fn undoing_a_create_deletes_the_card_everywhere() -> TestResult {
    let (mut network, _) = shared_space()?;
    network
        .peer_mut(0)
        .session
        .add_card(NewCard::at(0.0, 0.0).named("oops"))
        .ok_or("no card")?;
    network.deliver();
    assert_eq!(card_state(&network, 1).0.len(), 1);

    assert!(network.peer_mut(0).session.undo());
    network.deliver();
    assert_eq!(card_state(&network, 1), (vec![], vec![], 0));
    assert_eq!(card_state(&network, 0), card_state(&network, 1));
    Ok(())
}

#[test]
fn redone_removal_matches_on_both_peers() -> TestResult {
    let (mut network, _) = shared_space()?;
    let alice = network.peer_mut(0);
    let a = alice.session.add_card(NewCard::at(0.0, 0.0).named("A")).ok_or("no card")?;
    assert!(alice.session.remove_card(a));
    assert!(alice.session.undo());
    assert!(alice.session.redo());
    network.deliver();

    assert_eq!(card_state(&network, 1), (vec![], vec![a], 0));
    assert_eq!(card_state(&network, 0), card_state(&network, 1));
    Ok(())
}

#[test]
fn deleting_all_removed_cards_empties_peers_too() -> TestResult {
    let (mut network, _) = shared_space()?;
    let alice = network.peer_mut(0);
    let a = alice.session.add_card(NewCard::at(0.0, 0.0).named("A")).ok_or("no card")?;
    let b = alice.session.add_card(NewCard::at(90.0, 0.0).named("B")).ok_or("no card")?;
    let c = alice.session.add_card(NewCard::at(180.0, 0.0).named("C")).ok_or("no card")?;
    assert!(alice.session.remove_card(a));
    assert!(alice.session.remove_card(b));
    network.deliver();
    assert_eq!(card_state(&network, 1), (vec![c], vec![b, a], 0));

    assert_eq!(network.peer_mut(0).session.delete_all_removed(), 2);
    network.deliver();
    assert_eq!(card_state(&network, 1), (vec![c], vec![], 0));
    assert_eq!(card_state(&network, 0), card_state(&network, 1));
    Ok(())
}

#[test]
fn cascaded_connections_are_not_broadcast() -> TestResult {
    let (mut network, _) = shared_space()?;
    let alice = network.peer_mut(0);
    let a = alice.session.add_card(NewCard::at(0.0, 0.0).named("A")).ok_or("no card")?;
    let b = alice.session.add_card(NewCard::at(200.0, 0.0).named("B")).ok_or("no card")?;
    let c = alice.session.add_card(NewCard::at(400.0, 0.0).named("C")).ok_or("no card")?;
    alice.session.add_connection(a, b, None).ok_or("not connected")?;
    alice.session.add_connection(c, a, None).ok_or("not connected")?;
    network.deliver();

    let sent = network.peer(0).session.relay().sent();
    assert!(network.peer_mut(0).session.remove_card(a));
    assert_eq!(network.peer(0).session.relay().sent(), sent + 1);
    assert_eq!(network.deliver(), 1);
    assert_eq!(card_state(&network, 1), (vec![b, c], vec![a], 0));

    let removals = network
        .peer(0)
        .queued_names()
        .into_iter()
        .filter(|name| *name == "removeConnection")
        .count();
    assert_eq!(removals, 2);
    Ok(())
}
