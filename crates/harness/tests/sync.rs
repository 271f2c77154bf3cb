use spacesync_core::{
    ids::*,
    model::{Card, CardPosition, RemoteTimestamp},
    ManualClock,
};
use spacesync_engine::{LoadSource, NewCard, Notification};
use spacesync_harness::{init_tracing, FakeRemote, TestPeer};
use spacesync_storage::SpaceCache;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn peer_with_space() -> Result<(TestPeer, SpaceId), Box<dyn std::error::Error>> {
    init_tracing();
    let mut peer = TestPeer::new()?;
    let space_id = peer.session.create_space("Canvas").ok_or("space not created")?;
    Ok((peer, space_id))
}

// ============================================================================
// Local cache
// ============================================================================

#[test]
fn rapid_moves_produce_one_cache_write() -> TestResult {
    let (mut peer, space_id) = peer_with_space()?;
    let a = peer
        .session
        .add_card(NewCard::at(0.0, 0.0).named("A"))
        .ok_or("card not added")?;
    let writes_before = peer.session.cache_writes();

    for step in 1..=10 {
        let position = CardPosition { id: a, x: step as f64 * 10.0, y: 0.0 };
        assert_eq!(peer.session.move_cards(&[position]), 1);
        peer.advance(15);
    }
    assert_eq!(peer.session.cache_writes(), writes_before);

    peer.advance(250);
    assert_eq!(peer.session.cache_writes(), writes_before + 1);
    let cached = peer
        .session
        .storage()
        .load_space(space_id)?
        .ok_or("space not cached")?;
    assert_eq!(cached.space.cards[0].x, 100);

    peer.advance(1_000);
    assert_eq!(peer.session.cache_writes(), writes_before + 1);
    Ok(())
}

#[test]
fn cached_snapshot_round_trips() -> TestResult {
    let (mut peer, space_id) = peer_with_space()?;
    let a = peer.session.add_card(NewCard::at(0.0, 0.0).named("A")).ok_or("no card")?;
    let b = peer.session.add_card(NewCard::at(90.0, 0.0).named("B")).ok_or("no card")?;
    let c = peer.session.add_card(NewCard::at(180.0, 0.0).named("C")).ok_or("no card")?;
    let d = peer.session.add_card(NewCard::at(270.0, 0.0).named("D")).ok_or("no card")?;
    peer.session.add_connection(a, b, None).ok_or("not connected")?;
    assert!(peer.session.remove_card(c));
    assert!(peer.session.remove_card(d));
    peer.session.flush_cache();
    let expected = peer.session.store().snapshot();

    // reopen from the cache alone
    peer.remote.set_online(false);
    assert_eq!(peer.session.load_space(space_id), LoadSource::Cache);
    let restored = peer.session.store().snapshot();

    assert_eq!(restored.cards, expected.cards);
    let removed: Vec<CardId> = restored.removed_cards.iter().map(|card| card.id).collect();
    assert_eq!(removed, vec![d, c]);
    assert_eq!(restored.connections, expected.connections);
    assert_eq!(restored.connection_types, expected.connection_types);
    assert_eq!(restored.users, expected.users);
    Ok(())
}

#[test]
fn remote_snapshot_wins_only_when_newer() -> TestResult {
    let (mut peer, space_id) = peer_with_space()?;
    let cached_at = peer
        .session
        .storage()
        .load_space(space_id)?
        .ok_or("space not cached")?
        .cached_at;

    let mut remote = peer.session.store().snapshot();
    remote.name = "From remote".into();
    remote.updated_at = Some(RemoteTimestamp::Millis(cached_at - 500));
    peer.remote.put_space(remote.clone());
    assert_eq!(peer.session.load_space(space_id), LoadSource::Cache);
    assert_eq!(peer.session.store().name(), "Canvas");

    remote.updated_at = Some(RemoteTimestamp::Millis(cached_at + 500));
    peer.remote.put_space(remote);
    assert_eq!(peer.session.load_space(space_id), LoadSource::Remote);
    assert_eq!(peer.session.store().name(), "From remote");

    // the newer snapshot replaced the cached one
    let cached = peer.session.storage().load_space(space_id)?.ok_or("space not cached")?;
    assert_eq!(cached.space.name, "From remote");
    Ok(())
}

#[test]
fn rfc3339_timestamps_are_compared_as_instants() -> TestResult {
    init_tracing();
    let remote = FakeRemote::new();
    let clock = ManualClock::new(1_700_000_000_000);
    let mut peer = TestPeer::with_remote(remote.clone(), clock)?;
    let space_id = peer.session.create_space("Canvas").ok_or("space not created")?;

    let mut snapshot = peer.session.store().snapshot();
    snapshot.name = "Later".into();
    // 1_700_000_000_000 ms is 2023-11-14T22:13:20Z
    snapshot.updated_at = Some(RemoteTimestamp::Text("2023-11-14T22:13:21Z".into()));
    remote.put_space(snapshot);

    assert_eq!(peer.session.load_space(space_id), LoadSource::Remote);
    assert_eq!(peer.session.store().name(), "Later");
    Ok(())
}

#[test]
fn missing_space_keeps_local_state_and_notifies() -> TestResult {
    let (mut peer, space_id) = peer_with_space()?;
    peer.session.add_card(NewCard::at(0.0, 0.0).named("kept")).ok_or("no card")?;

    assert_eq!(peer.session.load_space(space_id), LoadSource::Cache);
    assert_eq!(peer.session.store().card_count(), 1);
    assert_eq!(
        peer.session.take_notifications(),
        vec![Notification::SpaceNotFound(space_id)]
    );

    let unknown = SpaceId::new();
    assert_eq!(peer.session.load_space(unknown), LoadSource::Empty);
    assert_eq!(peer.session.store().space_id(), unknown);
    assert_eq!(peer.session.notifications(), &[Notification::SpaceNotFound(unknown)]);
    Ok(())
}

#[test]
fn soft_removed_space_is_hidden_until_restored() -> TestResult {
    let (mut peer, space_id) = peer_with_space()?;
    assert!(peer.session.remove_current_space());
    assert!(peer.session.space_id().is_none());
    assert!(peer.session.storage().load_space(space_id)?.is_none());
    assert_eq!(peer.queued_names().last(), Some(&"removeSpace"));

    assert!(peer.session.restore_space(space_id));
    assert!(peer.session.storage().load_space(space_id)?.is_some());

    assert!(peer.session.remove_space_permanent(space_id));
    assert!(!peer.session.restore_space(space_id));
    assert_eq!(peer.queued_names().last(), Some(&"removeSpacePermanent"));
    Ok(())
}

#[test]
fn renaming_space_is_cached_and_queued() -> TestResult {
    let (mut peer, space_id) = peer_with_space()?;
    assert!(peer.session.update_space_name("Renamed"));
    let cached = peer.session.storage().load_space(space_id)?.ok_or("space not cached")?;
    assert_eq!(cached.space.name, "Renamed");
    assert_eq!(peer.queued_names().last(), Some(&"updateSpace"));
    Ok(())
}

// ============================================================================
// Operation queue
// ============================================================================

#[test]
fn queue_flushes_after_debounce() -> TestResult {
    let (mut peer, _) = peer_with_space()?;
    peer.session.add_card(NewCard::at(0.0, 0.0)).ok_or("no card")?;
    peer.advance(10);
    assert!(peer.remote.batches().is_empty());

    peer.advance(100);
    assert_eq!(peer.remote.operation_names(), vec!["createSpace", "createCard"]);
    assert!(peer.session.queue().is_empty());
    assert_eq!(peer.remote.batches().len(), 1);
    Ok(())
}

#[test]
fn failed_flush_is_retried_in_order() -> TestResult {
    let (mut peer, _) = peer_with_space()?;
    peer.remote.set_online(false);
    peer.session.add_card(NewCard::at(0.0, 0.0).named("A")).ok_or("no card")?;
    peer.session.add_card(NewCard::at(50.0, 0.0).named("B")).ok_or("no card")?;

    peer.advance(100);
    assert_eq!(peer.session.queue().len(), 3);
    assert!(peer.remote.batches().is_empty());

    peer.remote.set_online(true);
    peer.session.add_card(NewCard::at(100.0, 0.0).named("C")).ok_or("no card")?;
    peer.advance(5_000);

    assert_eq!(
        peer.remote.operation_names(),
        vec!["createSpace", "createCard", "createCard", "createCard"]
    );
    let names: Vec<String> = peer
        .remote
        .operations()
        .iter()
        .filter_map(|op| match &op.payload {
            spacesync_core::operations::OperationPayload::CreateCard(card) => Some(card.name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["A", "B", "C"]);
    assert!(peer.session.queue().is_empty());
    Ok(())
}

#[test]
fn offline_session_holds_operations_until_reconnect() -> TestResult {
    let (mut peer, _) = peer_with_space()?;
    peer.session.set_online(false);
    peer.session.add_card(NewCard::at(0.0, 0.0)).ok_or("no card")?;
    peer.advance(10_000);
    assert!(peer.remote.batches().is_empty());
    assert_eq!(peer.session.queue().len(), 2);

    peer.session.set_online(true);
    assert_eq!(peer.remote.operation_names(), vec!["createSpace", "createCard"]);
    assert!(peer.session.queue().is_empty());
    Ok(())
}

#[test]
fn timeouts_and_rejections_keep_the_batch() -> TestResult {
    let (mut peer, _) = peer_with_space()?;
    peer.remote.set_latency(6_000, 5_000);
    assert_eq!(peer.session.flush_queue(), 0);
    assert_eq!(peer.session.queue().len(), 1);

    peer.remote.set_latency(0, 5_000);
    peer.remote.fail_with(Some(401));
    assert_eq!(peer.session.flush_queue(), 0);
    assert_eq!(peer.session.queue().len(), 1);
    assert_eq!(peer.session.notifications(), &[Notification::Unauthorized]);

    peer.remote.fail_with(None);
    assert_eq!(peer.session.flush_queue(), 1);
    Ok(())
}

#[test]
fn batches_carry_ids_and_checksums() -> TestResult {
    let (mut peer, _) = peer_with_space()?;
    peer.session.add_card(NewCard::at(0.0, 0.0)).ok_or("no card")?;
    assert_eq!(peer.session.flush_queue(), 2);

    let batch = peer.remote.batches().pop().ok_or("no batch")?;
    assert_eq!(batch.checksum_hex().len(), 64);
    let ids: Vec<OpId> = batch.operations.iter().map(|op| op.op_id).collect();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    let body = batch.to_json()?;
    assert_eq!(body[1]["name"], "createCard");
    assert_eq!(body[1]["opId"], ids[1].to_string());
    Ok(())
}

#[test]
fn queue_survives_restart() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("spacesync.db");
    let remote = FakeRemote::new();
    let clock = ManualClock::new(1_000_000);
    remote.set_online(false);

    let (space_id, card_id) = {
        let mut peer = TestPeer::open(&path, remote.clone(), clock.clone())?;
        let space_id = peer.session.create_space("Durable").ok_or("space not created")?;
        let card_id = peer
            .session
            .add_card(NewCard::at(40.0, 40.0).named("survivor"))
            .ok_or("no card")?;
        peer.advance(100);
        assert_eq!(peer.session.queue().len(), 2);
        (space_id, card_id)
    };

    let mut peer = TestPeer::open(&path, remote.clone(), clock)?;
    assert_eq!(peer.session.queue().len(), 2);
    assert_eq!(peer.session.load_space(space_id), LoadSource::Cache);
    assert!(peer.card(card_id).is_some());

    remote.set_online(true);
    peer.advance(100);
    assert_eq!(remote.operation_names(), vec!["createSpace", "createCard"]);
    assert!(peer.session.queue().is_empty());
    Ok(())
}

#[test]
fn first_sync_uploads_cached_spaces() -> TestResult {
    let (mut peer, first) = peer_with_space()?;
    let second = peer.session.create_space("Second").ok_or("space not created")?;

    assert_eq!(peer.session.create_spaces_on_remote(), 2);
    let created: Vec<SpaceId> = peer.remote.created_spaces().iter().map(|s| s.id).collect();
    assert!(created.contains(&first));
    assert!(created.contains(&second));
    Ok(())
}

// ============================================================================
// Remote reconciliation
// ============================================================================

#[test]
fn merged_remote_cards_update_only_differing_fields() -> TestResult {
    let (mut peer, space_id) = peer_with_space()?;
    let a = peer.session.add_card(NewCard::at(0.0, 0.0).named("A")).ok_or("no card")?;
    let queued = peer.session.queue().len();
    let depth = peer.session.history().undo_depth();

    let mut remote_a = peer.card(a).ok_or("missing A")?.clone();
    remote_a.name = "from remote".into();
    remote_a.x = 40;
    let stranger = Card::new(CardId::new(), 5, 5).with_name("unknown");
    assert_eq!(peer.session.merge_remote_cards(&[remote_a.clone(), stranger.clone()]), 1);
    assert_eq!(peer.session.merge_remote_cards(&[remote_a]), 0);

    let card = peer.card(a).ok_or("missing A")?;
    assert_eq!((card.name.as_str(), card.x), ("from remote", 40));
    assert!(peer.card(stranger.id).is_none());
    assert_eq!(peer.session.queue().len(), queued);
    assert_eq!(peer.session.history().undo_depth(), depth);

    peer.session.flush_cache();
    let cached = peer.session.storage().load_space(space_id)?.ok_or("space not cached")?;
    assert_eq!(cached.space.cards[0].name, "from remote");
    Ok(())
}

#[test]
fn merged_remote_removals_follow_removal_rules() -> TestResult {
    let (mut peer, space_id) = peer_with_space()?;
    let named = peer.session.add_card(NewCard::at(0.0, 0.0).named("keep me")).ok_or("no card")?;
    let empty = peer.session.add_card(NewCard::at(90.0, 0.0)).ok_or("no card")?;
    peer.session.add_connection(named, empty, None).ok_or("not connected")?;
    let queued = peer.session.queue().len();

    let gone: Vec<Card> = [named, empty]
        .iter()
        .filter_map(|id| peer.card(*id).cloned())
        .chain(std::iter::once(Card::new(CardId::new(), 0, 0)))
        .collect();
    assert_eq!(peer.session.merge_remove_cards(&gone), 2);

    let store = peer.session.store();
    assert_eq!(store.card_count(), 0);
    assert_eq!(store.removed_cards().map(|c| c.id).collect::<Vec<_>>(), vec![named]);
    assert_eq!(store.connections().count(), 0);
    assert_eq!(peer.session.queue().len(), queued);

    let cached = peer.session.storage().load_space(space_id)?.ok_or("space not cached")?;
    assert!(cached.space.cards.is_empty());
    assert_eq!(cached.space.removed_cards.len(), 1);
    assert!(cached.space.connections.is_empty());
    Ok(())
}

// ============================================================================
// Moving cards between spaces
// ============================================================================

#[test]
fn cards_copy_into_another_cached_space() -> TestResult {
    init_tracing();
    let mut peer = TestPeer::new()?;
    let target = peer.session.create_space("Target").ok_or("space not created")?;
    let source = peer.session.create_space("Source").ok_or("space not created")?;
    let a = peer.session.add_card(NewCard::at(0.0, 0.0).named("A")).ok_or("no card")?;
    let b = peer.session.add_card(NewCard::at(100.0, 0.0).named("B")).ok_or("no card")?;
    let c = peer.session.add_card(NewCard::at(300.0, 0.0).named("C")).ok_or("no card")?;
    peer.session.add_connection(a, b, None).ok_or("not connected")?;
    peer.session.add_connection(b, c, None).ok_or("not connected")?;
    let queued = peer.session.queue().len();

    assert_eq!(peer.session.move_cards_to_space(&[a, b], target, false), 2);
    assert_eq!(peer.session.space_id(), Some(source));
    assert_eq!(peer.session.store().card_count(), 3);

    let copied = peer.session.storage().load_space(target)?.ok_or("target not cached")?.space;
    let names: Vec<&str> = copied.cards.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);
    assert!(copied.cards.iter().all(|c| c.space_id == target && c.id != a && c.id != b));
    assert_eq!(copied.connections.len(), 1);
    assert_eq!(copied.connection_types.len(), 2);
    let connection = &copied.connections[0];
    assert_eq!(connection.start_card_id, copied.cards[0].id);
    assert_eq!(connection.end_card_id, copied.cards[1].id);
    assert_eq!(connection.connection_type_id, copied.connection_types[1].id);
    assert_eq!(connection.space_id, target);

    let names = peer.queued_names();
    assert_eq!(
        names[queued..].to_vec(),
        vec!["createCard", "createCard", "createConnectionType", "createConnection"]
    );
    Ok(())
}

#[test]
fn moving_cards_removes_the_originals_undoably() -> TestResult {
    init_tracing();
    let mut peer = TestPeer::new()?;
    let target = peer.session.create_space("Target").ok_or("space not created")?;
    let source = peer.session.create_space("Source").ok_or("space not created")?;
    let b = peer.session.add_card(NewCard::at(100.0, 0.0).named("B")).ok_or("no card")?;
    let c = peer.session.add_card(NewCard::at(300.0, 0.0).named("C")).ok_or("no card")?;
    peer.session.add_connection(b, c, None).ok_or("not connected")?;

    assert_eq!(peer.session.move_cards_to_space(&[c], target, true), 1);
    assert!(peer.card(c).is_none());
    assert_eq!(peer.session.store().removed_card(c).map(|card| card.name.as_str()), Some("C"));
    assert_eq!(peer.session.store().connections().count(), 0);
    let moved = peer.session.storage().load_space(target)?.ok_or("target not cached")?.space;
    assert_eq!(moved.cards.len(), 1);
    assert!(moved.connections.is_empty());

    assert!(peer.session.undo());
    assert!(peer.card(c).is_some());
    assert_eq!(peer.session.store().connections().count(), 1);

    assert_eq!(peer.session.move_cards_to_space(&[b], source, true), 0);
    assert_eq!(peer.session.move_cards_to_space(&[b], SpaceId::new(), true), 0);
    assert!(peer.card(b).is_some());
    Ok(())
}
