//! Multi-participant presence scenarios over an in-process bus.
//!
//! Every participant gets its own `Presence` and endpoint on one `LocalBus`;
//! `pump()` stands in for the event loop draining the network.

use std::cell::RefCell;
use std::rc::Rc;
use trellis_core::{Document, Item, ItemId};
use trellis_presence::{
    watch, Attendee, CanvasSession, ConnectionStatus, DragManager, DragPreview, LocalBus,
    ParticipantId, Presence, PresenceManager, RemoteValue, SelectionEntry, SelectionManager,
    SessionConfig, UserInfo,
};

fn participant(bus: &LocalBus) -> Presence {
    let id = ParticipantId::new();
    let presence = Presence::new(id, bus.connect(id));
    presence.connect().unwrap();
    presence
}

fn pump_all(presences: &[&Presence]) {
    // Two rounds: joins are answered, then the answers land.
    for _ in 0..2 {
        for presence in presences {
            presence.pump().unwrap();
        }
    }
}

// ─── Selection ───────────────────────────────────────────────────

#[test]
fn test_selection_visible_until_owner_disconnects() {
    let bus = LocalBus::new(256);
    let a = participant(&bus);
    let b = participant(&bus);
    let a_sel = SelectionManager::new(&a, "selection:main").unwrap();
    let b_sel = SelectionManager::new(&b, "selection:main").unwrap();
    pump_all(&[&a, &b]);

    let s1 = SelectionEntry::new("s1");
    a_sel.set_selection([s1.clone()]);
    b.pump().unwrap();
    assert_eq!(b_sel.test_remote_selection(&s1), vec![a.me()]);
    assert!(!b_sel.test_selection(&s1));

    a.disconnect();
    b.pump().unwrap();
    assert!(b_sel.test_remote_selection(&s1).is_empty());
    assert!(b_sel.remote_selected().is_empty());
    // The value is still cached; only the attendee's status changed.
    assert_eq!(b_sel.channel().remote(&a.me()), Some(vec![s1]));
    assert_eq!(
        b.attendee(&a.me()).unwrap().status,
        ConnectionStatus::Disconnected
    );
}

#[test]
fn test_late_joiner_receives_current_values() {
    let bus = LocalBus::new(256);
    let a = participant(&bus);
    let a_sel = SelectionManager::new(&a, "selection:main").unwrap();
    a_sel.set_selection([SelectionEntry::new("x"), SelectionEntry::new("y")]);
    a_sel.add_to_selection(SelectionEntry::new("z"));
    a.pump().unwrap();

    let c = participant(&bus);
    let c_sel = SelectionManager::new(&c, "selection:main").unwrap();
    pump_all(&[&a, &c]);

    let seen = c_sel.channel().remote(&a.me()).unwrap();
    let ids: Vec<&str> = seen.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["x", "y", "z"]);
    assert!(c.attendee(&a.me()).unwrap().is_connected());
}

#[test]
fn test_values_before_registration_are_replayed() {
    let bus = LocalBus::new(256);
    let a = participant(&bus);
    let b = participant(&bus);
    let a_sel = SelectionManager::new(&a, "selection:main").unwrap();
    a_sel.set_selection([SelectionEntry::new("early")]);

    // B drains before it has a selection channel.
    pump_all(&[&a, &b]);
    let b_sel = SelectionManager::new(&b, "selection:main").unwrap();
    assert_eq!(
        b_sel.test_remote_selection(&SelectionEntry::new("early")),
        vec![a.me()]
    );
}

// ─── Reconnect ───────────────────────────────────────────────────

#[test]
fn test_reconnect_gets_new_connection_and_fresh_sequence() {
    let bus = LocalBus::new(256);
    let a = participant(&bus);
    let a_drag = DragManager::new(&a, "drag:main").unwrap();
    let item = ItemId::from("shape-1");

    let b_id = ParticipantId::new();
    let first_connection;
    {
        let b = Presence::new(b_id, bus.connect(b_id));
        first_connection = b.connect().unwrap();
        let b_drag = DragManager::new(&b, "drag:main").unwrap();
        for step in 0..5 {
            b_drag.set_dragging(DragPreview::new(&item, step as f64, 0.0, 0.0));
        }
        a.pump().unwrap();
        assert_eq!(a_drag.preview_for(&item).unwrap().x, 4.0);
        // Dropping the process closes its endpoint.
    }
    a.pump().unwrap();
    assert!(!a.attendee(&b_id).unwrap().is_connected());
    assert!(a_drag.preview_for(&item).is_none());

    // Same participant, new process: sequence numbers start over.
    let b = Presence::new(b_id, bus.connect(b_id));
    let second_connection = b.connect().unwrap();
    assert_ne!(first_connection, second_connection);
    let b_drag = DragManager::new(&b, "drag:main").unwrap();
    b_drag.set_dragging(DragPreview::new(&item, 99.0, 0.0, 0.0));

    a.pump().unwrap();
    let attendee = a.attendee(&b_id).unwrap();
    assert!(attendee.is_connected());
    assert_eq!(attendee.connection_id, second_connection);
    assert_eq!(a_drag.preview_for(&item).unwrap().x, 99.0);
}

#[test]
fn test_disconnect_then_connect_same_process() {
    let bus = LocalBus::new(256);
    let a = participant(&bus);
    let b = participant(&bus);
    let a_sel = SelectionManager::new(&a, "selection:main").unwrap();
    let b_sel = SelectionManager::new(&b, "selection:main").unwrap();
    pump_all(&[&a, &b]);

    b.disconnect();
    // Written while offline: kept locally, published on reconnect.
    b_sel.set_selection([SelectionEntry::new("offline")]);
    a.pump().unwrap();
    assert!(a_sel.remote_selected().is_empty());

    b.connect().unwrap();
    pump_all(&[&a, &b]);
    assert_eq!(
        a_sel.test_remote_selection(&SelectionEntry::new("offline")),
        vec![b.me()]
    );
    assert!(b.attendee(&a.me()).unwrap().is_connected());
}

// ─── Session facade ──────────────────────────────────────────────

fn open_session(bus: &LocalBus, doc: &Document, name: &str) -> CanvasSession {
    let presence = participant(bus);
    CanvasSession::open(&presence, UserInfo::new(name, name), doc, &SessionConfig::default())
        .unwrap()
}

#[test]
fn test_roster_tracks_session_close() {
    let bus = LocalBus::new(256);
    let (doc_a, doc_b) = (Document::new(), Document::new());
    let ann = open_session(&bus, &doc_a, "ann");
    let bob = open_session(&bus, &doc_b, "bob");
    pump_all(&[ann.presence(), bob.presence()]);

    let names = |session: &CanvasSession| -> Vec<String> {
        session
            .users()
            .connected_users()
            .into_iter()
            .map(|u| u.info.name)
            .collect()
    };
    assert_eq!(names(&ann), vec!["bob".to_string()]);

    let sizes = Rc::new(RefCell::new(Vec::new()));
    let sink = sizes.clone();
    let _roster = ann
        .users()
        .on_roster_changed(move |users| sink.borrow_mut().push(users.len()));

    bob.close();
    ann.presence().pump().unwrap();
    assert!(names(&ann).is_empty());
    assert_eq!(ann.users().disconnected_users()[0].info.name, "bob");
    assert_eq!(sizes.borrow().last(), Some(&0));
}

#[test]
fn test_drag_commit_replicates_and_undoes() {
    let bus = LocalBus::new(256);
    let doc_a = Document::new();
    let shape = Item::shape(10.0, 10.0, 40.0, "#00FF00", "square");
    let id = shape.id.clone();
    doc_a.transaction(|tx| tx.insert(shape).map(|_| ())).unwrap();
    let doc_b = Document::load(&doc_a.encode_state()).unwrap();

    // Replicate A's document deltas to B.
    let outbox = Rc::new(RefCell::new(Vec::new()));
    let sink = outbox.clone();
    let _replicate = doc_a.on_update(move |update| sink.borrow_mut().push(update.to_vec()));

    let ann = open_session(&bus, &doc_a, "ann");
    let bob = open_session(&bus, &doc_b, "bob");
    pump_all(&[ann.presence(), bob.presence()]);

    let item = doc_a.get(&id).unwrap();
    for step in 1..=3 {
        ann.drag()
            .set_dragging(DragPreview::new(&id, 10.0 + step as f64 * 10.0, 10.0, 15.0));
    }
    bob.presence().pump().unwrap();
    let shown = bob.drag().effective_transform(&doc_b.get(&id).unwrap());
    assert_eq!((shown.x, shown.rotation), (40.0, 15.0));
    assert_eq!(doc_b.get(&id).unwrap().x, 10.0);
    assert!(outbox.borrow().is_empty());

    let preview = ann.drag().local_preview().unwrap();
    assert!(ann.drag().commit(&doc_a, &preview).unwrap());
    assert_eq!(ann.undo().undo_levels(), 1);

    for update in outbox.borrow_mut().drain(..) {
        doc_b.apply_remote_update(&update).unwrap();
    }
    bob.presence().pump().unwrap();
    assert_eq!(doc_b.get(&id).unwrap().x, 40.0);
    assert!(bob.drag().preview_for(&id).is_none());
    // Remote changes never land in the receiver's history.
    assert!(!bob.undo().can_undo());

    assert!(ann.undo().undo().unwrap());
    assert_eq!(doc_a.get(&id).unwrap(), item);
    for update in outbox.borrow_mut().drain(..) {
        doc_b.apply_remote_update(&update).unwrap();
    }
    assert_eq!(doc_b.get(&id).unwrap().x, 10.0);

    let ann_id = ann.presence().me();
    ann.close();
    bob.presence().pump().unwrap();
    assert!(!bob.presence().attendee(&ann_id).unwrap().is_connected());
}

// ─── watch helper ────────────────────────────────────────────────

#[test]
fn test_watch_reports_remote_local_and_disconnect() {
    let bus = LocalBus::new(256);
    let a = participant(&bus);
    let b = participant(&bus);
    let a_sel = SelectionManager::new(&a, "selection:main").unwrap();
    let b_sel = SelectionManager::new(&b, "selection:main").unwrap();
    pump_all(&[&a, &b]);

    let log = Rc::new(RefCell::new(Vec::<String>::new()));
    let (remote_log, local_log, drop_log) = (log.clone(), log.clone(), log.clone());
    let handle = watch(
        &a_sel,
        move |update: &RemoteValue<Vec<SelectionEntry>>| {
            remote_log
                .borrow_mut()
                .push(format!("remote:{}", update.value.len()))
        },
        move |value: &Vec<SelectionEntry>| local_log.borrow_mut().push(format!("local:{}", value.len())),
        move |_: &Attendee| drop_log.borrow_mut().push("left".to_string()),
    );
    assert_eq!(handle.len(), 3);

    a_sel.add_to_selection(SelectionEntry::new("mine"));
    b_sel.set_selection([SelectionEntry::new("p"), SelectionEntry::new("q")]);
    a.pump().unwrap();
    b.disconnect();
    a.pump().unwrap();
    assert_eq!(*log.borrow(), vec!["local:1", "remote:2", "left"]);

    handle.unsubscribe();
    a_sel.clear_selection();
    assert_eq!(log.borrow().len(), 3);
}
