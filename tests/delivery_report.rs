//! End-to-end fan-out scenarios from §8: S2 (private echo between two live
//! nodes) and S3 (broadcast that reaches one live peer and evicts one dead
//! one).

mod support;

use cyberchat_node::events::Event;
use cyberchat_node::pipeline::{LocalSubmission, MessageKind, Scope};

#[tokio::test]
async fn s2_private_echo_delivers_and_decrypts() {
    let a = support::spawn_node("alice").await;
    let b = support::spawn_node("bob").await;
    a.learn_peer(&b);
    b.learn_peer(&a);

    let mut b_session = b.state.events.subscribe();

    let report = a
        .state
        .pipeline
        .submit_local(LocalSubmission {
            kind: MessageKind::Text,
            receiver_guid: Some(b.state.identity.guid()),
            scope: Some(Scope::Private),
            content: b"ping".to_vec(),
        })
        .await;

    assert_eq!(report.total, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);

    let rows = b.state.db.list_messages_since(0, 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, report.message_id.to_string());
    assert_eq!(rows[0].sender_guid, a.state.identity.guid().to_string());
    assert_eq!(rows[0].content, b"ping");

    let mut saw_message = false;
    while let Ok(ev) = b_session.rx.try_recv() {
        if let Event::Message { sender_guid, content_len, .. } = ev {
            assert_eq!(sender_guid, a.state.identity.guid());
            assert_eq!(content_len, 4);
            saw_message = true;
        }
    }
    assert!(saw_message, "expected a message event on bob's bus");
}

#[tokio::test]
async fn s3_broadcast_with_one_dead_peer_evicts_it() {
    let a = support::spawn_node("alice").await;
    let b = support::spawn_node("bob").await;
    let c = support::spawn_node("carol").await;
    a.learn_peer(&b);
    a.learn_peer(&c);
    b.learn_peer(&a);

    // Kill carol's listener to simulate a peer whose server process died,
    // while her stale peer record remains in alice's active set.
    c.kill();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut a_session = a.state.events.subscribe();

    let report = a
        .state
        .pipeline
        .submit_local(LocalSubmission {
            kind: MessageKind::Text,
            receiver_guid: None,
            scope: Some(Scope::Broadcast),
            content: b"hi".to_vec(),
        })
        .await;

    assert_eq!(report.total, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);

    let mut offline_events = 0;
    while let Ok(ev) = a_session.rx.try_recv() {
        if matches!(ev, Event::PeerOffline { .. }) {
            offline_events += 1;
        }
    }
    assert_eq!(offline_events, 1, "exactly one peer_offline event for carol (§8 property vi)");

    let active: Vec<_> = a.state.peers.get_active_peers();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name, "bob");
}
