//! S4 — duplicate suppression (§8 property v, §3 "at-most-once per node").
//!
//! A's retry delivers the same encrypted wire message to B twice. B must
//! store exactly one row under that id and answer 202 to both attempts,
//! and its event bus must not replay the `message` event for the retry.

mod support;

use cyberchat_node::crypto;
use cyberchat_node::events::Event;
use cyberchat_node::pipeline::{MessageKind, Scope, WireMessage};
use uuid::Uuid;

#[tokio::test]
async fn duplicate_wire_post_yields_one_stored_row() {
    let a = support::spawn_node("node-a").await;
    let b = support::spawn_node("node-b").await;
    a.learn_peer(&b);
    b.learn_peer(&a);

    let message_id = Uuid::new_v4();
    let ciphertext_b64 = crypto::encrypt(
        b"retry me",
        &message_id.to_string(),
        b.state.identity.public_key(),
    )
    .unwrap();
    let wire = WireMessage {
        id: message_id,
        sender_guid: a.state.identity.guid(),
        receiver_guid: b.state.identity.guid(),
        kind: MessageKind::Text,
        scope: Scope::Private,
        ciphertext_b64,
        timestamp: cyberchat_node::peers::unix_now(),
    };

    let mut session = b.state.events.subscribe();
    let client = support::insecure_client();
    let url = format!("https://{}/api/v1/message", b.addr);

    let first = client.post(&url).json(&wire).send().await.unwrap();
    let second = client.post(&url).json(&wire).send().await.unwrap();

    assert_eq!(first.status().as_u16(), 202);
    assert_eq!(second.status().as_u16(), 202);

    let rows = b.state.db.list_messages_since(0, 100).unwrap();
    let matching: Vec<_> = rows.iter().filter(|r| r.id == message_id.to_string()).collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].content, b"retry me");

    let mut message_events = 0;
    while let Ok(ev) = session.rx.try_recv() {
        if matches!(ev, Event::Message { id, .. } if id == message_id.to_string()) {
            message_events += 1;
        }
    }
    assert!(message_events <= 1, "duplicate retry must not replay the message event");
}
