//! S1 (solo broadcast) and the universal event-bus ordering law (§8
//! property iii): within one session, `delivery_status` precedes every
//! `delivery_progress`, which precedes the single `delivery_final`.

mod support;

use cyberchat_node::events::Event;
use cyberchat_node::pipeline::{LocalSubmission, MessageKind, Scope};

#[tokio::test]
async fn s1_solo_broadcast_has_no_peers_and_no_outbound_traffic() {
    let solo = support::spawn_node("solo").await;
    let mut session = solo.state.events.subscribe();

    let report = solo
        .state
        .pipeline
        .submit_local(LocalSubmission {
            kind: MessageKind::Text,
            receiver_guid: None,
            scope: Some(Scope::Broadcast),
            content: b"hello".to_vec(),
        })
        .await;

    assert_eq!(report.total, 0);
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 0);

    let mut events = Vec::new();
    while let Ok(ev) = session.rx.try_recv() {
        events.push(ev);
    }

    let status_idx = events.iter().position(|e| matches!(e, Event::DeliveryStatus { status, .. } if status == "processing"));
    let final_idx = events.iter().position(|e| matches!(e, Event::DeliveryFinal { .. }));
    assert!(status_idx.is_some() && final_idx.is_some());
    assert!(status_idx.unwrap() < final_idx.unwrap());

    match &events[final_idx.unwrap()] {
        Event::DeliveryFinal { total, succeeded, failed, summary, .. } => {
            assert_eq!(*total, 0);
            assert_eq!(*succeeded, 0);
            assert_eq!(*failed, 0);
            assert!(summary.contains("0/0"));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn ordering_law_holds_for_a_private_send_with_one_live_peer() {
    let a = support::spawn_node("alice").await;
    let b = support::spawn_node("bob").await;
    a.learn_peer(&b);

    let mut session = a.state.events.subscribe();

    let message_id = a
        .state
        .pipeline
        .submit_local(LocalSubmission {
            kind: MessageKind::Text,
            receiver_guid: Some(b.state.identity.guid()),
            scope: Some(Scope::Private),
            content: b"ping".to_vec(),
        })
        .await
        .message_id
        .to_string();

    let mut saw_status = false;
    let mut saw_final_after_status = false;
    let mut progress_count = 0;

    while let Ok(ev) = session.rx.try_recv() {
        match ev {
            Event::DeliveryStatus { message_id: mid, .. } if mid == message_id => {
                saw_status = true;
            }
            Event::DeliveryProgress { message_id: mid, .. } if mid == message_id => {
                progress_count += 1;
            }
            Event::DeliveryFinal { message_id: mid, .. } if mid == message_id => {
                assert!(saw_status, "delivery_final observed before delivery_status");
                saw_final_after_status = true;
            }
            _ => {}
        }
    }

    assert!(saw_status);
    // §4.4: private sends emit only (i) status, an optional "sending", and
    // delivery_final — no delivery_progress, unlike broadcasts.
    assert_eq!(progress_count, 0, "private sends must not emit delivery_progress");
    assert!(saw_final_after_status);
}
