mod common;

use common::{of_type, Harness};
use delivery_service::{
    models::{DeliveryStatus, NewMessage},
    services::{Draft, HistoryParams, ReadTrigger},
    store::{MessageRepository, ReadMarkerRepository},
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

async fn seed(h: &Harness, sender: Uuid, n: usize) -> Vec<i64> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let outcome = h
            .state
            .delivery
            .send(
                h.conv,
                sender,
                Draft {
                    body: format!("message {i}"),
                    ..Draft::default()
                },
            )
            .await
            .unwrap();
        ids.push(outcome.message.id);
    }
    ids
}

fn snapshot(messages: &[delivery_service::models::Message]) -> HashMap<i64, (i16, bool)> {
    messages
        .iter()
        .map(|m| (m.id, (m.delivery_status, m.read_at.is_some())))
        .collect()
}

#[tokio::test]
async fn concurrent_read_triggers_commute() {
    let h = Harness::new().await;
    let ids = seed(&h, h.alice, 20).await;

    let mut tasks = Vec::new();
    for up_to in [ids[4], ids[19], ids[9], ids[14]] {
        let delivery = h.state.delivery.clone();
        let (conv, bob) = (h.conv, h.bob);
        tasks.push(tokio::spawn(async move {
            delivery
                .mark_read(conv, bob, Some(up_to), ReadTrigger::Explicit)
                .await
                .unwrap()
        }));
    }

    let mut promoted_total = 0;
    for task in tasks {
        promoted_total += task.await.unwrap().promoted.len();
    }
    // Every row is promoted exactly once across all triggers.
    assert_eq!(promoted_total, 20);
    assert_eq!(
        h.store.read_marker(h.conv, h.bob).await.unwrap(),
        Some(ids[19])
    );
    for m in h.store.messages_in(h.conv).await {
        assert!(m.is_read());
        assert!(m.read_at.is_some());
        assert!(m.delivered_at.is_some());
    }
}

#[tokio::test]
async fn status_never_moves_backwards() {
    let h = Harness::new().await;
    let ids = seed(&h, h.alice, 3).await;
    h.state
        .delivery
        .mark_read(h.conv, h.bob, Some(ids[2]), ReadTrigger::Explicit)
        .await
        .unwrap();
    let before = snapshot(&h.store.messages_in(h.conv).await);

    // Catch-up, a lower read and a repeated read are all no-ops.
    let caught = h
        .state
        .delivery
        .catch_up_conversation(h.conv, h.bob)
        .await
        .unwrap();
    assert!(caught.delivered.is_empty());
    let lower = h
        .state
        .delivery
        .mark_read(h.conv, h.bob, Some(ids[0]), ReadTrigger::Explicit)
        .await
        .unwrap();
    assert!(lower.events.is_empty());
    assert_eq!(lower.last_read_id, ids[2]);
    let repeat = h
        .state
        .delivery
        .mark_read(h.conv, h.bob, None, ReadTrigger::Open)
        .await
        .unwrap();
    assert!(repeat.events.is_empty());

    assert_eq!(before, snapshot(&h.store.messages_in(h.conv).await));
}

#[tokio::test]
async fn readers_never_promote_their_own_messages() {
    let h = Harness::new().await;
    seed(&h, h.bob, 2).await;
    let inbound = seed(&h, h.alice, 1).await;

    let outcome = h
        .state
        .delivery
        .mark_read(h.conv, h.bob, None, ReadTrigger::Explicit)
        .await
        .unwrap();
    assert_eq!(outcome.promoted.len(), 1);
    assert_eq!(outcome.promoted[0].id, inbound[0]);

    for m in h.store.messages_in(h.conv).await {
        let expected = if m.sender_id == h.bob {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Read
        };
        assert_eq!(m.status(), expected);
    }
}

#[tokio::test]
async fn reconciliation_heals_and_announces_then_goes_quiet() {
    let h = Harness::new().await;
    let ids = seed(&h, h.alice, 4).await;
    // Marker advanced but the bulk update behind it never landed.
    h.store.advance_read_marker(h.conv, h.bob, ids[2]).await.unwrap();

    let mut alice = h.open(h.alice).await;
    alice.drain();

    let report = h.state.reconciler.run_once(None, false).await.unwrap();
    assert_eq!(report.updated, 3);
    let frames = alice.drain();
    let healed = of_type(&frames, "message.status");
    assert_eq!(healed.len(), 3);
    assert!(healed.iter().all(|f| f["delivery_status"] == 2));

    let after_first = snapshot(&h.store.messages_in(h.conv).await);
    let second = h.state.reconciler.run_once(None, false).await.unwrap();
    assert_eq!(second.updated, 0);
    assert_eq!(second.candidates, 0);
    assert!(alice.drain().is_empty());
    assert_eq!(after_first, snapshot(&h.store.messages_in(h.conv).await));
    assert_eq!(
        h.store.get_message(ids[3]).await.unwrap().unwrap().status(),
        DeliveryStatus::Delivered
    );
}

#[tokio::test]
async fn history_renders_marker_covered_rows_as_read() {
    let h = Harness::new().await;
    let ids = seed(&h, h.alice, 3).await;
    h.state
        .delivery
        .mark_read(h.conv, h.bob, Some(ids[1]), ReadTrigger::Explicit)
        .await
        .unwrap();
    // Simulate the lost update on one row.
    h.store.revert_to_delivered(ids[0]).await.unwrap();

    let page = h
        .state
        .history
        .fetch(h.conv, HistoryParams::default())
        .await
        .unwrap();
    let rendered: Vec<i16> = page.messages.iter().map(|m| m.delivery_status).collect();
    assert_eq!(rendered, vec![2, 2, 1]);
    assert_eq!(page.lagging, 1);

    let healed = h.state.reconciler.heal_conversation(h.conv).await.unwrap();
    assert_eq!(healed.updated, 1);
    let page = h
        .state
        .history
        .fetch(h.conv, HistoryParams::default())
        .await
        .unwrap();
    assert_eq!(page.lagging, 0);
}

#[tokio::test]
async fn history_pages_stay_ascending() {
    let h = Harness::new().await;
    let ids = seed(&h, h.alice, 6).await;

    let latest = h
        .state
        .history
        .fetch(
            h.conv,
            HistoryParams {
                limit: Some(2),
                ..HistoryParams::default()
            },
        )
        .await
        .unwrap();
    let got: Vec<i64> = latest.messages.iter().map(|m| m.id).collect();
    assert_eq!(got, vec![ids[4], ids[5]]);

    let before = h
        .state
        .history
        .fetch(
            h.conv,
            HistoryParams {
                before: Some(ids[4]),
                limit: Some(3),
                ..HistoryParams::default()
            },
        )
        .await
        .unwrap();
    let got: Vec<i64> = before.messages.iter().map(|m| m.id).collect();
    assert_eq!(got, vec![ids[1], ids[2], ids[3]]);

    let after = h
        .state
        .history
        .fetch(
            h.conv,
            HistoryParams {
                after: Some(ids[3]),
                ..HistoryParams::default()
            },
        )
        .await
        .unwrap();
    let got: Vec<i64> = after.messages.iter().map(|m| m.id).collect();
    assert_eq!(got, vec![ids[4], ids[5]]);
}

#[tokio::test]
async fn unread_counts_follow_markers_across_conversations() {
    let h = Harness::new().await;
    let carol = Uuid::new_v4();
    let other = h.store.create_conversation(carol, h.bob).await;

    seed(&h, h.alice, 2).await;
    h.store
        .insert_message(NewMessage {
            conversation_id: other,
            sender_id: carol,
            body: "hey".into(),
            client_id: None,
            attachment: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    assert_eq!(h.state.unread.total_unread(h.bob).await.unwrap(), 3);
    let mut by_conv = h.state.unread.by_conversation(h.bob).await.unwrap();
    by_conv.sort_by_key(|(_, n)| *n);
    assert_eq!(by_conv, vec![(other, 1), (h.conv, 2)]);

    let mut bob = h.open(h.bob).await;
    bob.send(json!({"type": "read"})).await;
    assert_eq!(h.state.unread.total_unread(h.bob).await.unwrap(), 1);
    assert_eq!(h.state.unread.total_unread(h.alice).await.unwrap(), 0);
}
