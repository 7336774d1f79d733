mod common;

use common::{of_type, Harness};
use delivery_service::{
    config::Config,
    error::AppError,
    middleware::auth::Identity,
    models::DeliveryStatus,
    store::{MessageRepository, ReadMarkerRepository},
    websocket::{ConnectionHandle, ConversationSession, SessionHooks, SessionState},
};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn message_to_an_open_thread_is_read_on_arrival() {
    let h = Harness::new().await;
    let mut alice = h.open(h.alice).await;
    let mut bob = h.open(h.bob).await;
    alice.drain();
    bob.drain();

    alice
        .send(json!({"type": "send", "body": "hi bob", "client_id": "c-1"}))
        .await;

    for frames in [alice.drain(), bob.drain()] {
        let messages = of_type(&frames, "chat.message");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["delivery_status"], 2);
        assert_eq!(messages[0]["body"], "hi bob");
        assert_eq!(messages[0]["client_id"], "c-1");

        let statuses = of_type(&frames, "message.status");
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0]["delivery_status"], 2);
    }

    let stored = h.store.messages_in(h.conv).await;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].is_read());
    assert!(stored[0].read_at.is_some());
    assert_eq!(
        h.store.read_marker(h.conv, h.bob).await.unwrap(),
        Some(stored[0].id)
    );
    assert!(h.push.sent().is_empty());
}

#[tokio::test]
async fn offline_recipient_gets_a_push_and_reads_on_open() {
    let h = Harness::new().await;
    let mut alice = h.open(h.alice).await;
    alice.drain();

    alice.send(json!({"type": "send", "body": "are you there?"})).await;
    let frames = alice.drain();
    let sent = of_type(&frames, "chat.message");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["delivery_status"], 1);
    let id = sent[0]["id"].as_i64().unwrap();

    let pushes = h.push.wait_for(1).await;
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].user_id, h.bob);
    assert_eq!(pushes[0].unread_count, 1);
    assert_eq!(pushes[0].body, "are you there?");

    let mut bob = h.open(h.bob).await;

    let frames = alice.drain();
    let reads = of_type(&frames, "chat.read");
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0]["reader"], h.bob.to_string());
    assert_eq!(reads[0]["last_read_id"], id);
    let statuses = of_type(&frames, "message.status");
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0]["id"], id);
    assert_eq!(statuses[0]["delivery_status"], 2);

    // The reader sees the same broadcast on their own socket.
    assert_eq!(of_type(&bob.drain(), "chat.read").len(), 1);

    let message = h.store.get_message(id).await.unwrap().unwrap();
    assert_eq!(message.status(), DeliveryStatus::Read);
    assert_eq!(h.state.unread.total_unread(h.bob).await.unwrap(), 0);
}

#[tokio::test]
async fn opening_alone_does_not_mark_anything_read() {
    let h = Harness::new().await;
    let mut alice = h.open(h.alice).await;
    alice.send(json!({"type": "send", "body": "one"})).await;
    alice.close().await;

    let mut bob = h.open(h.bob).await;
    let frames = bob.drain();
    assert!(of_type(&frames, "chat.read").is_empty());
    assert!(h
        .store
        .messages_in(h.conv)
        .await
        .iter()
        .all(|m| m.status() == DeliveryStatus::Delivered));
    assert_eq!(h.state.unread.total_unread(h.bob).await.unwrap(), 1);
}

#[tokio::test]
async fn explicit_read_promotes_up_to_the_reported_id_only() {
    let h = Harness::new().await;
    let mut alice = h.open(h.alice).await;
    for body in ["one", "two", "three"] {
        alice.send(json!({"type": "send", "body": body})).await;
    }
    let ids: Vec<i64> = of_type(&alice.drain(), "chat.message")
        .iter()
        .map(|m| m["id"].as_i64().unwrap())
        .collect();
    alice.close().await;

    let mut bob = h.open(h.bob).await;
    bob.drain();
    bob.send(json!({"type": "read", "last_read_id": ids[1].to_string()}))
        .await;

    let frames = bob.drain();
    assert_eq!(of_type(&frames, "chat.read")[0]["last_read_id"], ids[1]);
    assert_eq!(of_type(&frames, "message.status").len(), 2);

    let statuses: Vec<i16> = h
        .store
        .messages_in(h.conv)
        .await
        .iter()
        .map(|m| m.delivery_status)
        .collect();
    assert_eq!(statuses, vec![2, 2, 1]);
    assert_eq!(h.state.unread.total_unread(h.bob).await.unwrap(), 1);

    // Reporting an older id changes nothing and broadcasts nothing.
    bob.send(json!({"type": "read", "last_read_id": ids[0]})).await;
    assert!(bob.drain().is_empty());
    assert_eq!(
        h.store.read_marker(h.conv, h.bob).await.unwrap(),
        Some(ids[1])
    );
}

#[tokio::test]
async fn read_beyond_the_newest_message_is_clamped() {
    let h = Harness::new().await;
    let mut alice = h.open(h.alice).await;
    alice.send(json!({"type": "send", "body": "only"})).await;
    let id = of_type(&alice.drain(), "chat.message")[0]["id"]
        .as_i64()
        .unwrap();
    alice.close().await;

    let mut bob = h.open(h.bob).await;
    bob.send(json!({"type": "read", "last_read_id": id + 1000})).await;
    assert_eq!(h.store.read_marker(h.conv, h.bob).await.unwrap(), Some(id));

    // A later message stays unread.
    let mut alice = h.open(h.alice).await;
    bob.close().await;
    alice.send(json!({"type": "send", "body": "later"})).await;
    assert_eq!(h.state.unread.total_unread(h.bob).await.unwrap(), 1);
}

#[tokio::test]
async fn catch_up_is_bounded_per_open() {
    let mut config = Config::in_memory(common::JWT_SECRET);
    config.tuning.catch_up_batch = 2;
    let h = Harness::with_config(config).await;
    for i in 0..5 {
        h.store
            .insert_undelivered(h.conv, h.alice, &format!("legacy {i}"))
            .await;
    }

    let mut bob = h.open(h.bob).await;
    let frames = bob.drain();
    let ticks = of_type(&frames, "message.status");
    assert_eq!(ticks.len(), 2);
    assert!(ticks.iter().all(|t| t["delivery_status"] == 1));
    let stamped = h
        .store
        .messages_in(h.conv)
        .await
        .iter()
        .filter(|m| m.delivered_at.is_some())
        .count();
    assert_eq!(stamped, 2);
    // Catch-up never reads.
    assert!(h.store.messages_in(h.conv).await.iter().all(|m| !m.is_read()));

    bob.close().await;
    let _again = h.open(h.bob).await;
    let stamped = h
        .store
        .messages_in(h.conv)
        .await
        .iter()
        .filter(|m| m.delivered_at.is_some())
        .count();
    assert_eq!(stamped, 4);
}

#[tokio::test]
async fn duplicate_send_is_echoed_to_the_sender_only() {
    let h = Harness::new().await;
    let mut alice = h.open(h.alice).await;
    let mut bob = h.open(h.bob).await;
    alice.drain();
    bob.drain();

    let frame = json!({"type": "send", "body": "once", "client_id": "retry-me"});
    alice.send(frame.clone()).await;
    alice.drain();
    bob.drain();

    alice.send(frame).await;
    let echoed = alice.drain();
    assert_eq!(of_type(&echoed, "chat.message").len(), 1);
    assert!(bob.drain().is_empty());
    assert_eq!(h.store.messages_in(h.conv).await.len(), 1);
}

#[tokio::test]
async fn failed_send_is_reported_to_the_sender_only() {
    let h = Harness::new().await;
    let mut alice = h.open(h.alice).await;
    let mut bob = h.open(h.bob).await;
    alice.drain();
    bob.drain();
    h.store.set_failing_writes(true).await;

    alice.send(json!({"type": "send", "body": "lost"})).await;

    let frames = alice.drain();
    let errors = of_type(&frames, "error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "send_failed");
    assert!(of_type(&frames, "chat.message").is_empty());
    assert!(bob.drain().is_empty());
    assert!(h.store.messages_in(h.conv).await.is_empty());
}

#[tokio::test]
async fn typing_ping_and_plain_text_frames() {
    let h = Harness::new().await;
    let mut alice = h.open(h.alice).await;
    let mut bob = h.open(h.bob).await;
    alice.drain();
    bob.drain();

    alice.send(json!({"type": "typing", "state": "end"})).await;
    let typing = bob.drain();
    assert_eq!(typing.len(), 1);
    assert_eq!(typing[0]["type"], "chat.typing");
    assert_eq!(typing[0]["state"], "stop");
    assert_eq!(typing[0]["user"], h.alice.to_string());

    alice.drain();
    alice.send(json!({"type": "ping"})).await;
    assert_eq!(alice.drain(), vec![json!({"type": "pong"})]);
    assert!(bob.drain().is_empty());

    alice.session.on_frame("hello in plain text").await;
    let frames = bob.drain();
    assert_eq!(of_type(&frames, "chat.message")[0]["body"], "hello in plain text");

    // Unknown frame types and empty bodies are ignored.
    alice.send(json!({"type": "dance"})).await;
    alice.send(json!({"type": "send", "body": "   "})).await;
    alice.drain();
    assert!(bob.drain().is_empty());
}

#[tokio::test]
async fn disconnect_removes_presence() {
    let h = Harness::new().await;
    let mut alice = h.open(h.alice).await;
    let bob = h.open(h.bob).await;
    bob.close().await;
    alice.drain();

    alice.send(json!({"type": "send", "body": "gone?"})).await;
    let frames = alice.drain();
    assert_eq!(of_type(&frames, "chat.message")[0]["delivery_status"], 1);
    assert!(of_type(&frames, "message.status").is_empty());
}

#[tokio::test]
async fn strangers_and_unknown_conversations_are_refused() {
    let h = Harness::new().await;

    let (handle, _rx) = ConnectionHandle::new();
    let mut stranger =
        ConversationSession::new(h.state.clone(), Identity::user(Uuid::new_v4()), h.conv, handle);
    assert!(matches!(stranger.on_connect().await, Err(AppError::Forbidden)));
    assert_eq!(stranger.state(), SessionState::Connecting);

    let (handle, _rx) = ConnectionHandle::new();
    let mut lost =
        ConversationSession::new(h.state.clone(), Identity::user(h.alice), Uuid::new_v4(), handle);
    assert!(matches!(lost.on_connect().await, Err(AppError::NotFound)));
}

#[tokio::test]
async fn active_team_members_may_open_delegated_conversations() {
    let h = Harness::new().await;
    let owner = Uuid::new_v4();
    let team_member = h.store.add_team_member(owner).await;
    h.store.delegate_to_team(h.conv, team_member).await.unwrap();

    let identity = Identity {
        user_id: owner,
        team_member_id: Some(team_member),
    };
    let (handle, _rx) = ConnectionHandle::new();
    let mut session = ConversationSession::new(h.state.clone(), identity, h.conv, handle);
    assert!(session.on_connect().await.is_ok());
    session.on_disconnect().await;

    h.store.set_team_member_active(team_member, false).await;
    let (handle, _rx) = ConnectionHandle::new();
    let mut session = ConversationSession::new(h.state.clone(), identity, h.conv, handle);
    assert!(matches!(session.on_connect().await, Err(AppError::Forbidden)));
}

#[tokio::test]
async fn team_owner_counts_delegated_conversations_as_unread() {
    let h = Harness::new().await;
    let owner = Uuid::new_v4();
    let team_member = h.store.add_team_member(owner).await;
    h.store.delegate_to_team(h.conv, team_member).await.unwrap();

    let mut alice = h.open(h.alice).await;
    alice.send(json!({"type": "send", "body": "for the team"})).await;

    let pushes = h.push.wait_for(2).await;
    let to_owner: Vec<_> = pushes.iter().filter(|p| p.user_id == owner).collect();
    assert_eq!(to_owner.len(), 1);
    assert_eq!(to_owner[0].unread_count, 1);
    assert_eq!(h.state.unread.total_unread(owner).await.unwrap(), 1);

    let mut inbox = h.open_inbox(owner).await;
    let digests = of_type(&inbox.drain(), "inbox.update")
        .into_iter()
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(digests.len(), 1);
    assert_eq!(digests[0]["conversation_id"], h.conv.to_string());
    assert_eq!(digests[0]["unread_count"], 1);
}

#[tokio::test]
async fn inbox_socket_gets_hello_then_a_digest() {
    let h = Harness::new().await;
    let mut alice = h.open(h.alice).await;
    h.store.insert_undelivered(h.conv, h.alice, "while you were out").await;
    alice.drain();

    let mut inbox = h.open_inbox(h.bob).await;
    let frames = inbox.drain();
    assert_eq!(frames[0]["type"], "inbox.hello");
    let digests = of_type(&frames, "inbox.update");
    assert_eq!(digests.len(), 1);
    assert_eq!(digests[0]["conversation_id"], h.conv.to_string());
    assert_eq!(digests[0]["unread_count"], 1);
    assert_eq!(digests[0]["last_message_preview"], "while you were out");

    // The sender's open thread learns the message reached a device.
    let ticks = alice.drain();
    assert_eq!(of_type(&ticks, "message.status")[0]["delivery_status"], 1);

    inbox.send(json!({"type": "ping"})).await;
    assert_eq!(inbox.drain(), vec![json!({"type": "pong"})]);

    // New messages reach the open inbox live.
    alice.send(json!({"type": "send", "body": "and another"})).await;
    let live = inbox.drain();
    assert_eq!(of_type(&live, "inbox.update")[0]["unread_count"], 2);
}
