#![allow(dead_code)]

use async_trait::async_trait;
use delivery_service::{
    config::Config,
    error::AppResult,
    middleware::auth::Identity,
    presence::InMemoryPresence,
    services::{PushNotification, PushNotifier},
    state::AppState,
    store::InMemoryStore,
    websocket::{
        BroadcastDispatcher, ConnectionHandle, ConnectionRegistry, ConversationSession,
        InboxSession, SessionHooks,
    },
};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

pub const JWT_SECRET: &str = "delivery-test-secret";

/// Push transport that remembers every hand-off.
#[derive(Default)]
pub struct RecordingPush {
    sent: Mutex<Vec<PushNotification>>,
}

impl RecordingPush {
    pub fn sent(&self) -> Vec<PushNotification> {
        self.sent.lock().unwrap().clone()
    }

    /// Pushes are spawned off the send path; give them a moment to land.
    pub async fn wait_for(&self, n: usize) -> Vec<PushNotification> {
        for _ in 0..50 {
            if self.sent.lock().unwrap().len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent()
    }
}

#[async_trait]
impl PushNotifier for RecordingPush {
    async fn notify(&self, notification: &PushNotification) -> AppResult<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<InMemoryStore>,
    pub presence: Arc<InMemoryPresence>,
    pub push: Arc<RecordingPush>,
    pub alice: Uuid,
    pub bob: Uuid,
    pub conv: Uuid,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(Config::in_memory(JWT_SECRET)).await
    }

    pub async fn with_config(config: Config) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let presence = Arc::new(InMemoryPresence::new());
        let push = Arc::new(RecordingPush::default());
        let dispatcher = BroadcastDispatcher::new(ConnectionRegistry::new());
        let state = AppState::new(
            config,
            store.clone(),
            presence.clone(),
            dispatcher,
            push.clone(),
        );

        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let conv = store.create_conversation(alice, bob).await;
        Self {
            state,
            store,
            presence,
            push,
            alice,
            bob,
            conv,
        }
    }

    /// Open a conversation socket for `user` and run its connect hook.
    pub async fn open(&self, user: Uuid) -> Client<ConversationSession> {
        let (handle, rx) = ConnectionHandle::new();
        let mut session =
            ConversationSession::new(self.state.clone(), Identity::user(user), self.conv, handle);
        session.on_connect().await.expect("connect");
        Client { session, rx }
    }

    pub async fn open_inbox(&self, user: Uuid) -> Client<InboxSession> {
        let (handle, rx) = ConnectionHandle::new();
        let mut session = InboxSession::new(self.state.clone(), Identity::user(user), handle);
        session.on_connect().await.expect("connect");
        Client { session, rx }
    }

    pub fn token(&self, user: Uuid) -> String {
        self.state
            .jwt
            .issue(Identity::user(user), 3600)
            .expect("issue token")
    }
}

/// A connected session plus the frames queued for its socket.
pub struct Client<S: SessionHooks> {
    pub session: S,
    pub rx: UnboundedReceiver<String>,
}

impl<S: SessionHooks> Client<S> {
    pub async fn send(&mut self, frame: Value) {
        self.session.on_frame(&frame.to_string()).await;
    }

    /// Every frame queued so far, parsed.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(raw) = self.rx.try_recv() {
            frames.push(serde_json::from_str(&raw).expect("frames are json"));
        }
        frames
    }

    pub async fn close(mut self) {
        self.session.on_disconnect().await;
    }
}

pub fn of_type<'a>(frames: &'a [Value], kind: &str) -> Vec<&'a Value> {
    frames.iter().filter(|f| f["type"] == kind).collect()
}
