//! Per-connection state machines.
//!
//! A session is `Connecting` until `on_connect` succeeds, `Open` while it
//! takes frames, and `Closed` after `on_disconnect`. The transport drives the
//! hooks; nothing here depends on the socket library.

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message_types::{ConversationFrame, InboxFrame};
use super::{ConnectionHandle, ServerEvent};
use crate::error::{AppError, AppResult};
use crate::middleware::auth::Identity;
use crate::presence::{self, GroupKey};
use crate::services::delivery::{Draft, ReadTrigger};
use crate::services::push::spawn_pushes;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

#[async_trait]
pub trait SessionHooks: Send {
    /// Channel label for logs and metrics.
    fn channel(&self) -> &'static str;

    fn state(&self) -> SessionState;

    /// Authorize, register and run catch-up. An error means the socket must
    /// be closed with a policy violation.
    async fn on_connect(&mut self) -> AppResult<()>;

    async fn on_frame(&mut self, text: &str);

    async fn on_heartbeat(&mut self);

    /// Idempotent.
    async fn on_disconnect(&mut self);
}

/// Shared join/leave bookkeeping for both socket kinds.
struct Membership {
    handle: ConnectionHandle,
    joined: Vec<GroupKey>,
}

impl Membership {
    fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            joined: Vec::new(),
        }
    }

    /// Join presence groups; on failure, undo the ones already joined.
    async fn join(&mut self, app: &AppState, groups: &[GroupKey]) -> AppResult<()> {
        for group in groups {
            if let Err(e) = app.presence.join(*group, self.handle.id).await {
                self.leave_all(app).await;
                return Err(e);
            }
            self.joined.push(*group);
        }
        Ok(())
    }

    async fn refresh(&self, app: &AppState) {
        for group in &self.joined {
            if let Err(e) = app.presence.refresh(*group, self.handle.id).await {
                warn!(group = %group, error = %e, "presence refresh failed");
            }
        }
    }

    async fn leave_all(&mut self, app: &AppState) {
        for group in self.joined.drain(..) {
            if let Err(e) = app.presence.leave(group, self.handle.id).await {
                warn!(group = %group, error = %e, "presence leave failed");
            }
        }
    }
}

pub struct ConversationSession {
    app: AppState,
    identity: Identity,
    conversation_id: Uuid,
    membership: Membership,
    state: SessionState,
}

impl ConversationSession {
    pub fn new(
        app: AppState,
        identity: Identity,
        conversation_id: Uuid,
        handle: ConnectionHandle,
    ) -> Self {
        Self {
            app,
            identity,
            conversation_id,
            membership: Membership::new(handle),
            state: SessionState::Connecting,
        }
    }

    fn user_id(&self) -> Uuid {
        self.identity.user_id
    }

    async fn handle_send(&self, draft: Draft) {
        match self
            .app
            .delivery
            .send(self.conversation_id, self.user_id(), draft)
            .await
        {
            Ok(outcome) if outcome.duplicate => {
                self.membership
                    .handle
                    .send(&ServerEvent::chat_message(&outcome.message));
            }
            Ok(outcome) => {
                self.app.dispatcher.dispatch(outcome.events).await;
                spawn_pushes(self.app.push.clone(), outcome.pushes);
            }
            Err(AppError::BadRequest(reason)) => {
                debug!(reason = %reason, "ignoring empty send");
            }
            Err(e) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    user_id = %self.user_id(),
                    error = %e,
                    "send failed"
                );
                self.membership.handle.send(&ServerEvent::Error {
                    code: "send_failed".into(),
                    detail: "message could not be saved".into(),
                });
            }
        }
    }

    async fn handle_read(&self, up_to: Option<i64>, trigger: ReadTrigger) {
        match self
            .app
            .delivery
            .mark_read(self.conversation_id, self.user_id(), up_to, trigger)
            .await
        {
            Ok(outcome) => self.app.dispatcher.dispatch(outcome.events).await,
            Err(e) => warn!(
                conversation_id = %self.conversation_id,
                user_id = %self.user_id(),
                error = %e,
                "read promotion failed"
            ),
        }
    }
}

#[async_trait]
impl SessionHooks for ConversationSession {
    fn channel(&self) -> &'static str {
        "conversation"
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn on_connect(&mut self) -> AppResult<()> {
        if self.state != SessionState::Connecting {
            return Ok(());
        }
        let (conversation_id, user_id) = (self.conversation_id, self.user_id());
        self.app
            .delivery
            .authorize(conversation_id, &self.identity)
            .await?;

        self.membership
            .join(
                &self.app,
                &[
                    GroupKey::Conversation(conversation_id),
                    GroupKey::ConversationUser(conversation_id, user_id),
                ],
            )
            .await?;
        self.app
            .dispatcher
            .registry()
            .register(GroupKey::Conversation(conversation_id), &self.membership.handle)
            .await;
        self.state = SessionState::Open;
        crate::metrics::ws_connected(self.channel());
        info!(
            conversation_id = %conversation_id,
            user_id = %user_id,
            connection_id = %self.membership.handle.id,
            "conversation socket open"
        );

        match self
            .app
            .delivery
            .catch_up_conversation(conversation_id, user_id)
            .await
        {
            Ok(caught) => self.app.dispatcher.dispatch(caught.events).await,
            Err(e) => warn!(conversation_id = %conversation_id, error = %e, "catch-up failed"),
        }

        // Opening the thread reads it only while the peer is looking too.
        match presence::peer_present(self.app.presence.as_ref(), conversation_id, user_id).await {
            Ok(true) => self.handle_read(None, ReadTrigger::Open).await,
            Ok(false) => {}
            Err(e) => warn!(conversation_id = %conversation_id, error = %e, "peer presence lookup failed"),
        }
        Ok(())
    }

    async fn on_frame(&mut self, text: &str) {
        if self.state != SessionState::Open {
            return;
        }
        let Some(frame) = ConversationFrame::parse(text) else {
            debug!(conversation_id = %self.conversation_id, "ignoring unsupported frame");
            return;
        };

        match frame {
            ConversationFrame::Send { body, client_id } => {
                self.handle_send(Draft {
                    body,
                    client_id,
                    attachment: None,
                })
                .await
            }
            ConversationFrame::Typing { state } => {
                let typing = self
                    .app
                    .delivery
                    .typing(self.conversation_id, self.user_id(), state.as_deref());
                self.app.dispatcher.dispatch(vec![typing]).await;
            }
            ConversationFrame::Read { last_read_id } => {
                self.handle_read(last_read_id, ReadTrigger::Explicit).await
            }
            ConversationFrame::Ping => {
                self.membership.handle.send(&ServerEvent::Pong);
            }
        }
    }

    async fn on_heartbeat(&mut self) {
        self.membership.refresh(&self.app).await;
    }

    async fn on_disconnect(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.app
            .dispatcher
            .registry()
            .unregister(
                GroupKey::Conversation(self.conversation_id),
                self.membership.handle.id,
            )
            .await;
        self.membership.leave_all(&self.app).await;
        if self.state == SessionState::Open {
            crate::metrics::ws_disconnected(self.channel());
        }
        self.state = SessionState::Closed;
        info!(
            conversation_id = %self.conversation_id,
            user_id = %self.user_id(),
            connection_id = %self.membership.handle.id,
            "conversation socket closed"
        );
    }
}

pub struct InboxSession {
    app: AppState,
    identity: Identity,
    membership: Membership,
    state: SessionState,
}

impl InboxSession {
    pub fn new(app: AppState, identity: Identity, handle: ConnectionHandle) -> Self {
        Self {
            app,
            identity,
            membership: Membership::new(handle),
            state: SessionState::Connecting,
        }
    }

    fn group(&self) -> GroupKey {
        GroupKey::Inbox(self.identity.user_id)
    }
}

#[async_trait]
impl SessionHooks for InboxSession {
    fn channel(&self) -> &'static str {
        "inbox"
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn on_connect(&mut self) -> AppResult<()> {
        if self.state != SessionState::Connecting {
            return Ok(());
        }
        let user_id = self.identity.user_id;
        self.membership.join(&self.app, &[self.group()]).await?;
        self.app
            .dispatcher
            .registry()
            .register(self.group(), &self.membership.handle)
            .await;
        self.state = SessionState::Open;
        crate::metrics::ws_connected(self.channel());
        info!(user_id = %user_id, connection_id = %self.membership.handle.id, "inbox socket open");

        self.membership.handle.send(&ServerEvent::InboxHello);

        match self.app.delivery.catch_up_inbox(user_id).await {
            Ok(caught) => {
                // One consolidated refresh for this socket only.
                for digest in &caught.digests {
                    self.membership.handle.send(digest);
                }
                self.app.dispatcher.dispatch(caught.events).await;
            }
            Err(e) => warn!(user_id = %user_id, error = %e, "inbox catch-up failed"),
        }
        Ok(())
    }

    async fn on_frame(&mut self, text: &str) {
        if self.state != SessionState::Open {
            return;
        }
        match InboxFrame::parse(text) {
            Some(InboxFrame::Ping) => {
                self.membership.handle.send(&ServerEvent::Pong);
            }
            None => debug!(user_id = %self.identity.user_id, "ignoring inbox frame"),
        }
    }

    async fn on_heartbeat(&mut self) {
        self.membership.refresh(&self.app).await;
    }

    async fn on_disconnect(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.app
            .dispatcher
            .registry()
            .unregister(self.group(), self.membership.handle.id)
            .await;
        self.membership.leave_all(&self.app).await;
        if self.state == SessionState::Open {
            crate::metrics::ws_disconnected(self.channel());
        }
        self.state = SessionState::Closed;
        info!(user_id = %self.identity.user_id, "inbox socket closed");
    }
}
