//! Presence: who is connected to which fan-out group right now.
//!
//! Counts only; no persistence. The in-memory backend is correct for a
//! single process, the Redis backend shares counts across instances.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppResult;

pub mod memory;
pub mod redis;

pub use self::memory::InMemoryPresence;
pub use self::redis::RedisPresence;

/// Identifier of one live socket. Globally unique so it can live in a shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Fan-out scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKey {
    /// Everyone with thread `C` open: `conv:C`.
    Conversation(Uuid),
    /// Connections of one user inside thread `C`: `conv:C:user:U`.
    /// Only used to answer "is user U present in C".
    ConversationUser(Uuid, Uuid),
    /// A user's inbox sockets: `user:U`.
    Inbox(Uuid),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Conversation(c) => write!(f, "conv:{c}"),
            GroupKey::ConversationUser(c, u) => write!(f, "conv:{c}:user:{u}"),
            GroupKey::Inbox(u) => write!(f, "user:{u}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid group key: {0}")]
pub struct InvalidGroupKey(String);

impl FromStr for GroupKey {
    type Err = InvalidGroupKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidGroupKey(s.to_string());
        let parse = |v: &str| Uuid::parse_str(v).map_err(|_| invalid());

        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            ["conv", c] => Ok(GroupKey::Conversation(parse(c)?)),
            ["conv", c, "user", u] => Ok(GroupKey::ConversationUser(parse(c)?, parse(u)?)),
            ["user", u] => Ok(GroupKey::Inbox(parse(u)?)),
            _ => Err(invalid()),
        }
    }
}

#[async_trait]
pub trait PresenceRegistry: Send + Sync {
    /// Add `connection` to `group`; returns the new count.
    async fn join(&self, group: GroupKey, connection: ConnectionId) -> AppResult<usize>;

    /// Remove `connection` from `group`; returns the remaining count.
    /// Leaving a group you never joined is a no-op.
    async fn leave(&self, group: GroupKey, connection: ConnectionId) -> AppResult<usize>;

    async fn count(&self, group: GroupKey) -> AppResult<usize>;

    /// Keep-alive from the heartbeat tick.
    async fn refresh(&self, _group: GroupKey, _connection: ConnectionId) -> AppResult<()> {
        Ok(())
    }
}

/// True when someone other than `user_id` has conversation `conversation_id` open.
pub async fn peer_present(
    presence: &dyn PresenceRegistry,
    conversation_id: Uuid,
    user_id: Uuid,
) -> AppResult<bool> {
    let everyone = presence
        .count(GroupKey::Conversation(conversation_id))
        .await?;
    let own = presence
        .count(GroupKey::ConversationUser(conversation_id, user_id))
        .await?;
    Ok(everyone > own)
}

pub async fn user_present(
    presence: &dyn PresenceRegistry,
    conversation_id: Uuid,
    user_id: Uuid,
) -> AppResult<bool> {
    Ok(presence
        .count(GroupKey::ConversationUser(conversation_id, user_id))
        .await?
        > 0)
}
