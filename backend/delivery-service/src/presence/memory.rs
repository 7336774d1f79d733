use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ConnectionId, GroupKey, PresenceRegistry};
use crate::error::AppResult;

/// Process-local presence counters.
#[derive(Default, Clone)]
pub struct InMemoryPresence {
    inner: Arc<RwLock<HashMap<GroupKey, HashSet<ConnectionId>>>>,
}

impl InMemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups with at least one connection (for debugging/metrics).
    pub async fn group_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[async_trait]
impl PresenceRegistry for InMemoryPresence {
    async fn join(&self, group: GroupKey, connection: ConnectionId) -> AppResult<usize> {
        let mut guard = self.inner.write().await;
        let members = guard.entry(group).or_default();
        members.insert(connection);
        Ok(members.len())
    }

    async fn leave(&self, group: GroupKey, connection: ConnectionId) -> AppResult<usize> {
        let mut guard = self.inner.write().await;
        let remaining = match guard.get_mut(&group) {
            Some(members) => {
                members.remove(&connection);
                members.len()
            }
            None => return Ok(0),
        };
        if remaining == 0 {
            guard.remove(&group);
        }
        Ok(remaining)
    }

    async fn count(&self, group: GroupKey) -> AppResult<usize> {
        let guard = self.inner.read().await;
        Ok(guard.get(&group).map(HashSet::len).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn join_leave_count() {
        let presence = InMemoryPresence::new();
        let group = GroupKey::Conversation(Uuid::new_v4());
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();

        assert_eq!(presence.join(group, c1).await.unwrap(), 1);
        assert_eq!(presence.join(group, c2).await.unwrap(), 2);
        // Re-joining the same connection does not double count.
        assert_eq!(presence.join(group, c2).await.unwrap(), 2);
        assert_eq!(presence.leave(group, c1).await.unwrap(), 1);
        assert_eq!(presence.count(group).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_groups_are_freed() {
        let presence = InMemoryPresence::new();
        let group = GroupKey::Inbox(Uuid::new_v4());
        let conn = ConnectionId::new();

        presence.join(group, conn).await.unwrap();
        assert_eq!(presence.group_count().await, 1);
        assert_eq!(presence.leave(group, conn).await.unwrap(), 0);
        assert_eq!(presence.group_count().await, 0);
        // Leaving again is harmless.
        assert_eq!(presence.leave(group, conn).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_joins_and_leaves_settle_to_zero() {
        let presence = InMemoryPresence::new();
        let group = GroupKey::Conversation(Uuid::new_v4());

        let mut handles = Vec::new();
        for _ in 0..64 {
            let presence = presence.clone();
            handles.push(tokio::spawn(async move {
                let conn = ConnectionId::new();
                presence.join(group, conn).await.unwrap();
                tokio::task::yield_now().await;
                presence.leave(group, conn).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(presence.count(group).await.unwrap(), 0);
    }
}
