use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;

use super::{ConnectionId, GroupKey, PresenceRegistry};
use crate::error::AppResult;

/// Presence shared across instances.
///
/// Each group is a sorted set `presence:{group}` of connection ids scored by
/// last-seen unix time. Entries older than `ttl_secs` are ignored and pruned,
/// so connections of a crashed instance age out on their own.
#[derive(Clone)]
pub struct RedisPresence {
    conn: ConnectionManager,
    ttl_secs: i64,
}

impl RedisPresence {
    pub fn new(conn: ConnectionManager, ttl_secs: u64) -> Self {
        Self {
            conn,
            ttl_secs: ttl_secs.max(1) as i64,
        }
    }

    pub async fn connect(redis_url: &str, ttl_secs: u64) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn, ttl_secs))
    }

    fn key(group: GroupKey) -> String {
        format!("presence:{group}")
    }

    fn cutoff(&self) -> i64 {
        Utc::now().timestamp() - self.ttl_secs
    }

    async fn touch(&self, group: GroupKey, connection: ConnectionId) -> AppResult<usize> {
        let key = Self::key(group);
        let now = Utc::now().timestamp();
        let mut conn = self.conn.clone();

        let (count,): (usize,) = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&key)
            .arg(now)
            .arg(connection.to_string())
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(self.cutoff())
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs * 2)
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl PresenceRegistry for RedisPresence {
    async fn join(&self, group: GroupKey, connection: ConnectionId) -> AppResult<usize> {
        let count = self.touch(group, connection).await?;
        tracing::debug!(group = %group, connection_id = %connection, count, "presence join");
        Ok(count)
    }

    async fn leave(&self, group: GroupKey, connection: ConnectionId) -> AppResult<usize> {
        let key = Self::key(group);
        let mut conn = self.conn.clone();

        let (count,): (usize,) = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(&key)
            .arg(connection.to_string())
            .ignore()
            .cmd("ZCOUNT")
            .arg(&key)
            .arg(self.cutoff())
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        tracing::debug!(group = %group, connection_id = %connection, count, "presence leave");
        Ok(count)
    }

    async fn count(&self, group: GroupKey) -> AppResult<usize> {
        let mut conn = self.conn.clone();
        let count: usize = redis::cmd("ZCOUNT")
            .arg(Self::key(group))
            .arg(self.cutoff())
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn refresh(&self, group: GroupKey, connection: ConnectionId) -> AppResult<()> {
        self.touch(group, connection).await.map(|_| ())
    }
}
