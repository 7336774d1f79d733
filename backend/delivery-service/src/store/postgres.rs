use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{dedup_preserving_order, ConversationDirectory, MessageRepository, ReadMarkerRepository};
use crate::error::AppResult;
use crate::middleware::auth::Identity;
use crate::models::{
    ConversationMute, DeliveryStatus, HistoryQuery, InsertOutcome, Message, NewMessage,
    ReadMarker, StatusChange,
};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, body, attachment_name, \
    attachment_mime, attachment_size, client_id, delivery_status, delivered_at, read_at, created_at";

/// sqlx-backed implementation of every repository seam.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct PromotedRow {
    id: i64,
    read_at: Option<DateTime<Utc>>,
}

impl From<PromotedRow> for StatusChange {
    fn from(row: PromotedRow) -> Self {
        StatusChange {
            id: row.id,
            delivery_status: DeliveryStatus::Read,
            read_at: row.read_at,
        }
    }
}

#[async_trait]
impl MessageRepository for PgStore {
    async fn insert_message(&self, new: NewMessage) -> AppResult<InsertOutcome> {
        let attachment = new.attachment.unwrap_or_default();
        let sql = format!(
            r#"
            INSERT INTO messages (
                conversation_id, sender_id, body, attachment_name, attachment_mime,
                attachment_size, client_id, delivery_status, delivered_at, created_at
            )
            VALUES ($1, $2, $3, NULLIF($4, ''), $5, $6, $7, 1, $8, $8)
            ON CONFLICT (conversation_id, client_id) WHERE client_id IS NOT NULL DO NOTHING
            RETURNING {MESSAGE_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, Message>(&sql)
            .bind(new.conversation_id)
            .bind(new.sender_id)
            .bind(&new.body)
            .bind(&attachment.name)
            .bind(&attachment.mime)
            .bind(attachment.size)
            .bind(&new.client_id)
            .bind(new.created_at)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(message) = inserted {
            return Ok(InsertOutcome::Inserted(message));
        }

        // Conflict: the retried send already landed.
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 AND client_id = $2"
        );
        let existing = sqlx::query_as::<_, Message>(&sql)
            .bind(new.conversation_id)
            .bind(&new.client_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(InsertOutcome::Duplicate(existing))
    }

    async fn get_message(&self, id: i64) -> AppResult<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
        Ok(sqlx::query_as::<_, Message>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn promote_read(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        up_to: i64,
        limit: Option<i64>,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<StatusChange>> {
        let mut rows = sqlx::query_as::<_, PromotedRow>(
            r#"
            UPDATE messages
            SET delivery_status = 2,
                read_at = COALESCE(read_at, $5),
                delivered_at = COALESCE(delivered_at, $5)
            WHERE id IN (
                SELECT id FROM messages
                WHERE conversation_id = $1
                  AND sender_id <> $2
                  AND id <= $3
                  AND delivery_status < 2
                ORDER BY id
                LIMIT $4
            )
            AND delivery_status < 2
            RETURNING id, read_at
            "#,
        )
        .bind(conversation_id)
        .bind(reader_id)
        .bind(up_to)
        .bind(limit)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        rows.sort_by_key(|r| r.id);
        Ok(rows.into_iter().map(StatusChange::from).collect())
    }

    async fn count_promotable(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        up_to: i64,
    ) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE conversation_id = $1 AND sender_id <> $2 AND id <= $3 AND delivery_status < 2
            "#,
        )
        .bind(conversation_id)
        .bind(reader_id)
        .bind(up_to)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn mark_delivered(
        &self,
        conversation_id: Uuid,
        recipient_id: Uuid,
        limit: i64,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<i64>> {
        let mut ids: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE messages
            SET delivered_at = $4,
                delivery_status = GREATEST(delivery_status, 1)
            WHERE id IN (
                SELECT id FROM messages
                WHERE conversation_id = $1
                  AND sender_id <> $2
                  AND delivered_at IS NULL
                ORDER BY id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            AND delivered_at IS NULL
            RETURNING id
            "#,
        )
        .bind(conversation_id)
        .bind(recipient_id)
        .bind(limit)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        ids.sort_unstable();
        Ok(ids)
    }

    async fn max_message_id(&self, conversation_id: Uuid) -> AppResult<Option<i64>> {
        Ok(
            sqlx::query_scalar("SELECT MAX(id) FROM messages WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn latest_inbound_id(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<i64>> {
        Ok(sqlx::query_scalar(
            "SELECT MAX(id) FROM messages WHERE conversation_id = $1 AND sender_id <> $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn last_message(&self, conversation_id: Uuid) -> AppResult<Option<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 ORDER BY id DESC LIMIT 1"
        );
        Ok(sqlx::query_as::<_, Message>(&sql)
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn history(&self, conversation_id: Uuid, query: HistoryQuery) -> AppResult<Vec<Message>> {
        let mut rows = match (query.after, query.before) {
            (Some(after), _) => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE conversation_id = $1 AND id > $2 ORDER BY id ASC LIMIT $3"
                );
                return Ok(sqlx::query_as::<_, Message>(&sql)
                    .bind(conversation_id)
                    .bind(after)
                    .bind(query.limit)
                    .fetch_all(&self.pool)
                    .await?);
            }
            (None, Some(before)) => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE conversation_id = $1 AND id < $2 ORDER BY id DESC LIMIT $3"
                );
                sqlx::query_as::<_, Message>(&sql)
                    .bind(conversation_id)
                    .bind(before)
                    .bind(query.limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, None) => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE conversation_id = $1 ORDER BY id DESC LIMIT $2"
                );
                sqlx::query_as::<_, Message>(&sql)
                    .bind(conversation_id)
                    .bind(query.limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.reverse();
        Ok(rows)
    }

    async fn unread_counts(
        &self,
        user_id: Uuid,
        conversation_ids: &[Uuid],
    ) -> AppResult<Vec<(Uuid, i64)>> {
        if conversation_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(sqlx::query_as::<_, (Uuid, i64)>(
            r#"
            SELECT m.conversation_id, COUNT(*)
            FROM messages m
            LEFT JOIN conversation_read_markers r
              ON r.conversation_id = m.conversation_id AND r.user_id = $1
            WHERE m.conversation_id = ANY($2)
              AND m.sender_id <> $1
              AND m.id > COALESCE(r.last_read_message_id, 0)
            GROUP BY m.conversation_id
            "#,
        )
        .bind(user_id)
        .bind(conversation_ids)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl ReadMarkerRepository for PgStore {
    async fn read_marker(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<Option<i64>> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT last_read_message_id FROM conversation_read_markers
            WHERE conversation_id = $1 AND user_id = $2
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn advance_read_marker(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        last_read_id: i64,
    ) -> AppResult<i64> {
        Ok(sqlx::query_scalar(
            r#"
            INSERT INTO conversation_read_markers (conversation_id, user_id, last_read_message_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (conversation_id, user_id) DO UPDATE
            SET last_read_message_id = GREATEST(
                    conversation_read_markers.last_read_message_id,
                    EXCLUDED.last_read_message_id
                ),
                updated_at = CASE
                    WHEN EXCLUDED.last_read_message_id > conversation_read_markers.last_read_message_id
                    THEN NOW()
                    ELSE conversation_read_markers.updated_at
                END
            RETURNING last_read_message_id
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(last_read_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn markers_for_conversation(&self, conversation_id: Uuid) -> AppResult<Vec<ReadMarker>> {
        Ok(sqlx::query_as::<_, ReadMarker>(
            r#"
            SELECT conversation_id, user_id, last_read_message_id, updated_at
            FROM conversation_read_markers
            WHERE conversation_id = $1
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_markers(&self, conversation_id: Option<Uuid>) -> AppResult<Vec<ReadMarker>> {
        Ok(sqlx::query_as::<_, ReadMarker>(
            r#"
            SELECT conversation_id, user_id, last_read_message_id, updated_at
            FROM conversation_read_markers
            WHERE last_read_message_id > 0
              AND ($1::uuid IS NULL OR conversation_id = $1)
            ORDER BY conversation_id, user_id
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl ConversationDirectory for PgStore {
    async fn conversation_exists(&self, conversation_id: Uuid) -> AppResult<bool> {
        Ok(
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM conversations WHERE id = $1)")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn is_authorized(&self, conversation_id: Uuid, identity: &Identity) -> AppResult<bool> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM conversations c
                WHERE c.id = $1 AND (c.user_a = $2 OR c.user_b = $2)
            )
            OR EXISTS (
                SELECT 1 FROM conversation_members cm
                WHERE cm.conversation_id = $1 AND cm.member_user_id = $2
            )
            OR EXISTS (
                SELECT 1 FROM conversation_members cm
                JOIN team_members t ON t.id = cm.member_team_id
                WHERE cm.conversation_id = $1
                  AND cm.member_team_id = $3
                  AND t.is_active
            )
            "#,
        )
        .bind(conversation_id)
        .bind(identity.user_id)
        .bind(identity.team_member_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn viewer_ids(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        let (user_a, user_b): (Uuid, Uuid) =
            sqlx::query_as("SELECT user_a, user_b FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await?;

        let extras: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT COALESCE(cm.member_user_id, t.owner_id)
            FROM conversation_members cm
            LEFT JOIN team_members t ON t.id = cm.member_team_id AND t.is_active
            WHERE cm.conversation_id = $1
              AND COALESCE(cm.member_user_id, t.owner_id) IS NOT NULL
            ORDER BY cm.id
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(dedup_preserving_order(
            [user_a, user_b].into_iter().chain(extras),
        ))
    }

    async fn conversations_for(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT id FROM conversations WHERE user_a = $1 OR user_b = $1
            UNION
            SELECT conversation_id FROM conversation_members WHERE member_user_id = $1
            UNION
            SELECT cm.conversation_id
            FROM conversation_members cm
            JOIN team_members t ON t.id = cm.member_team_id AND t.is_active
            WHERE t.owner_id = $1
            ORDER BY 1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn record_last_message(
        &self,
        conversation_id: Uuid,
        at: DateTime<Utc>,
        preview: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message_at = $2, last_message_preview = $3
            WHERE id = $1 AND (last_message_at IS NULL OR last_message_at <= $2)
            "#,
        )
        .bind(conversation_id)
        .bind(at)
        .bind(preview)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mute(&self, mute: ConversationMute) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_mutes (conversation_id, user_id, muted_until)
            VALUES ($1, $2, $3)
            ON CONFLICT (conversation_id, user_id) DO UPDATE SET muted_until = EXCLUDED.muted_until
            "#,
        )
        .bind(mute.conversation_id)
        .bind(mute.user_id)
        .bind(mute.muted_until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unmute(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM conversation_mutes WHERE conversation_id = $1 AND user_id = $2")
            .bind(conversation_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn muted_users(
        &self,
        conversation_id: Uuid,
        user_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> AppResult<Vec<Uuid>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(sqlx::query_scalar(
            r#"
            SELECT user_id FROM conversation_mutes
            WHERE conversation_id = $1
              AND user_id = ANY($2)
              AND (muted_until IS NULL OR muted_until > $3)
            "#,
        )
        .bind(conversation_id)
        .bind(user_ids)
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }
}
