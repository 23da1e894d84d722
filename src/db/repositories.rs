//! Repositories: messages, conversations, participants.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::{ChatStore, DbPool};
use crate::error::AppResult;
use crate::models::{ConversationId, Message, MessageId, UserId};

// ---- Messages ----

pub async fn message_insert(
    pool: &DbPool,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: &str,
) -> AppResult<Message> {
    let row = sqlx::query_as::<_, Message>(
        r#"
        INSERT INTO messages (conversation_id, sender_id, content)
        VALUES ($1, $2, $3)
        RETURNING id, conversation_id, sender_id, content, read, created_at
        "#,
    )
    .bind(conversation_id)
    .bind(sender_id)
    .bind(content)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn messages_mark_read(
    pool: &DbPool,
    message_ids: &[MessageId],
    conversation_id: ConversationId,
    reader: UserId,
) -> AppResult<Vec<MessageId>> {
    let rows = sqlx::query_as::<_, (MessageId,)>(
        r#"
        UPDATE messages
        SET read = true
        WHERE conversation_id = $1
          AND id = ANY($2)
          AND sender_id <> $3
          AND read = false
        RETURNING id
        "#,
    )
    .bind(conversation_id)
    .bind(message_ids)
    .bind(reader)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// ---- Conversations ----

#[derive(Debug, FromRow)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub listing_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn conversation_touch(pool: &DbPool, conversation_id: ConversationId) -> AppResult<()> {
    sqlx::query("UPDATE conversations SET updated_at = NOW() WHERE id = $1")
        .bind(conversation_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn conversation_get(
    pool: &DbPool,
    conversation_id: ConversationId,
) -> AppResult<Option<ConversationRow>> {
    let row = sqlx::query_as::<_, ConversationRow>(
        "SELECT id, listing_id, created_at, updated_at FROM conversations WHERE id = $1",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn conversation_participants(
    pool: &DbPool,
    conversation_id: ConversationId,
) -> AppResult<Vec<UserId>> {
    let rows = sqlx::query_as::<_, (UserId,)>(
        r#"
        SELECT user_id
        FROM conversation_participants
        WHERE conversation_id = $1
        ORDER BY user_id
        "#,
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// `ChatStore` backed by PostgreSQL.
#[derive(Clone)]
pub struct PgChatStore {
    pool: DbPool,
}

impl PgChatStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> AppResult<Message> {
        message_insert(&self.pool, conversation_id, sender_id, content).await
    }

    async fn touch_conversation(&self, conversation_id: ConversationId) -> AppResult<()> {
        conversation_touch(&self.pool, conversation_id).await
    }

    async fn mark_messages_read(
        &self,
        message_ids: &[MessageId],
        conversation_id: ConversationId,
        reader: UserId,
    ) -> AppResult<Vec<MessageId>> {
        messages_mark_read(&self.pool, message_ids, conversation_id, reader).await
    }

    async fn participants(&self, conversation_id: ConversationId) -> AppResult<Vec<UserId>> {
        if conversation_get(&self.pool, conversation_id).await?.is_none() {
            return Ok(Vec::new());
        }
        conversation_participants(&self.pool, conversation_id).await
    }
}
