//! Per-recipient delivery status records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::error::AppError;
use herald_common::types::{Message, MessageStatus, RecipientKind};
use sqlx::PgPool;
use uuid::Uuid;

/// Fields needed to record a new message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub recipient: String,
    pub recipient_kind: RecipientKind,
    pub client_id: String,
    pub kind_id: String,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Record a message in `queued` status.
    async fn create(&self, message: NewMessage) -> Result<Message, AppError>;

    /// `false` when the message no longer exists.
    async fn update_status(&self, id: Uuid, status: MessageStatus) -> Result<bool, AppError>;

    /// Delete every message created strictly before `cutoff`; returns the
    /// number removed.
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError>;
}

#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create(&self, message: NewMessage) -> Result<Message, AppError> {
        let created: Message = sqlx::query_as(
            r#"
            INSERT INTO messages (id, recipient, recipient_kind, client_id, kind_id, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&message.recipient)
        .bind(message.recipient_kind)
        .bind(&message.client_id)
        .bind(&message.kind_id)
        .bind(MessageStatus::Queued)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn update_status(&self, id: Uuid, status: MessageStatus) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE messages SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM messages WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
