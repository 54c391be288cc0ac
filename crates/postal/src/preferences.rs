//! Recipient preferences checked before delivery, and delivery receipts.
//!
//! Only user targets have preferences. A user may opt out of one kind or of
//! everything; kinds flagged critical reach them regardless.

use async_trait::async_trait;
use herald_common::error::AppError;
use sqlx::PgPool;

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Unknown kinds are not critical.
    async fn is_critical(&self, client_id: &str, kind_id: &str) -> Result<bool, AppError>;

    async fn is_globally_unsubscribed(&self, user_guid: &str) -> Result<bool, AppError>;

    async fn is_unsubscribed(
        &self,
        user_guid: &str,
        client_id: &str,
        kind_id: &str,
    ) -> Result<bool, AppError>;
}

#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Count one delivery of `kind_id` from `client_id` to `user_guid`.
    async fn record(
        &self,
        user_guid: &str,
        client_id: &str,
        kind_id: &str,
    ) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct PgPreferenceStore {
    pool: PgPool,
}

impl PgPreferenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferenceStore for PgPreferenceStore {
    async fn is_critical(&self, client_id: &str, kind_id: &str) -> Result<bool, AppError> {
        let critical: Option<(bool,)> =
            sqlx::query_as("SELECT critical FROM kinds WHERE id = $1 AND client_id = $2")
                .bind(kind_id)
                .bind(client_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(critical.is_some_and(|(critical,)| critical))
    }

    async fn is_globally_unsubscribed(&self, user_guid: &str) -> Result<bool, AppError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM global_unsubscribes WHERE user_id = $1)",
        )
        .bind(user_guid)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn is_unsubscribed(
        &self,
        user_guid: &str,
        client_id: &str,
        kind_id: &str,
    ) -> Result<bool, AppError> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM unsubscribes
                WHERE user_id = $1 AND client_id = $2 AND kind_id = $3
            )
            "#,
        )
        .bind(user_guid)
        .bind(client_id)
        .bind(kind_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}

#[derive(Clone)]
pub struct PgReceiptStore {
    pool: PgPool,
}

impl PgReceiptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReceiptStore for PgReceiptStore {
    async fn record(
        &self,
        user_guid: &str,
        client_id: &str,
        kind_id: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO receipts (user_guid, client_id, kind_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_guid, client_id, kind_id)
            DO UPDATE SET count = receipts.count + 1, updated_at = NOW()
            "#,
        )
        .bind(user_guid)
        .bind(client_id)
        .bind(kind_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
