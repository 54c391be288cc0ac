//! Durable job queue with exclusive, time-bounded leases.
//!
//! A job is reservable when it is due (`available_at <= now`) and nobody
//! holds a live lease on it. Reservation stamps `reserved_by` and
//! `reserved_until`; a lease that runs out without an ack makes the job
//! reservable again, so a crashed worker never strands work. Ack, renew and
//! requeue only take effect for the worker that still holds the lease.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::error::AppError;
use herald_common::types::{NotificationOptions, Recipient};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Identity of one delivery worker, unique across all instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a worker needs to deliver to one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub message_id: Uuid,
    /// The recipient the client addressed (user, space, org or e-mail).
    pub origin: Recipient,
    /// The expanded mail target: a user or an e-mail address.
    pub target: Recipient,
    pub options: NotificationOptions,
    /// The dispatching client's token, sealed by the cryptographer.
    pub encrypted_token: String,
}

/// A queued [`Delivery`] plus its lease and retry bookkeeping.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    #[sqlx(json)]
    pub payload: Delivery,
    pub reserved_by: Option<i64>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub reserved_until: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn is_reserved_by(&self, worker: WorkerId) -> bool {
        self.reserved_by == Some(i64::from(worker.0))
    }
}

/// Result of handing a job back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Back in the queue, reservable again at `available_at`.
    Scheduled {
        retry_count: i32,
        available_at: DateTime<Utc>,
    },
    /// Retry budget spent; the job was removed.
    Exhausted,
    /// The caller no longer held the lease; nothing changed.
    LeaseLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub lease: Duration,
    /// A job is discarded once it would need retry number `max_retries + 1`.
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(120),
            max_retries: 10,
        }
    }
}

/// Exponential backoff: `min(base * 2^retry_count, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay(&self, retry_count: i32) -> Duration {
        let exponent = u32::try_from(retry_count.max(0)).unwrap_or(0).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(6 * 60 * 60))
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, delivery: Delivery) -> Result<Job, AppError>;

    /// Claim the oldest reservable job for `worker`, if any.
    async fn reserve(&self, worker: WorkerId) -> Result<Option<Job>, AppError>;

    /// Push the lease out by another full lease period. `false` when the
    /// lease was already lost.
    async fn renew(&self, job: &Job) -> Result<bool, AppError>;

    /// Remove a finished job. `false` when the lease was already lost.
    async fn ack(&self, job: &Job) -> Result<bool, AppError>;

    /// Release the lease and schedule the job `backoff` from now, or drop it
    /// once its retries are spent.
    async fn requeue(&self, job: &Job, backoff: Duration) -> Result<RequeueOutcome, AppError>;

    /// Number of jobs in the queue, leased or not.
    async fn len(&self) -> Result<i64, AppError>;
}

/// Log the queue length every `interval`. Runs until the task is cancelled.
pub async fn report_length(queue: Arc<dyn JobQueue>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match queue.len().await {
            Ok(length) => tracing::info!(queue_length = length, "Queue length"),
            Err(e) => tracing::warn!(error = %e, "Failed to read queue length"),
        }
    }
}

/// PostgreSQL-backed queue. Reservation uses `FOR UPDATE SKIP LOCKED` so
/// concurrent workers never claim the same row.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    config: QueueConfig,
}

impl PgQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    fn lease_secs(&self) -> f64 {
        self.config.lease.as_secs_f64()
    }
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn enqueue(&self, delivery: Delivery) -> Result<Job, AppError> {
        let job: Job = sqlx::query_as(
            r#"
            INSERT INTO jobs (id, payload)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(sqlx::types::Json(&delivery))
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(job_id = %job.id, message_id = %delivery.message_id, "Job enqueued");
        Ok(job)
    }

    async fn reserve(&self, worker: WorkerId) -> Result<Option<Job>, AppError> {
        let job: Option<Job> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET reserved_by = $1,
                reserved_at = NOW(),
                reserved_until = NOW() + make_interval(secs => $2)
            WHERE id = (
                SELECT id FROM jobs
                WHERE available_at <= NOW()
                  AND (reserved_until IS NULL OR reserved_until < NOW())
                ORDER BY available_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(i64::from(worker.0))
        .bind(self.lease_secs())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &job {
            tracing::debug!(
                job_id = %job.id,
                worker_id = %worker,
                retry_count = job.retry_count,
                "Job reserved"
            );
        }
        Ok(job)
    }

    async fn renew(&self, job: &Job) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET reserved_until = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND reserved_by = $2 AND reserved_until >= NOW()
            "#,
        )
        .bind(job.id)
        .bind(job.reserved_by)
        .bind(self.lease_secs())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ack(&self, job: &Job) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND reserved_by = $2")
            .bind(job.id)
            .bind(job.reserved_by)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn requeue(&self, job: &Job, backoff: Duration) -> Result<RequeueOutcome, AppError> {
        let max_retries = i32::try_from(self.config.max_retries).unwrap_or(i32::MAX);

        if job.retry_count >= max_retries {
            let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND reserved_by = $2")
                .bind(job.id)
                .bind(job.reserved_by)
                .execute(&self.pool)
                .await?;

            return Ok(if result.rows_affected() > 0 {
                RequeueOutcome::Exhausted
            } else {
                RequeueOutcome::LeaseLost
            });
        }

        let row: Option<(i32, DateTime<Utc>)> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET retry_count = retry_count + 1,
                reserved_by = NULL,
                reserved_at = NULL,
                reserved_until = NULL,
                available_at = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND reserved_by = $2
            RETURNING retry_count, available_at
            "#,
        )
        .bind(job.id)
        .bind(job.reserved_by)
        .bind(backoff.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((retry_count, available_at)) => RequeueOutcome::Scheduled {
                retry_count,
                available_at,
            },
            None => RequeueOutcome::LeaseLost,
        })
    }

    async fn len(&self) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
