//! In-memory stores with the same semantics as the Postgres ones, for
//! exercising the courier, workers and GC without a database.
//!
//! [`MemoryQueue`] runs on its own clock so lease expiry and backoff can be
//! tested by calling [`MemoryQueue::advance`] instead of sleeping.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::error::AppError;
use herald_common::types::{Message, MessageStatus};
use uuid::Uuid;

use crate::messages::{MessageStore, NewMessage};
use crate::preferences::{PreferenceStore, ReceiptStore};
use crate::queue::{Delivery, Job, JobQueue, QueueConfig, RequeueOutcome, WorkerId};
use crate::templates::{StoredTemplate, TemplateStore};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, AppError> {
    mutex
        .lock()
        .map_err(|_| AppError::Internal("in-memory store lock poisoned".to_string()))
}

/// Whether `stored` is the same job still leased by the holder of `job`.
fn held(stored: &Job, job: &Job) -> bool {
    stored.id == job.id && stored.reserved_by.is_some() && stored.reserved_by == job.reserved_by
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[derive(Default)]
pub struct MemoryQueue {
    config: QueueConfig,
    jobs: Mutex<Vec<Job>>,
    clock_offset: Mutex<chrono::Duration>,
    failing_enqueues: AtomicUsize,
}

impl MemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Move the queue's clock forward.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.clock_offset.lock() {
            *offset += chrono_duration(by);
        }
    }

    /// Make the next `count` enqueues fail.
    pub fn fail_enqueues(&self, count: usize) {
        self.failing_enqueues.store(count, Ordering::SeqCst);
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }

    fn now(&self) -> Result<DateTime<Utc>, AppError> {
        Ok(Utc::now() + *lock(&self.clock_offset)?)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, delivery: Delivery) -> Result<Job, AppError> {
        let failing = self
            .failing_enqueues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::Persistence(sqlx::Error::PoolTimedOut));
        }

        let now = self.now()?;
        let job = Job {
            id: Uuid::new_v4(),
            payload: delivery,
            reserved_by: None,
            reserved_at: None,
            reserved_until: None,
            retry_count: 0,
            available_at: now,
            created_at: now,
        };
        lock(&self.jobs)?.push(job.clone());
        Ok(job)
    }

    async fn reserve(&self, worker: WorkerId) -> Result<Option<Job>, AppError> {
        let now = self.now()?;
        let mut jobs = lock(&self.jobs)?;

        let next = jobs
            .iter_mut()
            .filter(|job| job.available_at <= now)
            .filter(|job| job.reserved_until.is_none_or(|until| until < now))
            .min_by_key(|job| (job.available_at, job.id));

        Ok(next.map(|job| {
            job.reserved_by = Some(i64::from(worker.0));
            job.reserved_at = Some(now);
            job.reserved_until = Some(now + chrono_duration(self.config.lease));
            job.clone()
        }))
    }

    async fn renew(&self, job: &Job) -> Result<bool, AppError> {
        let now = self.now()?;
        let mut jobs = lock(&self.jobs)?;

        let current = jobs
            .iter_mut()
            .find(|j| held(j, job) && j.reserved_until.is_some_and(|until| until >= now));

        Ok(current
            .map(|j| j.reserved_until = Some(now + chrono_duration(self.config.lease)))
            .is_some())
    }

    async fn ack(&self, job: &Job) -> Result<bool, AppError> {
        let mut jobs = lock(&self.jobs)?;
        let before = jobs.len();
        jobs.retain(|j| !held(j, job));
        Ok(jobs.len() < before)
    }

    async fn requeue(&self, job: &Job, backoff: Duration) -> Result<RequeueOutcome, AppError> {
        let now = self.now()?;
        let max_retries = i32::try_from(self.config.max_retries).unwrap_or(i32::MAX);
        let mut jobs = lock(&self.jobs)?;

        let Some(position) = jobs.iter().position(|j| held(j, job)) else {
            return Ok(RequeueOutcome::LeaseLost);
        };

        if jobs[position].retry_count >= max_retries {
            jobs.remove(position);
            return Ok(RequeueOutcome::Exhausted);
        }

        let stored = &mut jobs[position];
        stored.retry_count += 1;
        stored.reserved_by = None;
        stored.reserved_at = None;
        stored.reserved_until = None;
        stored.available_at = now + chrono_duration(backoff);

        Ok(RequeueOutcome::Scheduled {
            retry_count: stored.retry_count,
            available_at: stored.available_at,
        })
    }

    async fn len(&self) -> Result<i64, AppError> {
        Ok(lock(&self.jobs)?.len() as i64)
    }
}

#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<HashMap<Uuid, Message>>,
    fail_creates: AtomicBool,
    fail_updates: AtomicBool,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Store a message as-is, e.g. with a backdated `created_at`.
    pub fn insert(&self, message: Message) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.insert(message.id, message);
        }
    }

    pub fn all(&self) -> Vec<Message> {
        let mut all: Vec<Message> = self
            .messages
            .lock()
            .map(|messages| messages.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by_key(|m| (m.created_at, m.id));
        all
    }

    pub fn status(&self, id: Uuid) -> Option<MessageStatus> {
        self.messages
            .lock()
            .ok()
            .and_then(|messages| messages.get(&id).map(|m| m.status))
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create(&self, message: NewMessage) -> Result<Message, AppError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(AppError::Persistence(sqlx::Error::PoolTimedOut));
        }

        let now = Utc::now();
        let created = Message {
            id: Uuid::new_v4(),
            recipient: message.recipient,
            recipient_kind: message.recipient_kind,
            client_id: message.client_id,
            kind_id: message.kind_id,
            status: MessageStatus::Queued,
            created_at: now,
            updated_at: now,
        };
        lock(&self.messages)?.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_status(&self, id: Uuid, status: MessageStatus) -> Result<bool, AppError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(AppError::Persistence(sqlx::Error::PoolTimedOut));
        }

        Ok(lock(&self.messages)?
            .get_mut(&id)
            .map(|message| {
                message.status = status;
                message.updated_at = Utc::now();
            })
            .is_some())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut messages = lock(&self.messages)?;
        let before = messages.len();
        messages.retain(|_, message| message.created_at >= cutoff);
        Ok((before - messages.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryTemplateStore {
    templates: HashMap<String, StoredTemplate>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, text: &str, html: &str) -> Self {
        self.templates.insert(
            name.to_string(),
            StoredTemplate {
                name: name.to_string(),
                text: text.to_string(),
                html: html.to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl TemplateStore for MemoryTemplateStore {
    async fn find(&self, name: &str) -> Result<Option<StoredTemplate>, AppError> {
        Ok(self.templates.get(name).cloned())
    }
}

type KindKey = (String, String);
type UserKindKey = (String, String, String);

#[derive(Default)]
pub struct MemoryPreferenceStore {
    critical: HashSet<KindKey>,
    global: HashSet<String>,
    unsubscribes: HashSet<UserKindKey>,
    fail_lookups: AtomicBool,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_critical_kind(mut self, client_id: &str, kind_id: &str) -> Self {
        self.critical
            .insert((client_id.to_string(), kind_id.to_string()));
        self
    }

    pub fn with_global_unsubscribe(mut self, user_guid: &str) -> Self {
        self.global.insert(user_guid.to_string());
        self
    }

    pub fn with_unsubscribe(mut self, user_guid: &str, client_id: &str, kind_id: &str) -> Self {
        self.unsubscribes.insert((
            user_guid.to_string(),
            client_id.to_string(),
            kind_id.to_string(),
        ));
        self
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AppError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(AppError::Persistence(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn is_critical(&self, client_id: &str, kind_id: &str) -> Result<bool, AppError> {
        self.check()?;
        Ok(self
            .critical
            .contains(&(client_id.to_string(), kind_id.to_string())))
    }

    async fn is_globally_unsubscribed(&self, user_guid: &str) -> Result<bool, AppError> {
        self.check()?;
        Ok(self.global.contains(user_guid))
    }

    async fn is_unsubscribed(
        &self,
        user_guid: &str,
        client_id: &str,
        kind_id: &str,
    ) -> Result<bool, AppError> {
        self.check()?;
        Ok(self.unsubscribes.contains(&(
            user_guid.to_string(),
            client_id.to_string(),
            kind_id.to_string(),
        )))
    }
}

#[derive(Default)]
pub struct MemoryReceiptStore {
    counts: Mutex<HashMap<UserKindKey, u32>>,
    fail_records: AtomicBool,
}

impl MemoryReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_records(&self, fail: bool) {
        self.fail_records.store(fail, Ordering::SeqCst);
    }

    /// Deliveries counted for one user, client and kind.
    pub fn count(&self, user_guid: &str, client_id: &str, kind_id: &str) -> u32 {
        let key = (
            user_guid.to_string(),
            client_id.to_string(),
            kind_id.to_string(),
        );
        self.counts
            .lock()
            .ok()
            .and_then(|counts| counts.get(&key).copied())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ReceiptStore for MemoryReceiptStore {
    async fn record(
        &self,
        user_guid: &str,
        client_id: &str,
        kind_id: &str,
    ) -> Result<(), AppError> {
        if self.fail_records.load(Ordering::SeqCst) {
            return Err(AppError::Persistence(sqlx::Error::PoolTimedOut));
        }

        let key = (
            user_guid.to_string(),
            client_id.to_string(),
            kind_id.to_string(),
        );
        *lock(&self.counts)?.entry(key).or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use herald_common::types::{NotificationOptions, Recipient, RecipientKind};
    use pretty_assertions::assert_eq;

    fn delivery() -> Delivery {
        Delivery {
            message_id: Uuid::new_v4(),
            origin: Recipient::User("user-123".into()),
            target: Recipient::User("user-123".into()),
            options: NotificationOptions::default(),
            encrypted_token: "sealed".into(),
        }
    }

    fn queue(max_retries: u32) -> MemoryQueue {
        MemoryQueue::new(QueueConfig {
            lease: Duration::from_secs(60),
            max_retries,
        })
    }

    #[tokio::test]
    async fn test_concurrent_reservations_are_exclusive() {
        let queue = Arc::new(queue(3));
        queue.enqueue(delivery()).await.unwrap();

        let mut handles = Vec::new();
        for worker in 0..16 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.reserve(WorkerId(worker)).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reservable_again() {
        let queue = queue(3);
        queue.enqueue(delivery()).await.unwrap();

        let first = queue.reserve(WorkerId(1)).await.unwrap().unwrap();
        assert!(queue.reserve(WorkerId(2)).await.unwrap().is_none());

        queue.advance(Duration::from_secs(61));
        let second = queue.reserve(WorkerId(2)).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert!(second.is_reserved_by(WorkerId(2)));

        // The first worker lost its lease and cannot settle the job.
        assert!(!queue.ack(&first).await.unwrap());
        assert!(!queue.renew(&first).await.unwrap());
        assert_eq!(
            queue.requeue(&first, Duration::ZERO).await.unwrap(),
            RequeueOutcome::LeaseLost
        );
        assert!(queue.ack(&second).await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_renew_extends_the_lease() {
        let queue = queue(3);
        queue.enqueue(delivery()).await.unwrap();
        let job = queue.reserve(WorkerId(1)).await.unwrap().unwrap();

        queue.advance(Duration::from_secs(45));
        assert!(queue.renew(&job).await.unwrap());
        queue.advance(Duration::from_secs(45));
        assert!(queue.reserve(WorkerId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeue_counts_up_then_exhausts() {
        let queue = queue(2);
        queue.enqueue(delivery()).await.unwrap();

        let mut counts = Vec::new();
        loop {
            let job = queue.reserve(WorkerId(7)).await.unwrap().unwrap();
            match queue.requeue(&job, Duration::from_secs(10)).await.unwrap() {
                RequeueOutcome::Scheduled { retry_count, .. } => {
                    counts.push(retry_count);
                    assert!(queue.reserve(WorkerId(7)).await.unwrap().is_none());
                    queue.advance(Duration::from_secs(11));
                }
                RequeueOutcome::Exhausted => break,
                RequeueOutcome::LeaseLost => panic!("lease unexpectedly lost"),
            }
        }

        assert_eq!(counts, vec![1, 2]);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert!(queue.reserve(WorkerId(7)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_enqueues() {
        let queue = queue(1);
        queue.fail_enqueues(1);
        assert!(queue.enqueue(delivery()).await.is_err());
        assert!(queue.enqueue(delivery()).await.is_ok());
    }

    #[tokio::test]
    async fn test_message_status_updates() {
        let store = MemoryMessageStore::new();
        let message = store
            .create(NewMessage {
                recipient: "user-123".into(),
                recipient_kind: RecipientKind::User,
                client_id: "login".into(),
                kind_id: "reset".into(),
            })
            .await
            .unwrap();
        assert_eq!(message.status, MessageStatus::Queued);

        assert!(store.update_status(message.id, MessageStatus::Delivered).await.unwrap());
        assert_eq!(store.status(message.id), Some(MessageStatus::Delivered));
        assert!(!store.update_status(Uuid::new_v4(), MessageStatus::Failed).await.unwrap());
    }

    #[tokio::test]
    async fn test_receipts_count_per_kind() {
        let receipts = MemoryReceiptStore::new();
        receipts.record("user-123", "login", "reset").await.unwrap();
        receipts.record("user-123", "login", "reset").await.unwrap();
        receipts.record("user-123", "login", "welcome").await.unwrap();

        assert_eq!(receipts.count("user-123", "login", "reset"), 2);
        assert_eq!(receipts.count("user-123", "login", "welcome"), 1);
        assert_eq!(receipts.count("user-456", "login", "reset"), 0);
    }
}
