//! Delivery workers.
//!
//! Each worker owns one [`WorkerId`] and loops: reserve a job, check the
//! recipient's preferences, resolve and render it, hand it to the mail
//! transport, then settle it. Every failure
//! is classified where it happens into an [`Outcome`]; settlement only maps
//! outcomes to a message status and an ack or requeue.
//!
//! While a job is being processed the worker renews its lease every half
//! lease period. If renewal reports the lease lost, processing is abandoned
//! without settling: the job now belongs to another worker.

use std::sync::Arc;
use std::time::Duration;

use herald_common::error::AppError;
use herald_common::types::{MessageStatus, Recipient};
use herald_directory::{Organization, Space, UserDirectory};
use herald_notifier::template::endorsement;
use herald_notifier::{MailClient, MailError, MailMessage};
use tera::Context;

use crate::cryptography::Cryptographer;
use crate::loader::{LoadError, SpaceAndOrgLoader};
use crate::messages::MessageStore;
use crate::preferences::{PreferenceStore, ReceiptStore};
use crate::queue::{Delivery, Job, JobQueue, RequeueOutcome, RetryPolicy, WorkerId};
use crate::templates::TemplateLoader;

/// Shared collaborators, cloned into every worker.
#[derive(Clone)]
pub struct DeliveryServices {
    pub queue: Arc<dyn JobQueue>,
    pub messages: Arc<dyn MessageStore>,
    pub loader: SpaceAndOrgLoader,
    pub users: Arc<dyn UserDirectory>,
    pub templates: Arc<dyn TemplateLoader>,
    pub mailer: Arc<dyn MailClient>,
    pub crypto: Cryptographer,
    pub preferences: Arc<dyn PreferenceStore>,
    pub receipts: Arc<dyn ReceiptStore>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// From address on every message.
    pub sender: String,
    /// Sleep between reservation attempts while the queue is empty.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Lease length; renewals happen every half of it.
    pub lease: Duration,
}

/// How processing a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    /// Hard bounce.
    Undeliverable(String),
    /// The recipient has no address, or no longer exists.
    NoAddress(String),
    /// The user opted out and the kind is not critical.
    Unsubscribed(String),
    /// Bad data that a retry cannot fix.
    Failed(String),
    /// A dependency is unavailable; try again later.
    Retry(String),
}

impl Outcome {
    /// Final message status, or `None` when the job should be retried.
    pub fn terminal_status(&self) -> Option<MessageStatus> {
        match self {
            Outcome::Delivered => Some(MessageStatus::Delivered),
            Outcome::Undeliverable(_) => Some(MessageStatus::Undeliverable),
            Outcome::NoAddress(_) => Some(MessageStatus::NoAddress),
            Outcome::Unsubscribed(_) => Some(MessageStatus::Unsubscribed),
            Outcome::Failed(_) => Some(MessageStatus::Failed),
            Outcome::Retry(_) => None,
        }
    }

    fn reason(&self) -> &str {
        match self {
            Outcome::Delivered => "",
            Outcome::Undeliverable(reason)
            | Outcome::NoAddress(reason)
            | Outcome::Unsubscribed(reason)
            | Outcome::Failed(reason)
            | Outcome::Retry(reason) => reason,
        }
    }
}

pub struct DeliveryWorker {
    id: WorkerId,
    services: DeliveryServices,
    settings: WorkerSettings,
}

impl DeliveryWorker {
    pub fn new(id: WorkerId, services: DeliveryServices, settings: WorkerSettings) -> Self {
        Self {
            id,
            services,
            settings,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Drain the queue forever. Runs until the task is cancelled.
    pub async fn run(self) {
        tracing::info!(worker_id = %self.id, "Delivery worker started");

        loop {
            match self.work_one().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.settings.poll_interval).await,
                Err(e) => {
                    tracing::warn!(worker_id = %self.id, error = %e, "Queue operation failed");
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }
    }

    /// Reserve and fully handle one job. `Ok(false)` when the queue had
    /// nothing reservable.
    pub async fn work_one(&self) -> Result<bool, AppError> {
        let Some(job) = self.services.queue.reserve(self.id).await? else {
            return Ok(false);
        };

        let outcome = tokio::select! {
            outcome = self.process(&job) => outcome,
            () = self.heartbeat(&job) => {
                tracing::warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    "Lease lost while processing, abandoning job"
                );
                return Ok(true);
            }
        };

        self.settle(&job, outcome).await?;
        Ok(true)
    }

    /// Renew the lease every half lease period. Returns only once the lease
    /// has been lost.
    async fn heartbeat(&self, job: &Job) {
        let period = (self.settings.lease / 2).max(Duration::from_millis(100));
        loop {
            tokio::time::sleep(period).await;
            match self.services.queue.renew(job).await {
                Ok(true) => tracing::debug!(worker_id = %self.id, job_id = %job.id, "Lease renewed"),
                Ok(false) => return,
                Err(e) => {
                    tracing::warn!(worker_id = %self.id, job_id = %job.id, error = %e, "Lease renewal failed")
                }
            }
        }
    }

    async fn process(&self, job: &Job) -> Outcome {
        let delivery = &job.payload;

        match self
            .services
            .messages
            .update_status(delivery.message_id, MessageStatus::Delivering)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                message_id = %delivery.message_id,
                "Message record already collected, delivering anyway"
            ),
            Err(e) => return Outcome::Retry(format!("marking message delivering: {e}")),
        }

        let token = match self.services.crypto.decrypt(&delivery.encrypted_token) {
            Ok(token) => token,
            Err(e) => return Outcome::Failed(format!("decrypting token: {e}")),
        };

        match self.should_deliver(delivery).await {
            Ok(true) => {}
            Ok(false) => {
                return Outcome::Unsubscribed(format!(
                    "{} unsubscribed from {}.{}",
                    delivery.target, delivery.options.client_id, delivery.options.kind_id
                ));
            }
            Err(e) => return Outcome::Retry(format!("checking preferences: {e}")),
        }

        let (space, organization) = match self.services.loader.load(&delivery.origin, &token).await {
            Ok(found) => found,
            Err(e @ LoadError::NotFound { .. }) => return Outcome::NoAddress(e.to_string()),
            Err(e) => return Outcome::Retry(e.to_string()),
        };

        let address = match self.address(&delivery.target).await {
            Ok(address) => address,
            Err(outcome) => return outcome,
        };

        let options = &delivery.options;
        let subject_provided = options.subject.as_deref().is_some_and(|s| !s.trim().is_empty());
        let templates = match self
            .services
            .templates
            .load(
                &options.client_id,
                &options.kind_id,
                delivery.origin.kind(),
                subject_provided,
            )
            .await
        {
            Ok(templates) => templates,
            Err(e) => return Outcome::Retry(format!("loading templates: {e}")),
        };

        let context = render_context(delivery, &address, &space, &organization);
        let rendered = match templates.render(&context) {
            Ok(rendered) => rendered,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        let has_html = options.html.as_deref().is_some_and(|h| !h.trim().is_empty());
        let message = MailMessage {
            from: self.settings.sender.clone(),
            reply_to: options.reply_to.clone().filter(|r| !r.trim().is_empty()),
            to: address,
            subject: rendered.subject,
            text: rendered.text,
            html: has_html.then_some(rendered.html),
        };

        match self.services.mailer.send(&message).await {
            Ok(()) => {
                self.record_receipt(delivery).await;
                Outcome::Delivered
            }
            Err(MailError::Permanent(reason)) => Outcome::Undeliverable(reason),
            Err(MailError::Invalid(reason)) => Outcome::Failed(reason),
            Err(MailError::Transient(reason)) => Outcome::Retry(reason),
        }
    }

    /// Critical kinds always go out. Otherwise a global or per-kind
    /// unsubscribe stops delivery to a user. E-mail targets have no
    /// preferences.
    async fn should_deliver(&self, delivery: &Delivery) -> Result<bool, AppError> {
        let Recipient::User(guid) = &delivery.target else {
            return Ok(true);
        };
        let options = &delivery.options;
        let preferences = &self.services.preferences;

        if preferences
            .is_critical(&options.client_id, &options.kind_id)
            .await?
        {
            return Ok(true);
        }
        if preferences.is_globally_unsubscribed(guid).await? {
            return Ok(false);
        }
        Ok(!preferences
            .is_unsubscribed(guid, &options.client_id, &options.kind_id)
            .await?)
    }

    /// Receipts only exist for users. A failed write never undoes a send.
    async fn record_receipt(&self, delivery: &Delivery) {
        let Recipient::User(guid) = &delivery.target else {
            return;
        };
        let options = &delivery.options;
        if let Err(e) = self
            .services
            .receipts
            .record(guid, &options.client_id, &options.kind_id)
            .await
        {
            tracing::warn!(
                message_id = %delivery.message_id,
                user_guid = %guid,
                error = %e,
                "Failed to record receipt"
            );
        }
    }

    /// The e-mail address to deliver to.
    async fn address(&self, target: &Recipient) -> Result<String, Outcome> {
        match target {
            Recipient::Email(address) => Ok(address.clone()),
            Recipient::User(guid) => match self.services.users.email_for(guid).await {
                Ok(Some(address)) => Ok(address),
                Ok(None) => Err(Outcome::NoAddress(format!("user {guid} has no e-mail address"))),
                Err(e) if e.is_not_found() => Err(Outcome::NoAddress(e.to_string())),
                Err(e) => Err(Outcome::Retry(e.to_string())),
            },
            other => Err(Outcome::Failed(format!("{other} is not a mail target"))),
        }
    }

    async fn settle(&self, job: &Job, outcome: Outcome) -> Result<(), AppError> {
        let message_id = job.payload.message_id;

        let Some(status) = outcome.terminal_status() else {
            return self.retry(job, outcome.reason()).await;
        };

        match status {
            MessageStatus::Delivered => tracing::info!(
                worker_id = %self.id,
                job_id = %job.id,
                %message_id,
                "Message delivered"
            ),
            MessageStatus::Unsubscribed => tracing::info!(
                worker_id = %self.id,
                job_id = %job.id,
                %message_id,
                reason = outcome.reason(),
                "Recipient unsubscribed, message skipped"
            ),
            _ => tracing::error!(
                worker_id = %self.id,
                job_id = %job.id,
                %message_id,
                %status,
                error = outcome.reason(),
                "Delivery ended without success"
            ),
        }

        // The outcome is final either way; a lost status update must not
        // cause a resend.
        if let Err(e) = self.services.messages.update_status(message_id, status).await {
            tracing::error!(%message_id, %status, error = %e, "Failed to record message status");
        }

        if !self.services.queue.ack(job).await? {
            tracing::warn!(worker_id = %self.id, job_id = %job.id, "Lease lost before ack");
        }
        Ok(())
    }

    async fn retry(&self, job: &Job, reason: &str) -> Result<(), AppError> {
        let message_id = job.payload.message_id;
        let backoff = self.settings.retry.delay(job.retry_count);

        let status = match self.services.queue.requeue(job, backoff).await? {
            RequeueOutcome::Scheduled {
                retry_count,
                available_at,
            } => {
                tracing::warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    %message_id,
                    retry_count,
                    %available_at,
                    error = reason,
                    "Delivery failed, requeued"
                );
                MessageStatus::Queued
            }
            RequeueOutcome::Exhausted => {
                tracing::error!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    %message_id,
                    retry_count = job.retry_count,
                    error = reason,
                    "Delivery retries exhausted"
                );
                MessageStatus::Failed
            }
            RequeueOutcome::LeaseLost => {
                tracing::warn!(worker_id = %self.id, job_id = %job.id, "Lease lost before requeue");
                return Ok(());
            }
        };

        if let Err(e) = self.services.messages.update_status(message_id, status).await {
            tracing::error!(%message_id, %status, error = %e, "Failed to record message status");
        }
        Ok(())
    }
}

fn render_context(
    delivery: &Delivery,
    address: &str,
    space: &Space,
    organization: &Organization,
) -> Context {
    let options = &delivery.options;
    let user_guid = match &delivery.target {
        Recipient::User(guid) => guid.as_str(),
        _ => "",
    };

    let mut context = Context::new();
    context.insert("text", options.text.as_deref().unwrap_or_default());
    context.insert("html", options.html.as_deref().unwrap_or_default());
    context.insert("subject", options.subject.as_deref().unwrap_or_default());
    context.insert("kind_id", &options.kind_id);
    context.insert("kind_description", &options.kind_description);
    context.insert("source_description", &options.source_description);
    context.insert("client_id", &options.client_id);
    context.insert("message_id", &delivery.message_id.to_string());
    context.insert("user_guid", user_guid);
    context.insert("to", address);
    context.insert("space", &space.name);
    context.insert("organization", &organization.name);
    context.insert(
        "endorsement",
        &endorsement(delivery.origin.kind(), &space.name, &organization.name),
    );
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::courier::Courier;
    use crate::memory::{
        MemoryMessageStore, MemoryPreferenceStore, MemoryQueue, MemoryReceiptStore,
        MemoryTemplateStore,
    };
    use crate::messages::NewMessage;
    use crate::queue::QueueConfig;
    use crate::templates::TemplatesLoader;
    use herald_common::types::{DispatchStatus, NotificationOptions};
    use herald_directory::fakes::{FakeCloudController, FakeError, FakeUserDirectory};
    use herald_notifier::fakes::FakeMailer;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    const TOKEN: &str = "bearer-token";

    /// Takes `delay` to accept each message.
    struct SlowMailer {
        inner: Arc<FakeMailer>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl MailClient for SlowMailer {
        async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
            tokio::time::sleep(self.delay).await;
            self.inner.send(message).await
        }
    }

    struct Harness {
        courier: Courier,
        worker: DeliveryWorker,
        queue: Arc<MemoryQueue>,
        messages: Arc<MemoryMessageStore>,
        mailer: Arc<FakeMailer>,
        crypto: Cryptographer,
        preferences: Arc<MemoryPreferenceStore>,
        receipts: Arc<MemoryReceiptStore>,
    }

    struct Setup {
        cc: FakeCloudController,
        users: FakeUserDirectory,
        templates: MemoryTemplateStore,
        preferences: MemoryPreferenceStore,
        max_retries: u32,
        lease: Duration,
        send_delay: Duration,
    }

    impl Default for Setup {
        fn default() -> Self {
            let mut cc = FakeCloudController::new()
                .with_space("space-001", "dev", "org-001")
                .with_org("org-001", "acme");
            cc.users_by_space
                .insert("space-001".into(), vec!["user-123".into()]);
            Self {
                cc,
                users: FakeUserDirectory::new()
                    .with_user("user-123", Some("user-123@example.com"))
                    .with_user("user-no-mail", None),
                templates: MemoryTemplateStore::new(),
                preferences: MemoryPreferenceStore::new(),
                max_retries: 3,
                lease: Duration::from_secs(60),
                send_delay: Duration::ZERO,
            }
        }
    }

    impl Setup {
        fn build(self) -> Harness {
            let cc = Arc::new(self.cc);
            let queue = Arc::new(MemoryQueue::new(QueueConfig {
                lease: self.lease,
                max_retries: self.max_retries,
            }));
            let messages = Arc::new(MemoryMessageStore::new());
            let mailer = Arc::new(FakeMailer::new());
            let crypto = Cryptographer::new("worker-secret").unwrap();
            let preferences = Arc::new(self.preferences);
            let receipts = Arc::new(MemoryReceiptStore::new());

            let transport: Arc<dyn MailClient> = if self.send_delay.is_zero() {
                mailer.clone()
            } else {
                Arc::new(SlowMailer {
                    inner: mailer.clone(),
                    delay: self.send_delay,
                })
            };

            let courier = Courier::new(cc.clone(), queue.clone(), messages.clone(), crypto.clone());
            let services = DeliveryServices {
                queue: queue.clone(),
                messages: messages.clone(),
                loader: SpaceAndOrgLoader::new(cc),
                users: Arc::new(self.users),
                templates: Arc::new(TemplatesLoader::new(self.templates)),
                mailer: transport,
                crypto: crypto.clone(),
                preferences: preferences.clone(),
                receipts: receipts.clone(),
            };
            let worker = DeliveryWorker::new(
                WorkerId(0),
                services,
                WorkerSettings {
                    sender: "no-reply@notifications.example.com".into(),
                    poll_interval: Duration::from_millis(10),
                    retry: RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(600)),
                    lease: self.lease,
                },
            );

            Harness {
                courier,
                worker,
                queue,
                messages,
                mailer,
                crypto,
                preferences,
                receipts,
            }
        }
    }

    impl Harness {
        async fn dispatch(&self, recipient: Recipient, options: NotificationOptions) -> Uuid {
            let responses = self
                .courier
                .dispatch(TOKEN, &recipient, &options)
                .await
                .unwrap();
            assert_eq!(responses.len(), 1);
            assert_eq!(responses[0].status, DispatchStatus::Queued);
            responses[0].notification_id.unwrap()
        }

        /// Queue a delivery without going through the courier. `token`
        /// replaces the sealed token when given.
        async fn enqueue_raw(&self, origin: Recipient, target: Recipient, token: Option<&str>) -> Uuid {
            let message = self
                .messages
                .create(NewMessage {
                    recipient: target.id().to_string(),
                    recipient_kind: target.kind(),
                    client_id: "login".into(),
                    kind_id: "forgot-password".into(),
                })
                .await
                .unwrap();
            let encrypted_token = match token {
                Some(raw) => raw.to_string(),
                None => self.crypto.encrypt(TOKEN).unwrap(),
            };
            self.queue
                .enqueue(Delivery {
                    message_id: message.id,
                    origin,
                    target,
                    options: options(),
                    encrypted_token,
                })
                .await
                .unwrap();
            message.id
        }
    }

    fn options() -> NotificationOptions {
        NotificationOptions {
            client_id: "login".into(),
            kind_id: "forgot-password".into(),
            kind_description: "Password reminder".into(),
            source_description: "Login system".into(),
            reply_to: Some("support@example.com".into()),
            text: Some("Please reset your password".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_delivers_to_a_user() {
        let h = Setup::default().build();
        let id = h.dispatch(Recipient::User("user-123".into()), options()).await;

        assert!(h.worker.work_one().await.unwrap());

        assert_eq!(h.messages.status(id), Some(MessageStatus::Delivered));
        assert_eq!(h.queue.len().await.unwrap(), 0);

        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "user-123@example.com");
        assert_eq!(sent[0].from, "no-reply@notifications.example.com");
        assert_eq!(sent[0].reply_to.as_deref(), Some("support@example.com"));
        assert_eq!(sent[0].subject, "CF Notification: Password reminder");
        assert!(sent[0].text.starts_with("This message was sent directly to you."));
        assert!(sent[0].text.contains("Please reset your password"));
        assert_eq!(sent[0].html, None);

        assert_eq!(h.receipts.count("user-123", "login", "forgot-password"), 1);
    }

    #[tokio::test]
    async fn test_space_delivery_mentions_space_and_org() {
        let h = Setup::default().build();
        let id = h
            .dispatch(
                Recipient::Space("space-001".into()),
                NotificationOptions {
                    subject: Some("Maintenance".into()),
                    html: Some("<p>Downtime tonight</p>".into()),
                    ..options()
                },
            )
            .await;

        h.worker.work_one().await.unwrap();

        assert_eq!(h.messages.status(id), Some(MessageStatus::Delivered));
        let sent = h.mailer.sent();
        assert_eq!(sent[0].subject, "CF Notification: Maintenance");
        assert!(sent[0].text.contains("the dev space in the acme organization"));
        assert!(sent[0].html.as_deref().unwrap().contains("<p>Downtime tonight</p>"));
    }

    #[tokio::test]
    async fn test_html_body_escapes_directory_names() {
        let mut setup = Setup::default();
        setup.cc = FakeCloudController::new()
            .with_space("space-001", "<script>alert(1)</script>", "org-001")
            .with_org("org-001", "acme");
        setup
            .cc
            .users_by_space
            .insert("space-001".into(), vec!["user-123".into()]);
        let h = setup.build();
        h.dispatch(
            Recipient::Space("space-001".into()),
            NotificationOptions {
                html: Some("<p>Downtime tonight</p>".into()),
                ..options()
            },
        )
        .await;

        h.worker.work_one().await.unwrap();

        let html = h.mailer.sent()[0].html.clone().unwrap();
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("<p>Downtime tonight</p>"));
    }

    #[tokio::test]
    async fn test_client_template_override() {
        let h = Setup {
            templates: MemoryTemplateStore::new().with(
                "login.forgot-password.email_body",
                "Hi {{ to }}: {{ text }}",
                "",
            ),
            ..Default::default()
        }
        .build();
        h.dispatch(Recipient::Email("ops@example.com".into()), options())
            .await;

        h.worker.work_one().await.unwrap();

        assert_eq!(
            h.mailer.sent()[0].text,
            "Hi ops@example.com: Please reset your password"
        );
    }

    #[tokio::test]
    async fn test_unsubscribed_user_is_skipped() {
        let h = Setup {
            preferences: MemoryPreferenceStore::new().with_unsubscribe(
                "user-123",
                "login",
                "forgot-password",
            ),
            ..Default::default()
        }
        .build();
        let id = h.dispatch(Recipient::User("user-123".into()), options()).await;

        h.worker.work_one().await.unwrap();

        assert_eq!(h.messages.status(id), Some(MessageStatus::Unsubscribed));
        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert!(h.mailer.sent().is_empty());
        assert_eq!(h.receipts.count("user-123", "login", "forgot-password"), 0);
    }

    #[tokio::test]
    async fn test_global_unsubscribe_skips_space_members() {
        let h = Setup {
            preferences: MemoryPreferenceStore::new().with_global_unsubscribe("user-123"),
            ..Default::default()
        }
        .build();
        let id = h.dispatch(Recipient::Space("space-001".into()), options()).await;

        h.worker.work_one().await.unwrap();

        assert_eq!(h.messages.status(id), Some(MessageStatus::Unsubscribed));
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_critical_kind_ignores_unsubscribes() {
        let h = Setup {
            preferences: MemoryPreferenceStore::new()
                .with_critical_kind("login", "forgot-password")
                .with_global_unsubscribe("user-123")
                .with_unsubscribe("user-123", "login", "forgot-password"),
            ..Default::default()
        }
        .build();
        let id = h.dispatch(Recipient::User("user-123".into()), options()).await;

        h.worker.work_one().await.unwrap();

        assert_eq!(h.messages.status(id), Some(MessageStatus::Delivered));
        assert_eq!(h.mailer.sent().len(), 1);
        assert_eq!(h.receipts.count("user-123", "login", "forgot-password"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_from_other_kind_still_delivers() {
        let h = Setup {
            preferences: MemoryPreferenceStore::new().with_unsubscribe(
                "user-123",
                "login",
                "welcome",
            ),
            ..Default::default()
        }
        .build();
        let id = h.dispatch(Recipient::User("user-123".into()), options()).await;

        h.worker.work_one().await.unwrap();
        assert_eq!(h.messages.status(id), Some(MessageStatus::Delivered));
    }

    #[tokio::test]
    async fn test_email_targets_have_no_preferences() {
        let h = Setup::default().build();
        h.preferences.fail_lookups(true);
        let id = h
            .dispatch(Recipient::Email("ops@example.com".into()), options())
            .await;

        h.worker.work_one().await.unwrap();

        assert_eq!(h.messages.status(id), Some(MessageStatus::Delivered));
        assert_eq!(h.receipts.count("ops@example.com", "login", "forgot-password"), 0);
    }

    #[tokio::test]
    async fn test_preference_lookup_failure_requeues() {
        let h = Setup::default().build();
        h.preferences.fail_lookups(true);
        let id = h.dispatch(Recipient::User("user-123".into()), options()).await;

        h.worker.work_one().await.unwrap();

        assert_eq!(h.messages.status(id), Some(MessageStatus::Queued));
        assert_eq!(h.queue.jobs()[0].retry_count, 1);
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_receipt_failure_keeps_delivery() {
        let h = Setup::default().build();
        h.receipts.fail_records(true);
        let id = h.dispatch(Recipient::User("user-123".into()), options()).await;

        h.worker.work_one().await.unwrap();

        assert_eq!(h.messages.status(id), Some(MessageStatus::Delivered));
        assert_eq!(h.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_user_without_email_is_no_address() {
        let h = Setup::default().build();
        let id = h
            .dispatch(Recipient::User("user-no-mail".into()), options())
            .await;

        h.worker.work_one().await.unwrap();

        assert_eq!(h.messages.status(id), Some(MessageStatus::NoAddress));
        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_user_is_no_address() {
        let h = Setup::default().build();
        let id = h
            .dispatch(Recipient::User("user-unknown".into()), options())
            .await;

        h.worker.work_one().await.unwrap();
        assert_eq!(h.messages.status(id), Some(MessageStatus::NoAddress));
    }

    #[tokio::test]
    async fn test_space_gone_before_delivery_is_no_address() {
        let h = Setup::default().build();
        let id = h
            .enqueue_raw(
                Recipient::Space("space-gone".into()),
                Recipient::User("user-123".into()),
                None,
            )
            .await;

        h.worker.work_one().await.unwrap();

        assert_eq!(h.messages.status(id), Some(MessageStatus::NoAddress));
        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_directory_outage_requeues() {
        let mut setup = Setup::default();
        setup.users.error = Some(FakeError::Failure(503, "UAA is down".into()));
        let h = setup.build();
        let id = h.dispatch(Recipient::User("user-123".into()), options()).await;

        h.worker.work_one().await.unwrap();

        assert_eq!(h.messages.status(id), Some(MessageStatus::Queued));
        let jobs = h.queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].retry_count, 1);
        assert_eq!(jobs[0].reserved_by, None);
        // Backed off: not reservable yet.
        assert!(!h.worker.work_one().await.unwrap());
    }

    #[tokio::test]
    async fn test_transient_send_failure_retries_then_delivers() {
        let h = Setup::default().build();
        let id = h.dispatch(Recipient::User("user-123".into()), options()).await;
        h.mailer
            .fail_next(MailError::Transient("connection reset".into()));

        h.worker.work_one().await.unwrap();
        assert_eq!(h.messages.status(id), Some(MessageStatus::Queued));
        assert!(h.mailer.sent().is_empty());

        h.queue.advance(Duration::from_secs(61));
        assert!(h.worker.work_one().await.unwrap());
        assert_eq!(h.messages.status(id), Some(MessageStatus::Delivered));
        assert_eq!(h.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_message() {
        let h = Setup {
            max_retries: 1,
            ..Default::default()
        }
        .build();
        let id = h.dispatch(Recipient::User("user-123".into()), options()).await;

        for _ in 0..2 {
            h.mailer.fail_next(MailError::Transient("451 try later".into()));
            assert!(h.worker.work_one().await.unwrap());
            h.queue.advance(Duration::from_secs(600));
        }

        assert_eq!(h.messages.status(id), Some(MessageStatus::Failed));
        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert!(!h.worker.work_one().await.unwrap());
    }

    #[tokio::test]
    async fn test_hard_bounce_is_undeliverable() {
        let h = Setup::default().build();
        let id = h.dispatch(Recipient::User("user-123".into()), options()).await;
        h.mailer
            .fail_next(MailError::Permanent("550 no such user".into()));

        h.worker.work_one().await.unwrap();

        assert_eq!(h.messages.status(id), Some(MessageStatus::Undeliverable));
        assert_eq!(h.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_render_error_fails_without_retry() {
        let h = Setup {
            templates: MemoryTemplateStore::new().with("user_body", "{{ no_such_var }}", ""),
            ..Default::default()
        }
        .build();
        let id = h.dispatch(Recipient::User("user-123".into()), options()).await;

        h.worker.work_one().await.unwrap();

        assert_eq!(h.messages.status(id), Some(MessageStatus::Failed));
        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_undecryptable_token_fails() {
        let h = Setup::default().build();
        let id = h
            .enqueue_raw(
                Recipient::User("user-123".into()),
                Recipient::User("user-123".into()),
                Some("not-a-ciphertext"),
            )
            .await;

        h.worker.work_one().await.unwrap();

        assert_eq!(h.messages.status(id), Some(MessageStatus::Failed));
        assert_eq!(h.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_status_write_failure_requeues() {
        let h = Setup::default().build();
        h.dispatch(Recipient::User("user-123".into()), options()).await;
        h.messages.fail_updates(true);

        h.worker.work_one().await.unwrap();

        assert_eq!(h.queue.jobs()[0].retry_count, 1);
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_during_slow_send() {
        let h = Setup {
            lease: Duration::from_millis(200),
            send_delay: Duration::from_millis(500),
            ..Default::default()
        }
        .build();
        let id = h.dispatch(Recipient::User("user-123".into()), options()).await;

        let (worked, stolen) = tokio::join!(h.worker.work_one(), async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            h.queue.reserve(WorkerId(9)).await.unwrap()
        });

        assert!(worked.unwrap());
        assert!(stolen.is_none());
        assert_eq!(h.messages.status(id), Some(MessageStatus::Delivered));
        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert_eq!(h.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_lease_abandons_job() {
        let h = Setup {
            lease: Duration::from_millis(200),
            send_delay: Duration::from_millis(500),
            ..Default::default()
        }
        .build();
        let id = h.dispatch(Recipient::User("user-123".into()), options()).await;

        let (worked, thief) = tokio::join!(h.worker.work_one(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.queue.advance(Duration::from_secs(1));
            h.queue.reserve(WorkerId(1)).await.unwrap()
        });

        assert!(worked.unwrap());
        assert!(thief.is_some());

        // The new holder still owns the job, and nothing was settled.
        let jobs = h.queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].is_reserved_by(WorkerId(1)));
        assert_eq!(jobs[0].retry_count, 0);
        assert_eq!(h.messages.status(id), Some(MessageStatus::Delivering));
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let h = Setup::default().build();
        assert!(!h.worker.work_one().await.unwrap());
    }

    #[test]
    fn test_outcome_statuses() {
        assert_eq!(Outcome::Delivered.terminal_status(), Some(MessageStatus::Delivered));
        assert_eq!(
            Outcome::NoAddress("x".into()).terminal_status(),
            Some(MessageStatus::NoAddress)
        );
        assert_eq!(
            Outcome::Unsubscribed("x".into()).terminal_status(),
            Some(MessageStatus::Unsubscribed)
        );
        assert_eq!(Outcome::Retry("x".into()).terminal_status(), None);
    }
}
