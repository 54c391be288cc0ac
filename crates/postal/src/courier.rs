//! Dispatch: expand a recipient into queued deliveries.

use std::sync::Arc;

use herald_common::error::AppError;
use herald_common::types::{
    DispatchStatus, MessageStatus, NotificationOptions, Recipient, RecipientResponse,
};
use herald_directory::CloudController;

use crate::cryptography::Cryptographer;
use crate::loader::{EntityKind, LoadError, SpaceAndOrgLoader};
use crate::messages::{MessageStore, NewMessage};
use crate::queue::{Delivery, JobQueue};

pub struct Courier {
    loader: SpaceAndOrgLoader,
    cloud_controller: Arc<dyn CloudController>,
    queue: Arc<dyn JobQueue>,
    messages: Arc<dyn MessageStore>,
    crypto: Cryptographer,
}

impl Courier {
    pub fn new(
        cloud_controller: Arc<dyn CloudController>,
        queue: Arc<dyn JobQueue>,
        messages: Arc<dyn MessageStore>,
        crypto: Cryptographer,
    ) -> Self {
        Self {
            loader: SpaceAndOrgLoader::new(cloud_controller.clone()),
            cloud_controller,
            queue,
            messages,
            crypto,
        }
    }

    /// Queue one delivery per mail target of `recipient`.
    ///
    /// Returns one response per target. A space or organization that does
    /// not exist yields a single `no-address` response and nothing queued.
    /// A target that cannot be queued is reported as `failed-to-queue`
    /// without aborting the rest. Validation failures and an unavailable
    /// directory fail the whole call.
    pub async fn dispatch(
        &self,
        token: &str,
        recipient: &Recipient,
        options: &NotificationOptions,
    ) -> Result<Vec<RecipientResponse>, AppError> {
        recipient.validate()?;
        options.validate()?;

        let targets = match self.targets(token, recipient).await {
            Ok(targets) => targets,
            Err(LoadError::NotFound { kind, guid, message }) => {
                tracing::info!(
                    recipient = %recipient,
                    %kind,
                    %guid,
                    error = %message,
                    "Recipient not found, nothing queued"
                );
                return Ok(vec![RecipientResponse {
                    recipient: recipient.id().to_string(),
                    status: DispatchStatus::NoAddress,
                    notification_id: None,
                }]);
            }
            Err(err) => {
                tracing::warn!(recipient = %recipient, error = %err, "Dispatch aborted");
                return Err(err.into());
            }
        };

        let mut responses = Vec::with_capacity(targets.len());
        for target in targets {
            responses.push(self.enqueue(token, recipient, target, options).await);
        }

        tracing::info!(
            recipient = %recipient,
            client_id = %options.client_id,
            kind_id = %options.kind_id,
            targets = responses.len(),
            "Notification dispatched"
        );
        Ok(responses)
    }

    /// Resolve the recipient, then list its mail targets.
    async fn targets(&self, token: &str, recipient: &Recipient) -> Result<Vec<Recipient>, LoadError> {
        self.loader.load(recipient, token).await?;

        let (kind, guid, members) = match recipient {
            Recipient::User(_) | Recipient::Email(_) => return Ok(vec![recipient.clone()]),
            Recipient::Space(guid) => (
                EntityKind::Space,
                guid,
                self.cloud_controller.users_by_space(guid, token).await,
            ),
            Recipient::Organization(guid) => (
                EntityKind::Organization,
                guid,
                self.cloud_controller.users_by_organization(guid, token).await,
            ),
        };

        let members = members.map_err(|e| LoadError::classify(e, kind, guid))?;
        Ok(members.into_iter().map(Recipient::User).collect())
    }

    async fn enqueue(
        &self,
        token: &str,
        origin: &Recipient,
        target: Recipient,
        options: &NotificationOptions,
    ) -> RecipientResponse {
        let recipient = target.id().to_string();
        let failed = |notification_id| RecipientResponse {
            recipient: recipient.clone(),
            status: DispatchStatus::FailedToQueue,
            notification_id,
        };

        let encrypted_token = match self.crypto.encrypt(token) {
            Ok(sealed) => sealed,
            Err(err) => {
                tracing::error!(recipient = %target, error = %err, "Token encryption failed");
                return failed(None);
            }
        };

        let message = match self
            .messages
            .create(NewMessage {
                recipient: recipient.clone(),
                recipient_kind: target.kind(),
                client_id: options.client_id.clone(),
                kind_id: options.kind_id.clone(),
            })
            .await
        {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(recipient = %target, error = %err, "Failed to record message");
                return failed(None);
            }
        };

        let delivery = Delivery {
            message_id: message.id,
            origin: origin.clone(),
            target: target.clone(),
            options: options.clone(),
            encrypted_token,
        };

        match self.queue.enqueue(delivery).await {
            Ok(job) => {
                tracing::debug!(
                    job_id = %job.id,
                    message_id = %message.id,
                    recipient = %target,
                    "Delivery queued"
                );
                RecipientResponse {
                    recipient: recipient.clone(),
                    status: DispatchStatus::Queued,
                    notification_id: Some(message.id),
                }
            }
            Err(err) => {
                tracing::error!(
                    message_id = %message.id,
                    recipient = %target,
                    error = %err,
                    "Failed to enqueue delivery"
                );
                if let Err(err) = self
                    .messages
                    .update_status(message.id, MessageStatus::Failed)
                    .await
                {
                    tracing::warn!(message_id = %message.id, error = %err, "Failed to mark message failed");
                }
                failed(Some(message.id))
            }
        }
    }
}
