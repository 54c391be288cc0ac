use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// A notification target as requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    User(String),
    Space(String),
    Organization(String),
    Email(String),
}

impl Recipient {
    /// The raw identifier: a GUID, or an address for `Email`.
    pub fn id(&self) -> &str {
        match self {
            Recipient::User(id)
            | Recipient::Space(id)
            | Recipient::Organization(id)
            | Recipient::Email(id) => id,
        }
    }

    pub fn kind(&self) -> RecipientKind {
        match self {
            Recipient::User(_) => RecipientKind::User,
            Recipient::Space(_) => RecipientKind::Space,
            Recipient::Organization(_) => RecipientKind::Organization,
            Recipient::Email(_) => RecipientKind::Email,
        }
    }

    /// Reject empty identifiers and e-mail recipients without an `@`.
    pub fn validate(&self) -> Result<(), AppError> {
        let id = self.id().trim();
        if id.is_empty() {
            return Err(AppError::Validation(format!(
                "{} recipient must not be empty",
                self.kind()
            )));
        }
        if let Recipient::Email(address) = self
            && !address.contains('@')
        {
            return Err(AppError::Validation(format!(
                "'{address}' is not a valid email address"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Discriminant of a [`Recipient`], persisted alongside each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    User,
    Space,
    Organization,
    Email,
}

impl std::fmt::Display for RecipientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipientKind::User => write!(f, "user"),
            RecipientKind::Space => write!(f, "space"),
            RecipientKind::Organization => write!(f, "organization"),
            RecipientKind::Email => write!(f, "email"),
        }
    }
}

/// Per-recipient delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Delivering,
    Delivered,
    Failed,
    Undeliverable,
    #[sqlx(rename = "no-address")]
    #[serde(rename = "no-address")]
    NoAddress,
    /// Skipped: the user opted out of this kind or of everything.
    Unsubscribed,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Queued => write!(f, "queued"),
            MessageStatus::Delivering => write!(f, "delivering"),
            MessageStatus::Delivered => write!(f, "delivered"),
            MessageStatus::Failed => write!(f, "failed"),
            MessageStatus::Undeliverable => write!(f, "undeliverable"),
            MessageStatus::NoAddress => write!(f, "no-address"),
            MessageStatus::Unsubscribed => write!(f, "unsubscribed"),
        }
    }
}

/// Status reported synchronously by dispatch for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchStatus {
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "failed-to-queue")]
    FailedToQueue,
    #[serde(rename = "no-address")]
    NoAddress,
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchStatus::Queued => write!(f, "queued"),
            DispatchStatus::FailedToQueue => write!(f, "failed-to-queue"),
            DispatchStatus::NoAddress => write!(f, "no-address"),
        }
    }
}

/// One entry of the dispatch response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientResponse {
    pub recipient: String,
    pub status: DispatchStatus,
    /// Message ID; absent when nothing was recorded for this target.
    pub notification_id: Option<Uuid>,
}

/// Content and metadata of a notification, supplied by the calling client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationOptions {
    pub client_id: String,
    pub kind_id: String,
    #[serde(default)]
    pub kind_description: String,
    #[serde(default)]
    pub source_description: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
}

impl NotificationOptions {
    pub fn validate(&self) -> Result<(), AppError> {
        let mut errors = Vec::new();

        if self.kind_id.trim().is_empty() {
            errors.push("\"kind_id\" is a required field");
        }

        let has_text = self.text.as_deref().is_some_and(|t| !t.trim().is_empty());
        let has_html = self.html.as_deref().is_some_and(|h| !h.trim().is_empty());
        if !has_text && !has_html {
            errors.push("\"text\" or \"html\" fields must be supplied");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(errors.join(", ")))
        }
    }
}

/// A persisted delivery-status record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    pub recipient: String,
    pub recipient_kind: RecipientKind,
    pub client_id: String,
    pub kind_id: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
