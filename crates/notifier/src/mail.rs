//! Mail transport.
//!
//! Delivery goes through lettre's `AsyncSmtpTransport`. The startup check
//! opens a bare lettre connection to learn whether the relay advertises
//! STARTTLS.

use std::time::Duration;

use async_trait::async_trait;
use herald_common::error::AppError;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, Message, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::AsyncSmtpConnection;
use lettre::transport::smtp::extension::{ClientId, Extension};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    /// Worth retrying: connection failures, timeouts, 4xx replies.
    #[error("Transient mail error: {0}")]
    Transient(String),

    /// Hard bounce: the relay rejected the message or recipient for good.
    #[error("Permanent mail error: {0}")]
    Permanent(String),

    /// The message could not be built (bad sender, malformed body).
    #[error("Invalid message: {0}")]
    Invalid(String),
}

impl From<MailError> for AppError {
    fn from(err: MailError) -> Self {
        match err {
            MailError::Transient(msg) => AppError::TransportTransient(msg),
            MailError::Permanent(msg) => AppError::TransportPermanent(msg),
            MailError::Invalid(msg) => AppError::Validation(msg),
        }
    }
}

/// A fully rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub reply_to: Option<String>,
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
}

#[async_trait]
pub trait MailClient: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError>;
}

/// Connection settings for [`SmtpMailer`].
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub tls: bool,
    pub timeout: Duration,
}

/// SMTP mail client.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    settings: SmtpSettings,
}

impl SmtpMailer {
    pub fn new(settings: SmtpSettings) -> Result<Self, MailError> {
        let builder = if settings.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .map_err(|e| MailError::Invalid(format!("SMTP relay {}: {e}", settings.host)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        };

        let mut builder = builder
            .port(settings.port)
            .timeout(Some(settings.timeout));

        if let (Some(user), Some(pass)) = (&settings.user, &settings.pass) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            settings,
        })
    }

    /// Whether the relay advertises STARTTLS in its EHLO reply.
    pub async fn supports_starttls(&self) -> Result<bool, MailError> {
        supports_starttls(&self.settings.host, self.settings.port, self.settings.timeout).await
    }

    /// Fail fast when the TLS setting disagrees with what the relay offers.
    pub async fn verify_tls(&self) -> Result<(), AppError> {
        let supported = self.supports_starttls().await?;
        verify_tls_configuration(self.settings.tls, supported)
    }
}

#[async_trait]
impl MailClient for SmtpMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), MailError> {
        let email = build_message(message)?;

        self.transport.send(email).await.map_err(|e| {
            if e.is_permanent() {
                MailError::Permanent(e.to_string())
            } else {
                MailError::Transient(e.to_string())
            }
        })?;

        tracing::debug!(to = %message.to, "Mail accepted by relay");
        Ok(())
    }
}

/// Compare the configured TLS mode with the relay's STARTTLS support.
pub fn verify_tls_configuration(configured_tls: bool, starttls_supported: bool) -> Result<(), AppError> {
    match (configured_tls, starttls_supported) {
        (true, false) => Err(AppError::Config(
            r#"SMTP TLS configuration mismatch: Configured to use TLS over SMTP, but the mail server does not support the "STARTTLS" extension."#.to_string(),
        )),
        (false, true) => Err(AppError::Config(
            r#"SMTP TLS configuration mismatch: Not configured to use TLS over SMTP, but the mail server does support the "STARTTLS" extension."#.to_string(),
        )),
        _ => Ok(()),
    }
}

fn build_message(message: &MailMessage) -> Result<Message, MailError> {
    let from: Mailbox = message
        .from
        .parse()
        .map_err(|e| MailError::Invalid(format!("sender address '{}': {e}", message.from)))?;
    let to: Mailbox = message
        .to
        .parse()
        .map_err(|e| MailError::Permanent(format!("recipient address '{}': {e}", message.to)))?;

    let mut builder = Message::builder().from(from).to(to).subject(&message.subject);

    if let Some(reply_to) = &message.reply_to {
        let reply_to: Mailbox = reply_to
            .parse()
            .map_err(|e| MailError::Invalid(format!("reply-to address '{reply_to}': {e}")))?;
        builder = builder.reply_to(reply_to);
    }

    let built = match &message.html {
        Some(html) => builder.multipart(
            MultiPart::alternative()
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_PLAIN)
                        .body(message.text.clone()),
                )
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_HTML)
                        .body(html.clone()),
                ),
        ),
        None => builder
            .header(ContentType::TEXT_PLAIN)
            .body(message.text.clone()),
    };

    built.map_err(|e| MailError::Invalid(format!("message build failed: {e}")))
}

/// Connect in plain text, read the EHLO extensions, then QUIT.
pub async fn supports_starttls(host: &str, port: u16, timeout: Duration) -> Result<bool, MailError> {
    let mut connection = AsyncSmtpConnection::connect_tokio1(
        (host, port),
        Some(timeout),
        &ClientId::Domain("herald".to_string()),
        None,
        None,
    )
    .await
    .map_err(|e| MailError::Transient(format!("SMTP capability check of {host}:{port}: {e}")))?;

    let supported = connection.server_info().supports_feature(Extension::StartTls);

    if let Err(e) = connection.quit().await {
        tracing::debug!(error = %e, "SMTP capability check QUIT failed");
    }

    Ok(supported)
}
