//! Outbound mail: the SMTP transport and the templates rendered into it.

pub mod mail;
pub mod template;

#[cfg(any(test, feature = "test-utils"))]
pub mod fakes;

pub use mail::{MailClient, MailError, MailMessage, SmtpMailer, SmtpSettings};
pub use template::{RenderedTemplates, TemplateError, Templates};
