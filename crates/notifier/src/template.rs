//! Notification templates rendered with tera.
//!
//! A template set is a subject, a plain-text body and an HTML body. Built-in
//! defaults are compiled into the binary; clients may override them by name
//! (see `herald_postal::templates`).

use herald_common::types::RecipientKind;
use serde::{Deserialize, Serialize};
use tera::{Context, Tera};
use thiserror::Error;

const SUBJECT_MISSING: &str = include_str!("../templates/subject.missing.txt");
const SUBJECT_PROVIDED: &str = include_str!("../templates/subject.provided.txt");
const BODY_TEXT: &str = include_str!("../templates/body.txt");
const BODY_HTML: &str = include_str!("../templates/body.html");

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template render failed: {0}")]
    Render(String),
}

/// Raw, unrendered templates for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Templates {
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl Templates {
    /// Built-in templates. `subject_provided` picks the subject variant.
    pub fn defaults(subject_provided: bool) -> Self {
        Self {
            subject: default_subject(subject_provided).to_string(),
            text: BODY_TEXT.to_string(),
            html: BODY_HTML.to_string(),
        }
    }

    /// Render subject and bodies against `context`.
    ///
    /// The HTML body is autoescaped. Templates opt the client's own markup
    /// back in with `{{ html | safe }}`.
    pub fn render(&self, context: &Context) -> Result<RenderedTemplates, TemplateError> {
        let render = |source: &str, autoescape: bool| {
            Tera::one_off(source, context, autoescape)
                .map_err(|e| TemplateError::Render(describe(&e)))
        };

        Ok(RenderedTemplates {
            subject: render(&self.subject, false)?.trim().to_string(),
            text: render(&self.text, false)?.trim().to_string(),
            html: render(&self.html, true)?.trim().to_string(),
        })
    }
}

/// Output of [`Templates::render`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTemplates {
    pub subject: String,
    pub text: String,
    pub html: String,
}

pub fn default_subject(subject_provided: bool) -> &'static str {
    if subject_provided {
        SUBJECT_PROVIDED
    } else {
        SUBJECT_MISSING
    }
}

/// Template name suffix for the body sent to a recipient of `kind`.
pub fn body_suffix(kind: RecipientKind) -> &'static str {
    match kind {
        RecipientKind::User => "user_body",
        RecipientKind::Space => "space_body",
        RecipientKind::Organization => "organization_body",
        RecipientKind::Email => "email_body",
    }
}

/// Template name suffix for the subject line.
pub fn subject_suffix(subject_provided: bool) -> &'static str {
    if subject_provided {
        "subject.provided"
    } else {
        "subject.missing"
    }
}

/// Sentence explaining why the recipient received the message.
pub fn endorsement(kind: RecipientKind, space: &str, organization: &str) -> String {
    match kind {
        RecipientKind::User => "This message was sent directly to you.".to_string(),
        RecipientKind::Email => "This message was sent directly to your email address.".to_string(),
        RecipientKind::Space => format!(
            "You received this message because you belong to the {space} space in the {organization} organization."
        ),
        RecipientKind::Organization => format!(
            "You received this message because you belong to the {organization} organization."
        ),
    }
}

/// tera nests the useful part of an error in its source chain.
fn describe(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
