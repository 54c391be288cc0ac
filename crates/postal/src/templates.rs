//! Template lookup with client/kind overrides.
//!
//! Overrides are stored by name. For each part the most specific name wins:
//! `{client}.{kind}.{suffix}`, then `{client}.{suffix}`, then `{suffix}`,
//! then the built-in default. Subject templates live in the `text` column.

use async_trait::async_trait;
use herald_common::error::AppError;
use herald_common::types::RecipientKind;
use herald_notifier::Templates;
use herald_notifier::template::{body_suffix, default_subject, subject_suffix};
use sqlx::PgPool;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredTemplate {
    pub name: String,
    pub text: String,
    pub html: String,
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn find(&self, name: &str) -> Result<Option<StoredTemplate>, AppError>;
}

#[derive(Clone)]
pub struct PgTemplateStore {
    pool: PgPool,
}

impl PgTemplateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateStore for PgTemplateStore {
    async fn find(&self, name: &str) -> Result<Option<StoredTemplate>, AppError> {
        let template: Option<StoredTemplate> =
            sqlx::query_as("SELECT name, text, html FROM templates WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(template)
    }
}

#[async_trait]
pub trait TemplateLoader: Send + Sync {
    async fn load(
        &self,
        client_id: &str,
        kind_id: &str,
        recipient_kind: RecipientKind,
        subject_provided: bool,
    ) -> Result<Templates, AppError>;
}

/// Resolves the template set for one delivery against a [`TemplateStore`].
pub struct TemplatesLoader<S> {
    store: S,
}

impl<S: TemplateStore> TemplatesLoader<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    async fn most_specific(
        &self,
        client_id: &str,
        kind_id: &str,
        suffix: &str,
    ) -> Result<Option<StoredTemplate>, AppError> {
        for name in candidate_names(client_id, kind_id, suffix) {
            if let Some(template) = self.store.find(&name).await? {
                tracing::debug!(template = %template.name, "Template override found");
                return Ok(Some(template));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl<S: TemplateStore> TemplateLoader for TemplatesLoader<S> {
    async fn load(
        &self,
        client_id: &str,
        kind_id: &str,
        recipient_kind: RecipientKind,
        subject_provided: bool,
    ) -> Result<Templates, AppError> {
        let mut templates = Templates::defaults(subject_provided);

        if let Some(body) = self
            .most_specific(client_id, kind_id, body_suffix(recipient_kind))
            .await?
        {
            templates.text = body.text;
            templates.html = body.html;
        }

        templates.subject = self
            .most_specific(client_id, kind_id, subject_suffix(subject_provided))
            .await?
            .map_or_else(|| default_subject(subject_provided).to_string(), |s| s.text);

        Ok(templates)
    }
}

/// Lookup order, most specific first. Empty client or kind IDs skip the
/// names that would contain them.
fn candidate_names(client_id: &str, kind_id: &str, suffix: &str) -> Vec<String> {
    let mut names = Vec::with_capacity(3);
    if !client_id.is_empty() {
        if !kind_id.is_empty() {
            names.push(format!("{client_id}.{kind_id}.{suffix}"));
        }
        names.push(format!("{client_id}.{suffix}"));
    }
    names.push(suffix.to_string());
    names
}
