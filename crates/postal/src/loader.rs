//! Space/organization resolution for a recipient.
//!
//! Directory failures are classified here, once, into the closed
//! [`LoadError`] set; callers match on it instead of inspecting
//! `DirectoryError`s themselves.

use std::sync::Arc;

use herald_common::error::AppError;
use herald_common::types::Recipient;
use herald_directory::{CloudController, DirectoryError, Organization, Space};
use thiserror::Error;

/// Which directory entity a lookup was about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Space,
    Organization,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Space => write!(f, "space"),
            EntityKind::Organization => write!(f, "organization"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    /// The entity does not exist. Not retried.
    #[error("CloudController Error: {message}")]
    NotFound {
        kind: EntityKind,
        guid: String,
        message: String,
    },

    /// The directory answered with a failure. Retried later.
    #[error("{0}")]
    Down(String),

    /// Anything that never reached an HTTP response.
    #[error(transparent)]
    Other(DirectoryError),
}

impl LoadError {
    /// Classify a directory error raised while looking up `kind` `guid`.
    pub fn classify(err: DirectoryError, kind: EntityKind, guid: &str) -> Self {
        if err.is_not_found() {
            LoadError::NotFound {
                kind,
                guid: guid.to_string(),
                message: err.to_string(),
            }
        } else if err.status().is_some() {
            LoadError::Down(err.to_string())
        } else {
            LoadError::Other(err)
        }
    }
}

impl From<LoadError> for AppError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::NotFound { .. } => AppError::NotFound(err.to_string()),
            LoadError::Down(message) => AppError::Down(message),
            LoadError::Other(inner) => AppError::Down(inner.to_string()),
        }
    }
}

/// Resolves a recipient to the space and organization it names.
#[derive(Clone)]
pub struct SpaceAndOrgLoader {
    cloud_controller: Arc<dyn CloudController>,
}

impl SpaceAndOrgLoader {
    pub fn new(cloud_controller: Arc<dyn CloudController>) -> Self {
        Self { cloud_controller }
    }

    /// User and e-mail recipients need no lookup and resolve to empty
    /// values. A space also loads its parent organization; the space lookup
    /// runs first, so its errors win.
    pub async fn load(
        &self,
        recipient: &Recipient,
        token: &str,
    ) -> Result<(Space, Organization), LoadError> {
        match recipient {
            Recipient::User(_) | Recipient::Email(_) => Ok(Default::default()),
            Recipient::Space(guid) => {
                let space = self
                    .cloud_controller
                    .load_space(guid, token)
                    .await
                    .map_err(|e| LoadError::classify(e, EntityKind::Space, guid))?;

                let org_guid = space.organization_guid.clone();
                let organization = self
                    .cloud_controller
                    .load_organization(&org_guid, token)
                    .await
                    .map_err(|e| LoadError::classify(e, EntityKind::Organization, &org_guid))?;

                Ok((space, organization))
            }
            Recipient::Organization(guid) => {
                let organization = self
                    .cloud_controller
                    .load_organization(guid, token)
                    .await
                    .map_err(|e| LoadError::classify(e, EntityKind::Organization, guid))?;

                Ok((Space::default(), organization))
            }
        }
    }
}
