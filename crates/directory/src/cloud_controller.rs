//! Cloud Controller v2 client.
//!
//! Every call forwards the dispatching client's bearer token; the Cloud
//! Controller decides whether that client may see the space or organization.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::DirectoryError;
use crate::types::{Organization, OrganizationEntity, Page, Resource, Space, SpaceEntity};

/// Read access to spaces, organizations and their members.
#[async_trait]
pub trait CloudController: Send + Sync {
    async fn load_space(&self, guid: &str, token: &str) -> Result<Space, DirectoryError>;

    async fn load_organization(
        &self,
        guid: &str,
        token: &str,
    ) -> Result<Organization, DirectoryError>;

    /// GUIDs of every user in the space.
    async fn users_by_space(&self, guid: &str, token: &str) -> Result<Vec<String>, DirectoryError>;

    /// GUIDs of every user in the organization.
    async fn users_by_organization(
        &self,
        guid: &str,
        token: &str,
    ) -> Result<Vec<String>, DirectoryError>;
}

/// HTTP implementation backed by `reqwest`.
#[derive(Clone)]
pub struct CloudControllerClient {
    http: reqwest::Client,
    host: String,
}

impl CloudControllerClient {
    pub fn new(host: &str, verify_ssl: bool, timeout: Duration) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()?;

        Ok(Self {
            http,
            host: host.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T, DirectoryError> {
        let url = format!("{}{}", self.host, path);
        tracing::debug!(url = %url, "Cloud Controller request");

        let response = self.http.get(&url).bearer_auth(token).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DirectoryError::cloud_controller(status.as_u16(), body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| DirectoryError::Decode(format!("{path}: {e}")))
    }

    /// Follow `next_url` until the listing is exhausted.
    async fn member_guids(&self, first_page: String, token: &str) -> Result<Vec<String>, DirectoryError> {
        let mut guids = Vec::new();
        let mut next = Some(first_page);

        while let Some(path) = next {
            let page: Page<serde_json::Value> = self.get(&path, token).await?;
            guids.extend(page.resources.into_iter().map(|r| r.metadata.guid));
            next = page.next_url;
        }

        Ok(guids)
    }
}

#[async_trait]
impl CloudController for CloudControllerClient {
    async fn load_space(&self, guid: &str, token: &str) -> Result<Space, DirectoryError> {
        let resource: Resource<SpaceEntity> = self.get(&format!("/v2/spaces/{guid}"), token).await?;

        Ok(Space {
            guid: resource.metadata.guid,
            name: resource.entity.name,
            organization_guid: resource.entity.organization_guid,
        })
    }

    async fn load_organization(
        &self,
        guid: &str,
        token: &str,
    ) -> Result<Organization, DirectoryError> {
        let resource: Resource<OrganizationEntity> =
            self.get(&format!("/v2/organizations/{guid}"), token).await?;

        Ok(Organization {
            guid: resource.metadata.guid,
            name: resource.entity.name,
        })
    }

    async fn users_by_space(&self, guid: &str, token: &str) -> Result<Vec<String>, DirectoryError> {
        self.member_guids(format!("/v2/spaces/{guid}/users"), token)
            .await
    }

    async fn users_by_organization(
        &self,
        guid: &str,
        token: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        self.member_guids(format!("/v2/organizations/{guid}/users"), token)
            .await
    }
}
