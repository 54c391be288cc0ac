//! In-memory directory services for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cloud_controller::CloudController;
use crate::error::DirectoryError;
use crate::types::{Organization, Space};
use crate::uaa::UserDirectory;

/// An error to raise from a fake call. `DirectoryError` is not `Clone`, so
/// fakes keep a recipe and build a fresh error each time.
#[derive(Debug, Clone)]
pub enum FakeError {
    Failure(u16, String),
    Decode(String),
}

impl FakeError {
    fn build(&self, service: &'static str) -> DirectoryError {
        match self {
            FakeError::Failure(code, message) => DirectoryError::Failure {
                service,
                code: *code,
                message: message.clone(),
            },
            FakeError::Decode(message) => DirectoryError::Decode(message.clone()),
        }
    }
}

/// Cloud Controller backed by hash maps. Missing entities answer with the
/// same 404 bodies the real Cloud Controller produces.
#[derive(Default)]
pub struct FakeCloudController {
    pub spaces: HashMap<String, Space>,
    pub orgs: HashMap<String, Organization>,
    pub users_by_space: HashMap<String, Vec<String>>,
    pub users_by_org: HashMap<String, Vec<String>>,
    pub load_space_error: Option<FakeError>,
    pub load_organization_error: Option<FakeError>,
    pub load_users_error: Option<FakeError>,
    calls: Mutex<Vec<String>>,
}

impl FakeCloudController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_space(mut self, guid: &str, name: &str, org_guid: &str) -> Self {
        self.spaces.insert(
            guid.to_string(),
            Space {
                guid: guid.to_string(),
                name: name.to_string(),
                organization_guid: org_guid.to_string(),
            },
        );
        self
    }

    pub fn with_org(mut self, guid: &str, name: &str) -> Self {
        self.orgs.insert(
            guid.to_string(),
            Organization {
                guid: guid.to_string(),
                name: name.to_string(),
            },
        );
        self
    }

    /// Every call made so far, as `"<operation>:<guid>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl CloudController for FakeCloudController {
    async fn load_space(&self, guid: &str, _token: &str) -> Result<Space, DirectoryError> {
        self.record(format!("load_space:{guid}"));
        if let Some(err) = &self.load_space_error {
            return Err(err.build("CloudController"));
        }
        self.spaces.get(guid).cloned().ok_or_else(|| {
            DirectoryError::cloud_controller(
                404,
                format!(
                    r#"{{"code":40004,"description":"The app space could not be found: {guid}","error_code":"CF-SpaceNotFound"}}"#
                ),
            )
        })
    }

    async fn load_organization(
        &self,
        guid: &str,
        _token: &str,
    ) -> Result<Organization, DirectoryError> {
        self.record(format!("load_organization:{guid}"));
        if let Some(err) = &self.load_organization_error {
            return Err(err.build("CloudController"));
        }
        self.orgs.get(guid).cloned().ok_or_else(|| {
            DirectoryError::cloud_controller(
                404,
                format!(
                    r#"{{"code":30003,"description":"The organization could not be found: {guid}","error_code":"CF-OrganizationNotFound"}}"#
                ),
            )
        })
    }

    async fn users_by_space(&self, guid: &str, _token: &str) -> Result<Vec<String>, DirectoryError> {
        self.record(format!("users_by_space:{guid}"));
        if let Some(err) = &self.load_users_error {
            return Err(err.build("CloudController"));
        }
        Ok(self.users_by_space.get(guid).cloned().unwrap_or_default())
    }

    async fn users_by_organization(
        &self,
        guid: &str,
        _token: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        self.record(format!("users_by_organization:{guid}"));
        if let Some(err) = &self.load_users_error {
            return Err(err.build("CloudController"));
        }
        Ok(self.users_by_org.get(guid).cloned().unwrap_or_default())
    }
}

/// UAA stand-in: `emails` maps user GUIDs to their address (or `None`).
/// Unknown users answer 404.
#[derive(Default)]
pub struct FakeUserDirectory {
    pub emails: HashMap<String, Option<String>>,
    pub error: Option<FakeError>,
}

impl FakeUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, guid: &str, email: Option<&str>) -> Self {
        self.emails
            .insert(guid.to_string(), email.map(str::to_string));
        self
    }
}

#[async_trait]
impl UserDirectory for FakeUserDirectory {
    async fn email_for(&self, user_guid: &str) -> Result<Option<String>, DirectoryError> {
        if let Some(err) = &self.error {
            return Err(err.build("UAA"));
        }
        self.emails
            .get(user_guid)
            .cloned()
            .ok_or_else(|| DirectoryError::uaa(404, r#"{"error":"scim_resource_not_found"}"#))
    }
}
