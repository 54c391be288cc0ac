//! UAA client used to turn user GUIDs into e-mail addresses.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::DirectoryError;

/// Tokens are refreshed this long before UAA says they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Lookup of a user's delivery address.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// The user's primary e-mail, or `None` when the user has no address.
    async fn email_for(&self, user_guid: &str) -> Result<Option<String>, DirectoryError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    #[serde(default)]
    emails: Vec<UserEmail>,
}

#[derive(Debug, Deserialize)]
struct UserEmail {
    value: String,
    #[serde(default)]
    primary: bool,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// UAA SCIM client authenticated with client credentials.
pub struct UaaClient {
    http: reqwest::Client,
    host: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl UaaClient {
    pub fn new(
        host: &str,
        client_id: &str,
        client_secret: &str,
        verify_ssl: bool,
        timeout: Duration,
    ) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()?;

        Ok(Self {
            http,
            host: host.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            token: Mutex::new(None),
        })
    }

    /// Return a cached client token, fetching a fresh one when it is stale.
    async fn client_token(&self) -> Result<String, DirectoryError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.clone());
        }

        let response = self
            .http
            .post(format!("{}/oauth/token", self.host))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DirectoryError::uaa(status.as_u16(), body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| DirectoryError::Decode(format!("/oauth/token: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        tracing::debug!(expires_in = token.expires_in, "Fetched UAA client token");

        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }
}

#[async_trait]
impl UserDirectory for UaaClient {
    async fn email_for(&self, user_guid: &str) -> Result<Option<String>, DirectoryError> {
        let token = self.client_token().await?;

        let response = self
            .http
            .get(format!("{}/Users/{}", self.host, user_guid))
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            if status.as_u16() == 401 {
                self.forget_token().await;
            }
            let body = response.text().await.unwrap_or_default();
            return Err(DirectoryError::uaa(status.as_u16(), body));
        }

        let user: UserResponse = response
            .json()
            .await
            .map_err(|e| DirectoryError::Decode(format!("/Users/{user_guid}: {e}")))?;

        Ok(primary_email(user.emails))
    }
}

fn primary_email(emails: Vec<UserEmail>) -> Option<String> {
    let mut emails = emails.into_iter().filter(|e| !e.value.trim().is_empty());
    let first = emails.next()?;
    if first.primary {
        return Some(first.value);
    }
    Some(emails.find(|e| e.primary).unwrap_or(first).value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn token(State(calls): State<Arc<AtomicUsize>>) -> axum::Json<serde_json::Value> {
        calls.fetch_add(1, Ordering::SeqCst);
        axum::Json(json!({"access_token": "client-token", "expires_in": 3600}))
    }

    async fn user(Path(guid): Path<String>) -> (StatusCode, String) {
        match guid.as_str() {
            "user-123" => (
                StatusCode::OK,
                json!({
                    "id": "user-123",
                    "emails": [
                        {"value": "secondary@example.com", "primary": false},
                        {"value": "user-123@example.com", "primary": true}
                    ]
                })
                .to_string(),
            ),
            "user-no-email" => (StatusCode::OK, json!({"id": "user-no-email"}).to_string()),
            _ => (StatusCode::NOT_FOUND, r#"{"error":"scim_resource_not_found"}"#.into()),
        }
    }

    async fn start_server(calls: Arc<AtomicUsize>) -> String {
        let app = Router::new()
            .route("/oauth/token", post(token))
            .route("/Users/{guid}", get(user))
            .with_state(calls);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(host: &str) -> UaaClient {
        UaaClient::new(host, "notifications", "secret", true, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_primary_email_is_returned() {
        let calls = Arc::new(AtomicUsize::new(0));
        let host = start_server(calls.clone()).await;
        let uaa = client(&host);

        let email = uaa.email_for("user-123").await.unwrap();
        assert_eq!(email.as_deref(), Some("user-123@example.com"));
    }

    #[tokio::test]
    async fn test_client_token_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let host = start_server(calls.clone()).await;
        let uaa = client(&host);

        uaa.email_for("user-123").await.unwrap();
        uaa.email_for("user-no-email").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_user_without_email() {
        let calls = Arc::new(AtomicUsize::new(0));
        let host = start_server(calls).await;
        assert_eq!(client(&host).email_for("user-no-email").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let calls = Arc::new(AtomicUsize::new(0));
        let host = start_server(calls).await;
        let err = client(&host).email_for("user-missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().starts_with("UAA Failure (404)"));
    }

    #[test]
    fn test_first_email_when_none_primary() {
        let emails = vec![
            UserEmail { value: "a@example.com".into(), primary: false },
            UserEmail { value: "b@example.com".into(), primary: false },
        ];
        assert_eq!(primary_email(emails).as_deref(), Some("a@example.com"));
    }
}
