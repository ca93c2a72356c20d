//! Backend collaborators reached over HTTP
//!
//! The core does not authenticate; it validates an externally supplied
//! session by asking the authenticator for the caller's identity, and asks
//! the service to mint chat-session ids. Both ride one small trait so
//! tests can substitute a canned backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of the signed-in caller, as the authenticator reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub zoneinfo: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
}

/// A freshly minted chat session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub ts: String,
}

/// Session validation failed; fatal to the connection attempt and never
/// retried. The caller must force a login flow.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("session rejected: {0}")]
    SessionRejected(String),
    #[error("authenticator unreachable: {0}")]
    Unreachable(String),
}

/// The HTTP side of the service.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch the caller's identity; an error result invalidates the
    /// session.
    async fn get_user(&self) -> Result<UserIdentity, AuthError>;

    /// Create a chat session, returning the server-assigned id.
    async fn create_chat(&self, ts: &str) -> Result<ChatSession, String>;
}

// ============================================================================
// Production adapter
// ============================================================================

/// Error body the authenticator returns on a rejected session.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

#[derive(Debug, Serialize)]
struct CreateChatBody<'a> {
    ts: &'a str,
}

/// reqwest-backed [`Backend`].
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn get_user(&self) -> Result<UserIdentity, AuthError> {
        let response = self
            .client
            .get(self.url("auth/user"))
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        if response.status().is_success() {
            response
                .json::<UserIdentity>()
                .await
                .map_err(|e| AuthError::Unreachable(e.to_string()))
        } else {
            let status = response.status();
            let body = response
                .json::<ErrorBody>()
                .await
                .map(|b| b.error)
                .unwrap_or_default();
            tracing::warn!(%status, error = %body, "session rejected by authenticator");
            Err(AuthError::SessionRejected(if body.is_empty() {
                status.to_string()
            } else {
                body
            }))
        }
    }

    async fn create_chat(&self, ts: &str) -> Result<ChatSession, String> {
        self.client
            .post(self.url("validator/chat_session"))
            .json(&CreateChatBody { ts })
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?
            .json::<ChatSession>()
            .await
            .map_err(|e| e.to_string())
    }
}
