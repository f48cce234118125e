use crate::error::ConversationError;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

/// Short-lived credential used to open one live session.
#[derive(Deserialize, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub token: String,
}

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken").field("token", &"<redacted>").finish()
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Any failure is reported as [`ConversationError::ServiceUnavailable`].
    async fn fetch_token(&self) -> Result<AuthToken, ConversationError>;
}

/// Fetches tokens with `GET <endpoint>` expecting `{ "token": "..." }`.
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTokenProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self) -> Result<AuthToken, ConversationError> {
        debug!("[Token] Requesting session token from {}", self.endpoint);
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| ConversationError::ServiceUnavailable(format!("token request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            warn!("[Token] Token endpoint answered {}", status);
            return Err(ConversationError::ServiceUnavailable(format!(
                "token endpoint returned {}",
                status
            )));
        }

        let token: AuthToken = response.json().await.map_err(|e| {
            ConversationError::ServiceUnavailable(format!("token response: {}", e))
        })?;
        if token.token.is_empty() {
            return Err(ConversationError::ServiceUnavailable(
                "token endpoint returned an empty token".to_string(),
            ));
        }
        Ok(token)
    }
}
