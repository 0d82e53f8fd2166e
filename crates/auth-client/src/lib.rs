//! Session token validation against the auth service.

use async_trait::async_trait;
use offer_models::PrincipalId;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::{collections::HashMap, time::Duration};
use tracing::{debug, warn};
use url::Url;

/// Error types for authentication
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum AuthError {
    #[snafu(display("No credential supplied"))]
    MissingCredential,

    #[snafu(display("Credential rejected: {}", message))]
    Rejected { message: String },

    #[snafu(display("Auth service unavailable: {}", message))]
    Unavailable { message: String },
}

pub type Result<T, E = AuthError> = std::result::Result<T, E>;

/// Validator for session tokens.
///
/// Implementations are shared by every connection and must tolerate
/// concurrent calls.
#[async_trait]
pub trait AuthValidator: Send + Sync + 'static {
    /// Validate an opaque session token and return the user behind it.
    async fn validate(&self, token: &str) -> Result<PrincipalId>;
}

#[derive(Debug, Serialize)]
struct ValidateTokenRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateTokenResponse {
    user_id: PrincipalId,
}

/// HTTP/JSON client for the auth service's `POST validate` endpoint.
#[derive(Debug, Clone)]
pub struct AuthServiceClient {
    client: Client,
    validate_url: Url,
}

impl AuthServiceClient {
    pub fn new(base_url: impl AsRef<str>, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref()).map_err(|e| AuthError::Unavailable {
            message: format!("invalid auth service URL: {e}"),
        })?;
        let validate_url = base_url.join("validate").map_err(|e| AuthError::Unavailable {
            message: format!("invalid auth service URL: {e}"),
        })?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Unavailable {
                message: e.to_string(),
            })?;

        tracing::info!("Creating AuthServiceClient with validate URL: {}", validate_url);

        Ok(Self {
            client,
            validate_url,
        })
    }
}

#[async_trait]
impl AuthValidator for AuthServiceClient {
    async fn validate(&self, token: &str) -> Result<PrincipalId> {
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let response = self
            .client
            .post(self.validate_url.clone())
            .json(&ValidateTokenRequest { token })
            .send()
            .await
            .map_err(|e| AuthError::Unavailable {
                message: e.to_string(),
            })?;

        match response.status() {
            status if status.is_success() => {
                let body = response
                    .json::<ValidateTokenResponse>()
                    .await
                    .map_err(|e| AuthError::Unavailable {
                        message: format!("malformed validate response: {e}"),
                    })?;
                debug!(principal = %body.user_id, "Token validated");
                Ok(body.user_id)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST => {
                Err(AuthError::Rejected {
                    message: "invalid or expired token".to_string(),
                })
            }
            status => {
                warn!(status = %status, "Auth service returned unexpected status");
                Err(AuthError::Unavailable {
                    message: format!("auth service returned {status}"),
                })
            }
        }
    }
}

/// Fixed token table, for development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, PrincipalId>,
}

impl StaticTokenValidator {
    pub fn new(tokens: impl IntoIterator<Item = (String, PrincipalId)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, principal: impl Into<PrincipalId>) -> Self {
        self.tokens.insert(token.into(), principal.into());
        self
    }
}

#[async_trait]
impl AuthValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<PrincipalId> {
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        self.tokens
            .get(token)
            .cloned()
            .context(RejectedSnafu {
                message: "unknown token",
            })
    }
}
