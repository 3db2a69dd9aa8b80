use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Secret presented to the credential verifier. Never logged.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", content = "secret", rename_all = "snake_case")]
pub enum Proof {
    Password(SecretString),
    /// Full `ak_<prefix>_<secret>` value.
    ApiKey(SecretString),
}

/// Request metadata the authority binds sessions and refresh tokens to.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestContext {
    pub user_agent: String,
    pub ip_address: String,
    /// Client-supplied device identifier; falls back to the user agent when empty.
    #[serde(default)]
    pub device_fingerprint: String,
}

impl RequestContext {
    pub fn new(user_agent: &str, ip_address: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            ip_address: ip_address.to_string(),
            device_fingerprint: String::new(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: &str) -> Self {
        self.device_fingerprint = fingerprint.to_string();
        self
    }

    pub fn fingerprint(&self) -> &str {
        if self.device_fingerprint.is_empty() {
            &self.user_agent
        } else {
            &self.device_fingerprint
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterPrincipalRequest {
    #[validate(email(message = "Invalid email format"))]
    pub identifier: String,

    #[validate(length(min = 8, max = 128, message = "Password must be 8-128 characters"))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, max = 320, message = "Identifier is required"))]
    pub identifier: String,
    pub proof: Proof,
    pub org_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: SecretString,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateApiKeyRequest {
    #[validate(length(min = 1, max = 64, message = "Label is required"))]
    pub label: String,
    pub expires_in_days: Option<i64>,
}

/// Access and refresh token pair. The raw refresh token appears here once.
#[derive(Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access-token lifetime in seconds.
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .field("session_id", &self.session_id)
            .field("scope", &self.scope)
            .finish()
    }
}
