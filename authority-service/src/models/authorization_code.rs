//! OAuth2 authorization code model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// PKCE challenge methods. Only `S256` exists; `plain` is refused at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkceChallengeMethod {
    S256,
}

impl PkceChallengeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PkceChallengeMethod::S256 => "S256",
        }
    }
}

impl std::str::FromStr for PkceChallengeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S256" => Ok(PkceChallengeMethod::S256),
            other => Err(format!("Unsupported code challenge method: {}", other)),
        }
    }
}

/// Stored status of a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationCodeStatus {
    Issued,
    /// Redeemed once; `issued_family_id` names the refresh-token family it produced.
    Exchanged {
        exchanged_utc: DateTime<Utc>,
        issued_family_id: Uuid,
    },
    /// Burned by a failed exchange (redirect or PKCE mismatch).
    Denied { denied_utc: DateTime<Utc> },
}

impl AuthorizationCodeStatus {
    pub fn code(&self) -> &'static str {
        match self {
            AuthorizationCodeStatus::Issued => "issued",
            AuthorizationCodeStatus::Exchanged { .. } => "exchanged",
            AuthorizationCodeStatus::Denied { .. } => "denied",
        }
    }
}

/// Observable state of an authorization request once a code exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationState {
    CodeIssued,
    Exchanged,
    Expired,
    Denied,
}

/// Authorization code entity. The raw code is never stored.
#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    pub code_id: Uuid,
    pub code_hash: String,
    pub client_id: String,
    pub principal_id: Uuid,
    pub org_id: Uuid,
    pub redirect_uri: String,
    pub scope: Vec<String>,
    pub code_challenge: String,
    pub code_challenge_method: PkceChallengeMethod,
    pub issued_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
    pub status: AuthorizationCodeStatus,
}

/// Everything recorded about the request a code is issued for.
#[derive(Debug, Clone)]
pub struct CodeGrant {
    pub client_id: String,
    pub principal_id: Uuid,
    pub org_id: Uuid,
    pub redirect_uri: String,
    pub scope: Vec<String>,
    pub code_challenge: String,
    pub code_challenge_method: PkceChallengeMethod,
}

impl AuthorizationCode {
    pub fn new(grant: CodeGrant, code_hash: String, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            code_id: Uuid::new_v4(),
            code_hash,
            client_id: grant.client_id,
            principal_id: grant.principal_id,
            org_id: grant.org_id,
            redirect_uri: grant.redirect_uri,
            scope: grant.scope,
            code_challenge: grant.code_challenge,
            code_challenge_method: grant.code_challenge_method,
            issued_utc: now,
            expires_utc: now + ttl,
            status: AuthorizationCodeStatus::Issued,
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> AuthorizationState {
        match self.status {
            AuthorizationCodeStatus::Exchanged { .. } => AuthorizationState::Exchanged,
            AuthorizationCodeStatus::Denied { .. } => AuthorizationState::Denied,
            AuthorizationCodeStatus::Issued if now >= self.expires_utc => {
                AuthorizationState::Expired
            }
            AuthorizationCodeStatus::Issued => AuthorizationState::CodeIssued,
        }
    }
}
