//! Principal model - authenticated identities and their API keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Principal lifecycle states. Principals are never deleted, only suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalState {
    Active,
    Suspended,
}

impl PrincipalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalState::Active => "active",
            PrincipalState::Suspended => "suspended",
        }
    }
}

impl std::str::FromStr for PrincipalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(PrincipalState::Active),
            "suspended" => Ok(PrincipalState::Suspended),
            _ => Err(format!("Invalid principal state: {}", s)),
        }
    }
}

/// Principal entity.
#[derive(Debug, Clone)]
pub struct Principal {
    pub principal_id: Uuid,
    /// Normalized login identifier (lowercased email).
    pub identifier: String,
    /// Digest produced by the credential hasher; `None` for key-only principals.
    pub credential_hash: Option<String>,
    pub email_verified: bool,
    pub is_superadmin: bool,
    pub state: PrincipalState,
    pub created_utc: DateTime<Utc>,
}

impl Principal {
    /// Create a new, unverified, active principal.
    pub fn new(identifier: &str, credential_hash: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            principal_id: Uuid::new_v4(),
            identifier: normalize_identifier(identifier),
            credential_hash,
            email_verified: false,
            is_superadmin: false,
            state: PrincipalState::Active,
            created_utc: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == PrincipalState::Active
    }
}

/// Identifiers compare case-insensitively and ignore surrounding whitespace.
pub fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

/// Prefix of every raw API key: `ak_<key_prefix>_<secret>`.
pub const API_KEY_SCHEME: &str = "ak";

/// API key credential. Only the digest of the secret part is stored.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub key_id: Uuid,
    pub principal_id: Uuid,
    /// Public lookup handle embedded in the raw key.
    pub key_prefix: String,
    pub key_hash: String,
    pub label: String,
    pub created_utc: DateTime<Utc>,
    pub expires_utc: Option<DateTime<Utc>>,
    pub revoked_utc: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn new(
        principal_id: Uuid,
        key_prefix: String,
        key_hash: String,
        label: String,
        expires_utc: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key_id: Uuid::new_v4(),
            principal_id,
            key_prefix,
            key_hash,
            label,
            created_utc: now,
            expires_utc,
            revoked_utc: None,
        }
    }

    /// Not revoked and not past its expiry.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.revoked_utc.is_none() && self.expires_utc.map_or(true, |exp| exp > now)
    }
}

/// Split a raw API key into `(prefix, secret)`.
pub fn split_api_key(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix(API_KEY_SCHEME)?.strip_prefix('_')?;
    let (prefix, secret) = rest.split_once('_')?;
    if prefix.is_empty() || secret.is_empty() {
        return None;
    }
    Some((prefix, secret))
}
