//! Refresh token model.
//!
//! Only the keyed hash of a refresh token is stored. Every token produced by
//! rotating one original issuance shares its `family_id`, which is the unit of
//! revocation when replay or a binding violation is detected.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::session::{Revocation, RevocationReason};

/// Lifecycle of a single refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTokenStatus {
    /// Never presented for rotation.
    Active,
    /// Consumed by a rotation that produced `replaced_by_id`.
    Used {
        used_utc: DateTime<Utc>,
        replaced_by_id: Uuid,
    },
    Revoked(Revocation),
}

impl RefreshTokenStatus {
    pub fn code(&self) -> &'static str {
        match self {
            RefreshTokenStatus::Active => "active",
            RefreshTokenStatus::Used { .. } => "used",
            RefreshTokenStatus::Revoked(_) => "revoked",
        }
    }
}

/// Device metadata a refresh token is bound to, already hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBinding {
    pub user_agent_hash: String,
    pub ip_hash: String,
}

/// Refresh token entity.
#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub token_id: Uuid,
    pub principal_id: Uuid,
    pub org_id: Uuid,
    /// Login session this token belongs to; `None` for OAuth-issued tokens.
    pub session_id: Option<Uuid>,
    /// Client application for OAuth-issued tokens.
    pub client_id: Option<String>,
    /// Granted OAuth scope; empty for session tokens.
    pub scope: Vec<String>,
    pub token_hash: String,
    pub family_id: Uuid,
    pub binding: DeviceBinding,
    pub issued_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
    pub status: RefreshTokenStatus,
}

/// Ownership of a new token family.
#[derive(Debug, Clone)]
pub struct TokenOwner {
    pub principal_id: Uuid,
    pub org_id: Uuid,
    pub session_id: Option<Uuid>,
    pub client_id: Option<String>,
    pub scope: Vec<String>,
}

impl RefreshToken {
    /// First token of a new family.
    pub fn new_family(
        owner: TokenOwner,
        token_hash: String,
        binding: DeviceBinding,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            token_id: Uuid::new_v4(),
            principal_id: owner.principal_id,
            org_id: owner.org_id,
            session_id: owner.session_id,
            client_id: owner.client_id,
            scope: owner.scope,
            token_hash,
            family_id: Uuid::new_v4(),
            binding,
            issued_utc: now,
            expires_utc: now + ttl,
            status: RefreshTokenStatus::Active,
        }
    }

    /// Next token in this family, issued when `self` is rotated.
    pub fn successor(
        &self,
        token_hash: String,
        binding: DeviceBinding,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            token_id: Uuid::new_v4(),
            principal_id: self.principal_id,
            org_id: self.org_id,
            session_id: self.session_id,
            client_id: self.client_id.clone(),
            scope: self.scope.clone(),
            token_hash,
            family_id: self.family_id,
            binding,
            issued_utc: now,
            expires_utc: now + ttl,
            status: RefreshTokenStatus::Active,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_utc
    }

    pub fn revocation_reason(&self) -> Option<RevocationReason> {
        match self.status {
            RefreshTokenStatus::Revoked(r) => Some(r.reason),
            _ => None,
        }
    }
}
