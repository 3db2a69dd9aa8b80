//! Session model - a principal bound to one organization and one device.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a session or refresh token was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Logout,
    ReplayDetected,
    BindingViolation,
    SessionRevoked,
    SessionSuperseded,
    CodeReused,
    PrincipalDisabled,
    MembershipEnded,
    Administrative,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Logout => "logout",
            RevocationReason::ReplayDetected => "replay_detected",
            RevocationReason::BindingViolation => "binding_violation",
            RevocationReason::SessionRevoked => "session_revoked",
            RevocationReason::SessionSuperseded => "session_superseded",
            RevocationReason::CodeReused => "code_reused",
            RevocationReason::PrincipalDisabled => "principal_disabled",
            RevocationReason::MembershipEnded => "membership_ended",
            RevocationReason::Administrative => "administrative",
        }
    }
}

impl std::str::FromStr for RevocationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logout" => Ok(RevocationReason::Logout),
            "replay_detected" => Ok(RevocationReason::ReplayDetected),
            "binding_violation" => Ok(RevocationReason::BindingViolation),
            "session_revoked" => Ok(RevocationReason::SessionRevoked),
            "session_superseded" => Ok(RevocationReason::SessionSuperseded),
            "code_reused" => Ok(RevocationReason::CodeReused),
            "principal_disabled" => Ok(RevocationReason::PrincipalDisabled),
            "membership_ended" => Ok(RevocationReason::MembershipEnded),
            "administrative" => Ok(RevocationReason::Administrative),
            _ => Err(format!("Invalid revocation reason: {}", s)),
        }
    }
}

impl std::fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Revocation timestamp and reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub revoked_utc: DateTime<Utc>,
    pub reason: RevocationReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Expired,
    Revoked(RevocationReason),
}

/// Session entity.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub principal_id: Uuid,
    pub org_id: Uuid,
    pub device_binding_hash: String,
    pub created_utc: DateTime<Utc>,
    pub last_activity_utc: DateTime<Utc>,
    /// Sliding expiry, never later than `absolute_expires_utc`.
    pub expires_utc: DateTime<Utc>,
    pub absolute_expires_utc: DateTime<Utc>,
    pub revocation: Option<Revocation>,
}

impl Session {
    pub fn new(
        principal_id: Uuid,
        org_id: Uuid,
        device_binding_hash: String,
        now: DateTime<Utc>,
        idle_timeout: Duration,
        max_lifetime: Duration,
    ) -> Self {
        let absolute_expires_utc = now + max_lifetime;
        Self {
            session_id: Uuid::new_v4(),
            principal_id,
            org_id,
            device_binding_hash,
            created_utc: now,
            last_activity_utc: now,
            expires_utc: (now + idle_timeout).min(absolute_expires_utc),
            absolute_expires_utc,
            revocation: None,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> SessionStatus {
        match self.revocation {
            Some(r) => SessionStatus::Revoked(r.reason),
            None if now >= self.expires_utc => SessionStatus::Expired,
            None => SessionStatus::Active,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status(now) == SessionStatus::Active
    }

    /// Expiry after activity at `now`: slides by `idle_timeout`, capped by the
    /// absolute lifetime.
    pub fn slid_expiry(&self, now: DateTime<Utc>, idle_timeout: Duration) -> DateTime<Utc> {
        (now + idle_timeout).min(self.absolute_expires_utc)
    }
}
