//! Login sessions.
//!
//! A session binds a principal to one organization and one device. Its expiry
//! slides with activity up to an absolute cap. Revoking a session revokes
//! every refresh token issued under it in the same store operation.

use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AuthorityError, AuthorityResult, TokenFailure};
use crate::models::{AuditEvent, AuditEventType, Revocation, RevocationReason, Session};
use crate::services::audit::AuditSink;
use crate::services::hashing::TokenHasher;
use crate::store::AuthorityStore;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::hours(24),
            max_lifetime: Duration::days(30),
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn AuthorityStore>,
    hasher: Arc<TokenHasher>,
    audit: Arc<dyn AuditSink>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn AuthorityStore>,
        hasher: Arc<TokenHasher>,
        audit: Arc<dyn AuditSink>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            store,
            hasher,
            audit,
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Open a session. Any unrevoked session for the same principal,
    /// organization and device is superseded.
    pub async fn create(
        &self,
        principal_id: Uuid,
        org_id: Uuid,
        device_fingerprint: &str,
    ) -> AuthorityResult<Session> {
        let now = self.store.now().await?;
        let session = Session::new(
            principal_id,
            org_id,
            self.hasher.hash_device(device_fingerprint),
            now,
            self.settings.idle_timeout,
            self.settings.max_lifetime,
        );

        let superseded = self.store.insert_session(&session).await?;
        for previous in &superseded {
            tracing::info!(
                session_id = %previous,
                principal_id = %principal_id,
                "Session superseded by new login on the same device"
            );
        }

        tracing::info!(session_id = %session.session_id, principal_id = %principal_id, org_id = %org_id, "Session created");
        self.audit.record(
            AuditEvent::new(AuditEventType::SessionCreated, now)
                .with_org(org_id)
                .with_principal(principal_id)
                .with_data(json!({ "session_id": session.session_id, "superseded": superseded })),
        );
        Ok(session)
    }

    /// Fetch a session that is still active.
    pub async fn validate(&self, session_id: Uuid) -> AuthorityResult<Session> {
        let now = self.store.now().await?;
        match self.store.get_session(session_id).await? {
            Some(session) if session.is_active(now) => Ok(session),
            _ => Err(TokenFailure::SessionInactive.into()),
        }
    }

    /// Record activity and slide the expiry.
    pub async fn touch(&self, session_id: Uuid) -> AuthorityResult<Session> {
        let now = self.store.now().await?;
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .filter(|s| s.is_active(now))
            .ok_or(TokenFailure::SessionInactive)?;

        let expires_utc = session.slid_expiry(now, self.settings.idle_timeout);
        if !self.store.touch_session(session_id, now, expires_utc).await? {
            return Err(TokenFailure::SessionInactive.into());
        }
        session.last_activity_utc = now;
        session.expires_utc = expires_utc;
        Ok(session)
    }

    /// Revoke a session and its refresh tokens. Returns false if it was
    /// already revoked.
    pub async fn revoke(&self, session_id: Uuid, reason: RevocationReason) -> AuthorityResult<bool> {
        let now = self.store.now().await?;
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| AuthorityError::NotFound("session".to_string()))?;

        let revoked = self
            .store
            .revoke_session(session_id, Revocation { revoked_utc: now, reason })
            .await?;
        if revoked {
            tracing::info!(session_id = %session_id, reason = %reason, "Session revoked");
            self.audit.record(
                AuditEvent::new(AuditEventType::SessionRevoked, now)
                    .with_org(session.org_id)
                    .with_principal(session.principal_id)
                    .with_data(json!({ "session_id": session_id, "reason": reason.as_str() })),
            );
        }
        Ok(revoked)
    }

    /// Revoke every session of a principal, optionally only in one organization.
    pub async fn revoke_all(
        &self,
        principal_id: Uuid,
        org_id: Option<Uuid>,
        reason: RevocationReason,
    ) -> AuthorityResult<u64> {
        let now = self.store.now().await?;
        let count = self
            .store
            .revoke_sessions_for_principal(
                principal_id,
                org_id,
                Revocation { revoked_utc: now, reason },
            )
            .await?;

        tracing::info!(principal_id = %principal_id, org_id = ?org_id, count, reason = %reason, "Sessions revoked");
        if count > 0 {
            let mut event = AuditEvent::new(AuditEventType::SessionRevoked, now)
                .with_principal(principal_id)
                .with_data(json!({ "count": count, "reason": reason.as_str() }));
            if let Some(org_id) = org_id {
                event = event.with_org(org_id);
            }
            self.audit.record(event);
        }
        Ok(count)
    }

    pub async fn list_active(&self, principal_id: Uuid) -> AuthorityResult<Vec<Session>> {
        let now = self.store.now().await?;
        let mut sessions: Vec<Session> = self
            .store
            .list_sessions_for_principal(principal_id)
            .await?
            .into_iter()
            .filter(|s| s.is_active(now))
            .collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.last_activity_utc));
        Ok(sessions)
    }
}
