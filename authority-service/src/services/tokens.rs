//! Access-token minting and refresh-token rotation.
//!
//! Refresh tokens are opaque random values; only their keyed hash is stored.
//! Each rotation consumes the presented token and issues a successor in the
//! same family. Presenting a consumed token again, or presenting one from a
//! different device, revokes the whole family.

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::dtos::auth::{RequestContext, TokenPair};
use crate::error::{AuthorityError, AuthorityResult, TokenFailure};
use crate::models::{
    AuditEvent, AuditEventType, DeviceBinding, RefreshToken, RefreshTokenStatus, Revocation,
    RevocationReason, Session, TokenOwner,
};
use crate::services::audit::AuditSink;
use crate::services::hashing::{constant_time_eq, generate_random_token, TokenHasher};
use crate::services::keys::{AccessTokenClaims, SigningKeys};
use crate::services::permissions::{PermissionResolver, ResolvedAccess};
use crate::services::sessions::SessionManager;
use crate::store::{AuthorityStore, RotationOutcome};

#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub issuer: String,
    pub audience: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    /// Reject rotations from a different IP address than the token was issued to.
    pub enforce_ip_binding: bool,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            issuer: "authority-service".to_string(),
            audience: "authority-clients".to_string(),
            access_token_ttl: Duration::minutes(15),
            refresh_token_ttl: Duration::days(30),
            enforce_ip_binding: true,
        }
    }
}

#[derive(Clone)]
pub struct TokenIssuer {
    store: Arc<dyn AuthorityStore>,
    resolver: PermissionResolver,
    sessions: SessionManager,
    keys: Arc<SigningKeys>,
    hasher: Arc<TokenHasher>,
    audit: Arc<dyn AuditSink>,
    settings: TokenSettings,
}

impl TokenIssuer {
    pub fn new(
        store: Arc<dyn AuthorityStore>,
        resolver: PermissionResolver,
        sessions: SessionManager,
        keys: Arc<SigningKeys>,
        hasher: Arc<TokenHasher>,
        audit: Arc<dyn AuditSink>,
        settings: TokenSettings,
    ) -> Self {
        Self {
            store,
            resolver,
            sessions,
            keys,
            hasher,
            audit,
            settings,
        }
    }

    pub fn settings(&self) -> &TokenSettings {
        &self.settings
    }

    pub fn binding_for(&self, ctx: &RequestContext) -> DeviceBinding {
        DeviceBinding {
            user_agent_hash: self.hasher.hash_user_agent(&ctx.user_agent),
            ip_hash: self.hasher.hash_ip(&ctx.ip_address),
        }
    }

    fn binding_matches(&self, stored: &DeviceBinding, presented: &DeviceBinding) -> bool {
        let user_agent_ok = constant_time_eq(&stored.user_agent_hash, &presented.user_agent_hash);
        let ip_ok = !self.settings.enforce_ip_binding
            || constant_time_eq(&stored.ip_hash, &presented.ip_hash);
        user_agent_ok && ip_ok
    }

    /// Sign an access token for `access`.
    ///
    /// With a `scope`, the permission claim is narrowed to the granted scope.
    pub fn mint_access_token(
        &self,
        access: &ResolvedAccess,
        session_id: Option<Uuid>,
        client_id: Option<&str>,
        scope: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> AuthorityResult<String> {
        let permissions: Vec<String> = match scope {
            Some(scope) => access
                .permissions
                .iter()
                .filter(|p| scope.contains(p))
                .cloned()
                .collect(),
            None => access.permissions.iter().cloned().collect(),
        };

        let claims = AccessTokenClaims {
            sub: access.principal_id,
            org_id: access.org_id,
            role_id: access.role_id,
            permissions,
            is_superadmin: access.is_superadmin,
            iss: self.settings.issuer.clone(),
            aud: self.settings.audience.clone(),
            iat: now.timestamp(),
            exp: (now + self.settings.access_token_ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
            sid: session_id,
            client_id: client_id.map(str::to_string),
            scope: scope.map(|s| s.join(" ")),
        };

        Ok(self.keys.sign(&claims)?)
    }

    /// Verify an access token without touching storage.
    pub fn verify_access_token(&self, token: &str) -> AuthorityResult<AccessTokenClaims> {
        self.keys
            .verify(token, &self.settings.issuer, &self.settings.audience)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenFailure::Expired.into(),
                _ => {
                    tracing::debug!(error = %e, "Access token rejected");
                    TokenFailure::InvalidAccessToken.into()
                }
            })
    }

    /// Generate a raw refresh token and the unsaved first row of a new family.
    pub(crate) fn new_family(
        &self,
        owner: TokenOwner,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> (String, RefreshToken) {
        let raw = generate_random_token();
        let token = RefreshToken::new_family(
            owner,
            self.hasher.hash_refresh_token(&raw),
            self.binding_for(ctx),
            now,
            self.settings.refresh_token_ttl,
        );
        (raw, token)
    }

    /// Mint the access token that accompanies a stored refresh token.
    pub(crate) fn token_pair(
        &self,
        access: &ResolvedAccess,
        refresh: &RefreshToken,
        raw_refresh: String,
        now: DateTime<Utc>,
    ) -> AuthorityResult<TokenPair> {
        let scope = refresh.client_id.as_ref().map(|_| refresh.scope.as_slice());
        let access_token = self.mint_access_token(
            access,
            refresh.session_id,
            refresh.client_id.as_deref(),
            scope,
            now,
        )?;

        Ok(TokenPair {
            access_token,
            refresh_token: raw_refresh,
            token_type: "Bearer".to_string(),
            expires_in: self.settings.access_token_ttl.num_seconds(),
            session_id: refresh.session_id,
            scope: scope.map(|s| s.join(" ")),
        })
    }

    /// Issue the first token pair of a login session.
    pub async fn issue_for_session(
        &self,
        session: &Session,
        ctx: &RequestContext,
    ) -> AuthorityResult<TokenPair> {
        let now = self.store.now().await?;
        if !session.is_active(now) {
            return Err(TokenFailure::SessionInactive.into());
        }
        let access = self
            .resolver
            .resolve_access(session.principal_id, session.org_id)
            .await?;

        let owner = TokenOwner {
            principal_id: session.principal_id,
            org_id: session.org_id,
            session_id: Some(session.session_id),
            client_id: None,
            scope: Vec::new(),
        };
        let (raw, refresh) = self.new_family(owner, ctx, now);
        self.store.insert_refresh_token(&refresh).await?;

        tracing::info!(
            principal_id = %session.principal_id,
            session_id = %session.session_id,
            family_id = %refresh.family_id,
            "Token family issued"
        );
        self.audit.record(
            AuditEvent::new(AuditEventType::TokenIssued, now)
                .with_org(session.org_id)
                .with_principal(session.principal_id)
                .with_data(json!({ "family_id": refresh.family_id, "session_id": session.session_id })),
        );

        self.token_pair(&access, &refresh, raw, now)
    }

    /// Exchange a refresh token for a new pair.
    pub async fn rotate(
        &self,
        raw_refresh: &SecretString,
        ctx: &RequestContext,
    ) -> AuthorityResult<TokenPair> {
        let now = self.store.now().await?;
        let token_hash = self.hasher.hash_refresh_token(raw_refresh.expose_secret());
        let presented = self
            .store
            .find_refresh_token_by_hash(&token_hash)
            .await?
            .ok_or(TokenFailure::InvalidRefreshToken)?;

        if presented.is_expired(now) {
            return Err(TokenFailure::InvalidRefreshToken.into());
        }
        match presented.status {
            RefreshTokenStatus::Revoked(_) => return Err(TokenFailure::InvalidRefreshToken.into()),
            RefreshTokenStatus::Used { .. } => return Err(self.replay_detected(&presented, now).await),
            RefreshTokenStatus::Active => {}
        }

        let binding = self.binding_for(ctx);
        if !self.binding_matches(&presented.binding, &binding) {
            return Err(self.binding_violation(&presented, now).await);
        }

        if let Some(session_id) = presented.session_id {
            self.sessions.validate(session_id).await?;
        }

        let access = self
            .resolver
            .resolve_access(presented.principal_id, presented.org_id)
            .await?;

        let raw = generate_random_token();
        let successor = presented.successor(
            self.hasher.hash_refresh_token(&raw),
            binding,
            now,
            self.settings.refresh_token_ttl,
        );

        match self
            .store
            .rotate_refresh_token(presented.token_id, &successor)
            .await?
        {
            RotationOutcome::Rotated => {}
            RotationOutcome::AlreadyConsumed => {
                return Err(self.replay_detected(&presented, now).await);
            }
            RotationOutcome::Revoked => {
                tracing::info!(
                    family_id = %presented.family_id,
                    "Refresh token revoked during rotation"
                );
                return Err(TokenFailure::InvalidRefreshToken.into());
            }
        }

        if let Some(session_id) = presented.session_id {
            self.sessions.touch(session_id).await?;
        }

        tracing::info!(
            principal_id = %presented.principal_id,
            family_id = %presented.family_id,
            token_id = %successor.token_id,
            "Refresh token rotated"
        );
        self.audit.record(
            AuditEvent::new(AuditEventType::TokenRotated, now)
                .with_org(presented.org_id)
                .with_principal(presented.principal_id)
                .with_data(json!({
                    "family_id": presented.family_id,
                    "replaced_id": presented.token_id,
                    "token_id": successor.token_id,
                })),
        );

        self.token_pair(&access, &successor, raw, now)
    }

    async fn replay_detected(&self, presented: &RefreshToken, now: DateTime<Utc>) -> AuthorityError {
        self.security_revoke(
            presented,
            now,
            RevocationReason::ReplayDetected,
            AuditEventType::ReplayDetected,
            TokenFailure::ReplayDetected,
        )
        .await
    }

    async fn binding_violation(&self, presented: &RefreshToken, now: DateTime<Utc>) -> AuthorityError {
        self.security_revoke(
            presented,
            now,
            RevocationReason::BindingViolation,
            AuditEventType::BindingViolation,
            TokenFailure::BindingViolation,
        )
        .await
    }

    /// Revoke the presented token's family and report the failure.
    async fn security_revoke(
        &self,
        presented: &RefreshToken,
        now: DateTime<Utc>,
        reason: RevocationReason,
        event_type: AuditEventType,
        failure: TokenFailure,
    ) -> AuthorityError {
        let revoked = match self
            .store
            .revoke_token_family(presented.family_id, Revocation { revoked_utc: now, reason })
            .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(error = %e, family_id = %presented.family_id, "Failed to revoke token family");
                return e.into();
            }
        };

        tracing::warn!(
            principal_id = %presented.principal_id,
            family_id = %presented.family_id,
            token_id = %presented.token_id,
            revoked,
            reason = %reason,
            "Token family revoked"
        );
        let mut event = AuditEvent::new(event_type, now)
            .with_org(presented.org_id)
            .with_principal(presented.principal_id)
            .with_data(json!({
                "family_id": presented.family_id,
                "token_id": presented.token_id,
                "session_id": presented.session_id,
                "revoked": revoked,
            }));
        if let Some(client_id) = &presented.client_id {
            event = event.with_client(client_id);
        }
        self.audit.record(event);

        failure.into()
    }

    /// Revoke every token in a family, used or not.
    pub async fn revoke_family(
        &self,
        family_id: Uuid,
        reason: RevocationReason,
    ) -> AuthorityResult<u64> {
        let now = self.store.now().await?;
        let revoked = self
            .store
            .revoke_token_family(family_id, Revocation { revoked_utc: now, reason })
            .await?;

        tracing::info!(family_id = %family_id, revoked, reason = %reason, "Token family revoked");
        self.audit.record(
            AuditEvent::new(AuditEventType::TokenRevoked, now)
                .with_data(json!({ "family_id": family_id, "revoked": revoked, "reason": reason.as_str() })),
        );
        Ok(revoked)
    }

    /// Revoke every refresh token a principal holds, in one organization or
    /// everywhere. Reaches OAuth families that no session cascade covers.
    pub async fn revoke_for_principal(
        &self,
        principal_id: Uuid,
        org_id: Option<Uuid>,
        reason: RevocationReason,
    ) -> AuthorityResult<u64> {
        let now = self.store.now().await?;
        let revoked = self
            .store
            .revoke_refresh_tokens_for_principal(
                principal_id,
                org_id,
                Revocation { revoked_utc: now, reason },
            )
            .await?;

        tracing::info!(principal_id = %principal_id, org_id = ?org_id, revoked, reason = %reason, "Principal refresh tokens revoked");
        let mut event = AuditEvent::new(AuditEventType::TokenRevoked, now)
            .with_principal(principal_id)
            .with_data(json!({ "revoked": revoked, "reason": reason.as_str() }));
        if let Some(org_id) = org_id {
            event = event.with_org(org_id);
        }
        self.audit.record(event);
        Ok(revoked)
    }

    /// Look up a presented refresh token regardless of its status.
    pub async fn find_presented(&self, raw_refresh: &SecretString) -> AuthorityResult<RefreshToken> {
        let token_hash = self.hasher.hash_refresh_token(raw_refresh.expose_secret());
        self.store
            .find_refresh_token_by_hash(&token_hash)
            .await?
            .ok_or_else(|| TokenFailure::InvalidRefreshToken.into())
    }

    /// Revoke the family of a presented refresh token.
    pub async fn revoke_refresh_token(
        &self,
        raw_refresh: &SecretString,
        reason: RevocationReason,
    ) -> AuthorityResult<u64> {
        let presented = self.find_presented(raw_refresh).await?;
        self.revoke_family(presented.family_id, reason).await
    }
}
