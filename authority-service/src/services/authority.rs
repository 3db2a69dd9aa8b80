//! The authority's public surface.
//!
//! [`Authority`] wires the components together and puts the rate gate in
//! front of credential checks, refreshes and code exchanges. Handlers call
//! these methods and nothing else.

use secrecy::SecretString;
use serde_json::json;
use service_core::rate_limit::RateGate;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::config::{AuthorityConfig, LOGIN_SCOPE, REFRESH_SCOPE, TOKEN_EXCHANGE_SCOPE};
use crate::dtos::auth::{LoginRequest, RefreshRequest, RequestContext, TokenPair};
use crate::dtos::oauth::{AuthorizationGrant, AuthorizeRequest, ExchangeRequest};
use crate::error::{AuthorityError, AuthorityResult};
use crate::models::{
    normalize_identifier, AuditEvent, AuditEventType, MembershipState, PrincipalState,
    RevocationReason,
};
use crate::services::audit::AuditSink;
use crate::services::credentials::CredentialVerifier;
use crate::services::hashing::{Argon2Hasher, CredentialHasher, TokenHasher};
use crate::services::keys::{AccessTokenClaims, SigningKeys};
use crate::services::oauth::{AuthorizationEngine, OAuthSettings};
use crate::services::permissions::PermissionResolver;
use crate::services::sessions::{SessionManager, SessionSettings};
use crate::services::tokens::{TokenIssuer, TokenSettings};
use crate::store::AuthorityStore;

#[derive(Debug, Clone, Default)]
pub struct AuthoritySettings {
    pub tokens: TokenSettings,
    pub sessions: SessionSettings,
    pub oauth: OAuthSettings,
}

/// Long-lived collaborators, built once at startup.
pub struct AuthorityDeps {
    pub store: Arc<dyn AuthorityStore>,
    pub keys: Arc<SigningKeys>,
    pub token_hasher: Arc<TokenHasher>,
    pub credential_hasher: Arc<dyn CredentialHasher>,
    pub audit: Arc<dyn AuditSink>,
    pub gate: Arc<dyn RateGate>,
}

#[derive(Clone)]
pub struct Authority {
    store: Arc<dyn AuthorityStore>,
    audit: Arc<dyn AuditSink>,
    gate: Arc<dyn RateGate>,
    credentials: CredentialVerifier,
    permissions: PermissionResolver,
    sessions: SessionManager,
    tokens: TokenIssuer,
    oauth: AuthorizationEngine,
}

impl Authority {
    pub fn new(deps: AuthorityDeps, settings: AuthoritySettings) -> Self {
        let AuthorityDeps {
            store,
            keys,
            token_hasher,
            credential_hasher,
            audit,
            gate,
        } = deps;

        let credentials = CredentialVerifier::new(store.clone(), credential_hasher);
        let permissions = PermissionResolver::new(store.clone(), audit.clone());
        let sessions = SessionManager::new(
            store.clone(),
            token_hasher.clone(),
            audit.clone(),
            settings.sessions,
        );
        let tokens = TokenIssuer::new(
            store.clone(),
            permissions.clone(),
            sessions.clone(),
            keys,
            token_hasher.clone(),
            audit.clone(),
            settings.tokens,
        );
        let oauth = AuthorizationEngine::new(
            store.clone(),
            permissions.clone(),
            tokens.clone(),
            credentials.clone(),
            token_hasher,
            audit.clone(),
            settings.oauth,
        );

        Self {
            store,
            audit,
            gate,
            credentials,
            permissions,
            sessions,
            tokens,
            oauth,
        }
    }

    /// Build the authority from configuration with Argon2 credential hashing.
    pub fn from_config(
        config: &AuthorityConfig,
        store: Arc<dyn AuthorityStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, anyhow::Error> {
        let deps = AuthorityDeps {
            store,
            keys: Arc::new(SigningKeys::from_config(&config.tokens)?),
            token_hasher: Arc::new(TokenHasher::new(&config.tokens.hash_secret)?),
            credential_hasher: Arc::new(Argon2Hasher),
            audit,
            gate: Arc::new(config.rate_limit.build_gate()),
        };
        let settings = AuthoritySettings {
            tokens: config.token_settings(),
            sessions: config.session_settings(),
            oauth: config.oauth_settings(),
        };
        Ok(Self::new(deps, settings))
    }

    pub fn credentials(&self) -> &CredentialVerifier {
        &self.credentials
    }

    pub fn permissions(&self) -> &PermissionResolver {
        &self.permissions
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn oauth(&self) -> &AuthorizationEngine {
        &self.oauth
    }

    fn check_gate(&self, scope: &str, identifier: &str) -> AuthorityResult<()> {
        if self.gate.allow(scope, identifier) {
            Ok(())
        } else {
            Err(AuthorityError::RateLimited(scope.to_string()))
        }
    }

    /// Authenticate, open a session in `org_id`, and issue the first token pair.
    pub async fn login(&self, req: LoginRequest, ctx: &RequestContext) -> AuthorityResult<TokenPair> {
        req.validate()?;
        let identifier = normalize_identifier(&req.identifier);
        self.check_gate(LOGIN_SCOPE, &identifier)?;

        let principal = match self.credentials.verify(&identifier, &req.proof).await {
            Ok(principal) => principal,
            Err(AuthorityError::Auth(failure)) => {
                let now = self.store.now().await?;
                tracing::info!(org_id = %req.org_id, reason = %failure, "Login failed");
                self.audit.record(
                    AuditEvent::new(AuditEventType::LoginFailed, now)
                        .with_org(req.org_id)
                        .with_data(json!({ "reason": failure.to_string() })),
                );
                return Err(failure.into());
            }
            Err(e) => return Err(e),
        };

        self.permissions
            .resolve_access(principal.principal_id, req.org_id)
            .await?;
        let session = self
            .sessions
            .create(principal.principal_id, req.org_id, ctx.fingerprint())
            .await?;
        let pair = self.tokens.issue_for_session(&session, ctx).await?;

        tracing::info!(principal_id = %principal.principal_id, org_id = %req.org_id, "Login succeeded");
        self.audit.record(
            AuditEvent::new(AuditEventType::LoginSucceeded, session.created_utc)
                .with_org(req.org_id)
                .with_principal(principal.principal_id)
                .with_data(json!({ "session_id": session.session_id })),
        );
        Ok(pair)
    }

    pub async fn refresh(&self, req: RefreshRequest, ctx: &RequestContext) -> AuthorityResult<TokenPair> {
        self.check_gate(REFRESH_SCOPE, &ctx.ip_address)?;
        self.tokens.rotate(&req.refresh_token, ctx).await
    }

    /// End the session a refresh token belongs to, or its family for
    /// OAuth-issued tokens.
    pub async fn logout(&self, raw_refresh: &SecretString) -> AuthorityResult<()> {
        let presented = self.tokens.find_presented(raw_refresh).await?;
        match presented.session_id {
            Some(session_id) => {
                self.sessions
                    .revoke(session_id, RevocationReason::Logout)
                    .await?;
            }
            None => {
                self.tokens
                    .revoke_family(presented.family_id, RevocationReason::Logout)
                    .await?;
            }
        }
        Ok(())
    }

    /// End every session and refresh token family of a principal, in one
    /// organization or everywhere. Returns the number of sessions revoked.
    pub async fn logout_all(&self, principal_id: Uuid, org_id: Option<Uuid>) -> AuthorityResult<u64> {
        self.end_grants(principal_id, org_id, RevocationReason::Logout)
            .await
    }

    /// Sessions first, then the sessionless OAuth families.
    async fn end_grants(
        &self,
        principal_id: Uuid,
        org_id: Option<Uuid>,
        reason: RevocationReason,
    ) -> AuthorityResult<u64> {
        let sessions = self.sessions.revoke_all(principal_id, org_id, reason).await?;
        self.tokens
            .revoke_for_principal(principal_id, org_id, reason)
            .await?;
        Ok(sessions)
    }

    pub async fn authorize(
        &self,
        principal_id: Uuid,
        req: AuthorizeRequest,
    ) -> AuthorityResult<AuthorizationGrant> {
        self.oauth.issue_code(principal_id, req).await
    }

    pub async fn exchange_code(
        &self,
        req: ExchangeRequest,
        ctx: &RequestContext,
    ) -> AuthorityResult<TokenPair> {
        self.check_gate(TOKEN_EXCHANGE_SCOPE, &req.client_id)?;
        self.oauth.exchange(req, ctx).await
    }

    pub fn verify_access_token(&self, token: &str) -> AuthorityResult<AccessTokenClaims> {
        self.tokens.verify_access_token(token)
    }

    /// Suspend a principal and end all of their sessions and OAuth grants.
    pub async fn disable_principal(&self, principal_id: Uuid) -> AuthorityResult<u64> {
        self.store
            .set_principal_state(principal_id, PrincipalState::Suspended)
            .await?;
        tracing::info!(principal_id = %principal_id, "Principal disabled");
        self.end_grants(principal_id, None, RevocationReason::PrincipalDisabled)
            .await
    }

    /// Remove a principal from an organization and end their sessions and
    /// OAuth grants there.
    pub async fn remove_member(&self, org_id: Uuid, principal_id: Uuid) -> AuthorityResult<u64> {
        let membership = self
            .store
            .find_membership(principal_id, org_id)
            .await?
            .ok_or_else(|| AuthorityError::NotFound("membership".to_string()))?;
        self.store
            .set_membership_state(membership.membership_id, MembershipState::Removed)
            .await?;
        tracing::info!(principal_id = %principal_id, org_id = %org_id, "Member removed");
        self.end_grants(principal_id, Some(org_id), RevocationReason::MembershipEnded)
            .await
    }
}
