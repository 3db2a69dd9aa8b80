//! OAuth2 authorization code grant with PKCE.
//!
//! A code moves `CodeIssued -> Exchanged | Expired | Denied`. Codes are single
//! use: presenting an exchanged code again is rejected and the token family it
//! produced is revoked. A redirect or verifier mismatch burns the code.

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::admin::{RegisterClientRequest, RegisterClientResponse};
use crate::dtos::auth::{RequestContext, TokenPair};
use crate::dtos::oauth::{AuthorizationGrant, AuthorizeRequest, ExchangeRequest};
use crate::error::{AuthorityError, AuthorityResult, ProtocolFailure};
use crate::models::{
    normalize_name, AuditEvent, AuditEventType, AuthorizationCode, AuthorizationCodeStatus,
    AuthorizationState, ClientApplication, ClientType, CodeGrant, PkceChallengeMethod,
    RevocationReason, TokenOwner,
};
use crate::services::audit::AuditSink;
use crate::services::credentials::CredentialVerifier;
use crate::services::hashing::{generate_random_token, TokenHasher};
use crate::services::permissions::{PermissionResolver, ResolvedAccess};
use crate::services::pkce;
use crate::services::tokens::TokenIssuer;
use crate::store::{AuthorityStore, RedemptionOutcome, StoreError};

#[derive(Debug, Clone)]
pub struct OAuthSettings {
    /// Lifetime of an issued code.
    pub code_ttl: Duration,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            code_ttl: Duration::minutes(5),
        }
    }
}

#[derive(Clone)]
pub struct AuthorizationEngine {
    store: Arc<dyn AuthorityStore>,
    resolver: PermissionResolver,
    issuer: TokenIssuer,
    credentials: CredentialVerifier,
    hasher: Arc<TokenHasher>,
    audit: Arc<dyn AuditSink>,
    settings: OAuthSettings,
}

impl AuthorizationEngine {
    pub fn new(
        store: Arc<dyn AuthorityStore>,
        resolver: PermissionResolver,
        issuer: TokenIssuer,
        credentials: CredentialVerifier,
        hasher: Arc<TokenHasher>,
        audit: Arc<dyn AuditSink>,
        settings: OAuthSettings,
    ) -> Self {
        Self {
            store,
            resolver,
            issuer,
            credentials,
            hasher,
            audit,
            settings,
        }
    }

    /// Register a client application. Confidential clients get a secret,
    /// returned once.
    pub async fn register_client(
        &self,
        req: RegisterClientRequest,
    ) -> AuthorityResult<RegisterClientResponse> {
        req.validate()?;
        if let Some(uri) = req
            .redirect_uris
            .iter()
            .find(|uri| !is_registrable_redirect(uri))
        {
            return Err(AuthorityError::Validation(format!(
                "Redirect URI is not absolute or carries a fragment: {}",
                uri
            )));
        }

        let now = self.store.now().await?;
        let allowed_scopes: Vec<String> = req.allowed_scopes.iter().map(|s| normalize_name(s)).collect();
        let (client, secret) = match req.client_type {
            ClientType::Confidential => {
                let secret = generate_random_token();
                let digest = self
                    .credentials
                    .hash_secret(&SecretString::new(secret.clone()))
                    .await?;
                let client = ClientApplication::confidential(
                    &req.client_id,
                    digest,
                    &req.display_name,
                    req.redirect_uris.clone(),
                    allowed_scopes,
                    now,
                );
                (client, Some(secret))
            }
            ClientType::Public => (
                ClientApplication::public(
                    &req.client_id,
                    &req.display_name,
                    req.redirect_uris.clone(),
                    allowed_scopes,
                    now,
                ),
                None,
            ),
        };

        self.store.insert_client(&client).await.map_err(|e| match e {
            StoreError::Conflict(_) => {
                AuthorityError::Validation(format!("Client {} already exists", req.client_id))
            }
            other => other.into(),
        })?;

        tracing::info!(client_id = %client.client_id, client_type = %client.client_type, "Client registered");
        Ok(RegisterClientResponse {
            client_id: client.client_id,
            client_secret: secret,
            client_type: client.client_type,
        })
    }

    async fn enabled_client(&self, client_id: &str) -> AuthorityResult<ClientApplication> {
        self.store
            .get_client(client_id)
            .await?
            .filter(|c| c.enabled)
            .ok_or_else(|| ProtocolFailure::InvalidClient.into())
    }

    fn code_event(
        &self,
        event_type: AuditEventType,
        code: &AuthorizationCode,
        now: DateTime<Utc>,
        data: serde_json::Value,
    ) -> AuditEvent {
        AuditEvent::new(event_type, now)
            .with_org(code.org_id)
            .with_principal(code.principal_id)
            .with_client(&code.client_id)
            .with_data(data)
    }

    /// Issue a code for a principal who has authenticated and consented.
    pub async fn issue_code(
        &self,
        principal_id: Uuid,
        req: AuthorizeRequest,
    ) -> AuthorityResult<AuthorizationGrant> {
        req.validate()
            .map_err(|_| AuthorityError::from(ProtocolFailure::InvalidRequest))?;
        let method: PkceChallengeMethod = req
            .code_challenge_method
            .parse()
            .map_err(|_| ProtocolFailure::UnsupportedChallengeMethod)?;
        pkce::validate_challenge(&req.code_challenge).map_err(|_| ProtocolFailure::InvalidRequest)?;

        let client = self.enabled_client(&req.client_id).await?;
        if !client.has_redirect_uri(&req.redirect_uri) {
            tracing::warn!(client_id = %client.client_id, "Authorization request with unregistered redirect URI");
            return Err(ProtocolFailure::RedirectMismatch.into());
        }
        let scope: Vec<String> = req.scopes().iter().map(|s| normalize_name(s)).collect();
        if !client.allows_scopes(&scope) {
            return Err(ProtocolFailure::ScopeNotAllowed.into());
        }

        let now = self.store.now().await?;
        if let Err(e) = self.resolver.resolve_access(principal_id, req.org_id).await {
            if !is_access_failure(&e) {
                return Err(e);
            }
            tracing::warn!(principal_id = %principal_id, org_id = %req.org_id, error = %e, "Authorization denied");
            self.audit.record(
                AuditEvent::new(AuditEventType::CodeDenied, now)
                    .with_org(req.org_id)
                    .with_principal(principal_id)
                    .with_client(&client.client_id)
                    .with_data(json!({ "reason": e.to_string() })),
            );
            return Err(ProtocolFailure::AccessDenied.into());
        }

        let raw = generate_random_token();
        let code = AuthorizationCode::new(
            CodeGrant {
                client_id: client.client_id.clone(),
                principal_id,
                org_id: req.org_id,
                redirect_uri: req.redirect_uri.clone(),
                scope,
                code_challenge: req.code_challenge.clone(),
                code_challenge_method: method,
            },
            self.hasher.hash_authorization_code(&raw),
            now,
            self.settings.code_ttl,
        );
        self.store.insert_authorization_code(&code).await?;

        tracing::info!(
            code_id = %code.code_id,
            client_id = %code.client_id,
            principal_id = %principal_id,
            "Authorization code issued"
        );
        self.audit.record(self.code_event(
            AuditEventType::CodeIssued,
            &code,
            now,
            json!({ "code_id": code.code_id, "scope": code.scope }),
        ));

        Ok(AuthorizationGrant {
            code: raw,
            redirect_uri: req.redirect_uri,
            expires_in: self.settings.code_ttl.num_seconds(),
        })
    }

    /// Exchange a code for a token pair bound to the exchanging client's
    /// request metadata.
    pub async fn exchange(
        &self,
        req: ExchangeRequest,
        ctx: &RequestContext,
    ) -> AuthorityResult<TokenPair> {
        let now = self.store.now().await?;
        let code_hash = self.hasher.hash_authorization_code(req.code.expose_secret());
        let code = self
            .store
            .find_authorization_code_by_hash(&code_hash)
            .await?
            .ok_or(ProtocolFailure::InvalidCode)?;

        if code.client_id != req.client_id {
            tracing::warn!(code_id = %code.code_id, client_id = %req.client_id, "Code presented by another client");
            return Err(ProtocolFailure::ClientMismatch.into());
        }
        let client = self.enabled_client(&req.client_id).await?;
        self.authenticate_client(&client, req.client_secret.as_ref())
            .await?;

        match code.state(now) {
            AuthorizationState::CodeIssued => {}
            AuthorizationState::Exchanged => {
                let family = match code.status {
                    AuthorizationCodeStatus::Exchanged { issued_family_id, .. } => Some(issued_family_id),
                    _ => None,
                };
                return Err(self.code_reused(&code, family, now).await);
            }
            AuthorizationState::Denied => return Err(ProtocolFailure::InvalidCode.into()),
            AuthorizationState::Expired => return Err(ProtocolFailure::CodeExpired.into()),
        }

        if req.redirect_uri != code.redirect_uri {
            return Err(self
                .deny(&code, now, "redirect_mismatch", ProtocolFailure::RedirectMismatch)
                .await);
        }
        if pkce::verify(
            req.code_verifier.expose_secret(),
            &code.code_challenge,
            code.code_challenge_method,
        )
        .is_err()
        {
            return Err(self
                .deny(&code, now, "pkce_mismatch", ProtocolFailure::PkceMismatch)
                .await);
        }

        let access: ResolvedAccess = match self
            .resolver
            .resolve_access(code.principal_id, code.org_id)
            .await
        {
            Ok(access) => access,
            Err(e) if is_access_failure(&e) => {
                return Err(self
                    .deny(&code, now, "access_revoked", ProtocolFailure::AccessDenied)
                    .await);
            }
            Err(e) => return Err(e),
        };

        let owner = TokenOwner {
            principal_id: code.principal_id,
            org_id: code.org_id,
            session_id: None,
            client_id: Some(code.client_id.clone()),
            scope: code.scope.clone(),
        };
        let (raw, refresh) = self.issuer.new_family(owner, ctx, now);

        match self
            .store
            .redeem_authorization_code(code.code_id, now, &refresh)
            .await?
        {
            RedemptionOutcome::Redeemed => {}
            RedemptionOutcome::AlreadyRedeemed { issued_family_id } => {
                return Err(self.code_reused(&code, issued_family_id, now).await);
            }
        }

        tracing::info!(
            code_id = %code.code_id,
            client_id = %code.client_id,
            family_id = %refresh.family_id,
            "Authorization code exchanged"
        );
        self.audit.record(self.code_event(
            AuditEventType::CodeExchanged,
            &code,
            now,
            json!({ "code_id": code.code_id, "family_id": refresh.family_id }),
        ));

        self.issuer.token_pair(&access, &refresh, raw, now)
    }

    async fn authenticate_client(
        &self,
        client: &ClientApplication,
        secret: Option<&SecretString>,
    ) -> AuthorityResult<()> {
        if !client.is_confidential() {
            return Ok(());
        }
        let (Some(secret), Some(digest)) = (secret, client.client_secret_hash.clone()) else {
            return Err(ProtocolFailure::InvalidClient.into());
        };
        if !self.credentials.verify_secret(secret, digest).await? {
            tracing::warn!(client_id = %client.client_id, "Client authentication failed");
            return Err(ProtocolFailure::InvalidClient.into());
        }
        Ok(())
    }

    /// Burn an issued code after a failed exchange.
    async fn deny(
        &self,
        code: &AuthorizationCode,
        now: DateTime<Utc>,
        reason: &str,
        failure: ProtocolFailure,
    ) -> AuthorityError {
        match self.store.deny_authorization_code(code.code_id, now).await {
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, code_id = %code.code_id, "Failed to deny authorization code");
                return e.into();
            }
        }
        tracing::warn!(code_id = %code.code_id, client_id = %code.client_id, reason, "Authorization code denied");
        self.audit.record(self.code_event(
            AuditEventType::CodeDenied,
            code,
            now,
            json!({ "code_id": code.code_id, "reason": reason }),
        ));
        failure.into()
    }

    /// Reject a reused code and revoke whatever it issued.
    async fn code_reused(
        &self,
        code: &AuthorizationCode,
        issued_family_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> AuthorityError {
        let mut revoked = 0;
        if let Some(family_id) = issued_family_id {
            match self
                .issuer
                .revoke_family(family_id, RevocationReason::CodeReused)
                .await
            {
                Ok(count) => revoked = count,
                Err(e) => {
                    tracing::error!(error = %e, family_id = %family_id, "Failed to revoke family of reused code");
                    return e;
                }
            }
        }

        tracing::warn!(
            code_id = %code.code_id,
            client_id = %code.client_id,
            family_id = ?issued_family_id,
            revoked,
            "Authorization code reuse detected"
        );
        self.audit.record(self.code_event(
            AuditEventType::CodeReused,
            code,
            now,
            json!({ "code_id": code.code_id, "family_id": issued_family_id, "revoked": revoked }),
        ));
        ProtocolFailure::CodeReused.into()
    }
}

/// Errors meaning the principal may not act in the organization.
fn is_access_failure(err: &AuthorityError) -> bool {
    matches!(err, AuthorityError::Auth(_) | AuthorityError::NotFound(_))
}

/// Absolute http(s) URI without a fragment.
fn is_registrable_redirect(uri: &str) -> bool {
    let rest = uri
        .strip_prefix("https://")
        .or_else(|| uri.strip_prefix("http://"));
    match rest {
        Some(rest) => !rest.is_empty() && !uri.contains('#'),
        None => false,
    }
}
