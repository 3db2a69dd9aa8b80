//! Test helper module for authority-service integration tests.
//!
//! Builds an [`Authority`] over the in-memory store with a manual clock, an
//! in-memory audit sink and HS256 keys, and seeds the system catalogue.

#![allow(dead_code)]

use authority_service::{
    config::BootstrapConfig,
    dtos::admin::RegisterClientRequest,
    dtos::auth::{LoginRequest, Proof, RegisterPrincipalRequest, RequestContext, TokenPair},
    models::{ClientType, Membership, Organization, Principal, Role},
    services::{
        bootstrap, hashing::constant_time_eq, Authority, AuthorityDeps, AuthoritySettings,
        CredentialHasher, ManualClock, MemoryAuditSink, SigningKeys, TokenHasher,
    },
    store::{memory::InMemoryStore, AuthorityStore},
    AuthorityResult,
};
use chrono::Utc;
use secrecy::SecretString;
use service_core::rate_limit::{AllowAll, RateGate};
use std::sync::Arc;
use uuid::Uuid;

pub const TEST_PASSWORD: &str = "correct horse battery";
pub const TEST_SIGNING_SECRET: &[u8] = b"test-signing-secret-0123456789abcdef";
pub const TEST_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0";
pub const TEST_IP: &str = "203.0.113.7";

/// Fast, deterministic stand-in for Argon2.
pub struct PlainHasher;

impl CredentialHasher for PlainHasher {
    fn hash(&self, secret: &str) -> Result<String, anyhow::Error> {
        Ok(format!("plain${}", secret))
    }

    fn verify(&self, secret: &str, digest: &str) -> bool {
        constant_time_eq(&format!("plain${}", secret), digest)
    }
}

pub fn ctx() -> RequestContext {
    RequestContext::new(TEST_USER_AGENT, TEST_IP)
}

pub struct TestAuthority {
    pub authority: Authority,
    pub store: Arc<dyn AuthorityStore>,
    pub clock: ManualClock,
    pub audit: MemoryAuditSink,
}

impl TestAuthority {
    pub async fn new() -> Self {
        Self::with(AuthoritySettings::default(), Arc::new(AllowAll)).await
    }

    pub async fn with_settings(settings: AuthoritySettings) -> Self {
        Self::with(settings, Arc::new(AllowAll)).await
    }

    pub async fn with(settings: AuthoritySettings, gate: Arc<dyn RateGate>) -> Self {
        let clock = ManualClock::new(Utc::now());
        let store: Arc<dyn AuthorityStore> = Arc::new(InMemoryStore::new(Arc::new(clock.clone())));
        let audit = MemoryAuditSink::new();

        let deps = AuthorityDeps {
            store: store.clone(),
            keys: Arc::new(SigningKeys::hs256(TEST_SIGNING_SECRET)),
            token_hasher: Arc::new(
                TokenHasher::new(&SecretString::new("h".repeat(32))).unwrap(),
            ),
            credential_hasher: Arc::new(PlainHasher),
            audit: Arc::new(audit.clone()),
            gate,
        };
        let authority = Authority::new(deps, settings);

        bootstrap::run(&store, authority.credentials(), &BootstrapConfig::default())
            .await
            .unwrap();

        Self {
            authority,
            store,
            clock,
            audit,
        }
    }

    pub async fn org(&self, slug: &str) -> Organization {
        let org = Organization::new(slug, self.clock_now());
        self.store.insert_organization(&org).await.unwrap();
        org
    }

    pub fn clock_now(&self) -> chrono::DateTime<Utc> {
        use authority_service::services::Clock;
        self.clock.now()
    }

    /// Register a principal with [`TEST_PASSWORD`] and a verified email.
    pub async fn principal(&self, email: &str) -> Principal {
        let principal = self
            .authority
            .credentials()
            .register(RegisterPrincipalRequest {
                identifier: email.to_string(),
                password: TEST_PASSWORD.to_string(),
            })
            .await
            .unwrap();
        self.store
            .set_email_verified(principal.principal_id, true)
            .await
            .unwrap();
        self.store
            .get_principal(principal.principal_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn superadmin(&self, email: &str) -> Principal {
        let mut principal =
            Principal::new(email, Some(format!("plain${}", TEST_PASSWORD)), self.clock_now());
        principal.is_superadmin = true;
        principal.email_verified = true;
        self.store.insert_principal(&principal).await.unwrap();
        principal
    }

    pub async fn system_role(&self, name: &str) -> Role {
        self.store
            .find_system_role_by_name(name)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn member(&self, org_id: Uuid, principal_id: Uuid, role_id: Uuid) -> Membership {
        self.authority
            .permissions()
            .add_member(org_id, principal_id, role_id)
            .await
            .unwrap()
    }

    /// Principal with the system `member` role in `org_id`.
    pub async fn member_principal(&self, email: &str, org_id: Uuid) -> Principal {
        let principal = self.principal(email).await;
        let role = self.system_role("member").await;
        self.member(org_id, principal.principal_id, role.role_id).await;
        principal
    }

    pub async fn login(
        &self,
        email: &str,
        org_id: Uuid,
        ctx: &RequestContext,
    ) -> AuthorityResult<TokenPair> {
        self.authority
            .login(
                LoginRequest {
                    identifier: email.to_string(),
                    proof: Proof::Password(SecretString::new(TEST_PASSWORD.to_string())),
                    org_id,
                },
                ctx,
            )
            .await
    }

    /// Register a client; returns its secret for confidential clients.
    pub async fn client(
        &self,
        client_id: &str,
        client_type: ClientType,
        redirect_uri: &str,
        scopes: &[&str],
    ) -> Option<String> {
        self.authority
            .oauth()
            .register_client(RegisterClientRequest {
                client_id: client_id.to_string(),
                display_name: client_id.to_string(),
                client_type,
                redirect_uris: vec![redirect_uri.to_string()],
                allowed_scopes: scopes.iter().map(|s| s.to_string()).collect(),
            })
            .await
            .unwrap()
            .client_secret
    }
}
