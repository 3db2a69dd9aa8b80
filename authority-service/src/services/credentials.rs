//! Credential verification.
//!
//! Resolves an identifier plus a [`Proof`] to a [`Principal`]. The proof is
//! never logged or returned. Attempt counting lives in the rate gate, not here.

use chrono::{DateTime, Utc};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::auth::{Proof, RegisterPrincipalRequest};
use crate::error::{AuthFailure, AuthorityError, AuthorityResult};
use crate::models::{normalize_identifier, split_api_key, ApiKey, Principal, API_KEY_SCHEME};
use crate::services::hashing::{generate_random_token, CredentialHasher};
use crate::store::{AuthorityStore, StoreError};

#[derive(Clone)]
pub struct CredentialVerifier {
    store: Arc<dyn AuthorityStore>,
    hasher: Arc<dyn CredentialHasher>,
}

impl CredentialVerifier {
    pub fn new(store: Arc<dyn AuthorityStore>, hasher: Arc<dyn CredentialHasher>) -> Self {
        Self { store, hasher }
    }

    /// Hash a secret off the async runtime.
    pub async fn hash_secret(&self, secret: &SecretString) -> AuthorityResult<String> {
        let hasher = self.hasher.clone();
        let secret = secret.clone();
        tokio::task::spawn_blocking(move || hasher.hash(secret.expose_secret()))
            .await
            .map_err(|e| anyhow::anyhow!("Credential hashing task failed: {}", e))?
            .map_err(AuthorityError::Internal)
    }

    /// Compare a secret against a stored digest off the async runtime.
    pub async fn verify_secret(&self, secret: &SecretString, digest: String) -> AuthorityResult<bool> {
        let hasher = self.hasher.clone();
        let secret = secret.clone();
        let matched =
            tokio::task::spawn_blocking(move || hasher.verify(secret.expose_secret(), &digest))
                .await
                .map_err(|e| anyhow::anyhow!("Credential verification task failed: {}", e))?;
        Ok(matched)
    }

    pub async fn register(&self, req: RegisterPrincipalRequest) -> AuthorityResult<Principal> {
        req.validate()?;
        let digest = self
            .hash_secret(&SecretString::new(req.password))
            .await?;
        let now = self.store.now().await?;
        let principal = Principal::new(&req.identifier, Some(digest), now);

        self.store
            .insert_principal(&principal)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => {
                    AuthorityError::Validation("Identifier is already registered".to_string())
                }
                other => other.into(),
            })?;

        tracing::info!(principal_id = %principal.principal_id, "Principal registered");
        Ok(principal)
    }

    /// Resolve `identifier` and `proof` to an active principal.
    ///
    /// Unknown identifiers, wrong secrets, and revoked or expired API keys all
    /// fail as `InvalidCredential`. Account state is only revealed after the
    /// proof has matched.
    pub async fn verify(&self, identifier: &str, proof: &Proof) -> AuthorityResult<Principal> {
        let identifier = normalize_identifier(identifier);
        let Some(principal) = self.store.find_principal_by_identifier(&identifier).await? else {
            tracing::debug!("Credential check for unknown identifier");
            return Err(AuthFailure::InvalidCredential.into());
        };

        match proof {
            Proof::Password(password) => {
                let Some(digest) = principal.credential_hash.clone() else {
                    return Err(AuthFailure::InvalidCredential.into());
                };
                if !self.verify_secret(password, digest).await? {
                    tracing::debug!(principal_id = %principal.principal_id, "Password mismatch");
                    return Err(AuthFailure::InvalidCredential.into());
                }
                Self::check_state(&principal)?;
                if !principal.email_verified {
                    return Err(AuthFailure::EmailUnverified.into());
                }
            }
            Proof::ApiKey(raw) => {
                let now = self.store.now().await?;
                let Some((prefix, secret)) = split_api_key(raw.expose_secret()) else {
                    return Err(AuthFailure::InvalidCredential.into());
                };
                let key = self
                    .store
                    .find_api_key_by_prefix(prefix)
                    .await?
                    .filter(|k| k.principal_id == principal.principal_id && k.is_usable(now))
                    .ok_or(AuthFailure::InvalidCredential)?;
                let secret = SecretString::new(secret.to_string());
                if !self.verify_secret(&secret, key.key_hash.clone()).await? {
                    tracing::debug!(key_id = %key.key_id, "API key secret mismatch");
                    return Err(AuthFailure::InvalidCredential.into());
                }
                Self::check_state(&principal)?;
            }
        }

        Ok(principal)
    }

    fn check_state(principal: &Principal) -> AuthorityResult<()> {
        if !principal.is_active() {
            return Err(AuthFailure::AccountDisabled.into());
        }
        Ok(())
    }

    /// Create an API key. Returns the raw `ak_<prefix>_<secret>` value, which
    /// is shown once; only the digest of the secret part is stored.
    pub async fn generate_api_key(
        &self,
        principal_id: Uuid,
        label: &str,
        expires_utc: Option<DateTime<Utc>>,
    ) -> AuthorityResult<(String, ApiKey)> {
        if self.store.get_principal(principal_id).await?.is_none() {
            return Err(AuthorityError::NotFound("principal".to_string()));
        }

        let prefix_bytes: [u8; 4] = rand::thread_rng().gen();
        let prefix = hex::encode(prefix_bytes);
        let secret = generate_random_token();
        let digest = self
            .hash_secret(&SecretString::new(secret.clone()))
            .await?;

        let now = self.store.now().await?;
        let key = ApiKey::new(
            principal_id,
            prefix.clone(),
            digest,
            label.trim().to_string(),
            expires_utc,
            now,
        );
        self.store.insert_api_key(&key).await?;

        tracing::info!(principal_id = %principal_id, key_id = %key.key_id, "API key created");
        Ok((format!("{}_{}_{}", API_KEY_SCHEME, prefix, secret), key))
    }

    pub async fn revoke_api_key(&self, key_id: Uuid) -> AuthorityResult<()> {
        let now = self.store.now().await?;
        self.store.revoke_api_key(key_id, now).await?;
        tracing::info!(key_id = %key_id, "API key revoked");
        Ok(())
    }
}
