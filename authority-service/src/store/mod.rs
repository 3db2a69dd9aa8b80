//! Storage layer for the authority.
//!
//! [`AuthorityStore`] is plain CRUD plus the handful of atomic primitives the
//! trust core depends on. Every read-then-conditional-write that decides a
//! security outcome (grant validation, refresh rotation, code redemption,
//! session cascade) is a single method here so each backend can make it
//! atomic: a transaction in Postgres, one write lock in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    ApiKey, AuthorizationCode, ClientApplication, Membership, MembershipState, Organization,
    Permission, Principal, PrincipalState, RefreshToken, Revocation, Role, Session,
};

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// A role grant would link a permission owned by another organization.
    #[error("cross-tenant grant: {0}")]
    CrossTenantGrant(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of the conditional "active -> used" step of a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The presented token is now used and the successor was stored.
    Rotated,
    /// Another rotation got there first. Nothing was written.
    AlreadyConsumed,
    /// The token was revoked after it was read. Nothing was written.
    Revoked,
}

/// Result of the conditional "issued -> exchanged" step of a code exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedemptionOutcome {
    Redeemed,
    /// The code was exchanged before; carries the family it produced.
    AlreadyRedeemed { issued_family_id: Option<Uuid> },
}

/// Result of a conditional role delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleDeletion {
    Deleted,
    SystemRole,
    InUse,
}

#[async_trait]
pub trait AuthorityStore: Send + Sync {
    /// The storage layer's authoritative clock.
    async fn now(&self) -> StoreResult<DateTime<Utc>>;

    async fn insert_principal(&self, principal: &Principal) -> StoreResult<()>;
    async fn get_principal(&self, principal_id: Uuid) -> StoreResult<Option<Principal>>;
    async fn find_principal_by_identifier(&self, identifier: &str)
        -> StoreResult<Option<Principal>>;
    async fn set_principal_state(&self, principal_id: Uuid, state: PrincipalState)
        -> StoreResult<()>;
    async fn set_email_verified(&self, principal_id: Uuid, verified: bool) -> StoreResult<()>;

    async fn insert_api_key(&self, key: &ApiKey) -> StoreResult<()>;
    async fn find_api_key_by_prefix(&self, key_prefix: &str) -> StoreResult<Option<ApiKey>>;
    async fn revoke_api_key(&self, key_id: Uuid, revoked_utc: DateTime<Utc>) -> StoreResult<()>;

    async fn insert_organization(&self, org: &Organization) -> StoreResult<()>;
    async fn get_organization(&self, org_id: Uuid) -> StoreResult<Option<Organization>>;

    async fn insert_membership(&self, membership: &Membership) -> StoreResult<()>;
    async fn find_membership(
        &self,
        principal_id: Uuid,
        org_id: Uuid,
    ) -> StoreResult<Option<Membership>>;
    async fn set_membership_state(
        &self,
        membership_id: Uuid,
        state: MembershipState,
    ) -> StoreResult<()>;

    /// Fails with `Conflict` when the name is taken in the same scope.
    async fn insert_permission(&self, permission: &Permission) -> StoreResult<()>;
    /// Every permission with one of `names`, in any scope.
    async fn find_permissions_by_names(&self, names: &[String]) -> StoreResult<Vec<Permission>>;
    async fn list_system_permissions(&self) -> StoreResult<Vec<Permission>>;
    async fn list_org_permissions(&self, org_id: Uuid) -> StoreResult<Vec<Permission>>;

    /// Insert a role and its grants together. Each grant is checked against
    /// the role's scope; any violation aborts the whole insert.
    async fn insert_role(&self, role: &Role, perm_ids: &[Uuid]) -> StoreResult<()>;
    async fn get_role(&self, role_id: Uuid) -> StoreResult<Option<Role>>;
    async fn list_system_roles(&self) -> StoreResult<Vec<Role>>;
    async fn find_system_role_by_name(&self, name: &str) -> StoreResult<Option<Role>>;
    async fn update_role(&self, role: &Role) -> StoreResult<()>;
    async fn delete_role(&self, role_id: Uuid) -> StoreResult<RoleDeletion>;
    /// All-or-nothing, validated like [`AuthorityStore::insert_role`]. Existing grants are kept.
    async fn insert_role_grants(&self, role_id: Uuid, perm_ids: &[Uuid]) -> StoreResult<()>;
    async fn delete_role_grants(&self, role_id: Uuid, perm_ids: &[Uuid]) -> StoreResult<u64>;
    async fn list_role_permissions(&self, role_id: Uuid) -> StoreResult<Vec<Permission>>;

    /// Store a session. Every unrevoked session for the same principal,
    /// organization and device is revoked as superseded, together with its
    /// refresh tokens. Returns the superseded session ids.
    async fn insert_session(&self, session: &Session) -> StoreResult<Vec<Uuid>>;
    async fn get_session(&self, session_id: Uuid) -> StoreResult<Option<Session>>;
    /// Slide an unrevoked session's expiry. Returns false if it was revoked.
    async fn touch_session(
        &self,
        session_id: Uuid,
        last_activity_utc: DateTime<Utc>,
        expires_utc: DateTime<Utc>,
    ) -> StoreResult<bool>;
    /// Revoke a session and every refresh token issued under it. Returns
    /// false when the session was already revoked.
    async fn revoke_session(&self, session_id: Uuid, revocation: Revocation) -> StoreResult<bool>;
    /// Revoke a principal's sessions (optionally in one organization) with
    /// their refresh tokens. Returns the number of sessions revoked.
    async fn revoke_sessions_for_principal(
        &self,
        principal_id: Uuid,
        org_id: Option<Uuid>,
        revocation: Revocation,
    ) -> StoreResult<u64>;
    async fn list_sessions_for_principal(&self, principal_id: Uuid) -> StoreResult<Vec<Session>>;

    async fn insert_refresh_token(&self, token: &RefreshToken) -> StoreResult<()>;
    async fn find_refresh_token_by_hash(&self, token_hash: &str)
        -> StoreResult<Option<RefreshToken>>;
    /// Mark `presented_id` used and store `successor`, only if the presented
    /// token is still active. Exactly one of any number of concurrent callers
    /// observes `Rotated`.
    async fn rotate_refresh_token(
        &self,
        presented_id: Uuid,
        successor: &RefreshToken,
    ) -> StoreResult<RotationOutcome>;
    /// Revoke every not-yet-revoked token in the family, used or not.
    async fn revoke_token_family(&self, family_id: Uuid, revocation: Revocation)
        -> StoreResult<u64>;
    /// Revoke every not-yet-revoked token a principal holds, optionally in one
    /// organization. Covers OAuth families, which have no session to cascade from.
    async fn revoke_refresh_tokens_for_principal(
        &self,
        principal_id: Uuid,
        org_id: Option<Uuid>,
        revocation: Revocation,
    ) -> StoreResult<u64>;

    async fn insert_client(&self, client: &ClientApplication) -> StoreResult<()>;
    async fn get_client(&self, client_id: &str) -> StoreResult<Option<ClientApplication>>;

    async fn insert_authorization_code(&self, code: &AuthorizationCode) -> StoreResult<()>;
    async fn find_authorization_code_by_hash(
        &self,
        code_hash: &str,
    ) -> StoreResult<Option<AuthorizationCode>>;
    /// Mark the code exchanged and store the first refresh token of the family
    /// it produces, only if the code is still issued.
    async fn redeem_authorization_code(
        &self,
        code_id: Uuid,
        exchanged_utc: DateTime<Utc>,
        refresh_token: &RefreshToken,
    ) -> StoreResult<RedemptionOutcome>;
    /// Burn an issued code. Returns false if it had already left `issued`.
    async fn deny_authorization_code(
        &self,
        code_id: Uuid,
        denied_utc: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn health_check(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
}
