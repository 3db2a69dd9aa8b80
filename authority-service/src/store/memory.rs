//! In-memory implementation of the authority store.
//!
//! All state lives in one `State` behind a single `tokio::sync::RwLock`. Every
//! mutation takes the write lock once, so each trait method is atomic with
//! respect to every other: the conditional primitives (rotation, redemption,
//! grant validation, session cascade) cannot interleave.
//!
//! Not durable. Intended for tests and local development. "Now" comes from the
//! injected [`Clock`] so tests can move time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    AuthorityStore, RedemptionOutcome, RoleDeletion, RotationOutcome, StoreError, StoreResult,
};
use crate::models::{
    ApiKey, AuthorizationCode, AuthorizationCodeStatus, ClientApplication, Membership,
    MembershipState, Organization, Permission, Principal, PrincipalState, RefreshToken,
    RefreshTokenStatus, Revocation, RevocationReason, Role, RoleGrant, Scope, Session,
};
use crate::services::clock::Clock;

#[derive(Default)]
struct State {
    principals: HashMap<Uuid, Principal>,
    api_keys: HashMap<Uuid, ApiKey>,
    organizations: HashMap<Uuid, Organization>,
    memberships: HashMap<Uuid, Membership>,
    permissions: HashMap<Uuid, Permission>,
    roles: HashMap<Uuid, Role>,
    grants: HashSet<RoleGrant>,
    sessions: HashMap<Uuid, Session>,
    refresh_tokens: HashMap<Uuid, RefreshToken>,
    clients: HashMap<String, ClientApplication>,
    codes: HashMap<Uuid, AuthorizationCode>,
}

impl State {
    /// Every grant must satisfy `role_scope.may_hold(permission.scope)`.
    fn check_grants(&self, role_scope: &Scope, perm_ids: &[Uuid]) -> StoreResult<()> {
        for perm_id in perm_ids {
            let perm = self
                .permissions
                .get(perm_id)
                .ok_or_else(|| StoreError::NotFound(format!("permission {}", perm_id)))?;
            if !role_scope.may_hold(&perm.scope) {
                return Err(StoreError::CrossTenantGrant(perm.name.clone()));
            }
        }
        Ok(())
    }

    fn revoke_tokens_where(
        &mut self,
        revocation: Revocation,
        pred: impl Fn(&RefreshToken) -> bool,
    ) -> u64 {
        let mut count = 0;
        for token in self.refresh_tokens.values_mut() {
            if pred(token) && !matches!(token.status, RefreshTokenStatus::Revoked(_)) {
                token.status = RefreshTokenStatus::Revoked(revocation);
                count += 1;
            }
        }
        count
    }

    fn revoke_session_cascade(&mut self, session_id: Uuid, revocation: Revocation) -> bool {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        if session.revocation.is_some() {
            return false;
        }
        session.revocation = Some(revocation);
        self.revoke_tokens_where(revocation, |t| t.session_id == Some(session_id));
        true
    }

    fn refresh_hash_taken(&self, token_hash: &str) -> bool {
        self.refresh_tokens
            .values()
            .any(|t| t.token_hash == token_hash)
    }
}

pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            clock,
        }
    }
}

#[async_trait]
impl AuthorityStore for InMemoryStore {
    async fn now(&self) -> StoreResult<DateTime<Utc>> {
        Ok(self.clock.now())
    }

    async fn insert_principal(&self, principal: &Principal) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state
            .principals
            .values()
            .any(|p| p.identifier == principal.identifier)
        {
            return Err(StoreError::Conflict(format!(
                "principal {}",
                principal.identifier
            )));
        }
        state
            .principals
            .insert(principal.principal_id, principal.clone());
        Ok(())
    }

    async fn get_principal(&self, principal_id: Uuid) -> StoreResult<Option<Principal>> {
        Ok(self.state.read().await.principals.get(&principal_id).cloned())
    }

    async fn find_principal_by_identifier(
        &self,
        identifier: &str,
    ) -> StoreResult<Option<Principal>> {
        let state = self.state.read().await;
        Ok(state
            .principals
            .values()
            .find(|p| p.identifier == identifier)
            .cloned())
    }

    async fn set_principal_state(
        &self,
        principal_id: Uuid,
        new_state: PrincipalState,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let principal = state
            .principals
            .get_mut(&principal_id)
            .ok_or_else(|| StoreError::NotFound(format!("principal {}", principal_id)))?;
        principal.state = new_state;
        Ok(())
    }

    async fn set_email_verified(&self, principal_id: Uuid, verified: bool) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let principal = state
            .principals
            .get_mut(&principal_id)
            .ok_or_else(|| StoreError::NotFound(format!("principal {}", principal_id)))?;
        principal.email_verified = verified;
        Ok(())
    }

    async fn insert_api_key(&self, key: &ApiKey) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state
            .api_keys
            .values()
            .any(|k| k.key_prefix == key.key_prefix)
        {
            return Err(StoreError::Conflict(format!("api key {}", key.key_prefix)));
        }
        state.api_keys.insert(key.key_id, key.clone());
        Ok(())
    }

    async fn find_api_key_by_prefix(&self, key_prefix: &str) -> StoreResult<Option<ApiKey>> {
        let state = self.state.read().await;
        Ok(state
            .api_keys
            .values()
            .find(|k| k.key_prefix == key_prefix)
            .cloned())
    }

    async fn revoke_api_key(&self, key_id: Uuid, revoked_utc: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let key = state
            .api_keys
            .get_mut(&key_id)
            .ok_or_else(|| StoreError::NotFound(format!("api key {}", key_id)))?;
        key.revoked_utc.get_or_insert(revoked_utc);
        Ok(())
    }

    async fn insert_organization(&self, org: &Organization) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.organizations.values().any(|o| o.slug == org.slug) {
            return Err(StoreError::Conflict(format!("organization {}", org.slug)));
        }
        state.organizations.insert(org.org_id, org.clone());
        Ok(())
    }

    async fn get_organization(&self, org_id: Uuid) -> StoreResult<Option<Organization>> {
        Ok(self.state.read().await.organizations.get(&org_id).cloned())
    }

    async fn insert_membership(&self, membership: &Membership) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.principals.contains_key(&membership.principal_id) {
            return Err(StoreError::NotFound(format!(
                "principal {}",
                membership.principal_id
            )));
        }
        if !state.organizations.contains_key(&membership.org_id) {
            return Err(StoreError::NotFound(format!(
                "organization {}",
                membership.org_id
            )));
        }
        let role = state
            .roles
            .get(&membership.role_id)
            .ok_or_else(|| StoreError::NotFound(format!("role {}", membership.role_id)))?;
        if !role.scope.visible_in(membership.org_id) {
            return Err(StoreError::CrossTenantGrant(role.name.clone()));
        }
        if state.memberships.values().any(|m| {
            m.principal_id == membership.principal_id && m.org_id == membership.org_id
        }) {
            return Err(StoreError::Conflict("membership".to_string()));
        }
        state
            .memberships
            .insert(membership.membership_id, membership.clone());
        Ok(())
    }

    async fn find_membership(
        &self,
        principal_id: Uuid,
        org_id: Uuid,
    ) -> StoreResult<Option<Membership>> {
        let state = self.state.read().await;
        Ok(state
            .memberships
            .values()
            .find(|m| m.principal_id == principal_id && m.org_id == org_id)
            .cloned())
    }

    async fn set_membership_state(
        &self,
        membership_id: Uuid,
        new_state: MembershipState,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let membership = state
            .memberships
            .get_mut(&membership_id)
            .ok_or_else(|| StoreError::NotFound(format!("membership {}", membership_id)))?;
        membership.state = new_state;
        Ok(())
    }

    async fn insert_permission(&self, permission: &Permission) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state
            .permissions
            .values()
            .any(|p| p.scope == permission.scope && p.name == permission.name)
        {
            return Err(StoreError::Conflict(format!(
                "permission {}",
                permission.name
            )));
        }
        state
            .permissions
            .insert(permission.perm_id, permission.clone());
        Ok(())
    }

    async fn find_permissions_by_names(&self, names: &[String]) -> StoreResult<Vec<Permission>> {
        let state = self.state.read().await;
        Ok(state
            .permissions
            .values()
            .filter(|p| names.contains(&p.name))
            .cloned()
            .collect())
    }

    async fn list_system_permissions(&self) -> StoreResult<Vec<Permission>> {
        let state = self.state.read().await;
        Ok(state
            .permissions
            .values()
            .filter(|p| p.is_system())
            .cloned()
            .collect())
    }

    async fn list_org_permissions(&self, org_id: Uuid) -> StoreResult<Vec<Permission>> {
        let state = self.state.read().await;
        Ok(state
            .permissions
            .values()
            .filter(|p| p.org_id() == Some(org_id))
            .cloned()
            .collect())
    }

    async fn insert_role(&self, role: &Role, perm_ids: &[Uuid]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state
            .roles
            .values()
            .any(|r| r.scope == role.scope && r.name == role.name)
        {
            return Err(StoreError::Conflict(format!("role {}", role.name)));
        }
        state.check_grants(&role.scope, perm_ids)?;
        state.roles.insert(role.role_id, role.clone());
        for perm_id in perm_ids {
            state.grants.insert(RoleGrant {
                role_id: role.role_id,
                perm_id: *perm_id,
            });
        }
        Ok(())
    }

    async fn get_role(&self, role_id: Uuid) -> StoreResult<Option<Role>> {
        Ok(self.state.read().await.roles.get(&role_id).cloned())
    }

    async fn list_system_roles(&self) -> StoreResult<Vec<Role>> {
        let state = self.state.read().await;
        Ok(state
            .roles
            .values()
            .filter(|r| r.is_system())
            .cloned()
            .collect())
    }

    async fn find_system_role_by_name(&self, name: &str) -> StoreResult<Option<Role>> {
        let state = self.state.read().await;
        Ok(state
            .roles
            .values()
            .find(|r| r.is_system() && r.name == name)
            .cloned())
    }

    async fn update_role(&self, role: &Role) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state
            .roles
            .values()
            .any(|r| r.role_id != role.role_id && r.scope == role.scope && r.name == role.name)
        {
            return Err(StoreError::Conflict(format!("role {}", role.name)));
        }
        let existing = state
            .roles
            .get_mut(&role.role_id)
            .ok_or_else(|| StoreError::NotFound(format!("role {}", role.role_id)))?;
        existing.name = role.name.clone();
        existing.display_name = role.display_name.clone();
        Ok(())
    }

    async fn delete_role(&self, role_id: Uuid) -> StoreResult<RoleDeletion> {
        let mut state = self.state.write().await;
        let role = state
            .roles
            .get(&role_id)
            .ok_or_else(|| StoreError::NotFound(format!("role {}", role_id)))?;
        if role.is_system() {
            return Ok(RoleDeletion::SystemRole);
        }
        if state
            .memberships
            .values()
            .any(|m| m.role_id == role_id && m.state != MembershipState::Removed)
        {
            return Ok(RoleDeletion::InUse);
        }
        state
            .memberships
            .retain(|_, m| m.role_id != role_id);
        state.grants.retain(|g| g.role_id != role_id);
        state.roles.remove(&role_id);
        Ok(RoleDeletion::Deleted)
    }

    async fn insert_role_grants(&self, role_id: Uuid, perm_ids: &[Uuid]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let scope = state
            .roles
            .get(&role_id)
            .map(|r| r.scope)
            .ok_or_else(|| StoreError::NotFound(format!("role {}", role_id)))?;
        state.check_grants(&scope, perm_ids)?;
        for perm_id in perm_ids {
            state.grants.insert(RoleGrant {
                role_id,
                perm_id: *perm_id,
            });
        }
        Ok(())
    }

    async fn delete_role_grants(&self, role_id: Uuid, perm_ids: &[Uuid]) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let before = state.grants.len();
        state
            .grants
            .retain(|g| !(g.role_id == role_id && perm_ids.contains(&g.perm_id)));
        Ok((before - state.grants.len()) as u64)
    }

    async fn list_role_permissions(&self, role_id: Uuid) -> StoreResult<Vec<Permission>> {
        let state = self.state.read().await;
        Ok(state
            .grants
            .iter()
            .filter(|g| g.role_id == role_id)
            .filter_map(|g| state.permissions.get(&g.perm_id).cloned())
            .collect())
    }

    async fn insert_session(&self, session: &Session) -> StoreResult<Vec<Uuid>> {
        let revocation = Revocation {
            revoked_utc: self.clock.now(),
            reason: RevocationReason::SessionSuperseded,
        };
        let mut state = self.state.write().await;
        let superseded: Vec<Uuid> = state
            .sessions
            .values()
            .filter(|s| {
                s.principal_id == session.principal_id
                    && s.org_id == session.org_id
                    && s.device_binding_hash == session.device_binding_hash
                    && s.revocation.is_none()
            })
            .map(|s| s.session_id)
            .collect();
        for old in &superseded {
            state.revoke_session_cascade(*old, revocation);
        }
        state.sessions.insert(session.session_id, session.clone());
        Ok(superseded)
    }

    async fn get_session(&self, session_id: Uuid) -> StoreResult<Option<Session>> {
        Ok(self.state.read().await.sessions.get(&session_id).cloned())
    }

    async fn touch_session(
        &self,
        session_id: Uuid,
        last_activity_utc: DateTime<Utc>,
        expires_utc: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;
        if session.revocation.is_some() {
            return Ok(false);
        }
        session.last_activity_utc = last_activity_utc;
        session.expires_utc = expires_utc.min(session.absolute_expires_utc);
        Ok(true)
    }

    async fn revoke_session(&self, session_id: Uuid, revocation: Revocation) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        if !state.sessions.contains_key(&session_id) {
            return Err(StoreError::NotFound(format!("session {}", session_id)));
        }
        Ok(state.revoke_session_cascade(session_id, revocation))
    }

    async fn revoke_sessions_for_principal(
        &self,
        principal_id: Uuid,
        org_id: Option<Uuid>,
        revocation: Revocation,
    ) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let targets: Vec<Uuid> = state
            .sessions
            .values()
            .filter(|s| {
                s.principal_id == principal_id
                    && org_id.map_or(true, |o| s.org_id == o)
                    && s.revocation.is_none()
            })
            .map(|s| s.session_id)
            .collect();
        let mut count = 0;
        for session_id in targets {
            if state.revoke_session_cascade(session_id, revocation) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_sessions_for_principal(&self, principal_id: Uuid) -> StoreResult<Vec<Session>> {
        let state = self.state.read().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.principal_id == principal_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_utc);
        Ok(sessions)
    }

    async fn insert_refresh_token(&self, token: &RefreshToken) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.refresh_hash_taken(&token.token_hash) {
            return Err(StoreError::Conflict("refresh token".to_string()));
        }
        state.refresh_tokens.insert(token.token_id, token.clone());
        Ok(())
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> StoreResult<Option<RefreshToken>> {
        let state = self.state.read().await;
        Ok(state
            .refresh_tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn rotate_refresh_token(
        &self,
        presented_id: Uuid,
        successor: &RefreshToken,
    ) -> StoreResult<RotationOutcome> {
        let mut state = self.state.write().await;
        let status = state
            .refresh_tokens
            .get(&presented_id)
            .map(|t| t.status)
            .ok_or_else(|| StoreError::NotFound(format!("refresh token {}", presented_id)))?;
        match status {
            RefreshTokenStatus::Active => {}
            RefreshTokenStatus::Used { .. } => return Ok(RotationOutcome::AlreadyConsumed),
            RefreshTokenStatus::Revoked(_) => return Ok(RotationOutcome::Revoked),
        }
        if state.refresh_hash_taken(&successor.token_hash) {
            return Err(StoreError::Conflict("refresh token".to_string()));
        }
        if let Some(presented) = state.refresh_tokens.get_mut(&presented_id) {
            presented.status = RefreshTokenStatus::Used {
                used_utc: successor.issued_utc,
                replaced_by_id: successor.token_id,
            };
        }
        state
            .refresh_tokens
            .insert(successor.token_id, successor.clone());
        Ok(RotationOutcome::Rotated)
    }

    async fn revoke_token_family(
        &self,
        family_id: Uuid,
        revocation: Revocation,
    ) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        Ok(state.revoke_tokens_where(revocation, |t| t.family_id == family_id))
    }

    async fn revoke_refresh_tokens_for_principal(
        &self,
        principal_id: Uuid,
        org_id: Option<Uuid>,
        revocation: Revocation,
    ) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        Ok(state.revoke_tokens_where(revocation, |t| {
            t.principal_id == principal_id && org_id.map_or(true, |o| t.org_id == o)
        }))
    }

    async fn insert_client(&self, client: &ClientApplication) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.clients.contains_key(&client.client_id) {
            return Err(StoreError::Conflict(format!("client {}", client.client_id)));
        }
        state
            .clients
            .insert(client.client_id.clone(), client.clone());
        Ok(())
    }

    async fn get_client(&self, client_id: &str) -> StoreResult<Option<ClientApplication>> {
        Ok(self.state.read().await.clients.get(client_id).cloned())
    }

    async fn insert_authorization_code(&self, code: &AuthorizationCode) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.codes.values().any(|c| c.code_hash == code.code_hash) {
            return Err(StoreError::Conflict("authorization code".to_string()));
        }
        state.codes.insert(code.code_id, code.clone());
        Ok(())
    }

    async fn find_authorization_code_by_hash(
        &self,
        code_hash: &str,
    ) -> StoreResult<Option<AuthorizationCode>> {
        let state = self.state.read().await;
        Ok(state
            .codes
            .values()
            .find(|c| c.code_hash == code_hash)
            .cloned())
    }

    async fn redeem_authorization_code(
        &self,
        code_id: Uuid,
        exchanged_utc: DateTime<Utc>,
        refresh_token: &RefreshToken,
    ) -> StoreResult<RedemptionOutcome> {
        let mut state = self.state.write().await;
        let status = state
            .codes
            .get(&code_id)
            .map(|c| c.status)
            .ok_or_else(|| StoreError::NotFound(format!("authorization code {}", code_id)))?;
        match status {
            AuthorizationCodeStatus::Issued => {}
            AuthorizationCodeStatus::Exchanged {
                issued_family_id, ..
            } => {
                return Ok(RedemptionOutcome::AlreadyRedeemed {
                    issued_family_id: Some(issued_family_id),
                })
            }
            AuthorizationCodeStatus::Denied { .. } => {
                return Ok(RedemptionOutcome::AlreadyRedeemed {
                    issued_family_id: None,
                })
            }
        }
        if state.refresh_hash_taken(&refresh_token.token_hash) {
            return Err(StoreError::Conflict("refresh token".to_string()));
        }
        if let Some(code) = state.codes.get_mut(&code_id) {
            code.status = AuthorizationCodeStatus::Exchanged {
                exchanged_utc,
                issued_family_id: refresh_token.family_id,
            };
        }
        state
            .refresh_tokens
            .insert(refresh_token.token_id, refresh_token.clone());
        Ok(RedemptionOutcome::Redeemed)
    }

    async fn deny_authorization_code(
        &self,
        code_id: Uuid,
        denied_utc: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let code = state
            .codes
            .get_mut(&code_id)
            .ok_or_else(|| StoreError::NotFound(format!("authorization code {}", code_id)))?;
        if code.status != AuthorizationCodeStatus::Issued {
            return Ok(false);
        }
        code.status = AuthorizationCodeStatus::Denied { denied_utc };
        Ok(true)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
