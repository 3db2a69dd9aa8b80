//! Permission resolution and role management.
//!
//! Grants are flat: a role holds permissions directly, and superadmins bypass
//! roles entirely. Every path that links a permission to a role goes through
//! the store's validated grant primitives, which re-check the scope rule.

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::admin::{CreatePermissionRequest, CreateRoleRequest, UpdateRoleRequest};
use crate::error::{AuthFailure, AuthorityError, AuthorityResult, GrantFailure};
use crate::models::{
    normalize_name, AuditEvent, AuditEventType, Membership, Permission, Role,
};
use crate::services::audit::AuditSink;
use crate::store::{AuthorityStore, RoleDeletion, StoreError};

/// What a principal may do inside one organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAccess {
    pub principal_id: Uuid,
    pub org_id: Uuid,
    /// Role from the principal's active membership, if any.
    pub role_id: Option<Uuid>,
    pub permissions: BTreeSet<String>,
    pub is_superadmin: bool,
}

#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn AuthorityStore>,
    audit: Arc<dyn AuditSink>,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn AuthorityStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    pub async fn resolve(&self, principal_id: Uuid, org_id: Uuid) -> AuthorityResult<BTreeSet<String>> {
        Ok(self.resolve_access(principal_id, org_id).await?.permissions)
    }

    /// Resolve the role and permission set a token for `(principal, org)` carries.
    ///
    /// Superadmins get every system permission plus every permission owned by
    /// `org_id`. Everyone else gets their role's permissions, restricted to
    /// those visible in `org_id`.
    pub async fn resolve_access(
        &self,
        principal_id: Uuid,
        org_id: Uuid,
    ) -> AuthorityResult<ResolvedAccess> {
        let principal = self
            .store
            .get_principal(principal_id)
            .await?
            .ok_or_else(|| AuthorityError::NotFound("principal".to_string()))?;
        if !principal.is_active() {
            return Err(AuthFailure::AccountDisabled.into());
        }

        let org = self
            .store
            .get_organization(org_id)
            .await?
            .ok_or_else(|| AuthorityError::NotFound("organization".to_string()))?;
        if !org.is_active() {
            return Err(AuthFailure::NotMember.into());
        }

        let membership = self
            .store
            .find_membership(principal_id, org_id)
            .await?
            .filter(Membership::is_active);

        if principal.is_superadmin {
            let mut permissions: BTreeSet<String> = self
                .store
                .list_system_permissions()
                .await?
                .into_iter()
                .map(|p| p.name)
                .collect();
            permissions.extend(
                self.store
                    .list_org_permissions(org_id)
                    .await?
                    .into_iter()
                    .filter(|p| p.scope.visible_in(org_id))
                    .map(|p| p.name),
            );
            return Ok(ResolvedAccess {
                principal_id,
                org_id,
                role_id: membership.map(|m| m.role_id),
                permissions,
                is_superadmin: true,
            });
        }

        let membership = membership.ok_or(AuthFailure::NotMember)?;
        let role = self
            .store
            .get_role(membership.role_id)
            .await?
            .ok_or_else(|| AuthorityError::NotFound("role".to_string()))?;

        let mut permissions = BTreeSet::new();
        if role.scope.visible_in(org_id) {
            for perm in self.store.list_role_permissions(role.role_id).await? {
                if perm.scope.visible_in(org_id) {
                    permissions.insert(perm.name);
                } else {
                    tracing::error!(
                        role_id = %role.role_id,
                        perm_id = %perm.perm_id,
                        org_id = %org_id,
                        "Role holds a permission owned by another organization; ignored"
                    );
                }
            }
        } else {
            tracing::error!(
                role_id = %role.role_id,
                org_id = %org_id,
                "Membership references a role owned by another organization"
            );
        }

        Ok(ResolvedAccess {
            principal_id,
            org_id,
            role_id: Some(role.role_id),
            permissions,
            is_superadmin: false,
        })
    }

    async fn record(&self, event_type: AuditEventType, org_id: Uuid, data: serde_json::Value) {
        let now = match self.store.now().await {
            Ok(now) => now,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read clock for audit event");
                chrono::Utc::now()
            }
        };
        self.audit
            .record(AuditEvent::new(event_type, now).with_org(org_id).with_data(data));
    }

    async fn deny_cross_tenant(&self, org_id: Uuid, role_id: Option<Uuid>, name: &str) -> AuthorityError {
        tracing::warn!(
            org_id = %org_id,
            role_id = ?role_id,
            permission = %name,
            "Cross-tenant grant denied"
        );
        self.record(
            AuditEventType::CrossTenantGrantDenied,
            org_id,
            json!({ "role_id": role_id, "permission": name }),
        )
        .await;
        GrantFailure::CrossTenantGrantDenied(name.to_string()).into()
    }

    /// Map permission names to ids visible in `org_id`.
    ///
    /// A name that only exists in other organizations is a cross-tenant
    /// attempt, not a missing permission.
    async fn lookup_permissions(
        &self,
        org_id: Uuid,
        role_id: Option<Uuid>,
        names: &[String],
    ) -> AuthorityResult<Vec<Uuid>> {
        let mut wanted: Vec<String> = names.iter().map(|n| normalize_name(n)).collect();
        wanted.sort();
        wanted.dedup();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let found = self.store.find_permissions_by_names(&wanted).await?;
        let mut perm_ids = Vec::with_capacity(wanted.len());
        for name in &wanted {
            let mut candidates = found.iter().filter(|p| &p.name == name).peekable();
            if candidates.peek().is_none() {
                return Err(AuthorityError::NotFound(format!("permission {}", name)));
            }
            match candidates.find(|p| p.scope.visible_in(org_id)) {
                Some(perm) => perm_ids.push(perm.perm_id),
                None => return Err(self.deny_cross_tenant(org_id, role_id, name).await),
            }
        }
        Ok(perm_ids)
    }

    async fn check_reserved_role_name(&self, name: &str) -> AuthorityResult<()> {
        let name = normalize_name(name);
        if self.store.find_system_role_by_name(&name).await?.is_some() {
            return Err(GrantFailure::ReservedName(name).into());
        }
        Ok(())
    }

    /// Load a role, refusing system roles.
    async fn org_role(&self, role_id: Uuid) -> AuthorityResult<Role> {
        let role = self
            .store
            .get_role(role_id)
            .await?
            .ok_or_else(|| AuthorityError::NotFound("role".to_string()))?;
        if role.is_system() {
            return Err(GrantFailure::SystemResourceImmutable.into());
        }
        Ok(role)
    }

    async fn map_grant_error(&self, err: StoreError, org_id: Uuid, role_id: Uuid) -> AuthorityError {
        match err {
            StoreError::CrossTenantGrant(name) => {
                self.deny_cross_tenant(org_id, Some(role_id), &name).await
            }
            other => other.into(),
        }
    }

    pub async fn create_role(&self, org_id: Uuid, req: CreateRoleRequest) -> AuthorityResult<Role> {
        req.validate()?;
        if self.store.get_organization(org_id).await?.is_none() {
            return Err(AuthorityError::NotFound("organization".to_string()));
        }
        self.check_reserved_role_name(&req.name).await?;

        let now = self.store.now().await?;
        let display_name = if req.display_name.trim().is_empty() {
            req.name.trim()
        } else {
            req.display_name.as_str()
        };
        let role = Role::custom(org_id, &req.name, display_name, now);
        let perm_ids = self
            .lookup_permissions(org_id, Some(role.role_id), &req.permissions)
            .await?;

        if let Err(e) = self.store.insert_role(&role, &perm_ids).await {
            return Err(self.map_grant_error(e, org_id, role.role_id).await);
        }

        tracing::info!(role_id = %role.role_id, org_id = %org_id, grants = perm_ids.len(), "Role created");
        self.record(
            AuditEventType::RoleCreated,
            org_id,
            json!({ "role_id": role.role_id, "name": role.name, "grants": perm_ids.len() }),
        )
        .await;
        Ok(role)
    }

    pub async fn update_role(
        &self,
        role_id: Uuid,
        org_id: Uuid,
        req: UpdateRoleRequest,
    ) -> AuthorityResult<Role> {
        req.validate()?;
        let mut role = self.org_role(role_id).await?;
        if role.org_id() != Some(org_id) {
            return Err(AuthorityError::NotFound("role".to_string()));
        }
        self.check_reserved_role_name(&req.name).await?;

        role.name = normalize_name(&req.name);
        if !req.display_name.trim().is_empty() {
            role.display_name = req.display_name.trim().to_string();
        }
        self.store.update_role(&role).await?;

        tracing::info!(role_id = %role_id, org_id = %org_id, "Role updated");
        self.record(
            AuditEventType::RoleUpdated,
            org_id,
            json!({ "role_id": role_id, "name": role.name }),
        )
        .await;
        Ok(role)
    }

    pub async fn delete_role(&self, role_id: Uuid, org_id: Uuid) -> AuthorityResult<()> {
        let role = self.org_role(role_id).await?;
        if role.org_id() != Some(org_id) {
            return Err(AuthorityError::NotFound("role".to_string()));
        }

        match self.store.delete_role(role_id).await? {
            RoleDeletion::Deleted => {}
            RoleDeletion::SystemRole => return Err(GrantFailure::SystemResourceImmutable.into()),
            RoleDeletion::InUse => return Err(GrantFailure::RoleInUse.into()),
        }

        tracing::info!(role_id = %role_id, org_id = %org_id, "Role deleted");
        self.record(AuditEventType::RoleDeleted, org_id, json!({ "role_id": role_id }))
            .await;
        Ok(())
    }

    /// Grant permissions to a custom role of `org_id`, all or nothing.
    ///
    /// The role's owner is checked against `org_id` on every call.
    pub async fn assign_grants(
        &self,
        role_id: Uuid,
        org_id: Uuid,
        permission_names: &[String],
    ) -> AuthorityResult<()> {
        let role = self.org_role(role_id).await?;
        if role.org_id() != Some(org_id) {
            return Err(self
                .deny_cross_tenant(org_id, Some(role_id), &role.name)
                .await);
        }

        let perm_ids = self
            .lookup_permissions(org_id, Some(role_id), permission_names)
            .await?;
        if perm_ids.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.store.insert_role_grants(role_id, &perm_ids).await {
            return Err(self.map_grant_error(e, org_id, role_id).await);
        }

        tracing::info!(role_id = %role_id, org_id = %org_id, grants = perm_ids.len(), "Grants assigned");
        self.record(
            AuditEventType::GrantsAssigned,
            org_id,
            json!({ "role_id": role_id, "permissions": permission_names }),
        )
        .await;
        Ok(())
    }

    pub async fn revoke_grants(
        &self,
        role_id: Uuid,
        org_id: Uuid,
        permission_names: &[String],
    ) -> AuthorityResult<u64> {
        let role = self.org_role(role_id).await?;
        if role.org_id() != Some(org_id) {
            return Err(self
                .deny_cross_tenant(org_id, Some(role_id), &role.name)
                .await);
        }

        let perm_ids = self
            .lookup_permissions(org_id, Some(role_id), permission_names)
            .await?;
        let removed = self.store.delete_role_grants(role_id, &perm_ids).await?;

        tracing::info!(role_id = %role_id, org_id = %org_id, removed, "Grants revoked");
        self.record(
            AuditEventType::GrantsRevoked,
            org_id,
            json!({ "role_id": role_id, "permissions": permission_names, "removed": removed }),
        )
        .await;
        Ok(removed)
    }

    /// Create a custom permission owned by `org_id`.
    pub async fn create_permission(
        &self,
        org_id: Uuid,
        req: CreatePermissionRequest,
    ) -> AuthorityResult<Permission> {
        req.validate()?;
        if self.store.get_organization(org_id).await?.is_none() {
            return Err(AuthorityError::NotFound("organization".to_string()));
        }

        let name = normalize_name(&req.name);
        let clashes = self
            .store
            .find_permissions_by_names(std::slice::from_ref(&name))
            .await?;
        if clashes.iter().any(Permission::is_system) {
            return Err(GrantFailure::ReservedName(name).into());
        }

        let now = self.store.now().await?;
        let permission = Permission::custom(org_id, &name, &req.category, now);
        self.store.insert_permission(&permission).await?;

        tracing::info!(perm_id = %permission.perm_id, org_id = %org_id, "Permission created");
        self.record(
            AuditEventType::PermissionCreated,
            org_id,
            json!({ "perm_id": permission.perm_id, "name": permission.name }),
        )
        .await;
        Ok(permission)
    }

    /// Add a principal to an organization with a role visible there.
    pub async fn add_member(
        &self,
        org_id: Uuid,
        principal_id: Uuid,
        role_id: Uuid,
    ) -> AuthorityResult<Membership> {
        let now = self.store.now().await?;
        let membership = Membership::new(principal_id, org_id, role_id, now);
        if let Err(e) = self.store.insert_membership(&membership).await {
            return Err(self.map_grant_error(e, org_id, role_id).await);
        }

        tracing::info!(principal_id = %principal_id, org_id = %org_id, role_id = %role_id, "Member added");
        Ok(membership)
    }
}
