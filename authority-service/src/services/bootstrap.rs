//! Idempotent seeding of the system catalogue.

use secrecy::ExposeSecret;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::BootstrapConfig;
use crate::error::{AuthorityError, AuthorityResult};
use crate::models::{normalize_identifier, Permission, Principal, Role};
use crate::services::credentials::CredentialVerifier;
use crate::store::AuthorityStore;

/// System permissions as `(name, category)`.
pub const SYSTEM_PERMISSIONS: &[(&str, &str)] = &[
    ("org:read", "organization"),
    ("org:update", "organization"),
    ("member:read", "membership"),
    ("member:invite", "membership"),
    ("member:remove", "membership"),
    ("role:read", "rbac"),
    ("role:manage", "rbac"),
    ("session:read", "session"),
    ("session:revoke", "session"),
    ("client:manage", "oauth"),
    ("audit:read", "audit"),
];

/// System roles as `(name, display name, permissions)`.
pub const SYSTEM_ROLES: &[(&str, &str, &[&str])] = &[
    (
        "owner",
        "Owner",
        &[
            "org:read",
            "org:update",
            "member:read",
            "member:invite",
            "member:remove",
            "role:read",
            "role:manage",
            "session:read",
            "session:revoke",
            "client:manage",
            "audit:read",
        ],
    ),
    (
        "admin",
        "Administrator",
        &[
            "org:read",
            "member:read",
            "member:invite",
            "member:remove",
            "role:read",
            "role:manage",
            "session:read",
            "session:revoke",
            "audit:read",
        ],
    ),
    (
        "member",
        "Member",
        &["org:read", "member:read", "role:read", "session:read"],
    ),
    ("viewer", "Viewer", &["org:read", "member:read"]),
];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub permissions_created: usize,
    pub roles_created: usize,
    pub superadmin_id: Option<Uuid>,
}

/// Create missing system permissions, roles and grants, and the configured
/// superadmin. Safe to run on every start.
pub async fn run(
    store: &Arc<dyn AuthorityStore>,
    credentials: &CredentialVerifier,
    config: &BootstrapConfig,
) -> AuthorityResult<BootstrapReport> {
    let mut report = BootstrapReport::default();
    let now = store.now().await?;

    let mut permissions = store.list_system_permissions().await?;
    for (name, category) in SYSTEM_PERMISSIONS {
        if permissions.iter().any(|p| p.name == *name) {
            continue;
        }
        let permission = Permission::system(name, category, now);
        store.insert_permission(&permission).await?;
        permissions.push(permission);
        report.permissions_created += 1;
    }

    let existing_roles = store.list_system_roles().await?;
    for (name, display_name, grants) in SYSTEM_ROLES {
        let perm_ids: Vec<Uuid> = permissions
            .iter()
            .filter(|p| grants.contains(&p.name.as_str()))
            .map(|p| p.perm_id)
            .collect();

        match existing_roles.iter().find(|r| r.name == *name) {
            Some(role) => store.insert_role_grants(role.role_id, &perm_ids).await?,
            None => {
                let role = Role::system(name, display_name, now);
                store.insert_role(&role, &perm_ids).await?;
                report.roles_created += 1;
            }
        }
    }

    if let (Some(email), Some(password)) = (&config.superadmin_email, &config.superadmin_password)
    {
        match store.find_principal_by_identifier(&normalize_identifier(email)).await? {
            Some(existing) => {
                if !existing.is_superadmin {
                    tracing::warn!(
                        principal_id = %existing.principal_id,
                        "Bootstrap superadmin identifier belongs to a regular principal; left unchanged"
                    );
                }
                report.superadmin_id = Some(existing.principal_id);
            }
            None => {
                if password.expose_secret().len() < 8 {
                    return Err(AuthorityError::Validation(
                        "Bootstrap superadmin password is too short".to_string(),
                    ));
                }
                let digest = credentials.hash_secret(password).await?;
                let mut principal = Principal::new(email, Some(digest), now);
                principal.is_superadmin = true;
                principal.email_verified = true;
                store.insert_principal(&principal).await?;
                tracing::info!(principal_id = %principal.principal_id, "Bootstrap superadmin created");
                report.superadmin_id = Some(principal.principal_id);
            }
        }
    }

    tracing::info!(
        permissions_created = report.permissions_created,
        roles_created = report.roles_created,
        "System catalogue bootstrapped"
    );
    Ok(report)
}
