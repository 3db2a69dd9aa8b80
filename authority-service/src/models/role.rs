//! Role and permission models.
//!
//! Both carry a [`Scope`]: `System` (global, no owning organization) or
//! `Organization(id)` (custom, owned by exactly one tenant). Keeping the owner
//! and the system flag in one enum means the "system ⇔ no organization" rule
//! cannot be violated in memory; storage keeps both columns and a CHECK
//! constraint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ownership scope of a role or permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "org_id", rename_all = "snake_case")]
pub enum Scope {
    System,
    Organization(Uuid),
}

impl Scope {
    pub fn is_system(&self) -> bool {
        matches!(self, Scope::System)
    }

    pub fn org_id(&self) -> Option<Uuid> {
        match self {
            Scope::System => None,
            Scope::Organization(id) => Some(*id),
        }
    }

    /// Rebuild a scope from its stored `(is_system, org_id)` pair.
    ///
    /// Returns `None` when the pair breaks the system ⇔ null rule.
    pub fn from_parts(is_system: bool, org_id: Option<Uuid>) -> Option<Self> {
        match (is_system, org_id) {
            (true, None) => Some(Scope::System),
            (false, Some(id)) => Some(Scope::Organization(id)),
            _ => None,
        }
    }

    /// The role-grant invariant: a role in this scope may hold `permission`
    /// only if the permission is system-wide or owned by the same organization.
    pub fn may_hold(&self, permission: &Scope) -> bool {
        permission.is_system() || permission == self
    }

    /// True when a permission in this scope is visible inside `org_id`.
    pub fn visible_in(&self, org_id: Uuid) -> bool {
        match self {
            Scope::System => true,
            Scope::Organization(id) => *id == org_id,
        }
    }
}

/// Role entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub role_id: Uuid,
    pub scope: Scope,
    pub name: String,
    pub display_name: String,
    pub created_utc: DateTime<Utc>,
}

impl Role {
    /// Create a system role. Only bootstrap does this.
    pub fn system(name: &str, display_name: &str, now: DateTime<Utc>) -> Self {
        Self::with_scope(Scope::System, name, display_name, now)
    }

    /// Create a custom role owned by `org_id`.
    pub fn custom(org_id: Uuid, name: &str, display_name: &str, now: DateTime<Utc>) -> Self {
        Self::with_scope(Scope::Organization(org_id), name, display_name, now)
    }

    fn with_scope(scope: Scope, name: &str, display_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            role_id: Uuid::new_v4(),
            scope,
            name: normalize_name(name),
            display_name: display_name.trim().to_string(),
            created_utc: now,
        }
    }

    pub fn is_system(&self) -> bool {
        self.scope.is_system()
    }

    pub fn org_id(&self) -> Option<Uuid> {
        self.scope.org_id()
    }
}

/// Permission entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub perm_id: Uuid,
    pub scope: Scope,
    /// `resource:action`, e.g. `doc:approve`.
    pub name: String,
    pub category: String,
    pub created_utc: DateTime<Utc>,
}

impl Permission {
    pub fn system(name: &str, category: &str, now: DateTime<Utc>) -> Self {
        Self::with_scope(Scope::System, name, category, now)
    }

    pub fn custom(org_id: Uuid, name: &str, category: &str, now: DateTime<Utc>) -> Self {
        Self::with_scope(Scope::Organization(org_id), name, category, now)
    }

    fn with_scope(scope: Scope, name: &str, category: &str, now: DateTime<Utc>) -> Self {
        Self {
            perm_id: Uuid::new_v4(),
            scope,
            name: normalize_name(name),
            category: category.trim().to_string(),
            created_utc: now,
        }
    }

    pub fn is_system(&self) -> bool {
        self.scope.is_system()
    }

    pub fn org_id(&self) -> Option<Uuid> {
        self.scope.org_id()
    }
}

/// Role ↔ permission junction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoleGrant {
    pub role_id: Uuid,
    pub perm_id: Uuid,
}

/// Role and permission names compare case-insensitively.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_from_parts() {
        let org = Uuid::new_v4();
        assert_eq!(Scope::from_parts(true, None), Some(Scope::System));
        assert_eq!(
            Scope::from_parts(false, Some(org)),
            Some(Scope::Organization(org))
        );
        assert_eq!(Scope::from_parts(true, Some(org)), None);
        assert_eq!(Scope::from_parts(false, None), None);
    }

    #[test]
    fn test_grant_invariant() {
        let org_a = Scope::Organization(Uuid::new_v4());
        let org_b = Scope::Organization(Uuid::new_v4());

        // System permissions go anywhere
        assert!(org_a.may_hold(&Scope::System));
        assert!(Scope::System.may_hold(&Scope::System));

        // Custom permissions stay in their organization
        assert!(org_a.may_hold(&org_a));
        assert!(!org_b.may_hold(&org_a));
        assert!(!Scope::System.may_hold(&org_a));
    }

    #[test]
    fn test_roles_carry_consistent_scope() {
        let org = Uuid::new_v4();
        let custom = Role::custom(org, " Reviewer ", "Reviewer", Utc::now());
        assert!(!custom.is_system());
        assert_eq!(custom.org_id(), Some(org));
        assert_eq!(custom.name, "reviewer");

        let system = Role::system("owner", "Owner", Utc::now());
        assert!(system.is_system());
        assert_eq!(system.org_id(), None);
    }
}
