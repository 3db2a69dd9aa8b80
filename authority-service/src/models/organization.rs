//! Organization model - tenant boundaries and memberships.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Organization state codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrgState {
    Active,
    Suspended,
}

impl OrgState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrgState::Active => "active",
            OrgState::Suspended => "suspended",
        }
    }
}

impl std::str::FromStr for OrgState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(OrgState::Active),
            "suspended" => Ok(OrgState::Suspended),
            _ => Err(format!("Invalid organization state: {}", s)),
        }
    }
}

/// Organization entity (tenant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: Uuid,
    pub slug: String,
    pub state: OrgState,
    pub created_utc: DateTime<Utc>,
}

impl Organization {
    pub fn new(slug: &str, now: DateTime<Utc>) -> Self {
        Self {
            org_id: Uuid::new_v4(),
            slug: slug.trim().to_lowercase(),
            state: OrgState::Active,
            created_utc: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == OrgState::Active
    }
}

/// Membership state codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    Active,
    Suspended,
    Removed,
}

impl MembershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipState::Active => "active",
            MembershipState::Suspended => "suspended",
            MembershipState::Removed => "removed",
        }
    }
}

impl std::str::FromStr for MembershipState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MembershipState::Active),
            "suspended" => Ok(MembershipState::Suspended),
            "removed" => Ok(MembershipState::Removed),
            _ => Err(format!("Invalid membership state: {}", s)),
        }
    }
}

/// Principal ↔ organization link carrying the principal's role there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub membership_id: Uuid,
    pub principal_id: Uuid,
    pub org_id: Uuid,
    pub role_id: Uuid,
    pub state: MembershipState,
    pub created_utc: DateTime<Utc>,
}

impl Membership {
    pub fn new(principal_id: Uuid, org_id: Uuid, role_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            membership_id: Uuid::new_v4(),
            principal_id,
            org_id,
            role_id,
            state: MembershipState::Active,
            created_utc: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == MembershipState::Active
    }
}
