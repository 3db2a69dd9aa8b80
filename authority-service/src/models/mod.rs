//! Domain models for the authority.

pub mod audit_event;
pub mod authorization_code;
pub mod client;
pub mod organization;
pub mod principal;
pub mod refresh_token;
pub mod role;
pub mod session;

pub use audit_event::{AuditEvent, AuditEventType, Severity};
pub use authorization_code::{
    AuthorizationCode, AuthorizationCodeStatus, AuthorizationState, CodeGrant, PkceChallengeMethod,
};
pub use client::{ClientApplication, ClientType};
pub use organization::{Membership, MembershipState, OrgState, Organization};
pub use principal::{
    normalize_identifier, split_api_key, ApiKey, Principal, PrincipalState, API_KEY_SCHEME,
};
pub use refresh_token::{DeviceBinding, RefreshToken, RefreshTokenStatus, TokenOwner};
pub use role::{normalize_name, Permission, Role, RoleGrant, Scope};
pub use session::{Revocation, RevocationReason, Session, SessionStatus};
