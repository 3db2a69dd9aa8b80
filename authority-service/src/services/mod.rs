//! Services layer for the authority.
//!
//! The five trust components (credentials, permissions, sessions, tokens,
//! oauth) plus the collaborators they share.

pub mod audit;
pub mod authority;
pub mod bootstrap;
pub mod clock;
pub mod credentials;
pub mod hashing;
pub mod keys;
pub mod oauth;
pub mod permissions;
pub mod pkce;
pub mod sessions;
pub mod tokens;

pub use audit::{AuditSink, MemoryAuditSink, PgAuditSink, TracingAuditSink};
pub use authority::{Authority, AuthorityDeps, AuthoritySettings};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::CredentialVerifier;
pub use hashing::{Argon2Hasher, CredentialHasher, TokenHasher};
pub use keys::{AccessTokenClaims, SigningKeys};
pub use oauth::{AuthorizationEngine, OAuthSettings};
pub use permissions::{PermissionResolver, ResolvedAccess};
pub use sessions::{SessionManager, SessionSettings};
pub use tokens::{TokenIssuer, TokenSettings};
