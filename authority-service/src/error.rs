use service_core::error::AppError;
use thiserror::Error;

use crate::store::StoreError;

/// Authentication failures from the credential verifier.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("Invalid credentials")]
    InvalidCredential,

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("Email address is not verified")]
    EmailUnverified,

    #[error("Principal is not a member of this organization")]
    NotMember,
}

/// Token lifecycle failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFailure {
    #[error("Token expired")]
    Expired,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Refresh token replay detected")]
    ReplayDetected,

    #[error("Refresh token presented from a different device")]
    BindingViolation,

    #[error("Invalid access token")]
    InvalidAccessToken,

    #[error("Session is no longer active")]
    SessionInactive,
}

/// Role and permission management failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GrantFailure {
    #[error("Permission '{0}' belongs to another organization")]
    CrossTenantGrantDenied(String),

    #[error("System roles and permissions cannot be modified")]
    SystemResourceImmutable,

    #[error("Role is referenced by an active membership")]
    RoleInUse,

    #[error("Name '{0}' is reserved")]
    ReservedName(String),
}

/// OAuth2 authorization-code protocol failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFailure {
    #[error("Redirect URI does not match")]
    RedirectMismatch,

    #[error("Requested scope is not allowed for this client")]
    ScopeNotAllowed,

    #[error("PKCE verification failed")]
    PkceMismatch,

    #[error("Authorization code was already used")]
    CodeReused,

    #[error("Authorization code expired")]
    CodeExpired,

    #[error("Invalid authorization code")]
    InvalidCode,

    #[error("Client authentication failed")]
    InvalidClient,

    #[error("Code was issued to a different client")]
    ClientMismatch,

    #[error("Unsupported code challenge method")]
    UnsupportedChallengeMethod,

    #[error("Malformed authorization request")]
    InvalidRequest,

    #[error("Principal may not authorize this organization")]
    AccessDenied,
}

impl ProtocolFailure {
    /// RFC 6749 error code for the token or authorization endpoint.
    pub fn oauth_error(&self) -> &'static str {
        match self {
            ProtocolFailure::RedirectMismatch
            | ProtocolFailure::PkceMismatch
            | ProtocolFailure::CodeReused
            | ProtocolFailure::CodeExpired
            | ProtocolFailure::InvalidCode
            | ProtocolFailure::ClientMismatch => "invalid_grant",
            ProtocolFailure::ScopeNotAllowed => "invalid_scope",
            ProtocolFailure::InvalidClient => "invalid_client",
            ProtocolFailure::UnsupportedChallengeMethod | ProtocolFailure::InvalidRequest => {
                "invalid_request"
            }
            ProtocolFailure::AccessDenied => "access_denied",
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthorityError {
    #[error(transparent)]
    Auth(#[from] AuthFailure),

    #[error(transparent)]
    Token(#[from] TokenFailure),

    #[error(transparent)]
    Grant(#[from] GrantFailure),

    #[error(transparent)]
    Protocol(#[from] ProtocolFailure),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Too many {0} attempts")]
    RateLimited(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type AuthorityResult<T> = Result<T, AuthorityError>;

impl From<validator::ValidationErrors> for AuthorityError {
    fn from(err: validator::ValidationErrors) -> Self {
        AuthorityError::Validation(err.to_string())
    }
}

impl From<StoreError> for AuthorityError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AuthorityError::NotFound(what),
            StoreError::Conflict(what) => AuthorityError::Validation(format!("{} already exists", what)),
            StoreError::CrossTenantGrant(name) => {
                AuthorityError::Grant(GrantFailure::CrossTenantGrantDenied(name))
            }
            StoreError::Unexpected(e) => AuthorityError::Internal(e),
        }
    }
}

impl From<AuthorityError> for AppError {
    fn from(err: AuthorityError) -> Self {
        match err {
            AuthorityError::Auth(AuthFailure::NotMember) => {
                AppError::Forbidden(anyhow::anyhow!(AuthFailure::NotMember))
            }
            AuthorityError::Auth(f) => AppError::AuthError(anyhow::anyhow!(f)),
            AuthorityError::Token(f) => AppError::Unauthorized(anyhow::anyhow!(f)),
            AuthorityError::Grant(f @ GrantFailure::RoleInUse) => {
                AppError::Conflict(anyhow::anyhow!(f))
            }
            AuthorityError::Grant(f @ GrantFailure::ReservedName(_)) => {
                AppError::Conflict(anyhow::anyhow!(f))
            }
            AuthorityError::Grant(f) => AppError::Forbidden(anyhow::anyhow!(f)),
            AuthorityError::Protocol(f @ ProtocolFailure::InvalidClient) => {
                AppError::Unauthorized(anyhow::anyhow!(f))
            }
            AuthorityError::Protocol(f) => AppError::Protocol(f.oauth_error(), anyhow::anyhow!(f)),
            AuthorityError::NotFound(what) => {
                AppError::NotFound(anyhow::anyhow!("{} not found", what))
            }
            AuthorityError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            AuthorityError::RateLimited(scope) => {
                AppError::TooManyRequests(format!("Too many {} attempts", scope), None)
            }
            AuthorityError::Internal(e) => AppError::InternalError(e),
        }
    }
}
