use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::models::ClientType;

/// `resource:action`, lowercase ASCII letters, digits, `_`, `-` and `.`.
pub fn validate_permission_name(name: &str) -> Result<(), ValidationError> {
    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    };
    match name.trim().split_once(':') {
        Some((resource, action)) if valid_part(resource) && valid_part(action) => Ok(()),
        _ => Err(ValidationError::new("permission_name")),
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRoleRequest {
    #[validate(
        length(min = 1, max = 64, message = "Role name must be 1-64 characters"),
        custom(function = "validate_name")
    )]
    pub name: String,

    #[validate(length(max = 128, message = "Display name is too long"))]
    #[serde(default)]
    pub display_name: String,

    /// Permission names to grant.
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateRoleRequest {
    #[validate(
        length(min = 1, max = 64, message = "Role name must be 1-64 characters"),
        custom(function = "validate_name")
    )]
    pub name: String,

    #[validate(length(max = 128, message = "Display name is too long"))]
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePermissionRequest {
    #[validate(
        length(min = 3, max = 128, message = "Permission name must be 3-128 characters"),
        custom(function = "validate_permission_name")
    )]
    pub name: String,

    #[validate(length(min = 1, max = 64, message = "Category is required"))]
    pub category: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterClientRequest {
    #[validate(length(min = 1, max = 128, message = "client_id is required"))]
    pub client_id: String,

    #[validate(length(min = 1, message = "Display name is required"))]
    pub display_name: String,

    pub client_type: ClientType,

    #[validate(length(min = 1, message = "At least one redirect URI is required"))]
    pub redirect_uris: Vec<String>,

    #[serde(default)]
    pub allowed_scopes: Vec<String>,
}

#[derive(Serialize)]
pub struct RegisterClientResponse {
    pub client_id: String,
    /// Present for confidential clients only, returned exactly once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub client_type: ClientType,
}

impl std::fmt::Debug for RegisterClientResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterClientResponse")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("client_type", &self.client_type)
            .finish()
    }
}
