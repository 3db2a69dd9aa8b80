//! Audit event model - security and compliance events emitted by the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    LoginSucceeded,
    LoginFailed,
    TokenIssued,
    TokenRotated,
    TokenRevoked,
    ReplayDetected,
    BindingViolation,
    SessionCreated,
    SessionRevoked,
    RoleCreated,
    RoleUpdated,
    RoleDeleted,
    GrantsAssigned,
    GrantsRevoked,
    PermissionCreated,
    CrossTenantGrantDenied,
    CodeIssued,
    CodeExchanged,
    CodeReused,
    CodeDenied,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::LoginSucceeded => "login_succeeded",
            AuditEventType::LoginFailed => "login_failed",
            AuditEventType::TokenIssued => "token_issued",
            AuditEventType::TokenRotated => "token_rotated",
            AuditEventType::TokenRevoked => "token_revoked",
            AuditEventType::ReplayDetected => "replay_detected",
            AuditEventType::BindingViolation => "binding_violation",
            AuditEventType::SessionCreated => "session_created",
            AuditEventType::SessionRevoked => "session_revoked",
            AuditEventType::RoleCreated => "role_created",
            AuditEventType::RoleUpdated => "role_updated",
            AuditEventType::RoleDeleted => "role_deleted",
            AuditEventType::GrantsAssigned => "grants_assigned",
            AuditEventType::GrantsRevoked => "grants_revoked",
            AuditEventType::PermissionCreated => "permission_created",
            AuditEventType::CrossTenantGrantDenied => "cross_tenant_grant_denied",
            AuditEventType::CodeIssued => "code_issued",
            AuditEventType::CodeExchanged => "code_exchanged",
            AuditEventType::CodeReused => "code_reused",
            AuditEventType::CodeDenied => "code_denied",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            AuditEventType::ReplayDetected
            | AuditEventType::BindingViolation
            | AuditEventType::CrossTenantGrantDenied
            | AuditEventType::CodeReused => Severity::Critical,
            AuditEventType::LoginFailed | AuditEventType::CodeDenied => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Audit event entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub event_type: AuditEventType,
    pub org_id: Option<Uuid>,
    pub principal_id: Option<Uuid>,
    pub client_id: Option<String>,
    pub event_data: serde_json::Value,
    pub occurred_utc: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, occurred_utc: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            org_id: None,
            principal_id: None,
            client_id: None,
            event_data: serde_json::Value::Null,
            occurred_utc,
        }
    }

    pub fn with_org(mut self, org_id: Uuid) -> Self {
        self.org_id = Some(org_id);
        self
    }

    pub fn with_principal(mut self, principal_id: Uuid) -> Self {
        self.principal_id = Some(principal_id);
        self
    }

    pub fn with_client(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn severity(&self) -> Severity {
        self.event_type.severity()
    }
}
