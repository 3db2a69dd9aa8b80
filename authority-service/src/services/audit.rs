//! Audit sinks for security and compliance events.
//!
//! Recording never blocks the caller and never fails the operation that
//! produced the event. Write failures are logged.

use sqlx::PgPool;
use std::sync::{Arc, Mutex};

use crate::models::{AuditEvent, AuditEventType, Severity};

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

fn trace_event(event: &AuditEvent) {
    match event.severity() {
        Severity::Critical | Severity::Warning => tracing::warn!(
            event_type = event.event_type.as_str(),
            severity = event.severity().as_str(),
            org_id = ?event.org_id,
            principal_id = ?event.principal_id,
            client_id = ?event.client_id,
            data = %event.event_data,
            "Security event"
        ),
        Severity::Info => tracing::info!(
            event_type = event.event_type.as_str(),
            org_id = ?event.org_id,
            principal_id = ?event.principal_id,
            client_id = ?event.client_id,
            "Audit event"
        ),
    }
}

/// Emits events to the structured log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        trace_event(&event);
    }
}

/// Persists events to `audit_events` in the background.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl AuditSink for PgAuditSink {
    fn record(&self, event: AuditEvent) {
        trace_event(&event);
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let result = sqlx::query(
                r#"
                INSERT INTO audit_events
                    (event_id, event_type, severity, org_id, principal_id, client_id, event_data, occurred_utc)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event.event_id)
            .bind(event.event_type.as_str())
            .bind(event.severity().as_str())
            .bind(event.org_id)
            .bind(event.principal_id)
            .bind(&event.client_id)
            .bind(&event.event_data)
            .bind(event.occurred_utc)
            .execute(&pool)
            .await;

            if let Err(e) = result {
                tracing::error!(
                    error = %e,
                    event_type = event.event_type.as_str(),
                    "Failed to write audit event"
                );
            }
        });
    }
}

/// Keeps events in memory. Used by tests and local tooling.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, event_type: AuditEventType) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        trace_event(&event);
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}
