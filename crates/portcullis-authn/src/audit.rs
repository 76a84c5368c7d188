//! Audit trail for authentication attempts.
//!
//! Every attempt that reaches the dispatcher produces exactly one audit
//! record, success or failure, carrying the full error detail that the
//! caller-facing message deliberately omits. The sink is injected so
//! deployments can ship records wherever they need; the default writes
//! structured tracing events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuthnError;

/// Placeholder identity recorded when the failure happened before any role
/// could be established.
pub const UNKNOWN_ROLE: &str = "unknown";

/// One authentication attempt, as recorded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Fully qualified role id, or [`UNKNOWN_ROLE`]
    pub role_id: String,
    /// Authenticator type, e.g. `authn-jwt`
    pub authenticator: String,
    /// Instance discriminator, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    /// Source IP of the request
    pub client_ip: String,
    /// Whether authentication succeeded
    pub success: bool,
    /// Error kind label on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Full error detail on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the attempt was recorded
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Builds a success record.
    pub fn success(
        role_id: &str,
        authenticator: &str,
        service_id: Option<&str>,
        client_ip: &str,
    ) -> Self {
        Self {
            role_id: role_id.to_string(),
            authenticator: authenticator.to_string(),
            service_id: service_id.map(str::to_string),
            client_ip: client_ip.to_string(),
            success: true,
            error_kind: None,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    /// Builds a failure record from the denying error.
    pub fn failure(
        role_id: &str,
        authenticator: &str,
        service_id: Option<&str>,
        client_ip: &str,
        error: &AuthnError,
    ) -> Self {
        Self {
            role_id: role_id.to_string(),
            authenticator: authenticator.to_string(),
            service_id: service_id.map(str::to_string),
            client_ip: client_ip.to_string(),
            success: false,
            error_kind: Some(error.kind().to_string()),
            error_message: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    /// Records one attempt. Must not fail; a sink that cannot deliver logs
    /// the loss itself.
    fn record(&self, record: &AuditRecord);
}

/// Default sink writing structured tracing events, successes at INFO and
/// failures at WARN.
#[derive(Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        let json = match serde_json::to_string(record) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize audit record");
                return;
            }
        };

        if record.success {
            tracing::info!(
                audit_record = %json,
                role_id = %record.role_id,
                authenticator = %record.authenticator,
                client_ip = %record.client_ip,
                "Authentication succeeded"
            );
        } else {
            tracing::warn!(
                audit_record = %json,
                role_id = %record.role_id,
                authenticator = %record.authenticator,
                client_ip = %record.client_ip,
                error_kind = record.error_kind.as_deref().unwrap_or(""),
                "Authentication failed"
            );
        }
    }
}

/// Sink that retains records in memory. Used by tests asserting on the
/// exactly-once recording discipline.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: std::sync::Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record.clone());
    }
}
