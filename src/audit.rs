//! Structured audit trail for queue mutations.
//!
//! Events: order admit, promote, finalize, complete, cancel. Each is one JSON record with
//! timestamp, actor, action, resource, outcome. Sink: stdout or pluggable (e.g. test mock).

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub const ORDER_ADMIT: &str = "order_admit";
pub const ORDER_PROMOTE: &str = "order_promote";
pub const ORDER_FINALIZE: &str = "order_finalize";
pub const ORDER_COMPLETE: &str = "order_complete";
pub const ORDER_CANCEL: &str = "order_cancel";

/// Single audit record: one line of JSON per event.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    /// Unix timestamp (seconds since epoch).
    pub timestamp_secs: u64,
    /// Who performed the action, as `user:<id>`.
    pub actor: String,
    /// One of the `ORDER_*` action names.
    pub action: &'static str,
    /// Affected order and queue facts (order_id, position, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,
    /// success, rejected, error.
    pub outcome: &'static str,
}

impl AuditEvent {
    pub fn now(
        actor: impl Into<String>,
        action: &'static str,
        resource: Option<serde_json::Value>,
        outcome: &'static str,
    ) -> Self {
        let timestamp_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            timestamp_secs,
            actor: actor.into(),
            action,
            resource,
            outcome,
        }
    }
}

/// Sink for audit events. Implementations write to stdout, or in-memory (tests).
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// Writes one JSON line per event to stdout.
pub struct StdoutAuditSink;

impl AuditSink for StdoutAuditSink {
    fn emit(&self, event: &AuditEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
    }
}

/// Discards events.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn emit(&self, _event: &AuditEvent) {}
}

/// In-memory sink that stores events for tests. Clone shares the same backing buffer.
#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn actions(&self) -> Vec<(&'static str, &'static str)> {
        self.events().iter().map(|e| (e.action, e.outcome)).collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}
