//! Audit events for compliance logging.
//!
//! Components receive an [`AuditSink`] at construction and report to it; the
//! sink owns whatever storage the deployment needs.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{DimseCommand, SubOperationCounters};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEventKind {
    AssociationEstablished {
        calling_ae_title: String,
        called_ae_title: String,
        peer: String,
        encrypted: bool,
    },
    AssociationReleased {
        peer_ae_title: String,
    },
    AssociationAborted {
        peer_ae_title: String,
        reason: String,
    },
    OperationCompleted {
        command: DimseCommand,
        peer_ae_title: String,
        status: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        counters: Option<SubOperationCounters>,
    },
    OperationFailed {
        command: DimseCommand,
        peer_ae_title: String,
        error: String,
    },
    RetryAttempt {
        destination: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AuditEventKind,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

impl From<AuditEventKind> for AuditEvent {
    fn from(kind: AuditEventKind) -> Self {
        Self::new(kind)
    }
}

/// Receives audit events. Implementations must not block.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes events to the `dimse::audit` tracing target as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "dimse::audit", "{}", json),
            Err(e) => warn!(target: "dimse::audit", "Failed to serialize audit event: {}", e),
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn kinds(&self) -> Vec<AuditEventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
