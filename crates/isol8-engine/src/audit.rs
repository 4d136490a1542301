//! Audit record schema and sink trait (spec §6.4).
//!
//! The core defines the record shape and the single invocation point (after
//! the result is composed, before the container is released or destroyed);
//! actually persisting records — to a file, a database, a remote collector —
//! is the audit logger's job and lives outside this crate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use isol8_common::{ExecutionId, NetworkLogEntry, ResourceUsage, Runtime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AuditPrivacy;

/// One audit record emitted per execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub execution_id: ExecutionId,
    /// Pulled from `request.metadata["userId"]`, may be absent.
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub runtime: Runtime,
    /// SHA-256 hex of the code that actually ran (inline or fetched).
    pub code_hash: String,
    pub container_id: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub resource_usage: Option<ResourceUsage>,
    pub security_events: Option<Vec<NetworkLogEntry>>,
    pub network_logs: Option<Vec<NetworkLogEntry>>,
    pub metadata: Option<HashMap<String, Value>>,
    pub code: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl AuditRecord {
    /// Applies the configured privacy filters, clearing `code`/`stdout`/
    /// `stderr` when the sink isn't configured to include them. Called once
    /// per record, right before handing it to the sink.
    pub fn apply_privacy(mut self, privacy: AuditPrivacy) -> Self {
        if !privacy.include_code {
            self.code = None;
        }
        if !privacy.include_output {
            self.stdout = None;
            self.stderr = None;
        }
        self
    }
}

/// Receives audit records. Implementations are expected to be thread-safe;
/// the core calls this at most once per execution.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord);

    /// Whether this sink actually persists anything. The orchestrator
    /// consults this before paying for a `stats()` round-trip (spec
    /// §4.6.11: "if an audit sink is configured, sample container stats").
    /// `NullAuditSink` is the only implementation that overrides it.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// An `AuditSink` that drops every record, used when no sink is configured.
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn record(&self, _record: AuditRecord) {}

    fn is_enabled(&self) -> bool {
        false
    }
}

pub type SharedAuditSink = Arc<dyn AuditSink>;
