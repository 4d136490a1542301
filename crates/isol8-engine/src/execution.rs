//! Execution request/result data model (spec §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use isol8_common::{ExecutionId, NetworkLogEntry, ResourceUsage, Runtime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single `execute`/`executeStream` call.
///
/// Exactly one of `code`/`code_url` must be set; `Engine::execute` rejects
/// both-set and neither-set with `EngineError::Config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionRequest {
    pub runtime: Option<Runtime>,
    pub code: Option<String>,
    pub code_url: Option<String>,
    pub code_hash: Option<String>,
    pub allow_insecure_code_url: bool,
    pub timeout_ms: Option<u64>,
    pub env: HashMap<String, String>,
    pub file_extension: Option<String>,
    pub stdin: Option<String>,
    pub files: HashMap<String, Vec<u8>>,
    pub output_paths: Vec<String>,
    pub install_packages: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

impl ExecutionRequest {
    pub fn user_id(&self) -> Option<String> {
        self.metadata.get("userId").and_then(|v| v.as_str()).map(str::to_string)
    }
}

/// Result of a completed `execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub truncated: bool,
    pub execution_id: ExecutionId,
    pub runtime: Runtime,
    pub timestamp: DateTime<Utc>,
    pub container_id: String,
    /// Retrieved output files, base64-encoded bytes keyed by the requested
    /// absolute path. `None` when no `output_paths` were requested.
    pub files: Option<HashMap<String, String>>,
    pub resource_usage: Option<ResourceUsage>,
    pub network_logs: Option<Vec<NetworkLogEntry>>,
}
