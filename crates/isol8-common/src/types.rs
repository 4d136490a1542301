//! Common types shared across isol8 services.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a single call to `Engine::execute`/`execute_stream`.
pub type ExecutionId = Uuid;

/// A registered runtime name. Extension-to-runtime resolution is injective
/// except for the documented `.ts` collision (captured by `Bun`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Python,
    Node,
    Bun,
    Deno,
    Bash,
}

impl Runtime {
    /// All built-in runtimes, in registration order (python, node, bun, bash, deno).
    ///
    /// This is the order the registry installs them at startup; `.ts` binds to
    /// `Bun` because it is registered before `Deno`.
    pub const REGISTRATION_ORDER: [Runtime; 5] = [
        Runtime::Python,
        Runtime::Node,
        Runtime::Bun,
        Runtime::Bash,
        Runtime::Deno,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Python => "python",
            Runtime::Node => "node",
            Runtime::Bun => "bun",
            Runtime::Deno => "deno",
            Runtime::Bash => "bash",
        }
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Runtime {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Runtime::Python),
            "node" => Ok(Runtime::Node),
            "bun" => Ok(Runtime::Bun),
            "deno" => Ok(Runtime::Deno),
            "bash" => Ok(Runtime::Bash),
            other => Err(crate::error::EngineError::UnknownRuntime {
                requested: other.to_string(),
                known: Runtime::REGISTRATION_ORDER
                    .iter()
                    .map(|r| r.as_str().to_string())
                    .collect(),
            }),
        }
    }
}

/// Lifecycle mode for an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleMode {
    #[default]
    Ephemeral,
    Persistent,
}

/// Network posture applied to every sandbox container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    None,
    Host,
    Filtered,
}

/// Syscall-filter profile selection for a sandbox container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SeccompMode {
    #[default]
    Strict,
    Unconfined,
    Custom,
}

/// Container pool strategy: single clean-on-acquire queue, or dual
/// clean/dirty queues with a background reclaimer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolStrategy {
    #[default]
    Secure,
    Fast,
}

/// A single streamed output event from `Engine::execute_stream`.
///
/// Exactly one `Exit` event terminates a stream; it is always the last
/// event produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Stdout { data: String },
    Stderr { data: String },
    Exit { code: i32 },
    Error { message: String },
}

/// One allow/block decision logged by the in-container network proxy.
///
/// `camelCase` on the wire to match the proxy's own JSONL contract (spec
/// §6.3: "host, method, path-or-null, durationMs, timestamp"), independent
/// of whatever casing the rest of this crate's API uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkLogEntry {
    pub action: NetworkAction,
    pub host: String,
    pub method: String,
    pub path: Option<String>,
    pub duration_ms: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkAction {
    Allow,
    Block,
}

/// CPU/memory/network usage sampled around an execution.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mib: f64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}
