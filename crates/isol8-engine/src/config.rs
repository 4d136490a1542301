//! Engine configuration (spec §3, §6.5).
//!
//! The core only *consumes* this struct — merging a JSON file over defaults
//! is the configuration loader's job (an external collaborator). Every
//! field here derives `Deserialize` with `#[serde(default)]` so a
//! collaborator can `serde_json::from_value` a partial document directly
//! over `EngineConfig::default()`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use isol8_common::{LifecycleMode, NetworkMode, PoolStrategy, Runtime, SeccompMode};
use serde::{Deserialize, Serialize};

/// Top-level per-engine-instance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lifecycle: LifecycleMode,
    pub max_concurrent: usize,
    pub resources: ResourceCaps,
    pub max_output_bytes: usize,
    pub default_timeout_ms: u64,
    pub secrets: HashMap<String, String>,
    pub network_mode: NetworkMode,
    pub network_filter: NetworkFilterConfig,
    pub security: SecurityConfig,
    pub pool: PoolConfig,
    pub dependencies: HashMap<Runtime, Vec<String>>,
    pub image_overrides: HashMap<Runtime, String>,
    pub remote_code: RemoteCodePolicy,
    pub audit_privacy: AuditPrivacy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleMode::Ephemeral,
            max_concurrent: 10,
            resources: ResourceCaps::default(),
            max_output_bytes: 1024 * 1024,
            default_timeout_ms: 10_000,
            secrets: HashMap::new(),
            network_mode: NetworkMode::None,
            network_filter: NetworkFilterConfig::default(),
            security: SecurityConfig::default(),
            pool: PoolConfig::default(),
            dependencies: HashMap::new(),
            image_overrides: HashMap::new(),
            remote_code: RemoteCodePolicy::default(),
            audit_privacy: AuditPrivacy::default(),
        }
    }
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Resource caps applied to every sandbox container (spec §4.6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceCaps {
    pub memory_bytes: u64,
    pub cpu_cores: f64,
    pub max_pids: u32,
    pub readonly_rootfs: bool,
    /// `size=` value for the `/sandbox` tmpfs mount (e.g. `"256m"`).
    pub sandbox_tmpfs_size: String,
    /// `size=` value for the `/tmp` tmpfs mount (e.g. `"64m"`).
    pub tmp_tmpfs_size: String,
}

impl Default for ResourceCaps {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024,
            cpu_cores: 1.0,
            max_pids: 128,
            readonly_rootfs: true,
            sandbox_tmpfs_size: "256m".to_string(),
            tmp_tmpfs_size: "64m".to_string(),
        }
    }
}

/// Ordered allow/deny regex lists for filtered networking (spec §3, §4.5).
/// Deny always takes precedence; an empty allow list means allow-all after
/// deny is applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkFilterConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// Security profile applied to sandbox containers (spec §4.6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub profile: SeccompMode,
    pub custom_profile_path: Option<PathBuf>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            profile: SeccompMode::Strict,
            custom_profile_path: None,
        }
    }
}

/// Container pool sizing and strategy (spec §3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub strategy: PoolStrategy,
    /// Secure strategy: the single queue's capacity.
    /// Fast strategy: the `clean` queue's target capacity.
    pub clean_size: usize,
    /// Fast strategy only: the `dirty` queue's capacity. Unused (and
    /// logically always empty) under the secure strategy.
    pub dirty_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            strategy: PoolStrategy::Secure,
            clean_size: 4,
            dirty_size: 8,
        }
    }
}

/// Remote-code fetch policy (spec §4.5, §6.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCodePolicy {
    pub enabled: bool,
    pub allowed_schemes: Vec<String>,
    pub allow_hosts: Vec<String>,
    pub deny_hosts: Vec<String>,
    pub max_bytes: usize,
    pub timeout_ms: u64,
    pub require_hash: bool,
}

impl Default for RemoteCodePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_schemes: vec!["https".to_string()],
            allow_hosts: Vec::new(),
            deny_hosts: Vec::new(),
            max_bytes: 1024 * 1024,
            timeout_ms: 5_000,
            require_hash: false,
        }
    }
}

impl RemoteCodePolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Privacy flags applied by the audit sink (spec §6.4).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditPrivacy {
    pub include_code: bool,
    pub include_output: bool,
}
