//! isol8-engine — the secure, multi-runtime code execution engine (spec.md §2).
//!
//! Seven cooperating components, leaves-first:
//!
//! 1. [`registry`] — runtime registry (§4.1)
//! 2. [`host`] — container host adapter (§4.2)
//! 3. [`gate`] — concurrency gate (§4.3)
//! 4. [`pool`] — container pool (§4.4)
//! 5. [`fetcher`] — remote code fetcher (§4.5)
//! 6. [`orchestrator`] — execution orchestrator (§4.6)
//! 7. [`shaper`] — output shaper (§4.7)
//!
//! [`Engine`] is the abstraction consumed by the CLI, HTTP server, and other
//! library users (§6.1, §9); [`LocalEngine`] is the container-backed
//! implementation this crate provides. A remote HTTP client implementing the
//! same trait is an external collaborator and lives outside this crate.

pub mod audit;
pub mod config;
pub mod execution;
pub mod fetcher;
pub mod gate;
pub mod host;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod shaper;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use isol8_common::{EngineResult, Runtime, StreamEvent};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::audit::{NullAuditSink, SharedAuditSink};
use crate::config::EngineConfig;
use crate::execution::{ExecutionRequest, ExecutionResult};
use crate::host::{ContainerHost, DockerHost};
use crate::orchestrator::ExecutionOrchestrator;
use crate::registry::RuntimeRegistry;

const LABEL_PREFIX: &str = "isol8";

/// Options accompanying [`Engine::start`] (spec §6.1).
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Runtimes to eagerly warm the pool for. An empty/absent list warms
    /// every registered runtime. Ignored in persistent mode.
    pub prewarm_runtimes: Vec<Runtime>,
}

/// The channel of events returned by [`Engine::execute_stream`]: a finite,
/// single-use sequence terminated by exactly one `Exit` event (spec §3, §4.6.9).
pub type ExecutionEventStream = ReceiverStream<StreamEvent>;

/// Interface polymorphism over "engine" (spec §9): the same operations are
/// exposed whether the concrete backend is this crate's container-backed
/// implementation or a remote HTTP client, so callers (CLI, server) can swap
/// between them behind one trait object.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn start(&self, options: StartOptions) -> EngineResult<()>;
    async fn stop(&self) -> EngineResult<()>;
    async fn execute(&self, request: ExecutionRequest) -> EngineResult<ExecutionResult>;
    async fn execute_stream(&self, request: ExecutionRequest) -> EngineResult<ExecutionEventStream>;

    /// Persistent mode only; fails with `NoActiveContainer` before the first
    /// `execute` call (spec §6.1).
    async fn put_file(&self, path: &str, bytes: &[u8]) -> EngineResult<()>;
    async fn get_file(&self, path: &str) -> EngineResult<Vec<u8>>;
}

/// Container-backed [`Engine`] implementation. Owns the runtime registry and
/// the execution orchestrator (which in turn owns the pool, gate, and
/// fetcher); `stop()` tears down everything it owns.
pub struct LocalEngine {
    orchestrator: Arc<ExecutionOrchestrator>,
}

impl LocalEngine {
    pub fn new(host: Arc<dyn ContainerHost>, config: EngineConfig) -> EngineResult<Self> {
        Self::with_audit_sink(host, config, Arc::new(NullAuditSink))
    }

    pub fn with_audit_sink(
        host: Arc<dyn ContainerHost>,
        config: EngineConfig,
        audit: SharedAuditSink,
    ) -> EngineResult<Self> {
        let registry = Arc::new(RuntimeRegistry::with_builtins());
        let orchestrator = ExecutionOrchestrator::new(registry, host, config, audit)?;
        Ok(Self { orchestrator: Arc::new(orchestrator) })
    }

    /// Connects to the local Docker (or Docker-compatible) daemon via its
    /// default socket/environment and builds an engine with no audit sink.
    pub fn connect_local(config: EngineConfig) -> EngineResult<Self> {
        let host: Arc<dyn ContainerHost> = Arc::new(DockerHost::connect_local()?);
        Self::new(host, config)
    }
}

#[async_trait]
impl Engine for LocalEngine {
    async fn start(&self, options: StartOptions) -> EngineResult<()> {
        self.orchestrator.prewarm(&options.prewarm_runtimes).await
    }

    async fn stop(&self) -> EngineResult<()> {
        self.orchestrator.stop().await
    }

    async fn execute(&self, request: ExecutionRequest) -> EngineResult<ExecutionResult> {
        self.orchestrator.execute(request).await
    }

    async fn execute_stream(&self, request: ExecutionRequest) -> EngineResult<ExecutionEventStream> {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let orchestrator = self.orchestrator.clone();
        // The orchestrator owns the single producer for this channel and
        // drives the whole execution to completion on its own task, so the
        // caller can poll `rx` as a lazy sequence without blocking on it here.
        tokio::spawn(async move {
            if let Err(e) = orchestrator.execute_stream(request, tx.clone()).await {
                let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                let _ = tx.send(StreamEvent::Exit { code: 1 }).await;
            }
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn put_file(&self, path: &str, bytes: &[u8]) -> EngineResult<()> {
        self.orchestrator.put_file(path, bytes).await
    }

    async fn get_file(&self, path: &str) -> EngineResult<Vec<u8>> {
        self.orchestrator.get_file(path).await
    }
}

/// Removes every container whose image tag starts with the engine's known
/// prefix (`isol8:` / `isol8-*`), regardless of which engine instance
/// created it. Static utility exposed alongside `Engine`, not a method on it
/// (spec §6.1). Returns `(removed_count, per_failure_error_strings)`.
pub async fn cleanup_containers(host: &dyn ContainerHost) -> (usize, Vec<String>) {
    let mut removed = 0;
    let mut errors = Vec::new();

    let containers = match host.list_containers(true).await {
        Ok(c) => c,
        Err(e) => return (0, vec![e.to_string()]),
    };

    for container in containers {
        if !owned_by_engine(&container.image, &container.labels) {
            continue;
        }
        match host.remove(&container.id, true).await {
            Ok(()) => removed += 1,
            Err(e) => {
                warn!(container_id = %container.id, error = %e, "failed to remove container during cleanup");
                errors.push(format!("{}: {e}", container.id));
            }
        }
    }
    (removed, errors)
}

/// Removes every image whose tag starts with the engine's known prefix
/// (spec §6.1). Returns `(removed_count, per_failure_error_strings)`.
pub async fn cleanup_images(host: &dyn ContainerHost) -> (usize, Vec<String>) {
    let mut removed = 0;
    let mut errors = Vec::new();

    let images = match host.list_images(true).await {
        Ok(i) => i,
        Err(e) => return (0, vec![e.to_string()]),
    };

    for image in images {
        if !owned_by_engine(&image.id, &image.labels) {
            continue;
        }
        match host.remove_image(&image.id, true).await {
            Ok(()) => removed += 1,
            Err(e) => {
                warn!(image_id = %image.id, error = %e, "failed to remove image during cleanup");
                errors.push(format!("{}: {e}", image.id));
            }
        }
    }
    (removed, errors)
}

fn owned_by_engine(image_tag: &str, labels: &HashMap<String, String>) -> bool {
    image_tag.starts_with(LABEL_PREFIX) || labels.get("isol8.engine").map(String::as_str) == Some("true")
}

#[cfg(test)]
mod tests {
    use super::owned_by_engine;
    use std::collections::HashMap;

    #[test]
    fn recognizes_engine_owned_image_tag() {
        assert!(owned_by_engine("isol8-python:latest", &HashMap::new()));
        assert!(owned_by_engine("isol8:python-custom-abc123", &HashMap::new()));
        assert!(!owned_by_engine("postgres:16", &HashMap::new()));
    }

    #[test]
    fn recognizes_engine_owned_label() {
        let mut labels = HashMap::new();
        labels.insert("isol8.engine".to_string(), "true".to_string());
        assert!(owned_by_engine("sha256:deadbeef", &labels));
    }
}
