//! Execution Orchestrator (spec §4.6).
//!
//! Top-level logic for `execute` and `executeStream`: resolves the image,
//! acquires a container, stages code and ancillary files, builds the
//! timeout-wrapped command, collects or streams output, retrieves output
//! artifacts, composes the result, emits the audit record, and returns (or
//! destroys) the container.
//!
//! State machine per execution (spec §4.6.13):
//! `Admitted → ImageResolved → Staged → Started → Running → Collecting →
//! Completed | TimedOut | Failed`. Failures during `ImageResolved`/`Staged`
//! destroy any partially created container; failures during `Running` land
//! as a non-zero exit code, a `TimedOut` marker, or a transport error.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use isol8_common::{
    EngineError, EngineResult, ExecutionId, NetworkMode, Runtime, SeccompMode,
};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditRecord, SharedAuditSink};
use crate::config::EngineConfig;
use crate::execution::{ExecutionRequest, ExecutionResult};
use crate::fetcher::{FetchRequest, RemoteCodeFetcher};
use crate::gate::ConcurrencyGate;
use crate::host::{ContainerHost, ContainerSpec, ExecFrame, ExecSpec, ExecStreamHandle, SandboxHostConfig};
use crate::pool::{ContainerPool, PooledContainer};
use crate::registry::{RuntimeDescriptor, RuntimeRegistry};
use crate::shaper;

const SANDBOX_UID: u32 = 100;
const SANDBOX_GID: u32 = 101;
const PROXY_PORT: u16 = 8118;
const PROXY_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const OUTPUT_GRACE_PERIOD: Duration = Duration::from_millis(100);
const STAGING_INLINE_EXEC_LIMIT: usize = 20 * 1024;
const STAGING_CHUNK_SIZE: usize = 8 * 1024;
/// Well-known in-container locations the proxy (§6.3) appends its JSONL
/// records to. `/tmp` rather than `/sandbox` because the proxy runs as root
/// and `/sandbox`'s tmpfs is mounted `uid=100,gid=101` (the sandbox user).
const NETWORK_LOG_PATH: &str = "/tmp/.isol8-network.jsonl";
const SECURITY_EVENTS_PATH: &str = "/tmp/.isol8-security.jsonl";

/// One runtime bound to the single persistent-mode container.
struct PersistentContainer {
    container_id: String,
    runtime: Runtime,
}

pub struct ExecutionOrchestrator {
    registry: Arc<RuntimeRegistry>,
    host: Arc<dyn ContainerHost>,
    pool: ContainerPool,
    gate: ConcurrencyGate,
    fetcher: RemoteCodeFetcher,
    config: EngineConfig,
    audit: SharedAuditSink,
    image_cache: Mutex<HashMap<Runtime, String>>,
    image_pulls: Mutex<HashMap<String, Arc<tokio::sync::OnceCell<()>>>>,
    persistent: Mutex<Option<PersistentContainer>>,
}

impl ExecutionOrchestrator {
    pub fn new(
        registry: Arc<RuntimeRegistry>,
        host: Arc<dyn ContainerHost>,
        config: EngineConfig,
        audit: SharedAuditSink,
    ) -> EngineResult<Self> {
        let pool = ContainerPool::new(
            host.clone(),
            config.pool.strategy,
            config.pool.clean_size,
            config.pool.dirty_size,
            config.security.profile,
            config.network_mode,
        );
        let gate = ConcurrencyGate::new(config.max_concurrent);
        let fetcher = RemoteCodeFetcher::new()?;

        Ok(Self {
            registry,
            host,
            pool,
            gate,
            fetcher,
            config,
            audit,
            image_cache: Mutex::new(HashMap::new()),
            image_pulls: Mutex::new(HashMap::new()),
            persistent: Mutex::new(None),
        })
    }

    /// Eagerly warms the pool for the given runtimes (or all registered
    /// runtimes when `runtimes` is empty). No-op in persistent mode.
    pub async fn prewarm(&self, runtimes: &[Runtime]) -> EngineResult<()> {
        use isol8_common::LifecycleMode;
        if self.config.lifecycle == LifecycleMode::Persistent {
            return Ok(());
        }
        let targets: Vec<Runtime> = if runtimes.is_empty() {
            Runtime::REGISTRATION_ORDER.to_vec()
        } else {
            runtimes.to_vec()
        };
        for runtime in targets {
            let descriptor = self.registry.get(runtime)?;
            let image = self.resolve_image(descriptor).await?;
            let spec = self.build_container_spec(descriptor, &image);
            self.pool.warm(&image, &spec).await?;
        }
        Ok(())
    }

    pub async fn stop(&self) -> EngineResult<()> {
        let mut persistent = self.persistent.lock().await;
        if let Some(p) = persistent.take() {
            let _ = self.host.remove(&p.container_id, true).await;
        }
        self.pool.drain().await
    }

    #[instrument(skip(self, request), fields(runtime = ?request.runtime))]
    pub async fn execute(&self, request: ExecutionRequest) -> EngineResult<ExecutionResult> {
        let execution_id = Uuid::new_v4();
        let start = Instant::now();
        let _permit = self.gate.acquire().await;

        let runtime = request
            .runtime
            .ok_or_else(|| EngineError::Config("request is missing `runtime`".to_string()))?;
        validate_code_source(&request)?;

        let descriptor = self.registry.get(runtime)?;
        let image = self.resolve_image(descriptor).await?;

        let (code, code_hash) = self.resolve_code(&request).await?;

        let (container_id, from_pool) = self.acquire_container(runtime, descriptor, &image).await?;

        let outcome = self
            .run_in_container(
                execution_id,
                &container_id,
                descriptor,
                &request,
                &code,
                start,
            )
            .await;

        match &outcome {
            Ok(_) => {
                if from_pool {
                    let _ = self.pool.release(&image, PooledContainer { id: container_id.clone(), created_at: Instant::now() }).await;
                }
            }
            Err(_) => {
                if from_pool {
                    let _ = self.host.remove(&container_id, true).await;
                }
            }
        }

        let (mut result, security_events) = outcome?;
        result.execution_id = execution_id;
        result.runtime = runtime;
        result.container_id = container_id.clone();

        self.emit_audit(
            execution_id,
            runtime,
            &code_hash,
            &container_id,
            &code,
            &result,
            security_events,
            &request,
        )
        .await;

        Ok(result)
    }

    #[instrument(skip(self, request, sink), fields(runtime = ?request.runtime))]
    pub async fn execute_stream(
        &self,
        request: ExecutionRequest,
        sink: tokio::sync::mpsc::Sender<isol8_common::StreamEvent>,
    ) -> EngineResult<()> {
        use isol8_common::StreamEvent;

        let execution_id = Uuid::new_v4();
        let _permit = self.gate.acquire().await;

        let runtime = match request.runtime {
            Some(r) => r,
            None => {
                let _ = sink
                    .send(StreamEvent::Error { message: "request is missing `runtime`".to_string() })
                    .await;
                let _ = sink.send(StreamEvent::Exit { code: 1 }).await;
                return Ok(());
            }
        };
        if let Err(e) = validate_code_source(&request) {
            let _ = sink.send(StreamEvent::Error { message: e.to_string() }).await;
            let _ = sink.send(StreamEvent::Exit { code: 1 }).await;
            return Ok(());
        }

        let descriptor = self.registry.get(runtime)?;
        let image = self.resolve_image(descriptor).await?;
        let (code, _code_hash) = self.resolve_code(&request).await?;

        let (container_id, from_pool) = self.acquire_container(runtime, descriptor, &image).await?;

        let argv = match self.stage_and_build_command(&container_id, descriptor, &request, &code, execution_id).await {
            Ok(argv) => argv,
            Err(e) => {
                if from_pool {
                    let _ = self.host.remove(&container_id, true).await;
                }
                let _ = sink.send(StreamEvent::Error { message: e.to_string() }).await;
                let _ = sink.send(StreamEvent::Exit { code: 1 }).await;
                return Ok(());
            }
        };

        let timeout = Duration::from_millis(request.timeout_ms.unwrap_or(self.config.default_timeout_ms));
        let exec_spec = ExecSpec {
            cmd: argv,
            env: env_vars(&request, &self.config.secrets),
            user: Some(format!("{SANDBOX_UID}:{SANDBOX_GID}")),
            attach_stdout: true,
            attach_stderr: true,
            working_dir: Some("/sandbox".to_string()),
        };

        let handle = match self.host.exec_stream(&container_id, &exec_spec).await {
            Ok(h) => h,
            Err(e) => {
                if from_pool {
                    let _ = self.host.remove(&container_id, true).await;
                }
                let _ = sink.send(StreamEvent::Error { message: e.to_string() }).await;
                let _ = sink.send(StreamEvent::Exit { code: 1 }).await;
                return Ok(());
            }
        };

        let secrets: Vec<String> = self.config.secrets.values().cloned().collect();
        let (timed_out, exit_code) = stream_frames(handle, timeout, &secrets, &sink).await;

        if timed_out {
            let _ = sink
                .send(StreamEvent::Error { message: "EXECUTION TIMED OUT".to_string() })
                .await;
            let _ = sink.send(StreamEvent::Exit { code: 137 }).await;
        } else {
            let _ = sink.send(StreamEvent::Exit { code: exit_code.unwrap_or(1) as i32 }).await;
        }

        if from_pool {
            if timed_out {
                let _ = self.host.remove(&container_id, true).await;
            } else {
                let _ = self.pool.release(&image, PooledContainer { id: container_id, created_at: Instant::now() }).await;
            }
        }

        Ok(())
    }

    pub async fn put_file(&self, path: &str, bytes: &[u8]) -> EngineResult<()> {
        let persistent = self.persistent.lock().await;
        let container_id = persistent
            .as_ref()
            .ok_or(EngineError::NoActiveContainer)?
            .container_id
            .clone();
        drop(persistent);
        self.stage_bytes(&container_id, path, bytes).await
    }

    pub async fn get_file(&self, path: &str) -> EngineResult<Vec<u8>> {
        let persistent = self.persistent.lock().await;
        let container_id = persistent
            .as_ref()
            .ok_or(EngineError::NoActiveContainer)?
            .container_id
            .clone();
        drop(persistent);
        self.host
            .get_file(&container_id, path)
            .await?
            .ok_or_else(|| EngineError::Io {
                operation: "getFile",
                source: std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()),
            })
    }

    // ── Image resolution (spec §4.6.1) ──────────────────────────────────

    async fn resolve_image(&self, descriptor: &RuntimeDescriptor) -> EngineResult<String> {
        {
            let cache = self.image_cache.lock().await;
            if let Some(tag) = cache.get(&descriptor.runtime) {
                return Ok(tag.clone());
            }
        }

        let resolved = if let Some(tag) = self.config.image_overrides.get(&descriptor.runtime) {
            tag.clone()
        } else if let Some(deps) = self.config.dependencies.get(&descriptor.runtime) {
            let hashed = hashed_dependency_tag(descriptor.runtime, deps);
            if self.host.get_image(&hashed).await?.is_some() {
                hashed
            } else {
                let legacy = format!("{}-custom", descriptor.base_image.trim_end_matches(":latest"));
                if self.host.get_image(&legacy).await?.is_some() {
                    legacy
                } else {
                    descriptor.base_image.to_string()
                }
            }
        } else {
            descriptor.base_image.to_string()
        };

        self.ensure_image_pulled(&resolved).await?;

        let mut cache = self.image_cache.lock().await;
        cache.insert(descriptor.runtime, resolved.clone());
        Ok(resolved)
    }

    /// Pulls `tag` exactly once per engine lifetime, no matter how many
    /// concurrent executions resolve to it first.
    async fn ensure_image_pulled(&self, tag: &str) -> EngineResult<()> {
        let cell = {
            let mut pulls = self.image_pulls.lock().await;
            pulls.entry(tag.to_string()).or_insert_with(|| Arc::new(tokio::sync::OnceCell::new())).clone()
        };
        cell.get_or_try_init(|| async { self.host.ensure_image(tag).await }).await?;
        Ok(())
    }

    // ── Container acquisition ───────────────────────────────────────────

    /// Returns `(container_id, from_pool)`. `from_pool` is `false` for
    /// persistent-mode reuse, since those containers never go back through
    /// `ContainerPool`.
    async fn acquire_container(
        &self,
        runtime: Runtime,
        descriptor: &RuntimeDescriptor,
        image: &str,
    ) -> EngineResult<(String, bool)> {
        use isol8_common::LifecycleMode;

        if self.config.lifecycle == LifecycleMode::Persistent {
            let mut persistent = self.persistent.lock().await;
            if let Some(existing) = persistent.as_ref() {
                if existing.runtime != runtime {
                    return Err(EngineError::Config(format!(
                        "Cannot switch runtime: persistent engine is bound to `{}`, request asked for `{}`",
                        existing.runtime, runtime
                    )));
                }
                return Ok((existing.container_id.clone(), false));
            }

            let spec = self.build_container_spec(descriptor, image);
            let container_id = self.host.create(&spec).await?;
            self.host.start(&container_id).await?;
            if self.config.network_mode == NetworkMode::Filtered {
                self.bootstrap_filtered_network(&container_id).await?;
            }
            *persistent = Some(PersistentContainer { container_id: container_id.clone(), runtime });
            return Ok((container_id, false));
        }

        let spec = self.build_container_spec(descriptor, image);
        let pooled = self.pool.acquire(image, &spec).await?;
        if self.config.network_mode == NetworkMode::Filtered {
            self.bootstrap_filtered_network(&pooled.id).await?;
        }
        Ok((pooled.id, true))
    }

    // ── Container hardening spec (§4.6.2) ───────────────────────────────

    fn build_container_spec(&self, descriptor: &RuntimeDescriptor, image: &str) -> ContainerSpec {
        let resources = &self.config.resources;
        let mut security_opt = vec!["no-new-privileges".to_string()];
        match self.config.security.profile {
            SeccompMode::Unconfined => security_opt.push("seccomp=unconfined".to_string()),
            SeccompMode::Strict => match locate_strict_profile() {
                Some(path) => security_opt.push(format!("seccomp={}", path.display())),
                None => warn!("no bundled strict seccomp profile found, running unfiltered"),
            },
            SeccompMode::Custom => {
                if let Some(path) = &self.config.security.custom_profile_path {
                    security_opt.push(format!("seccomp={}", path.display()));
                }
            }
        }

        let (network_mode, extra_capabilities) = match self.config.network_mode {
            NetworkMode::None => ("none".to_string(), Vec::new()),
            NetworkMode::Host => ("host".to_string(), Vec::new()),
            NetworkMode::Filtered => ("bridge".to_string(), vec!["NET_ADMIN".to_string()]),
        };

        let tmpfs = vec![
            (
                "/sandbox".to_string(),
                format!(
                    "rw,exec,nosuid,nodev,size={},uid={SANDBOX_UID},gid={SANDBOX_GID}",
                    resources.sandbox_tmpfs_size
                ),
            ),
            (
                "/tmp".to_string(),
                format!("rw,noexec,nosuid,nodev,size={}", resources.tmp_tmpfs_size),
            ),
        ];

        let mut labels = HashMap::new();
        labels.insert("isol8.engine".to_string(), "true".to_string());
        labels.insert("isol8.runtime".to_string(), descriptor.runtime.as_str().to_string());

        ContainerSpec {
            image: image.to_string(),
            working_dir: "/sandbox".to_string(),
            env: Vec::new(),
            host_config: SandboxHostConfig {
                memory_bytes: resources.memory_bytes,
                nano_cpus: (resources.cpu_cores * 1_000_000_000.0) as i64,
                pids_limit: resources.max_pids,
                readonly_rootfs: resources.readonly_rootfs,
                tmpfs,
                security_opt,
                cap_drop: vec!["ALL".to_string()],
                network_mode,
                extra_capabilities,
            },
            labels,
        }
    }

    // ── Filtered-network bootstrap (spec §4.6.3) ────────────────────────

    async fn bootstrap_filtered_network(&self, container_id: &str) -> EngineResult<()> {
        let start_proxy = ExecSpec {
            cmd: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "ISOL8_WHITELIST='{}' ISOL8_BLACKLIST='{}' ISOL8_NETWORK_LOG={NETWORK_LOG_PATH} \
                     ISOL8_SECURITY_LOG={SECURITY_EVENTS_PATH} isol8-proxy --listen 127.0.0.1:{PROXY_PORT} &",
                    serde_json::to_string(&self.config.network_filter.allow).unwrap_or_default(),
                    serde_json::to_string(&self.config.network_filter.deny).unwrap_or_default(),
                ),
            ],
            env: Vec::new(),
            user: Some("root".to_string()),
            attach_stdout: false,
            attach_stderr: false,
            working_dir: None,
        };
        self.host.exec_collect(container_id, &start_proxy).await?;

        let deadline = Instant::now() + PROXY_STARTUP_TIMEOUT;
        loop {
            let probe = ExecSpec {
                cmd: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("nc -z 127.0.0.1 {PROXY_PORT}"),
                ],
                env: Vec::new(),
                user: Some("root".to_string()),
                attach_stdout: false,
                attach_stderr: false,
                working_dir: None,
            };
            if let Ok(output) = self.host.exec_collect(container_id, &probe).await {
                if output.exit_code == Some(0) {
                    break;
                }
            }
            if Instant::now() >= deadline {
                return Err(EngineError::ProxyStartupTimeout(PROXY_STARTUP_TIMEOUT));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let install_rules = ExecSpec {
            cmd: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "iptables -A OUTPUT -o lo -j ACCEPT; \
                     iptables -A OUTPUT -m state --state ESTABLISHED,RELATED -j ACCEPT; \
                     iptables -A OUTPUT -m owner --uid-owner {SANDBOX_UID} -p tcp -d 127.0.0.1 --dport {PROXY_PORT} -j ACCEPT; \
                     iptables -A OUTPUT -m owner --uid-owner {SANDBOX_UID} -j DROP"
                ),
            ],
            env: Vec::new(),
            user: Some("root".to_string()),
            attach_stdout: false,
            attach_stderr: true,
            working_dir: None,
        };
        self.host.exec_collect(container_id, &install_rules).await?;
        Ok(())
    }

    // ── Remote code resolution ──────────────────────────────────────────

    async fn resolve_code(&self, request: &ExecutionRequest) -> EngineResult<(String, String)> {
        if let Some(url) = &request.code_url {
            let fetched = self
                .fetcher
                .fetch(
                    &self.config.remote_code,
                    FetchRequest {
                        url,
                        allow_insecure_code_url: request.allow_insecure_code_url,
                        code_hash: request.code_hash.as_deref(),
                    },
                )
                .await?;
            Ok((fetched.code, fetched.hash))
        } else {
            let code = request.code.clone().unwrap_or_default();
            let mut hasher = Sha256::new();
            hasher.update(code.as_bytes());
            Ok((code.clone(), hex::encode(hasher.finalize())))
        }
    }

    // ── Staging and command construction (spec §4.6.4-4.6.7) ────────────

    async fn stage_and_build_command(
        &self,
        container_id: &str,
        descriptor: &RuntimeDescriptor,
        request: &ExecutionRequest,
        code: &str,
        execution_id: ExecutionId,
    ) -> EngineResult<Vec<String>> {
        if !request.install_packages.is_empty() {
            self.install_packages(container_id, descriptor.runtime, &request.install_packages).await?;
        }

        for (path, bytes) in &request.files {
            self.stage_bytes(container_id, path, bytes).await?;
        }

        let needs_file_staging = request.stdin.is_some()
            || !request.files.is_empty()
            || !request.output_paths.is_empty()
            || !request.install_packages.is_empty()
            || !descriptor.supports_inline();

        let argv = if needs_file_staging {
            let file_name = format!(
                "exec_{}.{}",
                epoch_millis(),
                request.file_extension.as_deref().unwrap_or(descriptor.file_extension)
            );
            let file_path = format!("/sandbox/{file_name}");
            self.stage_bytes(container_id, &file_path, code.as_bytes()).await?;
            descriptor.build_command(code, Some(&file_path))
        } else {
            descriptor.build_command(code, None)
        };

        let argv = if let Some(stdin) = &request.stdin {
            let stdin_path = format!("/sandbox/_stdin_{}", execution_id.simple());
            self.stage_bytes(container_id, &stdin_path, stdin.as_bytes()).await?;
            wrap_stdin(argv, &stdin_path)
        } else {
            argv
        };

        let timeout_ms = request.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        Ok(wrap_timeout(argv, timeout_ms))
    }

    async fn install_packages(&self, container_id: &str, runtime: Runtime, packages: &[String]) -> EngineResult<()> {
        let (cmd, user) = match runtime {
            Runtime::Python => (
                format!(
                    "pip install --user --no-cache-dir --break-system-packages {}",
                    packages.join(" ")
                ),
                format!("{SANDBOX_UID}:{SANDBOX_GID}"),
            ),
            Runtime::Node => (
                format!("npm install --prefix /sandbox {}", packages.join(" ")),
                format!("{SANDBOX_UID}:{SANDBOX_GID}"),
            ),
            Runtime::Bun => (
                format!(
                    "bun install -g --global-dir=/sandbox/.bun-global {}",
                    packages.join(" ")
                ),
                format!("{SANDBOX_UID}:{SANDBOX_GID}"),
            ),
            Runtime::Deno => (
                packages.iter().map(|url| format!("deno cache {url}")).collect::<Vec<_>>().join(" && "),
                format!("{SANDBOX_UID}:{SANDBOX_GID}"),
            ),
            Runtime::Bash => (format!("apk add --no-cache {}", packages.join(" ")), "root".to_string()),
        };

        let output = self
            .host
            .exec_collect(
                container_id,
                &ExecSpec {
                    cmd: vec!["sh".to_string(), "-c".to_string(), cmd],
                    env: Vec::new(),
                    user: Some(user),
                    attach_stdout: true,
                    attach_stderr: true,
                    working_dir: Some("/sandbox".to_string()),
                },
            )
            .await?;

        if output.exit_code.unwrap_or(1) != 0 {
            return Err(EngineError::Internal(format!(
                "package install failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Writes `bytes` into `dest_path` inside the container. Small bodies
    /// go through a single base64 exec round-trip; larger bodies are
    /// chunked into 8 KB base64 units appended to the destination, then
    /// decoded once the last chunk lands (spec §4.6.4).
    async fn stage_bytes(&self, container_id: &str, dest_path: &str, bytes: &[u8]) -> EngineResult<()> {
        if bytes.len() <= STAGING_INLINE_EXEC_LIMIT {
            return self.host.put_file(container_id, dest_path, bytes).await;
        }

        let tmp_path = format!("{dest_path}.b64");
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        for chunk in encoded.as_bytes().chunks(STAGING_CHUNK_SIZE) {
            let chunk_str = std::str::from_utf8(chunk).expect("base64 alphabet is ASCII");
            let append = ExecSpec {
                cmd: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("printf '%s' '{chunk_str}' >> {tmp_path}"),
                ],
                env: Vec::new(),
                user: None,
                attach_stdout: true,
                attach_stderr: true,
                working_dir: None,
            };
            let output = self.host.exec_collect(container_id, &append).await?;
            if output.exit_code.unwrap_or(1) != 0 {
                return Err(EngineError::Internal(format!(
                    "chunked staging of {dest_path} failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
        }

        let decode = ExecSpec {
            cmd: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("base64 -d {tmp_path} > {dest_path} && rm -f {tmp_path}"),
            ],
            env: Vec::new(),
            user: None,
            attach_stdout: true,
            attach_stderr: true,
            working_dir: None,
        };
        let output = self.host.exec_collect(container_id, &decode).await?;
        if output.exit_code.unwrap_or(1) != 0 {
            return Err(EngineError::Internal(format!(
                "decode of staged {dest_path} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    // ── Run + collect (non-streaming) ───────────────────────────────────

    async fn run_in_container(
        &self,
        execution_id: ExecutionId,
        container_id: &str,
        descriptor: &RuntimeDescriptor,
        request: &ExecutionRequest,
        code: &str,
        start: Instant,
    ) -> EngineResult<(ExecutionResult, Option<Vec<isol8_common::NetworkLogEntry>>)> {
        let argv = self
            .stage_and_build_command(container_id, descriptor, request, code, execution_id)
            .await?;

        let timeout_ms = request.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let timeout = Duration::from_millis(timeout_ms);

        let exec_spec = ExecSpec {
            cmd: argv,
            env: env_vars(request, &self.config.secrets),
            user: Some(format!("{SANDBOX_UID}:{SANDBOX_GID}")),
            attach_stdout: true,
            attach_stderr: true,
            working_dir: Some("/sandbox".to_string()),
        };

        let handle = self.host.exec_stream(container_id, &exec_spec).await?;
        let secrets: Vec<String> = self.config.secrets.values().cloned().collect();
        let collected = collect_with_timeout(handle, timeout, &secrets, self.config.max_output_bytes).await;

        let files = if request.output_paths.is_empty() {
            None
        } else {
            Some(self.retrieve_outputs(container_id, &request.output_paths).await?)
        };

        let resource_usage = if self.audit.is_enabled() {
            self.host.stats(container_id).await.ok().map(|s| isol8_common::ResourceUsage {
                cpu_percent: cpu_percent(&s),
                memory_mib: s.memory_usage_bytes as f64 / (1024.0 * 1024.0),
                rx_bytes: s.rx_bytes,
                tx_bytes: s.tx_bytes,
            })
        } else {
            None
        };

        let (network_logs, security_events) = if self.config.network_mode == NetworkMode::Filtered {
            (
                self.read_proxy_log(container_id, NETWORK_LOG_PATH).await,
                self.read_proxy_log(container_id, SECURITY_EVENTS_PATH).await,
            )
        } else {
            (None, None)
        };

        let result = ExecutionResult {
            stdout: collected.stdout,
            stderr: collected.stderr,
            exit_code: collected.exit_code,
            duration_ms: start.elapsed().as_millis() as u64,
            truncated: collected.truncated,
            execution_id,
            runtime: descriptor.runtime,
            timestamp: chrono::Utc::now(),
            container_id: container_id.to_string(),
            files,
            resource_usage,
            network_logs,
        };
        Ok((result, security_events))
    }

    /// Reads a JSONL log the in-container proxy appends to (spec §6.3,
    /// §4.6.11) and parses each line as a `NetworkLogEntry`. Missing file or
    /// malformed lines are swallowed — these logs are best-effort
    /// observability, not load-bearing for the execution result.
    async fn read_proxy_log(&self, container_id: &str, path: &str) -> Option<Vec<isol8_common::NetworkLogEntry>> {
        let bytes = self.host.get_file(container_id, path).await.ok().flatten()?;
        let text = String::from_utf8_lossy(&bytes);
        let entries: Vec<isol8_common::NetworkLogEntry> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        Some(entries)
    }

    async fn retrieve_outputs(&self, container_id: &str, paths: &[String]) -> EngineResult<HashMap<String, String>> {
        let mut out = HashMap::new();
        for path in paths {
            if let Some(bytes) = self.host.get_file(container_id, path).await? {
                out.insert(path.clone(), base64::engine::general_purpose::STANDARD.encode(bytes));
            }
        }
        Ok(out)
    }

    async fn emit_audit(
        &self,
        execution_id: ExecutionId,
        runtime: Runtime,
        code_hash: &str,
        container_id: &str,
        code: &str,
        result: &ExecutionResult,
        security_events: Option<Vec<isol8_common::NetworkLogEntry>>,
        request: &ExecutionRequest,
    ) {
        let record = AuditRecord {
            execution_id,
            user_id: request.user_id(),
            timestamp: result.timestamp,
            runtime,
            code_hash: code_hash.to_string(),
            container_id: container_id.to_string(),
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            resource_usage: result.resource_usage,
            security_events,
            network_logs: result.network_logs.clone(),
            metadata: if request.metadata.is_empty() { None } else { Some(request.metadata.clone()) },
            code: Some(code.to_string()),
            stdout: Some(result.stdout.clone()),
            stderr: Some(result.stderr.clone()),
        }
        .apply_privacy(self.config.audit_privacy);

        self.audit.record(record).await;
        info!(execution_id = %execution_id, exit_code = result.exit_code, duration_ms = result.duration_ms, "execution completed");
    }
}

fn validate_code_source(request: &ExecutionRequest) -> EngineResult<()> {
    match (&request.code, &request.code_url) {
        (Some(_), Some(_)) => Err(EngineError::Config(
            "request must set exactly one of `code`/`codeUrl`, both were set".to_string(),
        )),
        (None, None) => Err(EngineError::Config(
            "request must set exactly one of `code`/`codeUrl`, neither was set".to_string(),
        )),
        _ => Ok(()),
    }
}

/// `request.env` plus the engine's configured secrets (spec §3: secrets are
/// injected into the container environment, not just redacted from output).
/// Secrets are appended after `request.env` so a secret name always wins a
/// collision with a user-supplied env var of the same name.
fn env_vars(request: &ExecutionRequest, secrets: &HashMap<String, String>) -> Vec<String> {
    request
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .chain(secrets.iter().map(|(k, v)| format!("{k}={v}")))
        .collect()
}

fn hashed_dependency_tag(runtime: Runtime, deps: &[String]) -> String {
    let mut sorted = deps.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    for dep in &sorted {
        hasher.update(dep.as_bytes());
        hasher.update(b"\0");
    }
    let digest = hex::encode(hasher.finalize());
    format!("isol8:{}-custom-{}", runtime.as_str(), &digest[..12])
}

fn locate_strict_profile() -> Option<std::path::PathBuf> {
    let dev_relative = Path::new("seccomp/strict.json");
    if dev_relative.exists() {
        return Some(dev_relative.to_path_buf());
    }
    let installed_relative = Path::new("/usr/share/isol8/seccomp/strict.json");
    if installed_relative.exists() {
        return Some(installed_relative.to_path_buf());
    }
    None
}

fn wrap_timeout(argv: Vec<String>, timeout_ms: u64) -> Vec<String> {
    let secs = ((timeout_ms as f64) / 1000.0).ceil() as u64;
    let mut wrapped = vec!["timeout".to_string(), "--signal=KILL".to_string(), secs.to_string()];
    wrapped.extend(argv);
    wrapped
}

fn wrap_stdin(argv: Vec<String>, stdin_path: &str) -> Vec<String> {
    let quoted = argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ");
    vec!["sh".to_string(), "-c".to_string(), format!("cat {} | {}", shell_quote(stdin_path), quoted)]
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn epoch_millis() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
}

/// `(cpuDelta / systemDelta) * numCores * 100` (spec §4.6.11), where both
/// deltas come from the current-vs-previous sample the daemon bundles into
/// one `stats()` response.
fn cpu_percent(stats: &crate::host::ContainerStats) -> f64 {
    let cpu_delta = stats.cpu_total_usage.saturating_sub(stats.precpu_total_usage) as f64;
    let system_delta = stats.system_cpu_usage.saturating_sub(stats.presystem_cpu_usage) as f64;
    if system_delta <= 0.0 {
        return 0.0;
    }
    (cpu_delta / system_delta) * stats.online_cpus.max(1) as f64 * 100.0
}

struct Collected {
    stdout: String,
    stderr: String,
    truncated: bool,
    exit_code: i32,
}

/// Output collection for the non-streaming path (spec §4.6.8). Reads frames
/// until the stream ends or the wall-clock timeout fires; on timeout,
/// resolves with whatever was collected and an explicit timeout marker.
async fn collect_with_timeout(
    mut handle: Box<dyn ExecStreamHandle>,
    timeout: Duration,
    secrets: &[String],
    max_output_bytes: usize,
) -> Collected {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut stdout_buf: Vec<u8> = Vec::new();
    let mut stderr_buf: Vec<u8> = Vec::new();
    let mut timed_out = false;

    loop {
        tokio::select! {
            frame = handle.next_frame() => {
                match frame {
                    Some(Ok(ExecFrame::Stdout(bytes))) => stdout_buf.extend_from_slice(&bytes),
                    Some(Ok(ExecFrame::Stderr(bytes))) => stderr_buf.extend_from_slice(&bytes),
                    Some(Err(_)) => {}
                    None => {
                        match tokio::time::timeout(OUTPUT_GRACE_PERIOD, handle.next_frame()).await {
                            Ok(Some(Ok(ExecFrame::Stdout(bytes)))) => stdout_buf.extend_from_slice(&bytes),
                            Ok(Some(Ok(ExecFrame::Stderr(bytes)))) => stderr_buf.extend_from_slice(&bytes),
                            _ => break,
                        }
                    }
                }
            }
            _ = &mut deadline => {
                timed_out = true;
                break;
            }
        }
    }

    let (stdout, truncated_out) = shaper::shape_final(&stdout_buf, secrets, max_output_bytes);
    let (mut stderr, truncated_err) = shaper::shape_final(&stderr_buf, secrets, max_output_bytes);

    let exit_code = if timed_out {
        stderr.push_str("\n--- EXECUTION TIMED OUT ---");
        137
    } else {
        handle.exit_code().await.ok().flatten().unwrap_or(-1) as i32
    };

    if !timed_out {
        if let Some(signal) = classify_signal_kill(exit_code) {
            stderr.push_str(&format!("\n--- PROCESS TERMINATED: {signal} ---"));
        }
    }

    if timed_out || exit_code > 128 {
        // stderr grew after shaping; re-apply the cap so the marker cannot
        // itself push the stream over budget.
        let (capped, truncated_marker) = shaper::enforce_cap(&stderr, max_output_bytes);
        stderr = capped;
        return Collected { stdout, stderr, truncated: truncated_out || truncated_err || truncated_marker, exit_code };
    }

    Collected { stdout, stderr, truncated: truncated_out || truncated_err, exit_code }
}

/// Interprets a raw exit status using the `128 + signal` convention the
/// `timeout --signal=KILL` wrapper and the kernel's OOM killer both report
/// through, the same table `minos`'s executor consults to tell a
/// judge-requested kill apart from a resource-limit kill (spec §7's
/// `UserNonZeroExit` vs. `ExecutionTimeout` split, generalized here to the
/// signals a sandboxed process can actually receive).
fn classify_signal_kill(exit_code: i32) -> Option<&'static str> {
    match exit_code - 128 {
        6 => Some("SIGABRT"),
        9 => Some("SIGKILL (likely killed by the OOM killer or an external signal)"),
        11 => Some("SIGSEGV"),
        24 => Some("SIGXCPU (CPU time limit exceeded)"),
        n if n > 0 => Some("unknown signal"),
        _ => None,
    }
}

/// Output streaming for `executeStream` (spec §4.6.9): emits `Stdout`/
/// `Stderr` events per chunk as they arrive, then a terminal `Exit`. Returns
/// `(timed_out, exit_code)` so the caller can finish the event sequence.
async fn stream_frames(
    mut handle: Box<dyn ExecStreamHandle>,
    timeout: Duration,
    secrets: &[String],
    sink: &tokio::sync::mpsc::Sender<isol8_common::StreamEvent>,
) -> (bool, Option<i64>) {
    use isol8_common::StreamEvent;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut stdout_decoder = shaper::StreamDecoder::new();
    let mut stderr_decoder = shaper::StreamDecoder::new();

    loop {
        tokio::select! {
            frame = handle.next_frame() => {
                match frame {
                    Some(Ok(ExecFrame::Stdout(bytes))) => {
                        let text = shaper::redact_secrets(&stdout_decoder.push(&bytes), secrets);
                        if !text.is_empty() {
                            let _ = sink.send(StreamEvent::Stdout { data: text }).await;
                        }
                    }
                    Some(Ok(ExecFrame::Stderr(bytes))) => {
                        let text = shaper::redact_secrets(&stderr_decoder.push(&bytes), secrets);
                        if !text.is_empty() {
                            let _ = sink.send(StreamEvent::Stderr { data: text }).await;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = sink.send(StreamEvent::Error { message: e.to_string() }).await;
                    }
                    None => break,
                }
            }
            _ = &mut deadline => {
                return (true, None);
            }
        }
    }

    let exit_code = handle.exit_code().await.ok().flatten();
    (false, exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_percent_uses_the_delta_between_samples_not_raw_counters() {
        let stats = crate::host::ContainerStats {
            cpu_total_usage: 2_200_000_000,
            precpu_total_usage: 2_000_000_000,
            system_cpu_usage: 20_000_000_000,
            presystem_cpu_usage: 19_000_000_000,
            online_cpus: 4,
            memory_usage_bytes: 0,
            rx_bytes: 0,
            tx_bytes: 0,
        };
        // cpuDelta=200_000_000, systemDelta=1_000_000_000 -> 0.2 * 4 * 100 = 80%
        assert!((cpu_percent(&stats) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_is_zero_when_system_delta_is_not_positive() {
        let stats = crate::host::ContainerStats::default();
        assert_eq!(cpu_percent(&stats), 0.0);
    }

    #[test]
    fn wrap_timeout_rounds_up_to_whole_seconds() {
        let argv = wrap_timeout(vec!["python3".to_string()], 1500);
        assert_eq!(argv, vec!["timeout", "--signal=KILL", "2", "python3"]);
    }

    #[test]
    fn wrap_stdin_single_quotes_each_argument() {
        let argv = wrap_stdin(vec!["python3".to_string(), "-c".to_string(), "print('hi')".to_string()], "/sandbox/_stdin");
        assert_eq!(argv[0], "sh");
        assert!(argv[2].contains("cat '/sandbox/_stdin'"));
    }

    #[test]
    fn validate_rejects_both_code_and_url() {
        let mut request = ExecutionRequest::default();
        request.code = Some("print(1)".to_string());
        request.code_url = Some("https://example.com/a.py".to_string());
        assert!(validate_code_source(&request).is_err());
    }

    #[test]
    fn validate_rejects_neither_code_nor_url() {
        let request = ExecutionRequest::default();
        assert!(validate_code_source(&request).is_err());
    }

    #[test]
    fn classify_signal_kill_distinguishes_oom_from_cpu_limit() {
        assert_eq!(classify_signal_kill(137), Some("SIGKILL (likely killed by the OOM killer or an external signal)"));
        assert_eq!(classify_signal_kill(152), Some("SIGXCPU (CPU time limit exceeded)"));
        assert_eq!(classify_signal_kill(1), None);
        assert_eq!(classify_signal_kill(0), None);
    }

    #[test]
    fn hashed_dependency_tag_is_stable_regardless_of_order() {
        let a = hashed_dependency_tag(Runtime::Python, &["numpy".to_string(), "requests".to_string()]);
        let b = hashed_dependency_tag(Runtime::Python, &["requests".to_string(), "numpy".to_string()]);
        assert_eq!(a, b);
    }

    /// Builds a stream handle that yields `stdout` once and then ends,
    /// finishing with `exit_code`.
    fn stub_stream_handle(stdout: &'static [u8], exit_code: i64) -> crate::host::MockExecStreamHandle {
        use std::collections::VecDeque;
        let mut handle = crate::host::MockExecStreamHandle::new();
        let mut frames: VecDeque<Option<EngineResult<ExecFrame>>> =
            VecDeque::from([Some(Ok(ExecFrame::Stdout(stdout.to_vec()))), None, None]);
        handle.expect_next_frame().returning(move || frames.pop_front().unwrap_or(None));
        handle.expect_exit_code().returning(move || Ok(Some(exit_code)));
        handle
    }

    fn no_pool_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.pool.clean_size = 0;
        config.pool.dirty_size = 0;
        config
    }

    #[tokio::test]
    async fn execute_happy_path_runs_and_releases_the_container() {
        use crate::audit::NullAuditSink;
        use crate::host::MockContainerHost;

        let mut host = MockContainerHost::new();
        host.expect_ensure_image().returning(|_tag| Ok(()));
        host.expect_create().returning(|_spec| Ok("container-1".to_string()));
        host.expect_start().returning(|_id| Ok(()));
        host.expect_exec_stream()
            .return_once(|_id, _spec| Ok(Box::new(stub_stream_handle(b"2\n", 0)) as Box<dyn ExecStreamHandle>));
        // clean_size is 0, so the released container never fits the pool's
        // queue and is torn down immediately.
        host.expect_remove().returning(|_id, _force| Ok(()));

        let registry = Arc::new(RuntimeRegistry::with_builtins());
        let orchestrator =
            ExecutionOrchestrator::new(registry, Arc::new(host), no_pool_config(), Arc::new(NullAuditSink))
                .expect("orchestrator construction");

        let mut request = ExecutionRequest::default();
        request.runtime = Some(Runtime::Python);
        request.code = Some("print(1 + 1)".to_string());

        let result = orchestrator.execute(request).await.expect("execution succeeds");
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains('2'));
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn read_proxy_log_parses_jsonl_and_ignores_blank_lines() {
        use crate::audit::NullAuditSink;
        use crate::host::MockContainerHost;

        let mut host = MockContainerHost::new();
        host.expect_get_file().returning(|_id, _path| {
            Ok(Some(
                concat!(
                    r#"{"action":"allow","host":"example.com","method":"GET","path":"/","durationMs":12,"timestamp":"2026-01-01T00:00:00Z"}"#,
                    "\n\n",
                    r#"{"action":"block","host":"evil.example","method":"CONNECT","path":null,"durationMs":1,"timestamp":"2026-01-01T00:00:01Z"}"#,
                    "\n",
                )
                .as_bytes()
                .to_vec(),
            ))
        });

        let registry = Arc::new(RuntimeRegistry::with_builtins());
        let orchestrator =
            ExecutionOrchestrator::new(registry, Arc::new(host), no_pool_config(), Arc::new(NullAuditSink))
                .expect("orchestrator construction");

        let entries = orchestrator
            .read_proxy_log("container-1", NETWORK_LOG_PATH)
            .await
            .expect("log file present");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].host, "example.com");
        assert_eq!(entries[1].host, "evil.example");
    }

    #[tokio::test]
    async fn persistent_mode_rejects_a_runtime_switch() {
        use crate::audit::NullAuditSink;
        use crate::host::MockContainerHost;
        use isol8_common::LifecycleMode;

        let mut host = MockContainerHost::new();
        host.expect_ensure_image().returning(|_tag| Ok(()));
        host.expect_create().returning(|_spec| Ok("container-1".to_string()));
        host.expect_start().returning(|_id| Ok(()));
        host.expect_exec_stream()
            .return_once(|_id, _spec| Ok(Box::new(stub_stream_handle(b"1\n", 0)) as Box<dyn ExecStreamHandle>));

        let mut config = no_pool_config();
        config.lifecycle = LifecycleMode::Persistent;

        let registry = Arc::new(RuntimeRegistry::with_builtins());
        let orchestrator =
            ExecutionOrchestrator::new(registry, Arc::new(host), config, Arc::new(NullAuditSink))
                .expect("orchestrator construction");

        let mut first = ExecutionRequest::default();
        first.runtime = Some(Runtime::Python);
        first.code = Some("print(1)".to_string());
        orchestrator.execute(first).await.expect("first execution binds the persistent container");

        let mut second = ExecutionRequest::default();
        second.runtime = Some(Runtime::Node);
        second.code = Some("console.log(1)".to_string());
        let err = orchestrator.execute(second).await.expect_err("runtime switch must be rejected");
        match err {
            EngineError::Config(message) => assert!(message.contains("Cannot switch runtime")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
