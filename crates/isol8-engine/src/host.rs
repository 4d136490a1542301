//! Container Host Adapter (spec §4.2).
//!
//! The thin, engine-facing abstraction over a container daemon. The
//! orchestrator and pool never touch `bollard` directly — they go through
//! this trait, which `mockall` mocks in unit tests and `DockerHost`
//! implements against a real daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions, ListImagesOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use futures::StreamExt;
use isol8_common::{EngineError, EngineResult};
use tracing::{debug, info, warn};

/// Host-config knobs the orchestrator cares about when creating a sandbox
/// container. Mirrors the subset of `bollard::models::HostConfig` the spec
/// names explicitly (spec §4.2, §4.6.2).
#[derive(Debug, Clone)]
pub struct SandboxHostConfig {
    pub memory_bytes: u64,
    pub nano_cpus: i64,
    pub pids_limit: u32,
    pub readonly_rootfs: bool,
    pub tmpfs: Vec<(String, String)>,
    pub security_opt: Vec<String>,
    pub cap_drop: Vec<String>,
    pub network_mode: String,
    pub extra_capabilities: Vec<String>,
}

/// Everything needed to create one durable sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub working_dir: String,
    pub env: Vec<String>,
    pub host_config: SandboxHostConfig,
    pub labels: HashMap<String, String>,
}

/// Options for a single exec invocation inside a sandbox container.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub user: Option<String>,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub working_dir: Option<String>,
}

/// Outcome of waiting an exec stream to completion (non-streaming path).
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i64>,
}

/// A single frame from a running exec's attached stream.
#[derive(Debug, Clone)]
pub enum ExecFrame {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Point-in-time resource counters for a running container.
///
/// `cpu_total_usage`/`system_cpu_usage` are the daemon's current cumulative
/// counters; `precpu_total_usage`/`presystem_cpu_usage` are the previous
/// sample the daemon bundles into the same one-shot response. The CPU
/// percent formula (spec §4.6.11) needs the delta between the two, not
/// either value alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStats {
    pub cpu_total_usage: u64,
    pub precpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub presystem_cpu_usage: u64,
    pub online_cpus: u64,
    pub memory_usage_bytes: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub id: String,
    pub labels: HashMap<String, String>,
}

/// Enough of a container's identity for the cleanup utilities (spec §6.1) to
/// decide whether it belongs to this engine: its id, the image tag it was
/// created from, and its labels.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub labels: HashMap<String, String>,
}

/// Minimal container daemon surface the execution engine needs (spec §4.2).
///
/// Streaming exec output is exposed as a boxed stream of `ExecFrame` rather
/// than a concrete `bollard` type so that `mockall` can generate a mock
/// implementation without needing a `'static` daemon connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerHost: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> EngineResult<String>;
    async fn start(&self, container_id: &str) -> EngineResult<()>;

    /// Execute `spec` inside `container_id` and wait for it to finish,
    /// collecting demultiplexed stdout/stderr in full.
    async fn exec_collect(&self, container_id: &str, spec: &ExecSpec) -> EngineResult<ExecOutput>;

    /// Execute `spec` and return a handle that can be polled frame-by-frame,
    /// for the streaming execution path.
    async fn exec_stream(
        &self,
        container_id: &str,
        spec: &ExecSpec,
    ) -> EngineResult<Box<dyn ExecStreamHandle>>;

    async fn stats(&self, container_id: &str) -> EngineResult<ContainerStats>;

    /// Write `content` to `dest_path` inside the container via a base64
    /// exec round-trip (spec §4.6.4). Callers chunk large payloads
    /// themselves; this call stages one already-prepared body.
    async fn put_file(&self, container_id: &str, dest_path: &str, content: &[u8]) -> EngineResult<()>;

    /// Read `src_path` back out via `base64 <path>` and decode, returning
    /// `None` if the file does not exist (silently skipped per spec §4.6.10).
    async fn get_file(&self, container_id: &str, src_path: &str) -> EngineResult<Option<Vec<u8>>>;

    async fn remove(&self, container_id: &str, force: bool) -> EngineResult<()>;
    async fn stop(&self, container_id: &str, grace_seconds: i64) -> EngineResult<()>;

    async fn list_containers(&self, all: bool) -> EngineResult<Vec<ContainerSummary>>;
    async fn list_images(&self, all: bool) -> EngineResult<Vec<ImageInfo>>;
    async fn get_image(&self, tag: &str) -> EngineResult<Option<ImageInfo>>;
    async fn remove_image(&self, tag_or_id: &str, force: bool) -> EngineResult<()>;

    /// Pulls `tag` if it isn't already present locally. Best-effort: a pull
    /// failure is logged and swallowed rather than propagated, since the
    /// image may already be cached under a name the registry rejected.
    async fn ensure_image(&self, tag: &str) -> EngineResult<()>;
}

/// A live exec stream, polled frame-by-frame for `executeStream` (spec §4.6.9).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecStreamHandle: Send {
    async fn next_frame(&mut self) -> Option<EngineResult<ExecFrame>>;
    async fn exit_code(&mut self) -> EngineResult<Option<i64>>;
}

/// `ContainerHost` backed by a real Docker (or Docker-compatible) daemon via
/// `bollard`, grounded on the teacher's benchmark container manager.
pub struct DockerHost {
    docker: Docker,
}

impl DockerHost {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn connect_local() -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|source| EngineError::Host { operation: "connect", source })?;
        Ok(Self { docker })
    }

    fn to_host_config(h: &SandboxHostConfig) -> HostConfig {
        // `--tmpfs=<path>:<opts>` equivalent: HostConfig.tmpfs is a plain
        // path -> mount-options-string map, the same thing the daemon parses
        // from the CLI flag. This is what actually carries `size=`, `uid=`,
        // `gid=`, and `noexec` through to the container; the typed `Mount`
        // struct's `tmpfs_options` has no uid/gid/noexec fields at all, and
        // stuffing the option string into `source` (a bind-mount field) is a
        // no-op for a tmpfs mount.
        let tmpfs: HashMap<String, String> = h.tmpfs.iter().cloned().collect();

        HostConfig {
            memory: Some(h.memory_bytes as i64),
            nano_cpus: Some(h.nano_cpus),
            pids_limit: Some(h.pids_limit as i64),
            readonly_rootfs: Some(h.readonly_rootfs),
            tmpfs: Some(tmpfs),
            security_opt: Some(h.security_opt.clone()),
            cap_drop: Some(h.cap_drop.clone()),
            cap_add: Some(h.extra_capabilities.clone()),
            network_mode: Some(h.network_mode.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerHost for DockerHost {
    async fn create(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            // Sandbox containers are a durable shell: the orchestrator execs
            // into them rather than relying on the entrypoint's own output.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(Self::to_host_config(&spec.host_config)),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(None::<CreateContainerOptions>, body)
            .await
            .map_err(|source| EngineError::Host { operation: "create", source })?;
        Ok(created.id)
    }

    async fn start(&self, container_id: &str) -> EngineResult<()> {
        self.docker
            .start_container(container_id, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|source| EngineError::Host { operation: "start", source })
    }

    async fn exec_collect(&self, container_id: &str, spec: &ExecSpec) -> EngineResult<ExecOutput> {
        let exec = self
            .docker
            .create_exec(container_id, Self::exec_options(spec))
            .await
            .map_err(|source| EngineError::Host { operation: "exec_create", source })?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|source| EngineError::Host { operation: "exec_start", source })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(frame) = output.next().await {
                match frame.map_err(|source| EngineError::Host { operation: "exec_stream", source })? {
                    LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|source| EngineError::Host { operation: "exec_inspect", source })?;

        Ok(ExecOutput { stdout, stderr, exit_code: inspect.exit_code })
    }

    async fn exec_stream(
        &self,
        container_id: &str,
        spec: &ExecSpec,
    ) -> EngineResult<Box<dyn ExecStreamHandle>> {
        let exec = self
            .docker
            .create_exec(container_id, Self::exec_options(spec))
            .await
            .map_err(|source| EngineError::Host { operation: "exec_create", source })?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|source| EngineError::Host { operation: "exec_start", source })?;

        match started {
            StartExecResults::Attached { output, .. } => Ok(Box::new(DockerExecStream {
                docker: self.docker.clone(),
                exec_id: exec.id,
                output,
            })),
            StartExecResults::Detached => Err(EngineError::Internal(
                "exec started detached, expected an attached stream".to_string(),
            )),
        }
    }

    async fn stats(&self, container_id: &str) -> EngineResult<ContainerStats> {
        use bollard::query_parameters::StatsOptions;
        let options = StatsOptions { stream: false, one_shot: true };
        let mut stream = self.docker.stats(container_id, Some(options));
        let sample = stream
            .next()
            .await
            .ok_or_else(|| EngineError::Internal("no stats sample returned".to_string()))?
            .map_err(|source| EngineError::Host { operation: "stats", source })?;

        let cpu = sample.cpu_stats.unwrap_or_default();
        let precpu = sample.precpu_stats.unwrap_or_default();
        let memory = sample.memory_stats.unwrap_or_default();
        let (rx, tx) = sample
            .networks
            .unwrap_or_default()
            .values()
            .fold((0u64, 0u64), |(rx, tx), n| {
                (rx + n.rx_bytes.unwrap_or(0), tx + n.tx_bytes.unwrap_or(0))
            });

        Ok(ContainerStats {
            cpu_total_usage: cpu.cpu_usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0),
            precpu_total_usage: precpu.cpu_usage.and_then(|u| u.total_usage).unwrap_or(0),
            system_cpu_usage: cpu.system_cpu_usage.unwrap_or(0),
            presystem_cpu_usage: precpu.system_cpu_usage.unwrap_or(0),
            online_cpus: cpu.online_cpus.unwrap_or(1) as u64,
            memory_usage_bytes: memory.usage.unwrap_or(0),
            rx_bytes: rx,
            tx_bytes: tx,
        })
    }

    async fn put_file(&self, container_id: &str, dest_path: &str, content: &[u8]) -> EngineResult<()> {
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let cmd = format!("printf '%s' '{encoded}' | base64 -d > {dest_path}");
        let spec = ExecSpec {
            cmd: vec!["sh".to_string(), "-c".to_string(), cmd],
            env: Vec::new(),
            user: None,
            attach_stdout: true,
            attach_stderr: true,
            working_dir: None,
        };
        let output = self.exec_collect(container_id, &spec).await?;
        if output.exit_code.unwrap_or(1) != 0 {
            return Err(EngineError::Internal(format!(
                "staging {dest_path} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn get_file(&self, container_id: &str, src_path: &str) -> EngineResult<Option<Vec<u8>>> {
        use base64::Engine as _;
        let cmd = format!("test -f '{src_path}' && base64 '{src_path}'");
        let spec = ExecSpec {
            cmd: vec!["sh".to_string(), "-c".to_string(), cmd],
            env: Vec::new(),
            user: None,
            attach_stdout: true,
            attach_stderr: true,
            working_dir: None,
        };
        let output = self.exec_collect(container_id, &spec).await?;
        if output.exit_code.unwrap_or(1) != 0 {
            return Ok(None);
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(String::from_utf8_lossy(&output.stdout).trim())
            .map_err(|e| EngineError::Internal(format!("corrupt base64 from container: {e}")))?;
        Ok(Some(decoded))
    }

    async fn remove(&self, container_id: &str, force: bool) -> EngineResult<()> {
        let options = RemoveContainerOptions { force, v: true, ..Default::default() };
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .map_err(|source| EngineError::Host { operation: "remove", source })
    }

    async fn stop(&self, container_id: &str, grace_seconds: i64) -> EngineResult<()> {
        let options = StopContainerOptions { t: Some(grace_seconds as i32), ..Default::default() };
        self.docker
            .stop_container(container_id, Some(options))
            .await
            .map_err(|source| EngineError::Host { operation: "stop", source })
    }

    async fn list_containers(&self, all: bool) -> EngineResult<Vec<ContainerSummary>> {
        let options = ListContainersOptions { all, ..Default::default() };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|source| EngineError::Host { operation: "list_containers", source })?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    image: c.image.unwrap_or_default(),
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn list_images(&self, all: bool) -> EngineResult<Vec<ImageInfo>> {
        let options = ListImagesOptions { all, ..Default::default() };
        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(|source| EngineError::Host { operation: "list_images", source })?;
        Ok(images
            .into_iter()
            .map(|i| ImageInfo { id: i.id, labels: i.labels })
            .collect())
    }

    async fn get_image(&self, tag: &str) -> EngineResult<Option<ImageInfo>> {
        match self.docker.inspect_image(tag).await {
            Ok(image) => Ok(Some(ImageInfo {
                id: image.id.unwrap_or_default(),
                labels: image
                    .config
                    .and_then(|c| c.labels)
                    .unwrap_or_default(),
            })),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(source) => Err(EngineError::Host { operation: "inspect_image", source }),
        }
    }

    async fn remove_image(&self, tag_or_id: &str, force: bool) -> EngineResult<()> {
        use bollard::query_parameters::RemoveImageOptions;
        let options = RemoveImageOptions { force, ..Default::default() };
        self.docker
            .remove_image(tag_or_id, Some(options), None)
            .await
            .map_err(|source| EngineError::Host { operation: "remove_image", source })?;
        Ok(())
    }

    async fn ensure_image(&self, tag: &str) -> EngineResult<()> {
        if self.get_image(tag).await?.is_some() {
            debug!(image = tag, "image already present");
            return Ok(());
        }

        use bollard::query_parameters::CreateImageOptions;
        info!(image = tag, "pulling image");
        let options = CreateImageOptions { from_image: Some(tag.to_string()), ..Default::default() };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            if let Err(source) = progress {
                warn!(image = tag, error = %source, "image pull failed, proceeding with whatever is cached");
                return Ok(());
            }
        }
        Ok(())
    }
}

impl DockerHost {
    fn exec_options(spec: &ExecSpec) -> CreateExecOptions {
        CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            user: spec.user.clone(),
            attach_stdout: Some(spec.attach_stdout),
            attach_stderr: Some(spec.attach_stderr),
            working_dir: spec.working_dir.clone(),
            ..Default::default()
        }
    }
}

/// Adapts `bollard`'s exec log stream to the engine's frame-oriented
/// `ExecStreamHandle`.
struct DockerExecStream {
    docker: Docker,
    exec_id: String,
    output: std::pin::Pin<Box<dyn futures::Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>,
}

#[async_trait]
impl ExecStreamHandle for DockerExecStream {
    async fn next_frame(&mut self) -> Option<EngineResult<ExecFrame>> {
        loop {
            let frame = self.output.next().await?;
            return Some(match frame {
                Ok(LogOutput::StdOut { message }) => Ok(ExecFrame::Stdout(message.to_vec())),
                Ok(LogOutput::StdErr { message }) => Ok(ExecFrame::Stderr(message.to_vec())),
                Ok(_) => continue,
                Err(source) => Err(EngineError::Host { operation: "exec_stream", source }),
            });
        }
    }

    async fn exit_code(&mut self) -> EngineResult<Option<i64>> {
        let inspect = self
            .docker
            .inspect_exec(&self.exec_id)
            .await
            .map_err(|source| EngineError::Host { operation: "exec_inspect", source })?;
        Ok(inspect.exit_code)
    }
}

/// Used by persistent-mode reuse to check the bound container is still up
/// before staging a new execution into it.
pub async fn inspect_running(docker: &Docker, container_id: &str) -> EngineResult<bool> {
    let inspect = docker
        .inspect_container(container_id, None::<InspectContainerOptions>)
        .await
        .map_err(|source| EngineError::Host { operation: "inspect_container", source })?;
    Ok(inspect.state.and_then(|s| s.running).unwrap_or(false))
}
