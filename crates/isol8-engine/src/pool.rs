//! Container Pool (spec §4.4).
//!
//! Per-image warm pool with two strategies. `Secure` keeps one queue and
//! cleans a container synchronously on acquire; `Fast` keeps `clean`/`dirty`
//! queues and reclaims `dirty` containers into `clean` on a background
//! interval. Both strategies destroy a container rather than recycle it the
//! moment cleanup fails.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use isol8_common::{EngineError, EngineResult, NetworkMode, PoolStrategy, SeccompMode};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::host::{ContainerHost, ContainerSpec, ExecSpec};

/// A warm, currently-unowned container sitting in a pool queue.
#[derive(Debug, Clone)]
pub struct PooledContainer {
    pub id: String,
    pub created_at: Instant,
}

#[derive(Default)]
struct ImageState {
    clean: VecDeque<PooledContainer>,
    dirty: VecDeque<PooledContainer>,
    /// Secure strategy only: true while a refill task is already in flight
    /// for this image, preventing a second one from being spawned.
    replenishing: bool,
}

struct Inner {
    host: Arc<dyn ContainerHost>,
    strategy: PoolStrategy,
    clean_cap: usize,
    dirty_cap: usize,
    security_profile: SeccompMode,
    network_mode: NetworkMode,
    state: Mutex<HashMap<String, ImageState>>,
}

/// Snapshot of one image's queue depths, for logging and diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub clean_len: usize,
    pub dirty_len: usize,
    pub clean_cap: usize,
    pub dirty_cap: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "clean={}/{} dirty={}/{}",
            self.clean_len, self.clean_cap, self.dirty_len, self.dirty_cap
        )
    }
}

pub struct ContainerPool {
    inner: Arc<Inner>,
    reclaimer: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerPool {
    pub fn new(
        host: Arc<dyn ContainerHost>,
        strategy: PoolStrategy,
        clean_cap: usize,
        dirty_cap: usize,
        security_profile: SeccompMode,
        network_mode: NetworkMode,
    ) -> Self {
        let inner = Arc::new(Inner {
            host,
            strategy,
            clean_cap,
            dirty_cap,
            security_profile,
            network_mode,
            state: Mutex::new(HashMap::new()),
        });

        let reclaimer = if strategy == PoolStrategy::Fast {
            Some(spawn_reclaimer(inner.clone()))
        } else {
            None
        };

        Self { inner, reclaimer: Mutex::new(reclaimer) }
    }

    /// Acquire a container for `image`, creating a fresh one inline if the
    /// relevant queue is empty.
    pub async fn acquire(&self, image: &str, spec: &ContainerSpec) -> EngineResult<PooledContainer> {
        match self.inner.strategy {
            PoolStrategy::Secure => self.acquire_secure(image, spec).await,
            PoolStrategy::Fast => self.acquire_fast(image, spec).await,
        }
    }

    async fn acquire_secure(&self, image: &str, spec: &ContainerSpec) -> EngineResult<PooledContainer> {
        let popped = {
            let mut state = self.inner.state.lock().await;
            state.entry(image.to_string()).or_default().clean.pop_front()
        };

        let container = match popped {
            Some(candidate) => match cleanup(&self.inner, &candidate.id).await {
                Ok(()) => candidate,
                Err(e) => {
                    warn!(container_id = %candidate.id, error = %e, "pool cleanup failed, destroying container");
                    let _ = self.inner.host.remove(&candidate.id, true).await;
                    create_fresh(&self.inner, spec).await?
                }
            },
            None => create_fresh(&self.inner, spec).await?,
        };

        self.trigger_secure_refill(image.to_string(), spec.clone());
        Ok(container)
    }

    async fn acquire_fast(&self, image: &str, spec: &ContainerSpec) -> EngineResult<PooledContainer> {
        let popped = {
            let mut state = self.inner.state.lock().await;
            state.entry(image.to_string()).or_default().clean.pop_front()
        };
        match popped {
            Some(candidate) => Ok(candidate),
            None => create_fresh(&self.inner, spec).await,
        }
    }

    /// Return a container to the pool, or destroy it if the relevant queue
    /// is already at capacity.
    pub async fn release(&self, image: &str, container: PooledContainer) -> EngineResult<()> {
        let (accepted, over_capacity, duplicate) = {
            let mut state = self.inner.state.lock().await;
            let entry = state.entry(image.to_string()).or_default();
            let already_pooled =
                entry.clean.iter().any(|c| c.id == container.id) || entry.dirty.iter().any(|c| c.id == container.id);

            if already_pooled {
                (false, false, true)
            } else {
                match self.inner.strategy {
                    PoolStrategy::Secure => {
                        if entry.clean.len() < self.inner.clean_cap {
                            entry.clean.push_back(container.clone());
                            (true, false, false)
                        } else {
                            (false, true, false)
                        }
                    }
                    PoolStrategy::Fast => {
                        if entry.dirty.len() < self.inner.dirty_cap {
                            entry.dirty.push_back(container.clone());
                            (true, false, false)
                        } else {
                            (false, true, false)
                        }
                    }
                }
            }
        };

        if accepted {
            debug!(image, container_id = %container.id, "released container to pool");
            Ok(())
        } else {
            if duplicate {
                warn!(image, container_id = %container.id, "rejected duplicate release, destroying container");
            } else if over_capacity {
                debug!(image, container_id = %container.id, "pool at capacity, destroying released container");
            }
            self.inner.host.remove(&container.id, true).await
        }
    }

    fn trigger_secure_refill(&self, image: String, spec: ContainerSpec) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            {
                let mut state = inner.state.lock().await;
                let entry = state.entry(image.clone()).or_default();
                if entry.replenishing {
                    return;
                }
                entry.replenishing = true;
            }

            loop {
                let len = {
                    let state = inner.state.lock().await;
                    state.get(&image).map(|s| s.clean.len()).unwrap_or(0)
                };
                if len >= inner.clean_cap {
                    break;
                }
                match create_fresh(&inner, &spec).await {
                    Ok(fresh) => {
                        let mut state = inner.state.lock().await;
                        state.entry(image.clone()).or_default().clean.push_back(fresh);
                    }
                    Err(e) => {
                        warn!(image, error = %e, "pool refill create failed, abandoning this round");
                        break;
                    }
                }
            }

            let mut state = inner.state.lock().await;
            if let Some(entry) = state.get_mut(&image) {
                entry.replenishing = false;
            }
        });
    }

    /// Blocks until `image`'s clean queue reaches its target capacity, or a
    /// creation error surfaces.
    pub async fn warm(&self, image: &str, spec: &ContainerSpec) -> EngineResult<()> {
        loop {
            let len = {
                let mut state = self.inner.state.lock().await;
                state.entry(image.to_string()).or_default().clean.len()
            };
            if len >= self.inner.clean_cap {
                return Ok(());
            }
            let fresh = create_fresh(&self.inner, spec).await?;
            let mut state = self.inner.state.lock().await;
            state.entry(image.to_string()).or_default().clean.push_back(fresh);
        }
    }

    pub async fn stats(&self, image: &str) -> PoolStats {
        let state = self.inner.state.lock().await;
        let entry = state.get(image);
        PoolStats {
            clean_len: entry.map(|s| s.clean.len()).unwrap_or(0),
            dirty_len: entry.map(|s| s.dirty.len()).unwrap_or(0),
            clean_cap: self.inner.clean_cap,
            dirty_cap: self.inner.dirty_cap,
        }
    }

    /// Cancels the reclaimer, then removes every container in every queue.
    /// Pending refill tasks are detached `tokio::spawn`s; since they only
    /// ever touch containers they themselves created and push under lock,
    /// draining the queues after they land is sufficient — there is nothing
    /// further to await.
    pub async fn drain(&self) -> EngineResult<()> {
        if let Some(handle) = self.reclaimer.lock().await.take() {
            handle.abort();
        }

        let mut state = self.inner.state.lock().await;
        let images: Vec<String> = state.keys().cloned().collect();
        for image in images {
            if let Some(entry) = state.get_mut(&image) {
                let clean: Vec<_> = entry.clean.drain(..).collect();
                let dirty: Vec<_> = entry.dirty.drain(..).collect();
                for container in clean.into_iter().chain(dirty) {
                    if let Err(e) = self.inner.host.remove(&container.id, true).await {
                        warn!(container_id = %container.id, error = %e, "failed to remove container during drain");
                    }
                }
            }
        }
        state.clear();
        Ok(())
    }
}

async fn create_fresh(inner: &Inner, spec: &ContainerSpec) -> EngineResult<PooledContainer> {
    let id = inner.host.create(spec).await?;
    inner.host.start(&id).await?;
    Ok(PooledContainer { id, created_at: Instant::now() })
}

/// Cleanup contract (spec §4.4): applies only under the strict security
/// profile. Kills every process owned by the sandbox user, flushes the
/// packet-filter OUTPUT chain under filtered networking, and clears
/// `/sandbox` including dot-files. Best-effort by construction (`|| true`
/// per step); only a host-adapter failure propagates as an error.
async fn cleanup(inner: &Inner, container_id: &str) -> EngineResult<()> {
    if inner.security_profile != SeccompMode::Strict {
        return Ok(());
    }

    let mut script = String::from("pkill -KILL -u 100 >/dev/null 2>&1 || true; ");
    if inner.network_mode == NetworkMode::Filtered {
        script.push_str("iptables -F OUTPUT >/dev/null 2>&1 || true; ");
    }
    script.push_str("find /sandbox -mindepth 1 -delete >/dev/null 2>&1 || true");

    inner
        .host
        .exec_collect(
            container_id,
            &ExecSpec {
                cmd: vec!["sh".to_string(), "-c".to_string(), script],
                env: Vec::new(),
                user: Some("root".to_string()),
                attach_stdout: true,
                attach_stderr: true,
                working_dir: None,
            },
        )
        .await?;
    Ok(())
}

fn spawn_reclaimer(inner: Arc<Inner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(10));
        loop {
            interval.tick().await;

            let images: Vec<String> = {
                let state = inner.state.lock().await;
                state.keys().cloned().collect()
            };

            for image in images {
                promote_dirty_to_clean(&inner, &image).await;
            }
        }
    })
}

async fn promote_dirty_to_clean(inner: &Arc<Inner>, image: &str) {
    loop {
        let candidate = {
            let mut state = inner.state.lock().await;
            let entry = state.entry(image.to_string()).or_default();
            if entry.clean.len() >= inner.clean_cap {
                return;
            }
            entry.dirty.pop_front()
        };

        let Some(candidate) = candidate else { return };

        match cleanup(inner, &candidate.id).await {
            Ok(()) => {
                let mut state = inner.state.lock().await;
                state.entry(image.to_string()).or_default().clean.push_back(candidate);
            }
            Err(e) => {
                warn!(container_id = %candidate.id, error = %e, "reclaimer cleanup failed, destroying container");
                let _ = inner.host.remove(&candidate.id, true).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ContainerStats, ExecFrame, ExecOutput, ExecStreamHandle, ImageInfo};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHost {
        created: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl ContainerHost for CountingHost {
        async fn create(&self, _spec: &ContainerSpec) -> EngineResult<String> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("container-{n}"))
        }
        async fn start(&self, _container_id: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn exec_collect(&self, _container_id: &str, _spec: &ExecSpec) -> EngineResult<ExecOutput> {
            Ok(ExecOutput { stdout: Vec::new(), stderr: Vec::new(), exit_code: Some(0) })
        }
        async fn exec_stream(
            &self,
            _container_id: &str,
            _spec: &ExecSpec,
        ) -> EngineResult<Box<dyn ExecStreamHandle>> {
            unimplemented!()
        }
        async fn stats(&self, _container_id: &str) -> EngineResult<ContainerStats> {
            Ok(ContainerStats::default())
        }
        async fn put_file(&self, _container_id: &str, _dest_path: &str, _content: &[u8]) -> EngineResult<()> {
            Ok(())
        }
        async fn get_file(&self, _container_id: &str, _src_path: &str) -> EngineResult<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn remove(&self, _container_id: &str, _force: bool) -> EngineResult<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self, _container_id: &str, _grace_seconds: i64) -> EngineResult<()> {
            Ok(())
        }
        async fn list_containers(&self, _all: bool) -> EngineResult<Vec<crate::host::ContainerSummary>> {
            Ok(Vec::new())
        }
        async fn list_images(&self, _all: bool) -> EngineResult<Vec<ImageInfo>> {
            Ok(Vec::new())
        }
        async fn get_image(&self, _tag: &str) -> EngineResult<Option<ImageInfo>> {
            Ok(None)
        }
        async fn remove_image(&self, _tag_or_id: &str, _force: bool) -> EngineResult<()> {
            Ok(())
        }
        async fn ensure_image(&self, _tag: &str) -> EngineResult<()> {
            Ok(())
        }
    }

    fn test_spec() -> ContainerSpec {
        ContainerSpec {
            image: "isol8-python:latest".to_string(),
            working_dir: "/sandbox".to_string(),
            env: Vec::new(),
            host_config: crate::host::SandboxHostConfig {
                memory_bytes: 0,
                nano_cpus: 0,
                pids_limit: 0,
                readonly_rootfs: true,
                tmpfs: Vec::new(),
                security_opt: Vec::new(),
                cap_drop: Vec::new(),
                network_mode: "none".to_string(),
                extra_capabilities: Vec::new(),
            },
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn secure_acquire_creates_inline_when_empty_and_release_recycles() {
        let host = Arc::new(CountingHost { created: AtomicUsize::new(0), removed: AtomicUsize::new(0) });
        let pool = ContainerPool::new(
            host.clone(),
            PoolStrategy::Secure,
            2,
            0,
            SeccompMode::Unconfined,
            NetworkMode::None,
        );
        let spec = test_spec();

        let container = pool.acquire("img", &spec).await.unwrap();
        pool.release("img", container).await.unwrap();

        let stats = pool.stats("img").await;
        assert_eq!(stats.clean_len, 1);
    }

    #[tokio::test]
    async fn release_over_capacity_destroys_container() {
        let host = Arc::new(CountingHost { created: AtomicUsize::new(0), removed: AtomicUsize::new(0) });
        let pool = ContainerPool::new(
            host.clone(),
            PoolStrategy::Secure,
            0,
            0,
            SeccompMode::Unconfined,
            NetworkMode::None,
        );
        let spec = test_spec();

        let container = pool.acquire("img", &spec).await.unwrap();
        pool.release("img", container).await.unwrap();

        assert_eq!(host.removed.load(Ordering::SeqCst), 1);
        let stats = pool.stats("img").await;
        assert_eq!(stats.clean_len, 0);
    }

    #[tokio::test]
    async fn duplicate_release_is_rejected_not_corrupting_state() {
        let host = Arc::new(CountingHost { created: AtomicUsize::new(0), removed: AtomicUsize::new(0) });
        let pool = ContainerPool::new(
            host.clone(),
            PoolStrategy::Secure,
            5,
            0,
            SeccompMode::Unconfined,
            NetworkMode::None,
        );
        let spec = test_spec();
        let container = pool.acquire("img", &spec).await.unwrap();

        pool.release("img", container.clone()).await.unwrap();
        // A second release of the same logical container is the
        // already-pooled duplicate the spec calls out (§8 idempotence):
        // it must be rejected and destroyed, not double-queued.
        pool.release("img", container.clone()).await.unwrap();

        let stats = pool.stats("img").await;
        assert_eq!(stats.clean_len, 1);
        assert_eq!(host.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fast_strategy_reclaims_dirty_into_clean_in_background() {
        let host = Arc::new(CountingHost { created: AtomicUsize::new(0), removed: AtomicUsize::new(0) });
        let pool = ContainerPool::new(
            host.clone(),
            PoolStrategy::Fast,
            2,
            2,
            SeccompMode::Unconfined,
            NetworkMode::None,
        );
        let spec = test_spec();

        let container = pool.acquire("img", &spec).await.unwrap();
        pool.release("img", container).await.unwrap();

        // Released container lands in `dirty` immediately under the fast
        // strategy; the reclaimer promotes it to `clean` on its own
        // schedule (spec §4.4 "on the order of every 10ms").
        let stats = pool.stats("img").await;
        assert_eq!(stats.dirty_len, 1);
        assert_eq!(stats.clean_len, 0);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = pool.stats("img").await;
        assert_eq!(stats.dirty_len, 0);
        assert_eq!(stats.clean_len, 1);
    }
}
