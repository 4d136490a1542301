//! Concurrency Gate (spec §4.3).
//!
//! A counting semaphore with FIFO fairness bounding how many executions run
//! concurrently against one engine instance. `tokio::sync::Semaphore`
//! already gives FIFO wakeup order, so the gate is a thin wrapper that also
//! exposes how many permits are currently available for diagnostics.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

/// Bounds in-flight executions. One permit is held for the duration of a
/// top-level `execute` or `executeStream` call.
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Blocks until a permit is available. The returned guard releases the
    /// permit on drop, so a cancelled caller (e.g. a dropped future) still
    /// frees its slot — `release` is therefore idempotent with respect to
    /// paired acquires by construction.
    pub async fn acquire(&self) -> GatePermit<'_> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("gate semaphore is never closed");
        GatePermit(permit)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Held for the lifetime of one execution; dropping it is the gate's
/// `release`.
pub struct GatePermit<'a>(SemaphorePermit<'a>);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounds_in_flight_permits() {
        let gate = ConcurrencyGate::new(2);
        let first = gate.acquire().await;
        let second = gate.acquire().await;
        assert_eq!(gate.available_permits(), 0);

        let gate_ref = &gate;
        let third = tokio::time::timeout(std::time::Duration::from_millis(20), gate_ref.acquire()).await;
        assert!(third.is_err(), "third acquire should block while two permits are held");

        drop(first);
        let third = tokio::time::timeout(std::time::Duration::from_millis(50), gate_ref.acquire()).await;
        assert!(third.is_ok());
        drop(second);
    }
}
