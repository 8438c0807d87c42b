//! # Admission Limiter
//!
//! Per-listen-port bounded concurrency control (spec §4.2). Built on
//! `tokio::sync::Semaphore`, which already serves waiters in FIFO order;
//! the limiter adds a bounded waiter count on top so that once `queueLimit`
//! callers are already waiting, the next caller is rejected immediately
//! instead of growing the queue without bound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::error::ForwarderError;

/// A held admission permit. Dropping it releases the permit automatically,
/// which is how `TcpForwarder`/`UdpForwarder`/`HttpForwarder` guarantee the
/// `-1` on release always happens-after the matching `+1` on admission.
pub struct Lease<'a> {
    _permit: SemaphorePermit<'a>,
}

/// Bounded concurrency gate for one listen port.
pub struct AdmissionLimiter {
    semaphore: Semaphore,
    waiting: AtomicUsize,
    queue_limit: usize,
}

impl AdmissionLimiter {
    /// `permits` bounds concurrent admissions; `queue_limit` bounds the
    /// number of callers allowed to wait for a permit (FIFO) before further
    /// callers are rejected outright. Spec §2 fixes `queue_limit` at 100.
    pub fn new(permits: usize, queue_limit: usize) -> Self {
        Self {
            semaphore: Semaphore::new(permits),
            waiting: AtomicUsize::new(0),
            queue_limit,
        }
    }

    /// Attempts to acquire a permit. Succeeds immediately if one is free.
    /// Otherwise waits in FIFO order, unless the wait queue is already at
    /// `queue_limit`, in which case it is rejected without waiting at all.
    /// Cancellation-aware via `shutdown`.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> Result<Lease<'_>, ForwarderError> {
        if let Ok(permit) = self.semaphore.try_acquire() {
            return Ok(Lease { _permit: permit });
        }

        if self.waiting.load(Ordering::Relaxed) >= self.queue_limit {
            return Err(ForwarderError::AdmissionRejected(
                "wait queue is full".to_string(),
            ));
        }

        self.waiting.fetch_add(1, Ordering::Relaxed);
        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(ForwarderError::Cancelled),
            permit = self.semaphore.acquire() => {
                permit.map(|p| Lease { _permit: p }).map_err(|_| ForwarderError::Cancelled)
            }
        };
        self.waiting.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Number of permits currently free.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Per-listen-port collection of limiters, keyed by `"ip:port"`.
#[derive(Default)]
pub struct LimiterRegistry {
    limiters: std::sync::Mutex<std::collections::HashMap<String, Arc<AdmissionLimiter>>>,
}

impl LimiterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a limiter for a listen key. Called once per endpoint during `Orchestrator::init`.
    pub fn insert(&self, listen_key: String, limiter: Arc<AdmissionLimiter>) {
        self.limiters
            .lock()
            .expect("LimiterRegistry lock poisoned")
            .insert(listen_key, limiter);
    }

    /// Fetches the limiter registered for a listen key, if any.
    pub fn get(&self, listen_key: &str) -> Option<Arc<AdmissionLimiter>> {
        self.limiters
            .lock()
            .expect("LimiterRegistry lock poisoned")
            .get(listen_key)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_succeeds_immediately_while_permits_free() {
        let limiter = AdmissionLimiter::new(2, 2);
        let token = CancellationToken::new();
        let a = limiter.acquire(&token).await;
        let b = limiter.acquire(&token).await;
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(limiter.available_permits(), 0);
    }

    #[tokio::test]
    async fn release_on_drop_frees_the_permit() {
        let limiter = AdmissionLimiter::new(1, 1);
        let token = CancellationToken::new();
        {
            let _lease = limiter.acquire(&token).await.unwrap();
            assert_eq!(limiter.available_permits(), 0);
        }
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn waiters_beyond_queue_limit_are_rejected_immediately() {
        let limiter = Arc::new(AdmissionLimiter::new(1, 0));
        let token = CancellationToken::new();
        let _held = limiter.acquire(&token).await.unwrap();

        // No permits free and queue_limit is 0: the next caller must be
        // rejected immediately rather than waiting.
        let rejected = limiter.acquire(&token).await;
        assert!(matches!(rejected, Err(ForwarderError::AdmissionRejected(_))));
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_waiting_acquire() {
        let limiter = Arc::new(AdmissionLimiter::new(1, 5));
        let token = CancellationToken::new();
        let _held = limiter.acquire(&token).await.unwrap();

        let limiter2 = Arc::clone(&limiter);
        let token2 = token.clone();
        let waiter = tokio::spawn(async move { limiter2.acquire(&token2).await.is_err() });

        // Give the waiter a chance to register itself before cancelling.
        tokio::task::yield_now().await;
        token.cancel();

        assert!(waiter.await.unwrap());
    }
}
