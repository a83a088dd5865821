//! Cooperative request token for long-lived background workers.
//!
//! Reload, restart and shutdown requests are latched here by whoever
//! receives them (the signal plumbing in the server) and consumed by the
//! worker only at the top of its loop. The worker's idle sleep wakes up
//! as soon as a request is raised, so the request is honoured promptly but
//! never interrupts a cycle half way through.
//!
//! # Usage
//! ```ignore
//! let signal = WorkerSignal::new();
//! let worker_signal = signal.clone();
//!
//! // In the worker:
//! loop {
//!     match worker_signal.take_request() {
//!         Some(WorkerRequest::Reload) => reload(),
//!         Some(_) => break,
//!         None => {}
//!     }
//!     run_cycle().await;
//!     worker_signal.sleep(period).await;
//! }
//!
//! // From the control plane:
//! signal.request(WorkerRequest::Shutdown);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// A request delivered to a background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRequest {
    /// Re-read configuration and keep running.
    Reload,
    /// Exit so the supervisor can start a fresh worker (new node topology).
    Restart,
    /// Exit for good.
    Shutdown,
}

#[derive(Clone)]
pub struct WorkerSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    reload: AtomicBool,
    restart: AtomicBool,
    shutdown: AtomicBool,
    /// Bumped on every request to wake sleepers.
    generation: watch::Sender<u64>,
}

impl WorkerSignal {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(SignalInner {
                reload: AtomicBool::new(false),
                restart: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                generation,
            }),
        }
    }

    /// Latch a request and wake any sleeping worker.
    pub fn request(&self, req: WorkerRequest) {
        let flag = match req {
            WorkerRequest::Reload => &self.inner.reload,
            WorkerRequest::Restart => &self.inner.restart,
            WorkerRequest::Shutdown => &self.inner.shutdown,
        };
        flag.store(true, Ordering::SeqCst);
        self.inner.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    /// Whether any request is waiting to be taken.
    pub fn has_pending(&self) -> bool {
        self.inner.reload.load(Ordering::SeqCst)
            || self.inner.restart.load(Ordering::SeqCst)
            || self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Consume the most urgent pending request.
    ///
    /// Shutdown beats restart, restart beats reload. A reload is cleared when
    /// taken; restart and shutdown stay latched because the worker exits.
    pub fn take_request(&self) -> Option<WorkerRequest> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Some(WorkerRequest::Shutdown);
        }
        if self.inner.restart.load(Ordering::SeqCst) {
            return Some(WorkerRequest::Restart);
        }
        if self.inner.reload.swap(false, Ordering::SeqCst) {
            return Some(WorkerRequest::Reload);
        }
        None
    }

    /// Clear a latched restart once the supervisor has replaced the worker.
    pub fn clear_restart(&self) {
        self.inner.restart.store(false, Ordering::SeqCst);
    }

    /// Sleep for at most `duration`, returning early if a request is raised.
    /// Returns `true` if a request is pending when the sleep ends.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let mut rx = self.inner.generation.subscribe();
        if self.has_pending() {
            return true;
        }
        tokio::select! {
            _ = rx.changed() => {}
            _ = tokio::time::sleep(duration) => {}
        }
        self.has_pending()
    }
}

impl Default for WorkerSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_request_by_default() {
        let sig = WorkerSignal::new();
        assert!(!sig.has_pending());
        assert_eq!(sig.take_request(), None);
    }

    #[test]
    fn test_reload_is_consumed_once() {
        let sig = WorkerSignal::new();
        sig.request(WorkerRequest::Reload);
        assert_eq!(sig.take_request(), Some(WorkerRequest::Reload));
        assert_eq!(sig.take_request(), None);
    }

    #[test]
    fn test_shutdown_takes_priority_and_stays_latched() {
        let sig = WorkerSignal::new();
        sig.request(WorkerRequest::Reload);
        sig.request(WorkerRequest::Restart);
        sig.request(WorkerRequest::Shutdown);
        assert_eq!(sig.take_request(), Some(WorkerRequest::Shutdown));
        assert_eq!(sig.take_request(), Some(WorkerRequest::Shutdown));
        assert!(sig.is_shutdown());
    }

    #[test]
    fn test_clear_restart() {
        let sig = WorkerSignal::new();
        sig.request(WorkerRequest::Restart);
        assert_eq!(sig.take_request(), Some(WorkerRequest::Restart));
        sig.clear_restart();
        assert_eq!(sig.take_request(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_returns_immediately_when_pending() {
        let sig = WorkerSignal::new();
        sig.request(WorkerRequest::Shutdown);
        let start = tokio::time::Instant::now();
        assert!(sig.sleep(Duration::from_secs(30)).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_wakes_on_request() {
        let sig = WorkerSignal::new();
        let sig2 = sig.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let woke = sig2.sleep(Duration::from_secs(30)).await;
            (woke, start.elapsed())
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        sig.request(WorkerRequest::Reload);
        let (woke, elapsed) = handle.await.unwrap();
        assert!(woke);
        assert!(elapsed < Duration::from_secs(30), "woke after {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_expires_normally() {
        let sig = WorkerSignal::new();
        let start = tokio::time::Instant::now();
        assert!(!sig.sleep(Duration::from_secs(10)).await);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }
}
