//! Admission control: a bound on concurrently running grading sessions.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// What happens to a request that arrives while every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Turn it away immediately.
    Reject,
    /// Wait for a slot, behind at most `depth` other waiters and for at most
    /// `timeout` if one is set.
    Queue {
        /// Maximum number of waiting requests.
        depth: usize,
        /// Maximum wait.
        timeout: Option<Duration>,
    },
}

/// Why a request was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Every slot is taken and the policy does not queue.
    Full,
    /// The wait queue is full.
    QueueFull,
    /// The request waited longer than the queue timeout.
    QueueTimeout,
    /// The limiter was closed during shutdown.
    Closed,
}

impl Rejection {
    /// Short label, suitable for metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Rejection::Full => "full",
            Rejection::QueueFull => "queue_full",
            Rejection::QueueTimeout => "queue_timeout",
            Rejection::Closed => "closed",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The limiter shared by every request handler.
#[derive(Debug)]
pub struct Admission {
    permits: Arc<Semaphore>,
    limit: usize,
    policy: AdmissionPolicy,
    waiting: AtomicUsize,
}

impl Admission {
    /// Allow at most `limit` sessions at once (at least one).
    #[must_use]
    pub fn new(limit: usize, policy: AdmissionPolicy) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            policy,
            waiting: AtomicUsize::new(0),
        }
    }

    /// The configured policy.
    #[must_use]
    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Maximum concurrent sessions.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Sessions currently holding a slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.limit.saturating_sub(self.permits.available_permits())
    }

    /// Requests currently waiting for a slot.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Take a slot. The slot is released when the permit is dropped.
    ///
    /// # Errors
    ///
    /// Returns the reason the request was turned away.
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit, Rejection> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(Rejection::Closed),
            Err(TryAcquireError::NoPermits) => {}
        }

        let AdmissionPolicy::Queue { depth, timeout } = self.policy else {
            return Err(Rejection::Full);
        };

        let _waiting = WaitingSlot::enter(&self.waiting, depth).ok_or(Rejection::QueueFull)?;
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| Rejection::QueueTimeout)?,
            None => acquire.await,
        };
        permit.map_err(|_| Rejection::Closed)
    }

    /// Stop admitting. Waiters are released with [`Rejection::Closed`].
    pub fn close(&self) {
        self.permits.close();
    }
}

/// A place in the wait queue, given back on drop.
struct WaitingSlot<'a> {
    waiting: &'a AtomicUsize,
}

impl<'a> WaitingSlot<'a> {
    fn enter(waiting: &'a AtomicUsize, depth: usize) -> Option<Self> {
        waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < depth).then_some(n + 1)
            })
            .ok()?;
        Some(Self { waiting })
    }
}

impl Drop for WaitingSlot<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}
