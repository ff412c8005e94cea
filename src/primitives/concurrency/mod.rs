#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::types::{Result, TesseraError};

/// Registry of active snapshots used by reclamation and flushing.
pub mod readers;

pub use readers::{ReaderRegistry, ReaderSnapshot, ReaderToken};

/// Upper bound on a single condvar wait while a cancellation token is watched.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Cooperative cancellation flag shared between a waiter and whoever cancels it.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every wait observing this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Single-writer lock for write transactions.
///
/// Waiting is bounded by an optional timeout and observes an optional
/// [`CancellationToken`]; a waiter that gives up never disturbs the holder.
#[derive(Clone, Default)]
pub struct WriteLock {
    inner: Arc<LockInner>,
}

#[derive(Default)]
struct LockInner {
    state: Mutex<LockState>,
    released: Condvar,
    acquisitions: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Default, Debug)]
struct LockState {
    holder: Option<Holder>,
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    since: Instant,
    thread: ThreadId,
}

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy, serde::Serialize)]
pub struct LockSnapshot {
    /// Whether the writer lock is held.
    pub held: bool,
    /// How long the current holder has held the lock, in milliseconds.
    pub held_ms: u64,
    /// Total successful acquisitions.
    pub acquisitions: u64,
    /// Total acquisitions that gave up on timeout.
    pub timeouts: u64,
}

/// Proof of write-lock ownership; releasing happens on drop.
pub struct WriterGuard {
    inner: Arc<LockInner>,
}

impl std::fmt::Debug for WriterGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterGuard").finish_non_exhaustive()
    }
}

impl WriteLock {
    /// Creates an unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock, waiting at most `timeout` (`None` waits indefinitely).
    ///
    /// A zero timeout fails immediately with [`TesseraError::Timeout`] when the
    /// lock is held. Cancellation through `cancel` yields [`TesseraError::Cancelled`].
    pub fn acquire(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<WriterGuard> {
        // A limit too large to represent as an instant never expires.
        let deadline = timeout.and_then(|limit| Instant::now().checked_add(limit));
        let mut state = self.inner.state.lock();
        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                tracing::debug!("write_lock.acquire.cancelled");
                return Err(TesseraError::Cancelled);
            }
            if state.holder.is_none() {
                state.holder = Some(Holder {
                    since: Instant::now(),
                    thread: thread::current().id(),
                });
                self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
                return Ok(WriterGuard {
                    inner: Arc::clone(&self.inner),
                });
            }
            let now = Instant::now();
            let mut slice = match deadline {
                Some(deadline) if now >= deadline => {
                    self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
                    let waited = timeout.unwrap_or_default();
                    tracing::debug!(waited_ms = waited.as_millis() as u64, "write_lock.acquire.timeout");
                    return Err(TesseraError::Timeout(waited));
                }
                Some(deadline) => deadline - now,
                None => Duration::MAX,
            };
            if cancel.is_some() {
                slice = slice.min(CANCEL_POLL);
            }
            if slice == Duration::MAX {
                self.inner.released.wait(&mut state);
            } else {
                let _ = self.inner.released.wait_for(&mut state, slice);
            }
        }
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_acquire(&self) -> Option<WriterGuard> {
        let mut state = self.inner.state.lock();
        if state.holder.is_some() {
            return None;
        }
        state.holder = Some(Holder {
            since: Instant::now(),
            thread: thread::current().id(),
        });
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
        Some(WriterGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Returns true while a [`WriterGuard`] is alive.
    pub fn is_held(&self) -> bool {
        self.inner.state.lock().holder.is_some()
    }

    /// Captures lock counters for diagnostics.
    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.inner.state.lock();
        LockSnapshot {
            held: state.holder.is_some(),
            held_ms: state
                .holder
                .map(|h| h.since.elapsed().as_millis().min(u64::MAX as u128) as u64)
                .unwrap_or(0),
            acquisitions: self.inner.acquisitions.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl WriterGuard {
    /// Thread that acquired the lock.
    pub fn acquired_by(&self) -> Option<ThreadId> {
        self.inner.state.lock().holder.map(|h| h.thread)
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.holder = None;
        drop(state);
        self.inner.released.notify_one();
    }
}
