#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::primitives::concurrency::CancellationToken;
use crate::types::{Result, TesseraError, TxId};

use super::{Journal, JournalRecord};

const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Called on the worker thread once a record's fate is known, before its waiters wake.
pub type CompletionHook = Arc<dyn Fn(TxId, &Result<()>) + Send + Sync>;

/// Group-commit batching knobs.
#[derive(Clone, Copy, Debug)]
pub struct CommitConfig {
    /// Maximum records appended before one sync.
    pub max_batch_records: usize,
    /// Maximum time spent waiting for more records to join a batch.
    pub max_batch_wait: Duration,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_batch_records: 32,
            max_batch_wait: Duration::from_micros(200),
        }
    }
}

impl CommitConfig {
    fn normalize(mut self) -> Self {
        if self.max_batch_records == 0 {
            self.max_batch_records = 1;
        }
        self
    }
}

/// Background journal writer.
///
/// Records are queued in commit order; a worker thread appends them, syncs once
/// per batch and then completes their tickets. After the first failure every
/// queued and future record fails with the same error, so a later transaction
/// can never become durable ahead of an earlier one.
pub struct JournalCommitter {
    journal: Arc<Journal>,
    state: Arc<Mutex<CommitState>>,
    wakeup: Arc<Condvar>,
    config: CommitConfig,
    hook: Option<CompletionHook>,
}

/// Handle on a queued journal write.
#[derive(Clone)]
pub struct CommitTicket {
    tx: TxId,
    request: Arc<CommitRequest>,
}

impl std::fmt::Debug for CommitTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitTicket")
            .field("tx", &self.tx)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl CommitTicket {
    /// Transaction whose record this ticket tracks.
    pub fn tx(&self) -> TxId {
        self.tx
    }

    /// Returns true once the write succeeded or failed.
    pub fn is_complete(&self) -> bool {
        self.request.result.lock().is_some()
    }

    /// Blocks until the record is durable or has failed.
    pub fn wait(&self) -> Result<()> {
        self.request.wait(None)
    }

    /// Like [`wait`](Self::wait), giving up with [`TesseraError::Cancelled`] once
    /// `cancel` fires. The write itself keeps going.
    pub fn wait_cancellable(&self, cancel: &CancellationToken) -> Result<()> {
        self.request.wait(Some(cancel))
    }
}

impl JournalCommitter {
    /// Creates a committer over `journal`.
    pub fn new(journal: Arc<Journal>, config: CommitConfig, hook: Option<CompletionHook>) -> Self {
        Self {
            journal,
            state: Arc::new(Mutex::new(CommitState::default())),
            wakeup: Arc::new(Condvar::new()),
            config: config.normalize(),
            hook,
        }
    }

    /// Queues `record` without blocking.
    pub fn enqueue(&self, record: JournalRecord) -> CommitTicket {
        let tx = record.tx;
        let request = Arc::new(CommitRequest::new(record));
        let ticket = CommitTicket {
            tx,
            request: Arc::clone(&request),
        };
        let mut state = self.state.lock();
        if let Some(err) = &state.failed {
            let err = err.duplicate();
            drop(state);
            debug!(tx = tx.0, "journal.committer.enqueue_after_failure");
            self.complete(&request, Err(err));
            return ticket;
        }
        state.pending.push_back(request);
        debug!(
            tx = tx.0,
            pending = state.pending.len(),
            worker_running = state.worker_running,
            "journal.committer.enqueue"
        );
        if state.worker_running {
            self.wakeup.notify_one();
            return ticket;
        }
        state.worker_running = true;
        drop(state);
        if let Err(err) = self.spawn_worker() {
            let err = TesseraError::from(err);
            error!(error = %err, "journal.committer.spawn_failed");
            Worker::fail_pending(&self.state, self.hook.as_ref(), &err);
            self.state.lock().worker_running = false;
        }
        ticket
    }

    /// Queues `record` and waits for it to become durable.
    pub fn commit(&self, record: JournalRecord) -> Result<()> {
        self.enqueue(record).wait()
    }

    /// The first failure observed, if any.
    pub fn failure(&self) -> Option<TesseraError> {
        self.state.lock().failed.as_ref().map(TesseraError::duplicate)
    }

    /// Journal written by this committer.
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    fn complete(&self, request: &CommitRequest, outcome: Result<()>) {
        if let Some(hook) = &self.hook {
            hook(request.tx, &outcome);
        }
        request.finish(outcome);
    }

    fn spawn_worker(&self) -> std::io::Result<()> {
        let worker = Worker {
            journal: Arc::clone(&self.journal),
            state: Arc::clone(&self.state),
            wakeup: Arc::clone(&self.wakeup),
            config: self.config,
            hook: self.hook.clone(),
        };
        thread::Builder::new()
            .name("tessera-journal".into())
            .spawn(move || worker.run())
            .map(|_| ())
    }
}

struct Worker {
    journal: Arc<Journal>,
    state: Arc<Mutex<CommitState>>,
    wakeup: Arc<Condvar>,
    config: CommitConfig,
    hook: Option<CompletionHook>,
}

impl Worker {
    fn run(self) {
        let mut batch = Vec::new();
        loop {
            batch.clear();
            {
                let mut guard = self.state.lock();
                let Some(first) = guard.pending.pop_front() else {
                    guard.worker_running = false;
                    debug!("journal.committer.worker_exit");
                    break;
                };
                batch.push(first);
            }
            self.coalesce(&mut batch);
            match self.apply(&batch) {
                Ok(()) => {
                    for req in batch.drain(..) {
                        if let Some(hook) = &self.hook {
                            hook(req.tx, &Ok(()));
                        }
                        req.finish(Ok(()));
                    }
                }
                Err(err) => {
                    error!(error = %err, records = batch.len(), "journal.committer.batch_failed");
                    if let Err(cut) = self.journal.abort_batch() {
                        error!(error = %cut, "journal.committer.abort_batch_failed");
                    }
                    {
                        let mut guard = self.state.lock();
                        guard.failed = Some(err.duplicate());
                    }
                    for req in batch.drain(..) {
                        let outcome = Err(err.duplicate());
                        if let Some(hook) = &self.hook {
                            hook(req.tx, &outcome);
                        }
                        req.finish(outcome);
                    }
                    Self::fail_pending(&self.state, self.hook.as_ref(), &err);
                    self.state.lock().worker_running = false;
                    break;
                }
            }
        }
    }

    fn coalesce(&self, batch: &mut Vec<Arc<CommitRequest>>) {
        let start = Instant::now();
        while batch.len() < self.config.max_batch_records {
            let mut guard = self.state.lock();
            if guard.pending.is_empty() {
                let remaining = match self.config.max_batch_wait.checked_sub(start.elapsed()) {
                    Some(dur) if !dur.is_zero() => dur,
                    _ => break,
                };
                let waited = self.wakeup.wait_for(&mut guard, remaining);
                if waited.timed_out() && guard.pending.is_empty() {
                    break;
                }
            }
            match guard.pending.pop_front() {
                Some(req) => batch.push(req),
                None => continue,
            }
        }
    }

    fn apply(&self, batch: &[Arc<CommitRequest>]) -> Result<()> {
        self.journal.begin_batch();
        for req in batch {
            self.journal.append(&req.record)?;
        }
        self.journal.sync()?;
        self.journal.finish_batch();
        debug!(records = batch.len(), "journal.committer.batch_durable");
        Ok(())
    }

    fn fail_pending(
        state: &Arc<Mutex<CommitState>>,
        hook: Option<&CompletionHook>,
        err: &TesseraError,
    ) {
        let drained: Vec<_> = {
            let mut guard = state.lock();
            if guard.failed.is_none() {
                guard.failed = Some(err.duplicate());
            }
            guard.pending.drain(..).collect()
        };
        for req in drained {
            let outcome = Err(err.duplicate());
            if let Some(hook) = hook {
                hook(req.tx, &outcome);
            }
            req.finish(outcome);
        }
    }
}

#[derive(Default)]
struct CommitState {
    pending: VecDeque<Arc<CommitRequest>>,
    worker_running: bool,
    failed: Option<TesseraError>,
}

struct CommitRequest {
    tx: TxId,
    record: JournalRecord,
    result: Mutex<Option<Result<()>>>,
    cv: Condvar,
}

impl CommitRequest {
    fn new(record: JournalRecord) -> Self {
        Self {
            tx: record.tx,
            record,
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn finish(&self, outcome: Result<()>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }

    fn wait(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.as_ref() {
                return result.as_ref().map(|_| ()).map_err(TesseraError::duplicate);
            }
            match cancel {
                Some(token) if token.is_cancelled() => return Err(TesseraError::Cancelled),
                Some(_) => {
                    let _ = self.cv.wait_for(&mut guard, CANCEL_POLL);
                }
                None => self.cv.wait(&mut guard),
            }
        }
    }
}
