#![forbid(unsafe_code)]

//! Moves journal-durable page versions into the data file.
//!
//! A flush installs, in commit order, the newest version of every page
//! committed in `(last_flushed, bound]`, where `bound` is the oldest snapshot any reader or
//! the active writer still holds (capped at the durable id). Once the data file
//! and the alternate header are synced, the installed versions give back their
//! scratch slots and the journal files they covered are retired.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, error, info, trace};

use crate::primitives::alloc::{AllocDelta, PageAllocator};
use crate::primitives::scratch::PageVersion;
use crate::types::{page, PageNumber, Result, TxId};

use super::env::EnvShared;
use super::header::{EnvHeader, HeaderStore};

/// Outcome of one flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// `last_flushed` before the flush.
    pub previous: u64,
    /// `last_flushed` after the flush.
    pub flushed_up_to: u64,
    /// Page runs written to the data file.
    pub runs_written: u64,
    /// Scratch slots whose last reference was dropped.
    pub slots_released: u64,
    /// Journal files deleted or truncated.
    pub journal_files_retired: usize,
    /// Wall time spent, in microseconds.
    pub elapsed_us: u64,
}

impl FlushReport {
    /// Returns true when nothing was eligible.
    pub fn is_noop(&self) -> bool {
        self.previous == self.flushed_up_to
    }
}

/// Flushed allocator image and header copies, guarded by the flush mutex.
pub(crate) struct FlushState {
    image: PageAllocator,
    headers: HeaderStore,
    header: EnvHeader,
    pub flushes: u64,
}

impl FlushState {
    pub fn new(image: PageAllocator, headers: HeaderStore, header: EnvHeader) -> Self {
        Self {
            image,
            headers,
            header,
            flushes: 0,
        }
    }
}

/// Signals understood by the background flush thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FlushSignal {
    Requested,
    Shutdown,
}

/// Handle on the background flush thread.
pub(crate) struct FlushManager {
    sender: Sender<FlushSignal>,
    handle: Option<JoinHandle<()>>,
}

impl FlushManager {
    pub fn spawn(
        shared: Weak<EnvShared>,
        sender: Sender<FlushSignal>,
        receiver: Receiver<FlushSignal>,
        interval_ms: u64,
    ) -> Result<Self> {
        let interval = Duration::from_millis(interval_ms.max(1));
        let handle = thread::Builder::new()
            .name("tessera-flush".into())
            .spawn(move || run(shared, receiver, interval))?;
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Stops the thread after any flush in progress.
    pub fn shutdown(mut self) {
        // Blocks while a request is queued; the thread drains it first.
        let _ = self.sender.send(FlushSignal::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("flush.thread.panicked");
            }
        }
    }
}

fn run(shared: Weak<EnvShared>, receiver: Receiver<FlushSignal>, interval: Duration) {
    debug!(interval_ms = interval.as_millis() as u64, "flush.thread.start");
    loop {
        match receiver.recv_timeout(interval) {
            Ok(FlushSignal::Requested) | Err(RecvTimeoutError::Timeout) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if shared.is_poisoned() || !shared.has_unflushed() {
                    continue;
                }
                match shared.flush(false) {
                    Ok(Some(report)) if !report.is_noop() => {
                        trace!(up_to = report.flushed_up_to, "flush.background");
                    }
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "flush.background.failed"),
                }
            }
            Ok(FlushSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("flush.thread.stop");
}

impl EnvShared {
    /// Runs one flush. With `blocking == false` a flush already in progress
    /// makes this return `Ok(None)` immediately.
    pub(crate) fn flush(&self, blocking: bool) -> Result<Option<FlushReport>> {
        let mut flush = if blocking {
            self.flush.lock()
        } else {
            match self.flush.try_lock() {
                Some(guard) => guard,
                None => {
                    trace!("flush.skip.busy");
                    return Ok(None);
                }
            }
        };
        self.check_poison()?;
        let started = Instant::now();

        let (previous, bound, versions, deltas) = {
            let state = self.state.lock();
            let durable = state.last_durable;
            let bound = state.readers.oldest().map_or(durable, |oldest| oldest.min(durable));
            if bound <= state.last_flushed {
                return Ok(Some(FlushReport {
                    previous: state.last_flushed.0,
                    flushed_up_to: state.last_flushed.0,
                    ..FlushReport::default()
                }));
            }
            let previous = state.last_flushed;
            let mut versions = self.pages.read().latest_between(previous, bound);
            // Older runs may overlap pages a newer transaction reused.
            versions.sort_by_key(|(page, version)| (version.tx, *page));
            let deltas: Vec<AllocDelta> = state
                .deltas
                .range(previous.next()..=bound)
                .map(|(_, delta)| delta.clone())
                .collect();
            (previous, bound, versions, deltas)
        };

        if let Err(err) = self.install(&mut flush, bound, &versions, &deltas) {
            self.poison(format!("flush up to transaction {bound} failed: {err}"));
            return Err(err);
        }

        // Drop cached pre-flush images while the versions still shadow them.
        for (page, version) in &versions {
            self.invalidate_cached(*page, version.pages);
        }
        let slots_released = {
            let mut state = self.state.lock();
            state.last_flushed = bound;
            state.deltas = state.deltas.split_off(&bound.next());
            let mut table = self.pages.write();
            let slots = table.release_upto(bound);
            drop(table);
            drop(state);
            let mut scratch = self.scratch.lock();
            let mut freed = 0u64;
            for slot in slots {
                if scratch.release(slot)? == 0 {
                    freed += 1;
                }
            }
            freed
        };
        let retired = match self.committer.journal().retire_up_to(bound) {
            Ok(retired) => retired,
            Err(err) => {
                self.poison(format!("journal retirement after flush failed: {err}"));
                return Err(err);
            }
        };
        flush.flushes += 1;

        let report = FlushReport {
            previous: previous.0,
            flushed_up_to: bound.0,
            runs_written: versions.len() as u64,
            slots_released,
            journal_files_retired: retired,
            elapsed_us: started.elapsed().as_micros() as u64,
        };
        info!(
            from = report.previous,
            to = report.flushed_up_to,
            runs = report.runs_written,
            slots = report.slots_released,
            retired = report.journal_files_retired,
            "flush.complete"
        );
        Ok(Some(report))
    }

    fn install(
        &self,
        flush: &mut FlushState,
        bound: TxId,
        versions: &[(PageNumber, PageVersion)],
        deltas: &[AllocDelta],
    ) -> Result<()> {
        for delta in deltas {
            flush.image.apply_delta(delta)?;
        }
        let capacity = page::page_offset(PageNumber(flush.image.file_pages()), self.page_size)?;
        if self.data.len()? < capacity {
            debug!(bytes = capacity, "flush.grow");
            self.data.set_len(capacity)?;
        }
        for (page_no, version) in versions {
            let offset = page::page_offset(*page_no, self.page_size)?;
            let image = self.scratch.lock().view(version.slot, 0, version.pages)?.to_vec();
            self.data.write_at(offset, &image)?;
        }
        self.data.sync_all()?;

        let journal_next = self.committer.journal().stats().current_file + 1;
        let header = &mut flush.header;
        header.last_flushed = bound;
        header.next_page = flush.image.next_page().0;
        header.file_pages = flush.image.file_pages();
        header.free = flush.image.free_extents();
        header.journal_next_file = journal_next;
        flush.headers.write(header)
    }
}
