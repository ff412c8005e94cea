#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::primitives::alloc::{AllocDelta, AllocatorState, Extent};
use crate::primitives::concurrency::{CancellationToken, ReaderToken, WriterGuard};
use crate::primitives::journal::{CommitTicket, JournalPage, JournalRecord};
use crate::primitives::scratch::{PageVersion, ScratchPool, SlotId};
use crate::types::{PageNumber, Result, TesseraError, TxId};

use super::env::{AsyncPin, EnvShared};

/// Access mode requested when a transaction begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxMode {
    /// Snapshot reads only.
    Read,
    /// Holds the write lock; may allocate, modify and free pages.
    Write,
}

/// An immutable page image.
#[derive(Clone)]
pub struct PageRef {
    /// First page of the image.
    pub id: PageNumber,
    /// Run length in pages.
    pub pages: u32,
    data: Arc<[u8]>,
}

impl PageRef {
    /// Returns the page data as a byte slice.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for PageRef {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRef")
            .field("id", &self.id)
            .field("pages", &self.pages)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A run dirtied by the writer, backed by its reserved scratch region.
struct DirtyPage {
    slot: SlotId,
    pages: u32,
    buf: BytesMut,
}

struct WriteState {
    guard: WriterGuard,
    reader: ReaderToken,
    overlay: BTreeMap<PageNumber, DirtyPage>,
    delta: AllocDelta,
    alloc_base: AllocatorState,
    depends_on: Option<CommitTicket>,
}

impl WriteState {
    /// Dirty run holding `page`, with the run's first page.
    fn covering(&self, page: PageNumber) -> Option<(PageNumber, &DirtyPage)> {
        self.overlay
            .range(..=page)
            .next_back()
            .filter(|(start, dirty)| page.0 - start.0 < dirty.pages as u64)
            .map(|(start, dirty)| (*start, dirty))
    }

    /// Dirty runs sharing a page with `extent`, in page order.
    fn overlapping(&self, extent: Extent) -> impl Iterator<Item = (PageNumber, &DirtyPage)> + '_ {
        let from = self
            .covering(extent.first())
            .map_or(extent.first(), |(start, _)| start);
        self.overlay
            .range(from..PageNumber(extent.end()))
            .map(|(start, dirty)| (*start, dirty))
    }

    /// First page and page offset of the dirty run wholly containing `extent`.
    fn containing(&self, extent: Extent) -> Option<(PageNumber, usize)> {
        self.covering(extent.first())
            .filter(|(start, dirty)| extent.end() <= start.0 + dirty.pages as u64)
            .map(|(start, _)| (start, (extent.start - start.0) as usize))
    }

    /// Copies the dirty pages overlapping `extent` over `image`.
    fn overlay_onto(&self, extent: Extent, mut image: Vec<u8>, page_size: usize) -> Vec<u8> {
        for (start, dirty) in self.overlapping(extent) {
            let lo = start.0.max(extent.start);
            let hi = (start.0 + dirty.pages as u64).min(extent.end());
            let src = (lo - start.0) as usize * page_size;
            let dst = (lo - extent.start) as usize * page_size;
            let len = (hi - lo) as usize * page_size;
            image[dst..dst + len].copy_from_slice(&dirty.buf[src..src + len]);
        }
        image
    }
}

enum TxState {
    ReadOnly { reader: ReaderToken },
    Write(Box<WriteState>),
    AsyncCommitPending { ticket: CommitTicket },
    Completed { committed: Option<TxId> },
}

enum CommitMode {
    Sync,
    Async,
}

enum Published {
    Empty(WriterGuard),
    Queued {
        guard: WriterGuard,
        ticket: CommitTicket,
    },
}

enum Ready {
    Read(TxId),
    Write(Box<WriteState>),
}

fn write_state(state: &mut TxState) -> Result<&mut WriteState> {
    match state {
        TxState::Write(ws) => Ok(ws),
        TxState::ReadOnly { .. } => Err(TesseraError::ConcurrencyViolation(
            "write operation on a read transaction",
        )),
        TxState::AsyncCommitPending { .. } => Err(TesseraError::ConcurrencyViolation(
            "transaction already committed",
        )),
        TxState::Completed { .. } => Err(TesseraError::ConcurrencyViolation(
            "transaction already completed",
        )),
    }
}

/// A unit of work over pages.
///
/// Read transactions observe the newest journal-durable snapshot. A write
/// transaction holds the write lock, observes everything committed before it
/// (including an async commit that is still being written) and keeps its dirty
/// pages private until commit. Dropping an unfinished write transaction rolls
/// it back.
pub struct Transaction {
    shared: Arc<EnvShared>,
    id: TxId,
    snapshot: TxId,
    mode: TxMode,
    state: TxState,
}

impl Transaction {
    pub(crate) fn read(shared: Arc<EnvShared>, reader: ReaderToken) -> Self {
        let snapshot = reader.snapshot();
        Self {
            shared,
            id: snapshot,
            snapshot,
            mode: TxMode::Read,
            state: TxState::ReadOnly { reader },
        }
    }

    pub(crate) fn write(shared: Arc<EnvShared>, guard: WriterGuard) -> Self {
        let mut state = shared.state.lock();
        let snapshot = state.last_committed;
        let reader = state.readers.register(snapshot, Instant::now());
        let alloc_base = state.allocator.snapshot();
        let delta = AllocDelta::starting_at(
            state.allocator.next_page().0,
            state.allocator.file_pages(),
        );
        let depends_on = state
            .outstanding
            .as_ref()
            .filter(|ticket| !ticket.is_complete() || ticket.wait().is_err())
            .cloned();
        drop(state);
        let id = snapshot.next();
        debug!(
            tx = id.0,
            snapshot = snapshot.0,
            depends_on = depends_on.as_ref().map(|t| t.tx().0),
            "txn.begin_write"
        );
        Self {
            shared,
            id,
            snapshot,
            mode: TxMode::Write,
            state: TxState::Write(Box::new(WriteState {
                guard,
                reader,
                overlay: BTreeMap::new(),
                delta,
                alloc_base,
                depends_on,
            })),
        }
    }

    /// Id this transaction commits under; for readers, the snapshot id.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// Newest transaction visible to this one.
    pub fn snapshot(&self) -> TxId {
        self.snapshot
    }

    /// Mode the transaction was started in.
    pub fn mode(&self) -> TxMode {
        self.mode
    }

    /// Returns true between `commit_async` and confirmation.
    pub fn is_async_commit_pending(&self) -> bool {
        matches!(self.state, TxState::AsyncCommitPending { .. })
    }

    /// Returns true once committed, confirmed or rolled back.
    pub fn is_completed(&self) -> bool {
        matches!(self.state, TxState::Completed { .. })
    }

    /// Pages dirtied so far, counting each run once.
    pub fn dirty_runs(&self) -> usize {
        match &self.state {
            TxState::Write(ws) => ws.overlay.len(),
            _ => 0,
        }
    }

    /// Reads one page.
    pub fn read_page(&self, page: PageNumber) -> Result<PageRef> {
        self.read_pages(page, 1)
    }

    /// Reads `count` pages starting at `page`.
    ///
    /// Any page range may be read, including pages inside an overflow run.
    pub fn read_pages(&self, page: PageNumber, count: u32) -> Result<PageRef> {
        let page_size = self.shared.page_size as usize;
        let data = match &self.state {
            TxState::ReadOnly { .. } => {
                self.shared.check_readable(page, count)?;
                self.shared.read_committed(page, count, self.snapshot)?
            }
            TxState::Write(ws) => {
                let extent = Extent::new(page, count as u64);
                match ws.containing(extent) {
                    Some((start, skip)) if count > 0 => {
                        let from = skip * page_size;
                        let dirty = ws
                            .overlay
                            .get(&start)
                            .ok_or(TesseraError::Corruption("dirty page vanished"))?;
                        dirty.buf[from..from + count as usize * page_size].to_vec()
                    }
                    _ => {
                        {
                            let state = self.shared.state.lock();
                            state.allocator.check_allocated(extent)?;
                        }
                        let base = self.shared.read_committed(page, count, self.snapshot)?;
                        ws.overlay_onto(extent, base, page_size)
                    }
                }
            }
            TxState::AsyncCommitPending { .. } => {
                return Err(TesseraError::ConcurrencyViolation("transaction already committed"))
            }
            TxState::Completed { .. } => {
                return Err(TesseraError::ConcurrencyViolation("transaction already completed"))
            }
        };
        Ok(PageRef {
            id: page,
            pages: count,
            data: Arc::from(data),
        })
    }

    /// Allocates `count` contiguous zeroed pages and returns the first.
    ///
    /// A count above one yields an overflow run, read and written through its first page.
    pub fn allocate_page(&mut self, count: u32) -> Result<PageNumber> {
        let id = self.id;
        let ws = write_state(&mut self.state)?;
        if count == 0 {
            return Err(TesseraError::Invalid("allocation of zero pages"));
        }
        let extent = {
            let mut state = self.shared.state.lock();
            state.promote();
            state.allocator.allocate(count as u64, &mut ws.delta)?
        };
        let page = extent.first();
        let (slot, mut buf) = self.shared.scratch.lock().reserve(page, count, id)?;
        buf.fill(0);
        ws.overlay.insert(
            page,
            DirtyPage {
                slot,
                pages: count,
                buf,
            },
        );
        trace!(tx = id.0, page = page.0, pages = count, "txn.allocate");
        Ok(page)
    }

    /// Returns a writable copy of `page`.
    pub fn modify_page(&mut self, page: PageNumber) -> Result<&mut [u8]> {
        self.modify_pages(page, 1)
    }

    /// Returns a writable copy of the `count` pages starting at `page`.
    ///
    /// The first call copies the visible image into a scratch region; later
    /// calls for the same pages, or pages inside an already dirty run, return
    /// that region. A range that straddles the edge of a dirty run is rejected.
    pub fn modify_pages(&mut self, page: PageNumber, count: u32) -> Result<&mut [u8]> {
        let id = self.id;
        let snapshot = self.snapshot;
        let page_size = self.shared.page_size as usize;
        let ws = write_state(&mut self.state)?;
        let extent = Extent::new(page, count as u64);
        let (start, skip) = match ws.containing(extent) {
            Some(found) if count > 0 => found,
            _ => {
                if count > 0 && ws.overlapping(extent).next().is_some() {
                    return Err(TesseraError::Invalid("range straddles a dirty page run"));
                }
                {
                    let state = self.shared.state.lock();
                    state.allocator.check_allocated(extent)?;
                }
                let base = self.shared.read_committed(page, count, snapshot)?;
                let (slot, mut buf) = self.shared.scratch.lock().reserve(page, count, id)?;
                buf.copy_from_slice(&base);
                ws.overlay.insert(
                    page,
                    DirtyPage {
                        slot,
                        pages: count,
                        buf,
                    },
                );
                trace!(tx = id.0, page = page.0, pages = count, "txn.modify");
                (page, 0)
            }
        };
        let dirty = ws
            .overlay
            .get_mut(&start)
            .ok_or(TesseraError::Corruption("dirty page vanished"))?;
        let from = skip * page_size;
        Ok(&mut dirty.buf[from..from + count as usize * page_size])
    }

    /// Frees one page.
    pub fn free_page(&mut self, page: PageNumber) -> Result<()> {
        self.free_pages(page, 1)
    }

    /// Frees the `count`-page run starting at `page`.
    ///
    /// The pages become reusable once this transaction is durable and no
    /// snapshot that could still read them remains.
    pub fn free_pages(&mut self, page: PageNumber, count: u32) -> Result<()> {
        let id = self.id;
        let ws = write_state(&mut self.state)?;
        let extent = Extent::new(page, count as u64);
        let doomed: Vec<PageNumber> = ws.overlapping(extent).map(|(start, _)| start).collect();
        for start in &doomed {
            let run = ws.overlay.get(start).map_or(0, |d| d.pages as u64);
            if start.0 < extent.start || start.0 + run > extent.end() {
                return Err(TesseraError::Invalid("range straddles a dirty page run"));
            }
        }
        {
            let mut state = self.shared.state.lock();
            if state.is_pinned(&extent) {
                return Err(TesseraError::ConcurrencyViolation(
                    "pages are pinned by an outstanding async commit",
                ));
            }
            state.allocator.free(id, extent, &mut ws.delta)?;
        }
        let mut scratch = self.shared.scratch.lock();
        for start in doomed {
            if let Some(dirty) = ws.overlay.remove(&start) {
                scratch.discard(dirty.slot, dirty.buf)?;
            }
        }
        drop(scratch);
        trace!(tx = id.0, page = page.0, pages = count, "txn.free");
        Ok(())
    }

    /// Commits and waits until the journal record is durable.
    ///
    /// Returns the committed id, or the snapshot id when nothing changed.
    pub fn commit(&mut self) -> Result<TxId> {
        let ws = match self.take_for_commit()? {
            Ready::Read(id) => return Ok(id),
            Ready::Write(ws) => ws,
        };
        match self.publish(ws, CommitMode::Sync)? {
            Published::Empty(guard) => {
                drop(guard);
                self.state = TxState::Completed {
                    committed: Some(self.snapshot),
                };
                Ok(self.snapshot)
            }
            Published::Queued { guard, ticket } => {
                let outcome = ticket.wait();
                drop(guard);
                self.state = TxState::Completed {
                    committed: outcome.is_ok().then_some(self.id),
                };
                outcome.map(|()| self.id)
            }
        }
    }

    /// Publishes the commit, queues its journal write and releases the write lock.
    ///
    /// Confirm with [`end_async_commit`](Self::end_async_commit); the next writer
    /// waits for this write before it can commit.
    pub fn commit_async(&mut self) -> Result<TxId> {
        let ws = match self.take_for_commit()? {
            Ready::Read(id) => return Ok(id),
            Ready::Write(ws) => ws,
        };
        match self.publish(ws, CommitMode::Async)? {
            Published::Empty(guard) => {
                drop(guard);
                self.state = TxState::Completed {
                    committed: Some(self.snapshot),
                };
                Ok(self.snapshot)
            }
            Published::Queued { guard, ticket } => {
                drop(guard);
                self.state = TxState::AsyncCommitPending { ticket };
                Ok(self.id)
            }
        }
    }

    /// Like [`commit_async`](Self::commit_async), handing the write lock straight
    /// to a new write transaction.
    pub fn begin_async_commit_and_start_new(&mut self) -> Result<Transaction> {
        write_state(&mut self.state)?;
        let ws = match self.take_for_commit()? {
            Ready::Write(ws) => ws,
            Ready::Read(_) => {
                return Err(TesseraError::ConcurrencyViolation(
                    "write operation on a read transaction",
                ))
            }
        };
        let guard = match self.publish(ws, CommitMode::Async)? {
            Published::Empty(guard) => {
                self.state = TxState::Completed {
                    committed: Some(self.snapshot),
                };
                guard
            }
            Published::Queued { guard, ticket } => {
                self.state = TxState::AsyncCommitPending { ticket };
                guard
            }
        };
        Ok(Transaction::write(Arc::clone(&self.shared), guard))
    }

    /// Waits for the async commit to become durable.
    ///
    /// A failed journal write is reported as the I/O error; the environment is
    /// poisoned by then.
    pub fn end_async_commit(&mut self) -> Result<TxId> {
        self.await_commit(None)
    }

    /// Like [`end_async_commit`](Self::end_async_commit), giving up with
    /// [`TesseraError::Cancelled`] once `cancel` fires. Cancelling leaves the
    /// commit pending, so the call can be repeated.
    pub fn end_async_commit_cancellable(&mut self, cancel: &CancellationToken) -> Result<TxId> {
        self.await_commit(Some(cancel))
    }

    fn await_commit(&mut self, cancel: Option<&CancellationToken>) -> Result<TxId> {
        let ticket = match &self.state {
            TxState::AsyncCommitPending { ticket } => ticket.clone(),
            TxState::Completed {
                committed: Some(id),
            } => return Ok(*id),
            TxState::Completed { committed: None } => {
                return Err(TesseraError::ConcurrencyViolation(
                    "transaction was rolled back",
                ))
            }
            TxState::ReadOnly { .. } | TxState::Write(_) => {
                return Err(TesseraError::ConcurrencyViolation("no async commit to await"))
            }
        };
        let outcome = match cancel {
            Some(token) => ticket.wait_cancellable(token),
            None => ticket.wait(),
        };
        if matches!(outcome, Err(TesseraError::Cancelled)) {
            debug!(tx = self.id.0, "txn.end_async_commit.cancelled");
            return Err(TesseraError::Cancelled);
        }
        self.state = TxState::Completed {
            committed: outcome.is_ok().then_some(self.id),
        };
        outcome.map(|()| self.id)
    }

    /// Discards the transaction's changes and releases everything it holds.
    pub fn rollback(&mut self) -> Result<()> {
        match mem::replace(&mut self.state, TxState::Completed { committed: None }) {
            TxState::Write(ws) => {
                self.abandon(*ws);
                Ok(())
            }
            TxState::ReadOnly { reader } => {
                self.shared.state.lock().readers.release(reader);
                Ok(())
            }
            other @ TxState::AsyncCommitPending { .. } => {
                self.state = other;
                Err(TesseraError::ConcurrencyViolation(
                    "commit already queued; await it with end_async_commit",
                ))
            }
            other @ TxState::Completed { .. } => {
                self.state = other;
                Err(TesseraError::ConcurrencyViolation("transaction already completed"))
            }
        }
    }

    fn take_for_commit(&mut self) -> Result<Ready> {
        match mem::replace(&mut self.state, TxState::Completed { committed: None }) {
            TxState::Write(ws) => Ok(Ready::Write(ws)),
            TxState::ReadOnly { reader } => {
                self.shared.state.lock().readers.release(reader);
                self.state = TxState::Completed {
                    committed: Some(self.snapshot),
                };
                Ok(Ready::Read(self.snapshot))
            }
            other @ TxState::AsyncCommitPending { .. } => {
                self.state = other;
                Err(TesseraError::ConcurrencyViolation("transaction already committed"))
            }
            other @ TxState::Completed { .. } => {
                self.state = other;
                Err(TesseraError::ConcurrencyViolation("transaction already completed"))
            }
        }
    }

    /// Makes the transaction visible to later writers and queues its journal record.
    fn publish(&mut self, mut ws: Box<WriteState>, mode: CommitMode) -> Result<Published> {
        let id = self.id;
        if let Some(dependency) = ws.depends_on.take() {
            if let Err(err) = dependency.wait() {
                let predecessor = dependency.tx();
                self.abandon(*ws);
                let reason = format!(
                    "transaction {id} rolled back: async commit of transaction {predecessor} failed: {err}"
                );
                self.shared.poison(reason.clone());
                return Err(TesseraError::StorageFatal(reason));
            }
        }
        if let Err(err) = self.shared.check_poison() {
            self.abandon(*ws);
            return Err(err);
        }
        if ws.overlay.is_empty() && ws.delta.is_empty() {
            let WriteState { guard, reader, .. } = *ws;
            self.shared.state.lock().readers.release(reader);
            debug!(tx = id.0, "txn.commit.empty");
            return Ok(Published::Empty(guard));
        }

        let pin = matches!(mode, CommitMode::Async);
        let WriteState {
            guard,
            reader,
            overlay,
            delta,
            ..
        } = *ws;
        let sealed = {
            let mut scratch = self.shared.scratch.lock();
            let mut sealed = Vec::with_capacity(overlay.len());
            let mut failure = None;
            for (page, dirty) in overlay {
                if failure.is_some() {
                    if let Err(err) = scratch.discard(dirty.slot, dirty.buf) {
                        warn!(tx = id.0, error = %err, "txn.commit.release_failed");
                    }
                    continue;
                }
                let image: Arc<[u8]> = Arc::from(&dirty.buf[..]);
                let result = scratch.seal(dirty.slot, dirty.buf).and_then(|()| {
                    if pin {
                        scratch.acquire(dirty.slot)?;
                    }
                    Ok(())
                });
                match result {
                    Ok(()) => sealed.push((page, dirty.slot, dirty.pages, image)),
                    Err(err) => {
                        release_logged(&mut scratch, dirty.slot, id);
                        failure = Some(err);
                    }
                }
            }
            if let Some(err) = failure {
                for (_, slot, _, _) in &sealed {
                    release_logged(&mut scratch, *slot, id);
                    if pin {
                        release_logged(&mut scratch, *slot, id);
                    }
                }
                drop(scratch);
                self.shared.state.lock().readers.release(reader);
                let reason = format!("sealing transaction {id} failed: {err}");
                self.shared.poison(reason.clone());
                return Err(TesseraError::StorageFatal(reason));
            }
            sealed
        };

        let mut pages = Vec::with_capacity(sealed.len());
        let next_page = {
            let mut state = self.shared.state.lock();
            let mut table = self.shared.pages.write();
            for (page, slot, run, _) in &sealed {
                table.insert(
                    *page,
                    PageVersion {
                        tx: id,
                        slot: *slot,
                        pages: *run,
                    },
                );
            }
            drop(table);
            state.last_committed = id;
            state.deltas.insert(id, delta.clone());
            state.readers.release(reader);
            if pin {
                state.pinned = Some(AsyncPin {
                    tx: id,
                    runs: sealed
                        .iter()
                        .map(|(page, _, run, _)| Extent::new(*page, *run as u64))
                        .collect(),
                    slots: sealed.iter().map(|(_, slot, _, _)| *slot).collect(),
                });
            }
            state.allocator.next_page()
        };
        self.shared.publish_high_water(next_page);
        for (page, _, run, data) in sealed {
            pages.push(JournalPage {
                page,
                pages: run,
                data,
            });
        }
        let record = JournalRecord {
            tx: id,
            delta,
            pages,
        };
        debug!(
            tx = id.0,
            pages = record.page_count(),
            async_commit = pin,
            "env.commit.published"
        );
        let ticket = self.shared.committer.enqueue(record);
        if pin {
            self.shared.state.lock().outstanding = Some(ticket.clone());
        }
        Ok(Published::Queued { guard, ticket })
    }

    fn abandon(&self, ws: WriteState) {
        let WriteState {
            guard,
            reader,
            overlay,
            alloc_base,
            ..
        } = ws;
        {
            let mut state = self.shared.state.lock();
            state.allocator.restore(alloc_base);
            state.readers.release(reader);
            state.promote();
        }
        let mut scratch = self.shared.scratch.lock();
        for dirty in overlay.into_values() {
            if let Err(err) = scratch.discard(dirty.slot, dirty.buf) {
                warn!(tx = self.id.0, error = %err, "txn.rollback.release_failed");
            }
        }
        drop(scratch);
        drop(guard);
        debug!(tx = self.id.0, "txn.rollback");
    }

    /// Page size of the owning environment.
    pub fn page_size(&self) -> u32 {
        self.shared.page_size
    }
}

fn release_logged(scratch: &mut ScratchPool, slot: SlotId, tx: TxId) {
    if let Err(err) = scratch.release(slot) {
        warn!(tx = tx.0, error = %err, "txn.commit.release_failed");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        match mem::replace(&mut self.state, TxState::Completed { committed: None }) {
            TxState::Write(ws) => self.abandon(*ws),
            TxState::ReadOnly { reader } => self.shared.state.lock().readers.release(reader),
            TxState::AsyncCommitPending { ticket } => {
                if let Err(err) = ticket.wait() {
                    warn!(tx = self.id.0, error = %err, "txn.drop.async_commit_failed");
                }
            }
            TxState::Completed { .. } => {}
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            TxState::ReadOnly { .. } => "read_only",
            TxState::Write(_) => "write",
            TxState::AsyncCommitPending { .. } => "async_commit_pending",
            TxState::Completed { .. } => "completed",
        };
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot)
            .field("mode", &self.mode)
            .field("state", &state)
            .finish()
    }
}
