#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crossbeam_channel::Sender;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::primitives::alloc::{AllocDelta, AllocLimits, Extent, PageAllocator};
use crate::primitives::concurrency::{ReaderRegistry, WriteLock};
use crate::primitives::io::{read_or_zero, FileIo, IoProvider, StdIoProvider};
use crate::primitives::journal::{
    CommitTicket, CompletionHook, Journal, JournalCommitter, JournalOptions,
};
use crate::primitives::scratch::{PageTable, ScratchPool, SlotId};
use crate::types::{page, PageNumber, Result, TesseraError, TxId};

use super::flush::{FlushManager, FlushReport, FlushSignal, FlushState};
use super::header::{sibling, EnvHeader, HeaderStore};
use super::options::{EnvOptions, WriteOptions};
use super::stats::EnvStats;
use super::txn::{Transaction, TxMode};

/// Pages and scratch slots held by the outstanding async commit.
pub(crate) struct AsyncPin {
    pub tx: TxId,
    pub runs: Vec<Extent>,
    pub slots: Vec<SlotId>,
}

/// Mutable environment state, guarded by [`EnvShared::state`].
///
/// Lock order: `state`, then `pages`, then `scratch`, then the data cache.
pub(crate) struct EnvState {
    pub allocator: PageAllocator,
    pub readers: ReaderRegistry,
    pub last_committed: TxId,
    pub last_durable: TxId,
    pub last_flushed: TxId,
    /// Allocator deltas of committed transactions not yet in the data file.
    pub deltas: BTreeMap<TxId, AllocDelta>,
    pub outstanding: Option<CommitTicket>,
    pub pinned: Option<AsyncPin>,
}

impl EnvState {
    /// Promotes pending frees that no snapshot can still observe.
    ///
    /// With no snapshot registered the newest committed id stands in for the
    /// oldest one, so `reclaim_lag` still counts epochs on an idle environment.
    pub fn promote(&mut self) {
        let horizon = self.readers.oldest().unwrap_or(self.last_committed);
        let durable = self.last_durable;
        if let Err(err) = self.allocator.promote(Some(horizon), durable) {
            warn!(error = %err, "env.promote.failed");
        }
    }

    /// Returns true when `extent` overlaps a run dirtied by the outstanding async commit.
    pub fn is_pinned(&self, extent: &Extent) -> bool {
        self.pinned
            .as_ref()
            .is_some_and(|pin| pin.runs.iter().any(|run| run.overlaps(extent)))
    }
}

/// State shared by the environment handle, its transactions, the journal
/// completion hook and the flush thread.
pub(crate) struct EnvShared {
    pub path: PathBuf,
    pub options: EnvOptions,
    pub page_size: u32,
    pub env_id: u64,
    pub data: Arc<dyn FileIo>,
    pub write_lock: WriteLock,
    pub state: Mutex<EnvState>,
    pub pages: RwLock<PageTable>,
    pub scratch: Mutex<ScratchPool>,
    pub committer: JournalCommitter,
    pub flush: Mutex<FlushState>,
    cache: Option<Mutex<LruCache<PageNumber, Arc<[u8]>>>>,
    high_water: AtomicU64,
    poisoned: AtomicBool,
    poison_reason: Mutex<Option<String>>,
    flush_requests: Option<Sender<FlushSignal>>,
}

impl EnvShared {
    pub fn poison(&self, reason: String) {
        let mut slot = self.poison_reason.lock();
        if slot.is_none() {
            error!(reason = %reason, "env.poisoned");
            *slot = Some(reason);
        }
        self.poisoned.store(true, Ordering::SeqCst);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    pub fn poison_reason(&self) -> Option<String> {
        self.poison_reason.lock().clone()
    }

    pub fn check_poison(&self) -> Result<()> {
        if !self.is_poisoned() {
            return Ok(());
        }
        let reason = self
            .poison_reason()
            .unwrap_or_else(|| "environment poisoned".to_owned());
        Err(TesseraError::StorageFatal(reason))
    }

    /// Raises the published page bound after a commit.
    pub fn publish_high_water(&self, next_page: PageNumber) {
        self.high_water.fetch_max(next_page.0, Ordering::AcqRel);
    }

    /// Rejects page 0 and runs that reach past every published allocation.
    pub fn check_readable(&self, page: PageNumber, pages: u32) -> Result<()> {
        if pages == 0 {
            return Err(TesseraError::Invalid("empty page run"));
        }
        if page < page::FIRST_DATA_PAGE {
            return Err(TesseraError::Invalid("page 0 is reserved"));
        }
        let end = page
            .0
            .checked_add(pages as u64)
            .ok_or(TesseraError::Invalid("page run overflow"))?;
        if end > self.high_water.load(Ordering::Acquire) {
            return Err(TesseraError::Invalid("page out of allocated range"));
        }
        Ok(())
    }

    /// Image of `pages` pages at `page` as seen by `snapshot`, ignoring any overlay.
    ///
    /// Each page comes from the newest unflushed version holding it, keyed at
    /// that page or inside an overflow run; the rest come from the data file.
    pub fn read_committed(&self, page: PageNumber, pages: u32, snapshot: TxId) -> Result<Vec<u8>> {
        let page_size = self.page_size as usize;
        let mut image = vec![0u8; pages as usize * page_size];
        let mut missing = Vec::new();
        {
            // Slots stay alive while the table read lock is held.
            let table = self.pages.read();
            let scratch = self.scratch.lock();
            for index in 0..pages {
                let at = PageNumber(page.0 + index as u64);
                match table.resolve(at, snapshot) {
                    Some((version, skip)) => {
                        let from = index as usize * page_size;
                        image[from..from + page_size]
                            .copy_from_slice(scratch.view(version.slot, skip, 1)?);
                    }
                    None => missing.push(index as usize),
                }
            }
        }
        if !missing.is_empty() {
            let flushed = self.read_data_file(page, pages)?;
            for index in missing {
                let from = index * page_size;
                image[from..from + page_size].copy_from_slice(&flushed[from..from + page_size]);
            }
        }
        Ok(image)
    }

    /// Reads flushed content, consulting the clean-page cache for single pages.
    pub fn read_data_file(&self, page: PageNumber, pages: u32) -> Result<Arc<[u8]>> {
        if pages == 1 {
            if let Some(cache) = &self.cache {
                if let Some(hit) = cache.lock().get(&page) {
                    return Ok(Arc::clone(hit));
                }
            }
        }
        let range = page::run_range(page, pages, self.page_size)?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        read_or_zero(self.data.as_ref(), range.start, &mut buf)?;
        let data: Arc<[u8]> = Arc::from(buf);
        if pages == 1 {
            if let Some(cache) = &self.cache {
                cache.lock().put(page, Arc::clone(&data));
            }
        }
        Ok(data)
    }

    pub fn invalidate_cached(&self, page: PageNumber, pages: u32) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            for offset in 0..pages as u64 {
                cache.pop(&PageNumber(page.0 + offset));
            }
        }
    }

    pub fn begin_read(self: &Arc<Self>) -> Transaction {
        let mut state = self.state.lock();
        let snapshot = state.last_durable;
        let reader = state.readers.register(snapshot, Instant::now());
        drop(state);
        debug!(snapshot = snapshot.0, "env.begin_read");
        Transaction::read(Arc::clone(self), reader)
    }

    pub fn begin_write(self: &Arc<Self>, opts: &WriteOptions) -> Result<Transaction> {
        self.check_poison()?;
        let timeout = opts.timeout.or_else(|| self.options.write_lock_timeout());
        let guard = self.write_lock.acquire(timeout, opts.cancel.as_ref())?;
        self.check_poison()?;
        Ok(Transaction::write(Arc::clone(self), guard))
    }

    /// Runs once the journal write of `tx` has succeeded or failed, before its waiters wake.
    fn on_journal_complete(&self, tx: TxId, outcome: &Result<()>) {
        match outcome {
            Ok(()) => {
                let mut state = self.state.lock();
                if tx > state.last_durable {
                    state.last_durable = tx;
                }
                if state.outstanding.as_ref().is_some_and(|t| t.tx() == tx) {
                    state.outstanding = None;
                }
                let pin = take_pin(&mut state, tx);
                state.promote();
                drop(state);
                if let Some(pin) = pin {
                    let mut scratch = self.scratch.lock();
                    for slot in pin.slots {
                        if let Err(err) = scratch.release(slot) {
                            warn!(tx = tx.0, error = %err, "env.unpin.failed");
                        }
                    }
                }
                debug!(tx = tx.0, "env.commit.durable");
                self.maybe_request_flush();
            }
            Err(err) => {
                self.poison(format!("journal write for transaction {tx} failed: {err}"));
                let mut state = self.state.lock();
                if state.outstanding.as_ref().is_some_and(|t| t.tx() == tx) {
                    state.outstanding = None;
                }
                let pin = take_pin(&mut state, tx);
                state.deltas.remove(&tx);
                if tx <= state.last_committed {
                    state.last_committed = tx.prev();
                }
                if let Err(err) = state.allocator.forget_pending(tx) {
                    warn!(tx = tx.0, error = %err, "env.forget_pending.failed");
                }
                let mut table = self.pages.write();
                let mut slots = table.remove_tx(tx);
                drop(table);
                drop(state);
                if let Some(pin) = pin {
                    slots.extend(pin.slots);
                }
                let mut scratch = self.scratch.lock();
                for slot in slots {
                    if let Err(err) = scratch.release(slot) {
                        warn!(tx = tx.0, error = %err, "env.commit_failed.release_failed");
                    }
                }
            }
        }
    }

    fn maybe_request_flush(&self) {
        let Some(sender) = &self.flush_requests else {
            return;
        };
        let unflushed = self.pages.read().len() as u64;
        if unflushed >= self.options.flush_dirty_pages_threshold {
            // A full channel already carries a pending request.
            let _ = sender.try_send(FlushSignal::Requested);
        }
    }

    pub fn has_unflushed(&self) -> bool {
        let state = self.state.lock();
        state.last_durable > state.last_flushed
    }

    pub fn outstanding_ticket(&self) -> Option<CommitTicket> {
        self.state.lock().outstanding.clone()
    }

    fn stats(&self) -> EnvStats {
        let state = self.state.lock();
        let table = self.pages.read();
        let scratch = self.scratch.lock();
        let stats = EnvStats {
            page_size: self.page_size,
            last_committed_tx: state.last_committed.0,
            last_durable_tx: state.last_durable.0,
            last_flushed_tx: state.last_flushed.0,
            next_page: state.allocator.next_page().0,
            file_pages: state.allocator.file_pages(),
            free_pages: state.allocator.free_pages(),
            pending_free_pages: state.allocator.pending_pages(),
            readers: state.readers.snapshot(Instant::now()),
            unflushed_versions: table.len(),
            unflushed_pages: table.page_count(),
            async_commit_pending: state.outstanding.as_ref().is_some_and(|t| !t.is_complete()),
            flushes: 0,
            scratch: scratch.stats(),
            journal: self.committer.journal().stats(),
            write_lock: self.write_lock.snapshot(),
            poisoned: self.poison_reason(),
        };
        drop(scratch);
        drop(table);
        drop(state);
        EnvStats {
            flushes: self.flush.lock().flushes,
            ..stats
        }
    }
}

/// Journal directory used by the environment whose data file is `path`.
pub fn journal_dir_for(path: impl AsRef<Path>) -> PathBuf {
    sibling(path.as_ref(), "-journal")
}

fn take_pin(state: &mut EnvState, tx: TxId) -> Option<AsyncPin> {
    if state.pinned.as_ref().is_some_and(|pin| pin.tx == tx) {
        state.pinned.take()
    } else {
        None
    }
}

/// An open storage environment.
///
/// Owns the write lock, the transaction id counter, the snapshot registry and
/// the allocator, scratch pool and journal they coordinate. Any number of read
/// transactions may run alongside one write transaction.
pub struct Environment {
    shared: Arc<EnvShared>,
    flusher: Option<FlushManager>,
}

impl Environment {
    /// Opens or creates the environment at `path`, replaying its journal.
    pub fn open(path: impl AsRef<Path>, options: EnvOptions) -> Result<Self> {
        Self::open_with_provider(path, options, Arc::new(StdIoProvider))
    }

    /// Like [`open`](Self::open), reaching every file through `provider`.
    pub fn open_with_provider(
        path: impl AsRef<Path>,
        options: EnvOptions,
        provider: Arc<dyn IoProvider>,
    ) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let page_size = options.page_size;
        let data = provider.open(&path)?;
        let (mut headers, existing) = HeaderStore::open(&path, provider.as_ref())?;
        let mut header = match existing {
            Some(header) => {
                if header.page_size != page_size {
                    return Err(TesseraError::Invalid(
                        "page size does not match the environment",
                    ));
                }
                let mut identity = vec![0u8; page::identity::ENV_ID.end];
                data.read_at(0, &mut identity)?;
                let (stored_size, env_id) = page::decode_identity(&identity)?;
                if stored_size != page_size || env_id != header.env_id {
                    return Err(TesseraError::Corruption(
                        "data file identity does not match its header",
                    ));
                }
                header
            }
            None => {
                if !data.is_empty()? {
                    return Err(TesseraError::Corruption(
                        "data file exists without a valid header",
                    ));
                }
                let env_id: u64 = rand::random();
                data.write_at(0, &page::encode_identity(page_size, env_id))?;
                data.sync_all()?;
                let mut header = EnvHeader {
                    page_size,
                    env_id,
                    sequence: 0,
                    last_flushed: TxId(0),
                    next_page: page::FIRST_DATA_PAGE.0,
                    file_pages: page::FIRST_DATA_PAGE.0,
                    journal_next_file: 1,
                    free: Vec::new(),
                };
                headers.write(&mut header)?;
                info!(path = %path.display(), page_size, env_id, "env.create");
                header
            }
        };

        let journal_dir = journal_dir_for(&path);
        let journal_options = JournalOptions {
            page_size,
            size_limit: options.journal_size_limit,
            compression: options.journal_compression,
            env_id: header.env_id,
        };
        let recovered =
            Journal::recover(&journal_dir, provider.as_ref(), &journal_options, header.last_flushed)?;
        let limits = AllocLimits {
            max_pages: options.max_pages(),
            growth: options.growth,
            reclaim_lag: options.reclaim_lag,
        };
        let mut image = PageAllocator::new(
            header.next_page,
            header.file_pages,
            header.free.iter().copied().collect(),
            limits,
        );
        let first_file = recovered.next_file_number.max(header.journal_next_file);
        if let Some(last) = recovered.records.last().map(|r| r.tx) {
            for record in &recovered.records {
                image.apply_delta(&record.delta)?;
                for written in &record.pages {
                    data.write_at(page::page_offset(written.page, page_size)?, &written.data)?;
                }
            }
            let target = page::page_offset(PageNumber(image.file_pages()), page_size)?;
            if data.len()? < target {
                data.set_len(target)?;
            }
            data.sync_all()?;
            header.last_flushed = last;
            header.next_page = image.next_page().0;
            header.file_pages = image.file_pages();
            header.free = image.free_extents();
            header.journal_next_file = first_file;
            headers.write(&mut header)?;
            info!(
                records = recovered.records.len(),
                last_tx = last.0,
                "env.recover.applied"
            );
        }
        let journal = Arc::new(Journal::create(
            &journal_dir,
            Arc::clone(&provider),
            journal_options,
            first_file,
        )?);

        let live = PageAllocator::new(
            image.next_page().0,
            image.file_pages(),
            image.free_extents().into_iter().collect(),
            limits,
        );
        let last_flushed = header.last_flushed;
        let high_water = image.next_page().0;
        let cache = NonZeroUsize::new(options.data_cache_pages).map(|n| Mutex::new(LruCache::new(n)));
        let channel = (!options.manual_flushing).then(|| crossbeam_channel::bounded(1));
        let flush_requests = channel.as_ref().map(|(tx, _)| tx.clone());
        let commit_config = options.commit();
        let scratch = ScratchPool::new(options.scratch(), page_size);
        let env_id = header.env_id;
        let flush_state = FlushState::new(image, headers, header);

        let shared = Arc::new_cyclic(|weak: &Weak<EnvShared>| {
            let hook: CompletionHook = {
                let weak = weak.clone();
                Arc::new(move |tx, outcome| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_journal_complete(tx, outcome);
                    }
                })
            };
            EnvShared {
                path: path.clone(),
                options,
                page_size,
                env_id,
                data,
                write_lock: WriteLock::new(),
                state: Mutex::new(EnvState {
                    allocator: live,
                    readers: ReaderRegistry::new(),
                    last_committed: last_flushed,
                    last_durable: last_flushed,
                    last_flushed,
                    deltas: BTreeMap::new(),
                    outstanding: None,
                    pinned: None,
                }),
                pages: RwLock::new(PageTable::new()),
                scratch: Mutex::new(scratch),
                committer: JournalCommitter::new(journal, commit_config, Some(hook)),
                flush: Mutex::new(flush_state),
                cache,
                high_water: AtomicU64::new(high_water),
                poisoned: AtomicBool::new(false),
                poison_reason: Mutex::new(None),
                flush_requests,
            }
        });

        let flusher = match channel {
            Some((sender, receiver)) => Some(FlushManager::spawn(
                Arc::downgrade(&shared),
                sender,
                receiver,
                shared.options.flush_interval_ms,
            )?),
            None => None,
        };
        info!(
            path = %path.display(),
            last_tx = last_flushed.0,
            manual_flushing = flusher.is_none(),
            "env.open"
        );
        Ok(Self { shared, flusher })
    }

    /// Starts a transaction of the given mode; writers use the default lock bound.
    pub fn begin_transaction(&self, mode: TxMode) -> Result<Transaction> {
        match mode {
            TxMode::Read => self.begin_read(),
            TxMode::Write => self.begin_write(),
        }
    }

    /// Starts a read transaction at the newest durable snapshot.
    pub fn begin_read(&self) -> Result<Transaction> {
        Ok(self.shared.begin_read())
    }

    /// Starts a write transaction, waiting for the write lock per
    /// [`EnvOptions::write_lock_timeout_ms`].
    pub fn begin_write(&self) -> Result<Transaction> {
        self.shared.begin_write(&WriteOptions::default())
    }

    /// Starts a write transaction with per-call lock wait overrides.
    pub fn begin_write_with(&self, opts: WriteOptions) -> Result<Transaction> {
        self.shared.begin_write(&opts)
    }

    /// Installs every flushable page version in the data file and retires the
    /// journal behind it. Waits for a concurrent flush instead of skipping.
    pub fn flush_log_to_data_file(&self) -> Result<FlushReport> {
        self.shared.flush(true).map(|report| report.unwrap_or_default())
    }

    /// Nudges the background flush thread; a no-op with manual flushing.
    pub fn request_flush(&self) {
        if let Some(sender) = &self.shared.flush_requests {
            let _ = sender.try_send(FlushSignal::Requested);
        }
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> EnvStats {
        self.shared.stats()
    }

    /// Scratch slot holding the newest unflushed version of `page`, if any.
    pub fn unflushed_slot(&self, page: PageNumber) -> Option<SlotId> {
        self.shared
            .pages
            .read()
            .lookup(page, TxId(u64::MAX))
            .map(|version| version.slot)
    }

    /// Outstanding references on a scratch slot; zero once released.
    pub fn scratch_ref_count(&self, slot: SlotId) -> u32 {
        self.shared.scratch.lock().ref_count(slot)
    }

    /// Reads `page` straight from the data file, bypassing versions and cache.
    pub fn read_flushed_page(&self, page: PageNumber) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.shared.page_size as usize];
        let offset = page::page_offset(page, self.shared.page_size)?;
        read_or_zero(self.shared.data.as_ref(), offset, &mut buf)?;
        Ok(buf)
    }

    /// Returns true once an I/O failure stopped the environment accepting writers.
    pub fn is_poisoned(&self) -> bool {
        self.shared.is_poisoned()
    }

    /// Why the environment was poisoned.
    pub fn poison_reason(&self) -> Option<String> {
        self.shared.poison_reason()
    }

    /// Options in effect.
    pub fn options(&self) -> &EnvOptions {
        &self.shared.options
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.shared.page_size
    }

    /// Environment id stamped on the data file, headers and journal files.
    pub fn env_id(&self) -> u64 {
        self.shared.env_id
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Directory holding the journal files.
    pub fn journal_dir(&self) -> PathBuf {
        self.shared.committer.journal().dir().to_path_buf()
    }

    /// Waits for the outstanding async commit and stops the flush thread.
    ///
    /// Unflushed versions stay in the journal and are replayed on the next open.
    pub fn close(mut self) -> Result<()> {
        if let Some(flusher) = self.flusher.take() {
            flusher.shutdown();
        }
        match self.shared.outstanding_ticket() {
            Some(ticket) => ticket.wait(),
            None => Ok(()),
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.take() {
            flusher.shutdown();
        }
        if let Some(ticket) = self.shared.outstanding_ticket() {
            if let Err(err) = ticket.wait() {
                warn!(tx = ticket.tx().0, error = %err, "env.drop.async_commit_failed");
            }
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.shared.path)
            .field("page_size", &self.shared.page_size)
            .finish_non_exhaustive()
    }
}
