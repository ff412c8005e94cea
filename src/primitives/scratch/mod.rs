#![forbid(unsafe_code)]

//! Scratch buffer pool.
//!
//! Dirty pages live in reference-counted slots carved out of scratch files
//! until the flush manager has installed them in the data file. A scratch file
//! is an in-memory arena; slots are regions split off it and joined back on
//! release. Scratch files are not durable; the pool starts empty on every open.

use std::collections::BTreeMap;

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::primitives::alloc::{Extent, ExtentMap};
use crate::types::{PageNumber, Result, TesseraError, TxId};

mod page_table;

pub use page_table::{PageTable, PageVersion};

/// Location of a slot: scratch file id plus page offset inside that file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct SlotId {
    /// Scratch file id.
    pub file: u32,
    /// First page of the slot inside the file.
    pub offset: u64,
}

/// Sizing knobs for the scratch pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScratchOptions {
    /// Capacity of the first scratch file, in pages.
    pub initial_file_pages: u64,
    /// Largest capacity a new scratch file grows to, in pages.
    pub max_file_pages: u64,
    /// Number of fully released files kept for reuse.
    pub recycle_limit: usize,
}

impl Default for ScratchOptions {
    fn default() -> Self {
        Self {
            initial_file_pages: 64,
            max_file_pages: 16 * 1024,
            recycle_limit: 4,
        }
    }
}

/// Counters describing the pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScratchStats {
    /// Scratch files currently serving slots.
    pub active_files: usize,
    /// Empty files parked for reuse.
    pub recycled_files: usize,
    /// Total capacity of active files in pages.
    pub capacity_pages: u64,
    /// Pages held by live slots.
    pub used_pages: u64,
    /// Live slots.
    pub live_slots: usize,
    /// Bytes held by scratch arenas, recycled files included.
    pub arena_bytes: u64,
    /// Files created since open.
    pub files_created: u64,
    /// Files taken back out of the recycle list.
    pub files_reused: u64,
}

#[derive(Debug)]
struct Slot {
    page: PageNumber,
    pages: u32,
    tx: TxId,
    refs: u32,
    /// Sealed contents; `None` while the region is checked out to a writer.
    buf: Option<BytesMut>,
}

#[derive(Debug)]
struct ScratchFile {
    id: u32,
    capacity: u64,
    free: ExtentMap,
    /// Arena bytes of every free extent, keyed by the extent's first page.
    spare: BTreeMap<u64, BytesMut>,
    slots: FxHashMap<u64, Slot>,
}

impl ScratchFile {
    fn with_capacity(id: u32, capacity: u64, page_size: usize) -> Self {
        let mut free = ExtentMap::new();
        // A fresh map cannot overlap.
        let _ = free.insert(Extent {
            start: 0,
            len: capacity,
        });
        let mut spare = BTreeMap::new();
        spare.insert(0, BytesMut::zeroed(capacity as usize * page_size));
        Self {
            id,
            capacity,
            free,
            spare,
            slots: FxHashMap::default(),
        }
    }

    fn used_pages(&self) -> u64 {
        self.capacity - self.free.total_pages()
    }

    /// Splits the bytes of `extent` out of the spare piece holding them.
    fn carve(&mut self, extent: Extent, page_size: usize) -> Result<BytesMut> {
        let host = self
            .spare
            .range(..=extent.start)
            .next_back()
            .map(|(start, _)| *start)
            .ok_or(TesseraError::Corruption("scratch arena out of step"))?;
        let mut piece = self
            .spare
            .remove(&host)
            .ok_or(TesseraError::Corruption("scratch arena out of step"))?;
        let head = (extent.start - host) as usize * page_size;
        let want = extent.len as usize * page_size;
        if piece.len() < head + want {
            self.spare.insert(host, piece);
            return Err(TesseraError::Corruption("scratch arena out of step"));
        }
        let mut region = piece.split_off(head);
        let tail = region.split_off(want);
        if !piece.is_empty() {
            self.spare.insert(host, piece);
        }
        if !tail.is_empty() {
            self.spare.insert(extent.end(), tail);
        }
        Ok(region)
    }

    /// Returns a region to the spare pieces, joining it with its neighbours.
    fn give_back(&mut self, mut start: u64, mut region: BytesMut, page_size: usize) {
        let end = start + (region.len() / page_size) as u64;
        let left = self
            .spare
            .range(..start)
            .next_back()
            .filter(|(at, piece)| **at + (piece.len() / page_size) as u64 == start)
            .map(|(at, _)| *at);
        if let Some(at) = left {
            if let Some(mut joined) = self.spare.remove(&at) {
                joined.unsplit(region);
                region = joined;
                start = at;
            }
        }
        if let Some(right) = self.spare.remove(&end) {
            region.unsplit(right);
        }
        self.spare.insert(start, region);
    }

    fn arena_bytes(&self) -> u64 {
        let spare: usize = self.spare.values().map(BytesMut::len).sum();
        let sealed: usize = self
            .slots
            .values()
            .filter_map(|slot| slot.buf.as_ref())
            .map(BytesMut::len)
            .sum();
        (spare + sealed) as u64
    }
}

/// Pool of scratch files handing out reference-counted slots.
///
/// Each file is one contiguous arena. [`reserve`](ScratchPool::reserve) splits a
/// region off it for the writer to fill; [`seal`](ScratchPool::seal) stores the
/// region back as the committed image, and the last
/// [`release`](ScratchPool::release) joins it with the free space around it so
/// the same bytes serve later slots.
#[derive(Debug)]
pub struct ScratchPool {
    options: ScratchOptions,
    page_size: usize,
    files: BTreeMap<u32, ScratchFile>,
    recycled: Vec<ScratchFile>,
    next_file_id: u32,
    next_capacity: u64,
    files_created: u64,
    files_reused: u64,
}

impl ScratchPool {
    /// Creates an empty pool for pages of `page_size` bytes.
    pub fn new(options: ScratchOptions, page_size: u32) -> Self {
        Self {
            options,
            page_size: page_size as usize,
            files: BTreeMap::new(),
            recycled: Vec::new(),
            next_file_id: 0,
            next_capacity: options.initial_file_pages.max(1),
            files_created: 0,
            files_reused: 0,
        }
    }

    /// Reserves a slot for `pages` pages of `page`, owned by `tx`, with one reference.
    ///
    /// Returns the slot's region of the arena. It holds whatever the region last
    /// carried; the caller overwrites it and hands it to [`seal`](Self::seal) or
    /// [`discard`](Self::discard).
    pub fn reserve(&mut self, page: PageNumber, pages: u32, tx: TxId) -> Result<(SlotId, BytesMut)> {
        if pages == 0 {
            return Err(TesseraError::Invalid("scratch slot of zero pages"));
        }
        let wanted = pages as u64;
        let mut chosen = None;
        for file in self.files.values_mut() {
            if let Some(extent) = file.free.take_best_fit(wanted) {
                chosen = Some((file.id, extent));
                break;
            }
        }
        let (file_id, extent) = match chosen {
            Some(found) => found,
            None => {
                let id = self.open_file(wanted);
                let file = self
                    .files
                    .get_mut(&id)
                    .ok_or(TesseraError::Corruption("scratch file vanished"))?;
                let extent = file
                    .free
                    .take_best_fit(wanted)
                    .ok_or(TesseraError::Corruption("new scratch file too small"))?;
                (id, extent)
            }
        };
        let page_size = self.page_size;
        let file = self
            .files
            .get_mut(&file_id)
            .ok_or(TesseraError::Corruption("scratch file vanished"))?;
        let region = file.carve(extent, page_size)?;
        file.slots.insert(
            extent.start,
            Slot {
                page,
                pages,
                tx,
                refs: 1,
                buf: None,
            },
        );
        Ok((
            SlotId {
                file: file_id,
                offset: extent.start,
            },
            region,
        ))
    }

    fn open_file(&mut self, min_pages: u64) -> u32 {
        if let Some(pos) = self.recycled.iter().position(|f| f.capacity >= min_pages) {
            let file = self.recycled.swap_remove(pos);
            let id = file.id;
            self.files_reused += 1;
            tracing::debug!(file = id, capacity = file.capacity, "scratch.file.reuse");
            self.files.insert(id, file);
            return id;
        }
        let capacity = self.next_capacity.max(min_pages);
        self.next_capacity = self
            .next_capacity
            .saturating_mul(2)
            .min(self.options.max_file_pages.max(1));
        let id = self.next_file_id;
        self.next_file_id += 1;
        self.files_created += 1;
        tracing::debug!(file = id, capacity, "scratch.file.create");
        self.files
            .insert(id, ScratchFile::with_capacity(id, capacity, self.page_size));
        id
    }

    /// Stores the final contents of a reserved slot.
    pub fn seal(&mut self, slot: SlotId, buf: BytesMut) -> Result<()> {
        let page_size = self.page_size;
        let entry = self.slot_mut(slot)?;
        if entry.buf.is_some() {
            return Err(TesseraError::ConcurrencyViolation("scratch slot already sealed"));
        }
        if buf.len() != entry.pages as usize * page_size {
            return Err(TesseraError::Invalid("sealed image does not match the slot"));
        }
        entry.buf = Some(buf);
        Ok(())
    }

    /// Gives back a reserved slot that was never sealed, whatever its reference count.
    pub fn discard(&mut self, slot: SlotId, buf: BytesMut) -> Result<()> {
        let entry = self.slot_mut(slot)?;
        if entry.buf.is_some() {
            return Err(TesseraError::ConcurrencyViolation("scratch slot already sealed"));
        }
        entry.buf = Some(buf);
        entry.refs = 1;
        self.release(slot).map(|_| ())
    }

    /// Adds a reference, pinning the slot.
    pub fn acquire(&mut self, slot: SlotId) -> Result<()> {
        let entry = self.slot_mut(slot)?;
        entry.refs += 1;
        Ok(())
    }

    /// Drops a reference; the slot's region returns to its file at zero.
    ///
    /// Returns the remaining reference count.
    pub fn release(&mut self, slot: SlotId) -> Result<u32> {
        let page_size = self.page_size;
        let file = self
            .files
            .get_mut(&slot.file)
            .ok_or(TesseraError::Invalid("unknown scratch slot"))?;
        let entry = file
            .slots
            .get_mut(&slot.offset)
            .ok_or(TesseraError::Invalid("unknown scratch slot"))?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return Ok(entry.refs);
        }
        let pages = entry.pages as u64;
        let region = match entry.buf.take() {
            Some(buf) => buf,
            None => {
                tracing::warn!(
                    file = slot.file,
                    offset = slot.offset,
                    "scratch.release.unsealed"
                );
                BytesMut::zeroed(pages as usize * page_size)
            }
        };
        file.slots.remove(&slot.offset);
        file.free.insert(Extent {
            start: slot.offset,
            len: pages,
        })?;
        file.give_back(slot.offset, region, page_size);
        if file.slots.is_empty() {
            self.retire_file(slot.file);
        }
        Ok(0)
    }

    fn retire_file(&mut self, id: u32) {
        // Keep the newest file active so a steady workload does not churn files.
        if self.files.keys().next_back() == Some(&id) && self.files.len() == 1 {
            return;
        }
        if let Some(file) = self.files.remove(&id) {
            if self.recycled.len() < self.options.recycle_limit {
                tracing::debug!(file = id, "scratch.file.recycle");
                self.recycled.push(file);
            } else {
                tracing::debug!(file = id, "scratch.file.drop");
            }
        }
    }

    /// Sealed contents of `pages` pages starting `skip` pages into a slot.
    pub fn view(&self, slot: SlotId, skip: u32, pages: u32) -> Result<&[u8]> {
        let entry = self
            .files
            .get(&slot.file)
            .and_then(|file| file.slots.get(&slot.offset))
            .ok_or(TesseraError::Invalid("unknown scratch slot"))?;
        if skip as u64 + pages as u64 > entry.pages as u64 {
            return Err(TesseraError::Invalid("view extends past the scratch slot"));
        }
        let buf = entry
            .buf
            .as_ref()
            .ok_or(TesseraError::ConcurrencyViolation("scratch slot not sealed"))?;
        let from = skip as usize * self.page_size;
        Ok(&buf[from..from + pages as usize * self.page_size])
    }

    /// Current reference count, zero once released.
    pub fn ref_count(&self, slot: SlotId) -> u32 {
        self.files
            .get(&slot.file)
            .and_then(|file| file.slots.get(&slot.offset))
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }

    /// Page and owning transaction recorded for a live slot.
    pub fn owner(&self, slot: SlotId) -> Option<(PageNumber, TxId)> {
        self.files
            .get(&slot.file)
            .and_then(|file| file.slots.get(&slot.offset))
            .map(|entry| (entry.page, entry.tx))
    }

    /// Pool counters.
    pub fn stats(&self) -> ScratchStats {
        ScratchStats {
            active_files: self.files.len(),
            recycled_files: self.recycled.len(),
            capacity_pages: self.files.values().map(|f| f.capacity).sum(),
            used_pages: self.files.values().map(ScratchFile::used_pages).sum(),
            live_slots: self.files.values().map(|f| f.slots.len()).sum(),
            arena_bytes: self
                .files
                .values()
                .chain(&self.recycled)
                .map(ScratchFile::arena_bytes)
                .sum(),
            files_created: self.files_created,
            files_reused: self.files_reused,
        }
    }

    fn slot_mut(&mut self, slot: SlotId) -> Result<&mut Slot> {
        self.files
            .get_mut(&slot.file)
            .and_then(|file| file.slots.get_mut(&slot.offset))
            .ok_or(TesseraError::Invalid("unknown scratch slot"))
    }
}
