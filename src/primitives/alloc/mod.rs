#![forbid(unsafe_code)]

//! Page allocator.
//!
//! Allocation reuses free extents (best fit) before growing the arena. Frees are
//! queued under the freeing transaction and only become reusable once that
//! transaction is durable and no registered snapshot predates it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{page::FIRST_DATA_PAGE, PageNumber, Result, TesseraError, TxId};

mod extent;

pub use extent::{Extent, ExtentMap};

/// How the data file grows when allocation runs past its current capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GrowthPolicy {
    /// Double the capacity, growing by at least `min_step` pages.
    Geometric {
        /// Smallest growth increment in pages.
        min_step: u64,
    },
    /// Grow in multiples of `pages`.
    Fixed {
        /// Growth increment in pages.
        pages: u64,
    },
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        GrowthPolicy::Geometric { min_step: 256 }
    }
}

impl GrowthPolicy {
    /// Capacity to grow to so that `required` pages fit, capped at `max_pages`.
    pub fn next_capacity(&self, current: u64, required: u64, max_pages: u64) -> u64 {
        if required <= current {
            return current;
        }
        let grown = match *self {
            GrowthPolicy::Geometric { min_step } => {
                let step = current.max(min_step).max(1);
                current.saturating_add(step).max(required)
            }
            GrowthPolicy::Fixed { pages } => {
                let step = pages.max(1);
                let missing = required - current;
                let steps = missing.div_ceil(step);
                current.saturating_add(steps.saturating_mul(step))
            }
        };
        grown.min(max_pages).max(required)
    }

    /// Rejects degenerate policies.
    pub fn validate(&self) -> Result<()> {
        match *self {
            GrowthPolicy::Geometric { min_step: 0 } | GrowthPolicy::Fixed { pages: 0 } => {
                Err(TesseraError::Invalid("growth step must be at least one page"))
            }
            _ => Ok(()),
        }
    }
}

/// Allocator changes made by one transaction, journaled with its pages.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocDelta {
    /// First never-allocated page after the transaction.
    pub next_page: u64,
    /// Data file capacity in pages after the transaction.
    pub file_pages: u64,
    /// Extents freed by the transaction.
    pub freed: Vec<Extent>,
    /// Extents taken from the free map.
    pub reused: Vec<Extent>,
}

impl AllocDelta {
    /// Starts a delta against the current allocator bounds.
    pub fn starting_at(next_page: u64, file_pages: u64) -> Self {
        Self {
            next_page,
            file_pages,
            ..Self::default()
        }
    }

    /// Returns true when the transaction neither freed nor reused anything.
    pub fn is_empty(&self) -> bool {
        self.freed.is_empty() && self.reused.is_empty()
    }
}

/// Limits and policy knobs for a [`PageAllocator`].
#[derive(Clone, Copy, Debug)]
pub struct AllocLimits {
    /// Largest page count the environment may reach.
    pub max_pages: u64,
    /// File growth policy.
    pub growth: GrowthPolicy,
    /// Extra snapshot epochs retained before a free becomes reusable.
    pub reclaim_lag: u64,
}

/// Complete allocator state; cloned at transaction begin so rollback can restore it.
#[derive(Clone, Debug, Default)]
pub struct AllocatorState {
    next_page: u64,
    file_pages: u64,
    free: ExtentMap,
    pending: BTreeMap<TxId, Vec<Extent>>,
    pending_index: ExtentMap,
}

/// Free-space manager for the data file arena.
#[derive(Debug)]
pub struct PageAllocator {
    state: AllocatorState,
    limits: AllocLimits,
}

impl PageAllocator {
    /// Restores an allocator from a flushed image.
    pub fn new(next_page: u64, file_pages: u64, free: ExtentMap, limits: AllocLimits) -> Self {
        let next_page = next_page.max(FIRST_DATA_PAGE.0);
        Self {
            state: AllocatorState {
                next_page,
                file_pages: file_pages.max(next_page),
                free,
                pending: BTreeMap::new(),
                pending_index: ExtentMap::new(),
            },
            limits,
        }
    }

    /// Allocates `count` contiguous pages, recording the change in `delta`.
    pub fn allocate(&mut self, count: u64, delta: &mut AllocDelta) -> Result<Extent> {
        if count == 0 {
            return Err(TesseraError::Invalid("allocation of zero pages"));
        }
        if let Some(extent) = self.state.free.take_best_fit(count) {
            delta.reused.push(extent);
            tracing::trace!(start = extent.start, pages = count, "alloc.reuse");
            return Ok(extent);
        }
        let start = self.state.next_page;
        let end = start
            .checked_add(count)
            .filter(|end| *end <= self.limits.max_pages)
            .ok_or(TesseraError::OutOfSpace {
                requested: count,
                max_pages: self.limits.max_pages,
            })?;
        self.state.next_page = end;
        if end > self.state.file_pages {
            let grown = self
                .limits
                .growth
                .next_capacity(self.state.file_pages, end, self.limits.max_pages);
            tracing::debug!(from = self.state.file_pages, to = grown, "alloc.grow");
            self.state.file_pages = grown;
        }
        delta.next_page = self.state.next_page;
        delta.file_pages = self.state.file_pages;
        Ok(Extent { start, len: count })
    }

    /// Queues `extent` for reuse once `tx` is reclaimable.
    pub fn free(&mut self, tx: TxId, extent: Extent, delta: &mut AllocDelta) -> Result<()> {
        self.check_allocated(extent)?;
        self.state
            .pending_index
            .insert(extent)
            .map_err(|_| TesseraError::Invalid("pages already freed"))?;
        self.state.pending.entry(tx).or_default().push(extent);
        delta.freed.push(extent);
        Ok(())
    }

    /// Rejects runs outside the allocated range or already free.
    pub fn check_allocated(&self, extent: Extent) -> Result<()> {
        if extent.len == 0 {
            return Err(TesseraError::Invalid("empty page run"));
        }
        if extent.start < FIRST_DATA_PAGE.0 || extent.end() > self.state.next_page {
            return Err(TesseraError::Invalid("page out of allocated range"));
        }
        if self.state.free.intersects(&extent) || self.state.pending_index.intersects(&extent) {
            return Err(TesseraError::Invalid("pages already freed"));
        }
        Ok(())
    }

    /// Moves pending frees into the reusable set.
    ///
    /// A free by `T` is promoted when `T <= durable` and `oldest` (the oldest
    /// registered snapshot, if any) is at least `T + reclaim_lag`.
    pub fn promote(&mut self, oldest: Option<TxId>, durable: TxId) -> Result<u64> {
        let mut promoted = 0;
        while let Some((&tx, _)) = self.state.pending.first_key_value() {
            if tx > durable {
                break;
            }
            if let Some(oldest) = oldest {
                if tx.0.saturating_add(self.limits.reclaim_lag) > oldest.0 {
                    break;
                }
            }
            let extents = self.state.pending.remove(&tx).unwrap_or_default();
            for extent in extents {
                self.state.pending_index.remove(extent)?;
                self.state.free.insert(extent)?;
                promoted += extent.len;
            }
        }
        if promoted > 0 {
            tracing::trace!(pages = promoted, "alloc.promote");
        }
        Ok(promoted)
    }

    /// Folds a committed transaction's delta into a flushed image.
    ///
    /// Pending frees are merged straight into the free map: an image is only
    /// read back on open, when no snapshot survives.
    pub fn apply_delta(&mut self, delta: &AllocDelta) -> Result<()> {
        for extent in &delta.reused {
            self.state.free.remove(*extent)?;
        }
        for extent in &delta.freed {
            self.state.free.insert(*extent)?;
        }
        self.state.next_page = self.state.next_page.max(delta.next_page);
        self.state.file_pages = self
            .state
            .file_pages
            .max(delta.file_pages)
            .max(self.state.next_page);
        Ok(())
    }

    /// Clones the state for a later [`restore`](Self::restore).
    pub fn snapshot(&self) -> AllocatorState {
        self.state.clone()
    }

    /// Reverts to a snapshot taken with [`snapshot`](Self::snapshot).
    pub fn restore(&mut self, state: AllocatorState) {
        self.state = state;
    }

    /// Drops pending frees queued by `tx`; used when its commit is abandoned.
    pub fn forget_pending(&mut self, tx: TxId) -> Result<()> {
        if let Some(extents) = self.state.pending.remove(&tx) {
            for extent in extents {
                self.state.pending_index.remove(extent)?;
            }
        }
        Ok(())
    }

    /// First never-allocated page.
    pub fn next_page(&self) -> PageNumber {
        PageNumber(self.state.next_page)
    }

    /// Data file capacity in pages.
    pub fn file_pages(&self) -> u64 {
        self.state.file_pages
    }

    /// Reusable free pages.
    pub fn free_pages(&self) -> u64 {
        self.state.free.total_pages()
    }

    /// Pages freed but not yet reusable.
    pub fn pending_pages(&self) -> u64 {
        self.state.pending_index.total_pages()
    }

    /// Reusable extents in page order.
    pub fn free_extents(&self) -> Vec<Extent> {
        self.state.free.iter().collect()
    }

    /// Configured limits.
    pub fn limits(&self) -> AllocLimits {
        self.limits
    }
}
