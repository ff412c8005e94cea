#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::types::{PageNumber, Result, TesseraError};

/// Contiguous run of pages `[start, start + len)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct Extent {
    /// First page of the run.
    pub start: u64,
    /// Number of pages in the run.
    pub len: u64,
}

impl Extent {
    /// Builds an extent starting at `start` spanning `len` pages.
    pub const fn new(start: PageNumber, len: u64) -> Self {
        Self {
            start: start.0,
            len,
        }
    }

    /// One past the last page.
    pub const fn end(&self) -> u64 {
        self.start + self.len
    }

    /// First page as a [`PageNumber`].
    pub const fn first(&self) -> PageNumber {
        PageNumber(self.start)
    }

    /// Returns true when the two runs share a page.
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Returns true when `page` lies within the run.
    pub fn contains(&self, page: PageNumber) -> bool {
        page.0 >= self.start && page.0 < self.end()
    }
}

/// Free-extent index with best-fit lookup and coalescing on insert.
///
/// `by_start` maps start → len for neighbour lookups; `by_len` orders
/// `(len, start)` so the smallest sufficient run is found in one range query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtentMap {
    by_start: BTreeMap<u64, u64>,
    by_len: BTreeSet<(u64, u64)>,
    total: u64,
}

impl ExtentMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total free pages.
    pub fn total_pages(&self) -> u64 {
        self.total
    }

    /// Number of disjoint extents.
    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    /// Returns true when nothing is free.
    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    /// Extents in ascending page order.
    pub fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.by_start
            .iter()
            .map(|(&start, &len)| Extent { start, len })
    }

    /// Returns true when `page` is free.
    pub fn contains(&self, page: PageNumber) -> bool {
        self.containing(page.0).is_some()
    }

    fn containing(&self, page: u64) -> Option<Extent> {
        self.by_start
            .range(..=page)
            .next_back()
            .map(|(&start, &len)| Extent { start, len })
            .filter(|extent| page < extent.end())
    }

    /// Returns true when any page of `extent` is free.
    pub fn intersects(&self, extent: &Extent) -> bool {
        if let Some(prev) = self.containing(extent.start) {
            if prev.overlaps(extent) {
                return true;
            }
        }
        self.by_start
            .range(extent.start..extent.end())
            .next()
            .is_some()
    }

    /// Adds `extent`, merging it with adjacent free runs.
    ///
    /// Fails when any page of `extent` is already free.
    pub fn insert(&mut self, extent: Extent) -> Result<()> {
        if extent.len == 0 {
            return Ok(());
        }
        if self.intersects(&extent) {
            return Err(TesseraError::Invalid("extent overlaps free space"));
        }
        let mut merged = extent;
        if let Some((&start, &len)) = self.by_start.range(..extent.start).next_back() {
            if start + len == extent.start {
                self.detach(start, len);
                merged = Extent {
                    start,
                    len: len + merged.len,
                };
            }
        }
        if let Some(&len) = self.by_start.get(&merged.end()) {
            let start = merged.end();
            self.detach(start, len);
            merged.len += len;
        }
        self.attach(merged);
        self.total += extent.len;
        Ok(())
    }

    /// Takes the smallest run of at least `len` pages, lowest start on ties.
    ///
    /// The head of the chosen run is returned; any remainder stays free.
    pub fn take_best_fit(&mut self, len: u64) -> Option<Extent> {
        if len == 0 {
            return None;
        }
        let &(found_len, start) = self.by_len.range((len, 0)..).next()?;
        self.detach(start, found_len);
        if found_len > len {
            self.attach(Extent {
                start: start + len,
                len: found_len - len,
            });
        }
        self.total -= len;
        Some(Extent { start, len })
    }

    /// Removes `extent`, which must lie inside a single free run.
    pub fn remove(&mut self, extent: Extent) -> Result<()> {
        if extent.len == 0 {
            return Ok(());
        }
        let host = self
            .containing(extent.start)
            .filter(|host| extent.end() <= host.end())
            .ok_or(TesseraError::Corruption("extent is not free"))?;
        self.detach(host.start, host.len);
        if host.start < extent.start {
            self.attach(Extent {
                start: host.start,
                len: extent.start - host.start,
            });
        }
        if extent.end() < host.end() {
            self.attach(Extent {
                start: extent.end(),
                len: host.end() - extent.end(),
            });
        }
        self.total -= extent.len;
        Ok(())
    }

    fn attach(&mut self, extent: Extent) {
        self.by_start.insert(extent.start, extent.len);
        self.by_len.insert((extent.len, extent.start));
    }

    fn detach(&mut self, start: u64, len: u64) {
        self.by_start.remove(&start);
        self.by_len.remove(&(len, start));
    }
}

impl FromIterator<Extent> for ExtentMap {
    fn from_iter<I: IntoIterator<Item = Extent>>(iter: I) -> Self {
        let mut map = ExtentMap::new();
        for extent in iter {
            // Persisted lists never overlap; a duplicate run is dropped rather than double counted.
            let _ = map.insert(extent);
        }
        map
    }
}
