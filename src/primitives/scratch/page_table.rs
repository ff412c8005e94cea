#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::types::{PageNumber, TxId};

use super::SlotId;

/// One committed, not yet flushed image of a page (or overflow run).
///
/// The bytes live in the scratch slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageVersion {
    /// Transaction that produced the image.
    pub tx: TxId,
    /// Scratch slot holding the image.
    pub slot: SlotId,
    /// Run length in pages.
    pub pages: u32,
}

impl PageVersion {
    fn covers(&self, start: PageNumber, page: PageNumber) -> bool {
        page.0 >= start.0 && page.0 - start.0 < self.pages as u64
    }
}

/// Maps dirty pages to their unflushed versions, oldest first.
///
/// Versions are keyed by their first page. A page inside an overflow run is
/// found through the run's first page; `runs` counts multi-page versions per
/// first page so only nearby run starts are checked.
#[derive(Debug, Default)]
pub struct PageTable {
    versions: FxHashMap<PageNumber, SmallVec<[PageVersion; 2]>>,
    runs: BTreeMap<PageNumber, u32>,
    longest_run: u32,
    total: usize,
}

impl PageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a version; versions of a page arrive in commit order.
    pub fn insert(&mut self, page: PageNumber, version: PageVersion) {
        let chain = self.versions.entry(page).or_default();
        debug_assert!(chain.last().map_or(true, |last| last.tx < version.tx));
        if version.pages > 1 {
            *self.runs.entry(page).or_default() += 1;
            self.longest_run = self.longest_run.max(version.pages);
        }
        chain.push(version);
        self.total += 1;
    }

    /// Newest version keyed at `page` visible at `snapshot`.
    pub fn lookup(&self, page: PageNumber, snapshot: TxId) -> Option<&PageVersion> {
        self.versions
            .get(&page)?
            .iter()
            .rev()
            .find(|version| version.tx <= snapshot)
    }

    /// Newest version visible at `snapshot` whose image holds `page`, with the
    /// page's index inside that image.
    ///
    /// Considers versions keyed at `page` itself and every overflow run that
    /// starts before `page` and reaches it; the highest transaction wins.
    pub fn resolve(&self, page: PageNumber, snapshot: TxId) -> Option<(&PageVersion, u32)> {
        let mut best = self.covering(page, page, snapshot);
        if self.longest_run > 1 {
            let low = PageNumber(page.0.saturating_sub(self.longest_run as u64 - 1));
            for start in self.runs.range(low..page).map(|(start, _)| *start) {
                if let Some(found) = self.covering(start, page, snapshot) {
                    if best.map_or(true, |(current, _)| found.0.tx > current.tx) {
                        best = Some(found);
                    }
                }
            }
        }
        best
    }

    fn covering(
        &self,
        start: PageNumber,
        page: PageNumber,
        snapshot: TxId,
    ) -> Option<(&PageVersion, u32)> {
        self.versions
            .get(&start)?
            .iter()
            .rev()
            .find(|version| version.tx <= snapshot && version.covers(start, page))
            .map(|version| (version, (page.0 - start.0) as u32))
    }

    /// Versions committed in `(after, upto]` that a flush must install.
    ///
    /// Per first page this is the newest version in the window plus any older
    /// one that is longer than everything newer, so the tail of an overflow run
    /// survives a later rewrite of its head. Installing the result in
    /// transaction order reproduces the image at `upto`.
    pub fn latest_between(&self, after: TxId, upto: TxId) -> Vec<(PageNumber, PageVersion)> {
        let mut out = Vec::new();
        for (&page, chain) in &self.versions {
            let mut reach = 0;
            for version in chain.iter().rev() {
                if version.tx <= after || version.tx > upto || version.pages <= reach {
                    continue;
                }
                reach = version.pages;
                out.push((page, *version));
            }
        }
        out.sort_by_key(|(page, version)| (*page, version.tx));
        out
    }

    /// Drops every version committed at or before `upto`, returning their slots.
    pub fn release_upto(&mut self, upto: TxId) -> Vec<SlotId> {
        self.drop_where(|version| version.tx <= upto)
    }

    /// Drops the versions produced by `tx`, returning their slots.
    pub fn remove_tx(&mut self, tx: TxId) -> Vec<SlotId> {
        self.drop_where(|version| version.tx == tx)
    }

    fn drop_where(&mut self, doomed: impl Fn(&PageVersion) -> bool) -> Vec<SlotId> {
        let mut released = Vec::new();
        let runs = &mut self.runs;
        self.versions.retain(|page, chain| {
            chain.retain(|version| {
                if !doomed(version) {
                    return true;
                }
                released.push(version.slot);
                if version.pages > 1 {
                    if let Some(count) = runs.get_mut(page) {
                        *count -= 1;
                        if *count == 0 {
                            runs.remove(page);
                        }
                    }
                }
                false
            });
            !chain.is_empty()
        });
        if self.runs.is_empty() {
            self.longest_run = 0;
        }
        self.total -= released.len();
        released
    }

    /// Live versions across all pages.
    pub fn len(&self) -> usize {
        self.total
    }

    /// Returns true when nothing awaits flushing.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Distinct first pages with at least one version.
    pub fn page_count(&self) -> usize {
        self.versions.len()
    }
}
