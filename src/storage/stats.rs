use std::fmt;

use serde::Serialize;

use crate::primitives::concurrency::{LockSnapshot, ReaderSnapshot};
use crate::primitives::journal::JournalStats;
use crate::primitives::scratch::ScratchStats;

/// Point-in-time view of an environment.
#[derive(Clone, Debug, Serialize)]
pub struct EnvStats {
    /// Page size in bytes.
    pub page_size: u32,
    /// Newest published transaction.
    pub last_committed_tx: u64,
    /// Newest transaction whose journal record is durable.
    pub last_durable_tx: u64,
    /// Newest transaction installed in the data file.
    pub last_flushed_tx: u64,
    /// First never-allocated page.
    pub next_page: u64,
    /// Data file capacity in pages.
    pub file_pages: u64,
    /// Reusable free pages.
    pub free_pages: u64,
    /// Freed pages still waiting for reclamation.
    pub pending_free_pages: u64,
    /// Registered snapshots.
    pub readers: ReaderSnapshot,
    /// Unflushed page versions.
    pub unflushed_versions: usize,
    /// Distinct pages with unflushed versions.
    pub unflushed_pages: usize,
    /// Whether an async commit is still being written.
    pub async_commit_pending: bool,
    /// Completed flushes since open.
    pub flushes: u64,
    /// Scratch pool counters.
    pub scratch: ScratchStats,
    /// Journal counters.
    pub journal: JournalStats,
    /// Write lock counters.
    pub write_lock: LockSnapshot,
    /// Reason the environment stopped accepting writers, if it did.
    pub poisoned: Option<String>,
}

impl fmt::Display for EnvStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "page_size            {}", self.page_size)?;
        writeln!(
            f,
            "transactions         committed={} durable={} flushed={}",
            self.last_committed_tx, self.last_durable_tx, self.last_flushed_tx
        )?;
        writeln!(
            f,
            "pages                next={} capacity={} free={} pending_free={}",
            self.next_page, self.file_pages, self.free_pages, self.pending_free_pages
        )?;
        writeln!(
            f,
            "readers              active={} oldest={:?} max_age_ms={}",
            self.readers.active, self.readers.oldest_snapshot, self.readers.max_age_ms
        )?;
        writeln!(
            f,
            "unflushed            versions={} pages={} async_pending={}",
            self.unflushed_versions, self.unflushed_pages, self.async_commit_pending
        )?;
        writeln!(
            f,
            "scratch              files={} recycled={} used={}/{} slots={}",
            self.scratch.active_files,
            self.scratch.recycled_files,
            self.scratch.used_pages,
            self.scratch.capacity_pages,
            self.scratch.live_slots
        )?;
        writeln!(
            f,
            "journal              files={} current={} records={} bytes={} rotations={}",
            self.journal.files,
            self.journal.current_file,
            self.journal.records_appended,
            self.journal.bytes_appended,
            self.journal.rotations
        )?;
        writeln!(
            f,
            "write_lock           held={} acquisitions={} timeouts={}",
            self.write_lock.held, self.write_lock.acquisitions, self.write_lock.timeouts
        )?;
        writeln!(f, "flushes              {}", self.flushes)?;
        match &self.poisoned {
            Some(reason) => write!(f, "poisoned             {reason}"),
            None => write!(f, "poisoned             no"),
        }
    }
}
