use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::alloc::GrowthPolicy;
use crate::primitives::concurrency::CancellationToken;
use crate::primitives::journal::CommitConfig;
use crate::primitives::scratch::ScratchOptions;
use crate::types::{page, Result, TesseraError};

/// Configuration supplied when opening an [`super::Environment`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvOptions {
    /// Page size in bytes; must match the size the environment was created with.
    pub page_size: u32,
    /// Maximum data file size in bytes. `None` leaves the environment unbounded.
    pub max_size: Option<u64>,
    /// Size at which a journal file is closed and a new one started, in bytes.
    pub journal_size_limit: u64,
    /// Disables the background flush thread; flushing then only happens through
    /// [`super::Environment::flush_log_to_data_file`].
    pub manual_flushing: bool,
    /// Bound on waiting for the write lock. `None` waits indefinitely, `Some(0)`
    /// fails immediately when another writer is active.
    pub write_lock_timeout_ms: Option<u64>,
    /// Period of the background flush tick in milliseconds.
    pub flush_interval_ms: u64,
    /// Unflushed page versions that trigger an early background flush.
    pub flush_dirty_pages_threshold: u64,
    /// Data file growth policy.
    pub growth: GrowthPolicy,
    /// Extra snapshot epochs a freed page waits before it can be reused.
    pub reclaim_lag: u64,
    /// Capacity of the first scratch file, in pages.
    pub scratch_initial_pages: u64,
    /// Largest capacity a new scratch file grows to, in pages.
    pub scratch_max_file_pages: u64,
    /// Fully released scratch files kept for reuse.
    pub scratch_recycle_limit: usize,
    /// Snappy-compress journal payloads.
    pub journal_compression: bool,
    /// Maximum records the journal writer groups under one sync.
    pub journal_batch_max_records: usize,
    /// Time the journal writer waits for more records to join a batch, in microseconds.
    pub journal_batch_max_wait_us: u64,
    /// Clean data-file pages cached in memory. Zero disables the cache.
    pub data_cache_pages: usize,
}

impl Default for EnvOptions {
    fn default() -> Self {
        let scratch = ScratchOptions::default();
        let commit = CommitConfig::default();
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            max_size: None,
            journal_size_limit: 64 * 1024 * 1024,
            manual_flushing: false,
            write_lock_timeout_ms: None,
            flush_interval_ms: 1_000,
            flush_dirty_pages_threshold: 4_096,
            growth: GrowthPolicy::default(),
            reclaim_lag: 0,
            scratch_initial_pages: scratch.initial_file_pages,
            scratch_max_file_pages: scratch.max_file_pages,
            scratch_recycle_limit: scratch.recycle_limit,
            journal_compression: false,
            journal_batch_max_records: commit.max_batch_records,
            journal_batch_max_wait_us: commit.max_batch_wait.as_micros() as u64,
            data_cache_pages: 1_024,
        }
    }
}

impl EnvOptions {
    /// Parses options from TOML; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| {
            tracing::warn!(error = %err, "options.toml.invalid");
            TesseraError::Invalid("malformed environment options")
        })
    }

    /// Reads options from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Rejects inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        page::validate_page_size(self.page_size)?;
        self.growth.validate()?;
        if let Some(max) = self.max_size {
            if max < 2 * self.page_size as u64 {
                return Err(TesseraError::Invalid("max_size must hold at least two pages"));
            }
        }
        if self.journal_size_limit < 4 * self.page_size as u64 {
            return Err(TesseraError::Invalid(
                "journal_size_limit must hold at least four pages",
            ));
        }
        if !self.manual_flushing && self.flush_interval_ms == 0 {
            return Err(TesseraError::Invalid("flush_interval_ms must be positive"));
        }
        if self.scratch_initial_pages == 0 || self.scratch_max_file_pages == 0 {
            return Err(TesseraError::Invalid("scratch file sizes must be positive"));
        }
        Ok(())
    }

    /// Largest page count the data file may reach.
    pub fn max_pages(&self) -> u64 {
        self.max_size
            .map(|bytes| bytes / self.page_size as u64)
            .unwrap_or(u64::MAX / self.page_size as u64)
    }

    /// Default write-lock bound.
    pub fn write_lock_timeout(&self) -> Option<Duration> {
        self.write_lock_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn scratch(&self) -> ScratchOptions {
        ScratchOptions {
            initial_file_pages: self.scratch_initial_pages,
            max_file_pages: self.scratch_max_file_pages,
            recycle_limit: self.scratch_recycle_limit,
        }
    }

    pub(crate) fn commit(&self) -> CommitConfig {
        CommitConfig {
            max_batch_records: self.journal_batch_max_records,
            max_batch_wait: Duration::from_micros(self.journal_batch_max_wait_us),
        }
    }
}

/// Per-call overrides for beginning a write transaction.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    /// Overrides [`EnvOptions::write_lock_timeout_ms`] when set.
    pub timeout: Option<Duration>,
    /// Abandons the wait for the write lock once cancelled.
    pub cancel: Option<CancellationToken>,
}

impl WriteOptions {
    /// Bounds the lock wait.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Makes the lock wait cancellable.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}
