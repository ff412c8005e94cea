#![forbid(unsafe_code)]

//! Core identifiers, the crate-wide error type and on-disk page constants.

use std::{fmt, io, time::Duration};

/// Checksum helpers shared by the journal and header codecs.
pub mod checksum;

/// Logical page number inside the data file arena.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageNumber(pub u64);

/// Monotonically assigned transaction identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxId(pub u64);

impl TxId {
    /// Returns the id that follows this one.
    pub const fn next(self) -> TxId {
        TxId(self.0 + 1)
    }

    /// Returns the id that precedes this one, saturating at zero.
    pub const fn prev(self) -> TxId {
        TxId(self.0.saturating_sub(1))
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageNumber {
    fn from(value: u64) -> Self {
        PageNumber(value)
    }
}

impl From<u64> for TxId {
    fn from(value: u64) -> Self {
        TxId(value)
    }
}

/// Errors surfaced by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum TesseraError {
    /// An allocation would grow the environment past its configured maximum.
    #[error("out of space: requested {requested} page(s), limit is {max_pages} pages")]
    OutOfSpace {
        /// Number of contiguous pages requested.
        requested: u64,
        /// Maximum number of pages the environment may hold.
        max_pages: u64,
    },
    /// A journal or header checksum did not match its contents.
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(&'static str),
    /// API misuse such as writing through a read transaction.
    #[error("concurrency violation: {0}")]
    ConcurrencyViolation(&'static str),
    /// Disk write, read or sync failure.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// The write lock could not be acquired within the configured bound.
    #[error("timed out after {0:?} waiting for the write lock")]
    Timeout(Duration),
    /// A wait was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,
    /// The environment is poisoned and rejects further writers.
    #[error("storage fatal: {0}")]
    StorageFatal(String),
    /// Persistent state is structurally invalid.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// An argument or configuration value is invalid.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

impl TesseraError {
    /// Returns true when the error poisons the environment.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TesseraError::Io(_) | TesseraError::StorageFatal(_))
    }

    /// Clones the error so it can be handed to several waiters.
    pub(crate) fn duplicate(&self) -> TesseraError {
        match self {
            TesseraError::OutOfSpace {
                requested,
                max_pages,
            } => TesseraError::OutOfSpace {
                requested: *requested,
                max_pages: *max_pages,
            },
            TesseraError::ChecksumMismatch(msg) => TesseraError::ChecksumMismatch(msg),
            TesseraError::ConcurrencyViolation(msg) => TesseraError::ConcurrencyViolation(msg),
            TesseraError::Io(err) => TesseraError::Io(io::Error::new(err.kind(), err.to_string())),
            TesseraError::Timeout(waited) => TesseraError::Timeout(*waited),
            TesseraError::Cancelled => TesseraError::Cancelled,
            TesseraError::StorageFatal(msg) => TesseraError::StorageFatal(msg.clone()),
            TesseraError::Corruption(msg) => TesseraError::Corruption(msg),
            TesseraError::Invalid(msg) => TesseraError::Invalid(msg),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TesseraError>;

pub mod page {
    //! Page geometry and the identity page written at the start of the data file.

    use core::ops::Range;

    use super::{PageNumber, Result, TesseraError};

    /// Magic bytes at the start of the identity page.
    pub const DATA_MAGIC: [u8; 4] = *b"TSRA";
    /// Data file format version.
    pub const DATA_FORMAT_VERSION: u16 = 1;
    /// Default page size in bytes.
    pub const DEFAULT_PAGE_SIZE: u32 = 8192;
    /// Smallest supported page size.
    pub const MIN_PAGE_SIZE: u32 = 1024;
    /// Largest supported page size.
    pub const MAX_PAGE_SIZE: u32 = 64 * 1024;
    /// Page 0 holds the identity page and is never handed out.
    pub const FIRST_DATA_PAGE: PageNumber = PageNumber(1);

    /// Byte ranges of the identity page fields.
    pub mod identity {
        use core::ops::Range;

        /// Magic bytes.
        pub const MAGIC: Range<usize> = 0..4;
        /// Format version.
        pub const VERSION: Range<usize> = 4..6;
        /// Page size in bytes.
        pub const PAGE_SIZE: Range<usize> = 8..12;
        /// Environment id shared with headers and journal files.
        pub const ENV_ID: Range<usize> = 16..24;
    }

    /// Rejects page sizes that are not a power of two within the supported bounds.
    pub fn validate_page_size(page_size: u32) -> Result<()> {
        if !page_size.is_power_of_two() {
            return Err(TesseraError::Invalid("page size must be a power of two"));
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(TesseraError::Invalid("page size out of supported range"));
        }
        Ok(())
    }

    /// Byte offset of `page` in the data file.
    pub fn page_offset(page: PageNumber, page_size: u32) -> Result<u64> {
        page.0
            .checked_mul(page_size as u64)
            .ok_or(TesseraError::Invalid("page offset overflow"))
    }

    /// Byte range occupied by a run of `pages` pages starting at `page`.
    pub fn run_range(page: PageNumber, pages: u32, page_size: u32) -> Result<Range<u64>> {
        let start = page_offset(page, page_size)?;
        let len = (pages as u64)
            .checked_mul(page_size as u64)
            .ok_or(TesseraError::Invalid("page run overflow"))?;
        let end = start
            .checked_add(len)
            .ok_or(TesseraError::Invalid("page run overflow"))?;
        Ok(start..end)
    }

    /// Builds the identity page written at offset zero of a fresh data file.
    pub fn encode_identity(page_size: u32, env_id: u64) -> Vec<u8> {
        let mut buf = vec![0u8; page_size as usize];
        buf[identity::MAGIC].copy_from_slice(&DATA_MAGIC);
        buf[identity::VERSION].copy_from_slice(&DATA_FORMAT_VERSION.to_be_bytes());
        buf[identity::PAGE_SIZE].copy_from_slice(&page_size.to_be_bytes());
        buf[identity::ENV_ID].copy_from_slice(&env_id.to_be_bytes());
        buf
    }

    /// Parses the identity page, returning `(page_size, env_id)`.
    pub fn decode_identity(buf: &[u8]) -> Result<(u32, u64)> {
        if buf.len() < identity::ENV_ID.end {
            return Err(TesseraError::Corruption("identity page truncated"));
        }
        if buf[identity::MAGIC] != DATA_MAGIC {
            return Err(TesseraError::Corruption("identity page magic mismatch"));
        }
        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != DATA_FORMAT_VERSION {
            return Err(TesseraError::Corruption("unsupported data file version"));
        }
        let mut size = [0u8; 4];
        size.copy_from_slice(&buf[identity::PAGE_SIZE]);
        let mut env = [0u8; 8];
        env.copy_from_slice(&buf[identity::ENV_ID]);
        Ok((u32::from_be_bytes(size), u64::from_be_bytes(env)))
    }
}
