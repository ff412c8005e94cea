//! Low-level primitives for building the storage engine.
//!
//! Includes positional I/O, concurrency controls, the page allocator, the
//! scratch buffer pool and the write-ahead journal.

/// Page allocation over the data file arena.
///
/// Free-extent tracking, file growth and epoch-deferred reuse of freed pages.
pub mod alloc;

/// Concurrency primitives and synchronization.
///
/// The single-writer lock, cancellation tokens and the snapshot registry.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Write-ahead journal for crash recovery.
///
/// Ensures durability through sequential, checksummed transaction records.
pub mod journal;

/// Copy-on-write staging for dirty pages.
///
/// Reference-counted slots holding page images until they reach the data file.
pub mod scratch;
