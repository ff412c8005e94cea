//! Transactional page storage.
//!
//! Ties the primitives together into an [`Environment`]: a single writer and
//! any number of snapshot readers over one data file, a journal and a pool of
//! scratch slots, with a flush manager moving durable pages into place.

mod env;
mod flush;
mod header;
mod options;
mod stats;
mod txn;

pub use env::{journal_dir_for, Environment};
pub use flush::FlushReport;
pub use options::{EnvOptions, WriteOptions};
pub use stats::EnvStats;
pub use txn::{PageRef, Transaction, TxMode};
