//! Tessera: a single-node MVCC page storage engine.
//!
//! Pages are copied on write into scratch slots, made durable through a
//! checksummed write-ahead journal and later flushed into the data file once
//! no snapshot can still observe the versions they replace.
//!
//! ```no_run
//! use tessera::{EnvOptions, Environment};
//!
//! # fn main() -> tessera::Result<()> {
//! let env = Environment::open("data/env.tsr", EnvOptions::default())?;
//! let mut tx = env.begin_write()?;
//! let page = tx.allocate_page(1)?;
//! tx.modify_page(page)?[..5].copy_from_slice(b"hello");
//! tx.commit()?;
//!
//! let reader = env.begin_read()?;
//! assert_eq!(&reader.read_page(page)?.data()[..5], b"hello");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use primitives::concurrency::CancellationToken;
pub use storage::{
    EnvOptions, EnvStats, Environment, FlushReport, PageRef, Transaction, TxMode, WriteOptions,
};
pub use types::{PageNumber, Result, TesseraError, TxId};
