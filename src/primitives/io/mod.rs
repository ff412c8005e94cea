#![forbid(unsafe_code)]

//! Positional file I/O used by the data file, the header copies and the journal.
//!
//! Every durable file is reached through an [`IoProvider`] so tests can swap in
//! [`fault::FaultyIoProvider`] and exercise the failure paths.

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
};

use crate::types::{Result, TesseraError};

/// Fault-injecting provider for failure tests.
pub mod fault;

pub use fault::{FaultInjector, FaultyIoProvider};

/// Positioned reads and writes over a single file.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`; short files yield `UnexpectedEof`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the file when needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes file data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file.
    fn set_len(&self, len: u64) -> Result<()>;
}

/// Opens the files an environment persists to.
pub trait IoProvider: Send + Sync + 'static {
    /// Opens `path` read-write, creating it when missing.
    fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>>;
}

/// Provider backed by the local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdIoProvider;

impl IoProvider for StdIoProvider {
    fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>> {
        Ok(Arc::new(StdFileIo::open(path)?))
    }
}

/// File handle shared behind an `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }
}

#[cfg(unix)]
mod positional {
    use std::{fs::File, io, os::unix::fs::FileExt};

    pub fn read(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.read_at(dst, off)
    }

    pub fn write(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.write_at(src, off)
    }
}

#[cfg(windows)]
mod positional {
    use std::{fs::File, io, os::windows::fs::FileExt};

    pub fn read(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.seek_read(dst, off)
    }

    pub fn write(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.seek_write(src, off)
    }
}

#[cfg(not(any(unix, windows)))]
mod positional {
    use std::{fs::File, io};

    pub fn read(_file: &File, _dst: &mut [u8], _off: u64) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positional reads unsupported on this platform",
        ))
    }

    pub fn write(_file: &File, _src: &[u8], _off: u64) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positional writes unsupported on this platform",
        ))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let read = match positional::read(&self.inner, dst, off) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read_at reached EOF").into());
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        while !src.is_empty() {
            let written = match positional::write(&self.inner, src, off) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if written == 0 {
                return Err(
                    io::Error::new(ErrorKind::WriteZero, "write_at wrote zero bytes").into(),
                );
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(TesseraError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(TesseraError::from)
    }
}

/// Reads `dst.len()` bytes at `off`, zero-filling whatever lies past the end of the file.
pub fn read_or_zero(io: &dyn FileIo, off: u64, dst: &mut [u8]) -> Result<()> {
    let len = io.len()?;
    if off >= len {
        dst.fill(0);
        return Ok(());
    }
    let available = ((len - off) as usize).min(dst.len());
    let (head, tail) = dst.split_at_mut(available);
    io.read_at(off, head)?;
    tail.fill(0);
    Ok(())
}
