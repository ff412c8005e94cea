#![forbid(unsafe_code)]

use std::{
    io::{self, ErrorKind},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use crate::types::Result;

use super::{FileIo, IoProvider, StdIoProvider};

/// Shared switchboard deciding which operations fail.
///
/// Faults only apply to files whose path contains the configured fragment
/// (for example `"journal"` or `"header"`); an empty fragment matches all files.
#[derive(Clone, Default)]
pub struct FaultInjector {
    inner: Arc<FaultState>,
}

#[derive(Default)]
struct FaultState {
    fragment: Mutex<String>,
    fail_writes: AtomicBool,
    fail_syncs: AtomicBool,
    sync_delay_us: AtomicU64,
    injected: AtomicU64,
}

impl FaultInjector {
    /// Creates an injector with every fault disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts faults to paths containing `fragment`.
    pub fn target(&self, fragment: impl Into<String>) {
        *self.inner.fragment.lock() = fragment.into();
    }

    /// Makes every matching `write_at` fail.
    pub fn fail_writes(&self, enabled: bool) {
        self.inner.fail_writes.store(enabled, Ordering::SeqCst);
    }

    /// Makes every matching `sync_all` fail.
    pub fn fail_syncs(&self, enabled: bool) {
        self.inner.fail_syncs.store(enabled, Ordering::SeqCst);
    }

    /// Stalls every matching `sync_all` for `delay` before it runs.
    pub fn delay_syncs(&self, delay: Duration) {
        self.inner
            .sync_delay_us
            .store(delay.as_micros() as u64, Ordering::SeqCst);
    }

    /// Disables all faults and delays.
    pub fn heal(&self) {
        self.fail_writes(false);
        self.fail_syncs(false);
        self.delay_syncs(Duration::ZERO);
    }

    /// Number of operations failed so far.
    pub fn injected(&self) -> u64 {
        self.inner.injected.load(Ordering::SeqCst)
    }

    fn matches(&self, path: &Path) -> bool {
        let fragment = self.inner.fragment.lock();
        fragment.is_empty() || path.to_string_lossy().contains(fragment.as_str())
    }

    fn trip(&self, armed: &AtomicBool, path: &Path, op: &'static str) -> Result<()> {
        if armed.load(Ordering::SeqCst) && self.matches(path) {
            self.inner.injected.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(path = %path.display(), op, "io.fault.injected");
            return Err(io::Error::new(ErrorKind::Other, format!("injected {op} failure")).into());
        }
        Ok(())
    }
}

/// [`IoProvider`] wrapping another provider with injectable faults.
pub struct FaultyIoProvider {
    inner: Arc<dyn IoProvider>,
    injector: FaultInjector,
}

impl FaultyIoProvider {
    /// Wraps the filesystem provider.
    pub fn new(injector: FaultInjector) -> Self {
        Self::wrap(Arc::new(StdIoProvider), injector)
    }

    /// Wraps an arbitrary provider.
    pub fn wrap(inner: Arc<dyn IoProvider>, injector: FaultInjector) -> Self {
        Self { inner, injector }
    }
}

impl IoProvider for FaultyIoProvider {
    fn open(&self, path: &Path) -> Result<Arc<dyn FileIo>> {
        Ok(Arc::new(FaultyFileIo {
            path: path.to_path_buf(),
            inner: self.inner.open(path)?,
            injector: self.injector.clone(),
        }))
    }
}

struct FaultyFileIo {
    path: std::path::PathBuf,
    inner: Arc<dyn FileIo>,
    injector: FaultInjector,
}

impl FileIo for FaultyFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.injector
            .trip(&self.injector.inner.fail_writes, &self.path, "write")?;
        self.inner.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        let delay = self.injector.inner.sync_delay_us.load(Ordering::SeqCst);
        if delay > 0 && self.injector.matches(&self.path) {
            thread::sleep(Duration::from_micros(delay));
        }
        self.injector
            .trip(&self.injector.inner.fail_syncs, &self.path, "sync")?;
        self.inner.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.injector
            .trip(&self.injector.inner.fail_writes, &self.path, "set_len")?;
        self.inner.set_len(len)
    }
}
