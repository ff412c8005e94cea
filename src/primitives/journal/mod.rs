#![forbid(unsafe_code)]

//! Write-ahead journal.
//!
//! Each committed transaction becomes one checksummed record holding its full
//! page images and allocator delta. Records append to numbered files inside the
//! journal directory; a new file starts once the current one would exceed the
//! size limit. Files are retired once the flush manager has installed every
//! record they hold in the data file.
//!
//! Recovery scans files in number order and stops at the first record whose
//! checksum fails, that is cut short, or whose id breaks the consecutive
//! sequence. Everything from that crash point on is discarded.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Buf;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, IoProvider, StdIoProvider};
use crate::types::{checksum, Result, TesseraError, TxId};

mod committer;
mod record;

pub use committer::{CommitConfig, CommitTicket, CompletionHook, JournalCommitter};
pub use record::{JournalPage, JournalRecord, FLAG_SNAPPY, RECORD_HEADER_LEN, RECORD_MAGIC};

use record::RecordHeader;

const FILE_MAGIC: [u8; 4] = *b"TSJN";
const FILE_VERSION: u16 = 1;
/// Encoded size of the header at the start of every journal file.
pub const FILE_HEADER_LEN: u64 = 32;
const FILE_EXTENSION: &str = "journal";

/// Journal configuration.
#[derive(Clone, Copy, Debug)]
pub struct JournalOptions {
    /// Page size of the owning environment.
    pub page_size: u32,
    /// Soft size limit of one journal file in bytes.
    pub size_limit: u64,
    /// Snappy-compress record payloads.
    pub compression: bool,
    /// Environment id stamped into file headers.
    pub env_id: u64,
}

/// Counters describing journal activity since open.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct JournalStats {
    /// Journal files currently retained.
    pub files: usize,
    /// Number of the file receiving appends.
    pub current_file: u64,
    /// Bytes appended.
    pub bytes_appended: u64,
    /// Records appended.
    pub records_appended: u64,
    /// Sync calls issued.
    pub syncs: u64,
    /// Files started because of the size limit.
    pub rotations: u64,
    /// Files deleted or truncated after a flush.
    pub retired_files: u64,
}

/// File name of journal file `number`.
pub fn journal_file_name(number: u64) -> String {
    format!("{number:019}.{FILE_EXTENSION}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileHeader {
    page_size: u32,
    number: u64,
    env_id: u64,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN as usize] {
        let mut buf = [0u8; FILE_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&FILE_MAGIC);
        buf[4..6].copy_from_slice(&FILE_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_be_bytes());
        buf[12..20].copy_from_slice(&self.number.to_be_bytes());
        buf[20..28].copy_from_slice(&self.env_id.to_be_bytes());
        checksum::seal_trailer(&mut buf);
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN as usize {
            return Err(TesseraError::Corruption("journal file header truncated"));
        }
        if src[0..4] != FILE_MAGIC {
            return Err(TesseraError::ChecksumMismatch("journal file magic"));
        }
        let body = checksum::verify_trailer(&src[..FILE_HEADER_LEN as usize], "journal file header")?;
        let mut fields = &body[4..];
        if fields.get_u16() != FILE_VERSION {
            return Err(TesseraError::Corruption("unsupported journal version"));
        }
        fields.advance(2);
        Ok(Self {
            page_size: fields.get_u32(),
            number: fields.get_u64(),
            env_id: fields.get_u64(),
        })
    }
}

/// Where recovery stopped trusting the journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CrashPoint {
    /// File holding the first discarded byte.
    pub file_number: u64,
    /// Offset of the first discarded byte.
    pub offset: u64,
    /// Why the record was rejected.
    pub reason: &'static str,
}

/// Outcome of scanning the journal directory on open.
#[derive(Debug, Default)]
pub struct RecoveredJournal {
    /// Records newer than the last flushed transaction, in id order.
    pub records: Vec<JournalRecord>,
    /// Records older than the flushed horizon that were skipped.
    pub skipped: usize,
    /// First damaged or discontinuous record, if any.
    pub crash_point: Option<CrashPoint>,
    /// Files examined.
    pub files_scanned: usize,
    /// Number to give the next journal file.
    pub next_file_number: u64,
}

/// Summary of one record for read-only inspection.
#[derive(Clone, Debug, Serialize)]
pub struct RecordSummary {
    /// Offset of the record header.
    pub offset: u64,
    /// Committing transaction.
    pub tx: u64,
    /// Pages carried.
    pub pages: u32,
    /// Encoded size including the header.
    pub bytes: u64,
    /// Whether the payload was compressed.
    pub compressed: bool,
}

/// Summary of one journal file for read-only inspection.
#[derive(Clone, Debug, Serialize)]
pub struct JournalFileSummary {
    /// File number.
    pub number: u64,
    /// Path on disk.
    pub path: PathBuf,
    /// File length in bytes.
    pub bytes: u64,
    /// Valid records in order.
    pub records: Vec<RecordSummary>,
    /// First damaged byte and the reason, if any.
    pub damage: Option<(u64, &'static str)>,
}

enum ScanStop {
    End,
    Damaged { offset: u64, reason: &'static str },
}

struct ScannedRecord {
    offset: u64,
    len: u64,
    compressed: bool,
    record: JournalRecord,
}

fn damage_reason(err: &TesseraError) -> Option<&'static str> {
    match err {
        TesseraError::ChecksumMismatch(reason) | TesseraError::Corruption(reason) => Some(*reason),
        _ => None,
    }
}

fn scan_file(
    io: &dyn FileIo,
    page_size: u32,
    expected_env: Option<u64>,
) -> Result<(Vec<ScannedRecord>, ScanStop)> {
    let len = io.len()?;
    let mut records = Vec::new();
    if len < FILE_HEADER_LEN {
        return Ok((
            records,
            ScanStop::Damaged {
                offset: 0,
                reason: "journal file header truncated",
            },
        ));
    }
    let mut head = [0u8; FILE_HEADER_LEN as usize];
    io.read_at(0, &mut head)?;
    let header = match FileHeader::decode(&head) {
        Ok(header) => header,
        Err(err) => {
            let reason = damage_reason(&err).ok_or(err)?;
            return Ok((records, ScanStop::Damaged { offset: 0, reason }));
        }
    };
    if header.page_size != page_size || expected_env.is_some_and(|env| env != header.env_id) {
        return Ok((
            records,
            ScanStop::Damaged {
                offset: 0,
                reason: "journal file belongs to another environment",
            },
        ));
    }
    let mut offset = FILE_HEADER_LEN;
    let mut header_buf = [0u8; RECORD_HEADER_LEN];
    loop {
        if offset == len {
            return Ok((records, ScanStop::End));
        }
        if offset + RECORD_HEADER_LEN as u64 > len {
            return Ok((
                records,
                ScanStop::Damaged {
                    offset,
                    reason: "journal record header truncated",
                },
            ));
        }
        io.read_at(offset, &mut header_buf)?;
        let header = match RecordHeader::decode(&header_buf) {
            Ok(header) => header,
            Err(err) => {
                let reason = damage_reason(&err).ok_or(err)?;
                return Ok((records, ScanStop::Damaged { offset, reason }));
            }
        };
        let payload_start = offset + RECORD_HEADER_LEN as u64;
        let end = payload_start.saturating_add(header.payload_len);
        if end > len {
            return Ok((
                records,
                ScanStop::Damaged {
                    offset,
                    reason: "journal record payload truncated",
                },
            ));
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        io.read_at(payload_start, &mut payload)?;
        match JournalRecord::decode(&header, &payload, page_size) {
            Ok(record) => records.push(ScannedRecord {
                offset,
                len: end - offset,
                compressed: header.flags & FLAG_SNAPPY != 0,
                record,
            }),
            Err(err) => {
                let reason = damage_reason(&err).ok_or(err)?;
                return Ok((records, ScanStop::Damaged { offset, reason }));
            }
        }
        offset = end;
    }
}

fn list_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
            continue;
        }
        let number = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok());
        if let Some(number) = number {
            files.push((number, path));
        }
    }
    files.sort_by_key(|(number, _)| *number);
    Ok(files)
}

/// Lists journal files and their records without modifying anything.
pub fn inspect(dir: &Path, page_size: u32) -> Result<Vec<JournalFileSummary>> {
    let mut out = Vec::new();
    for (number, path) in list_files(dir)? {
        let io = StdIoProvider.open(&path)?;
        let (records, stop) = scan_file(io.as_ref(), page_size, None)?;
        out.push(JournalFileSummary {
            number,
            bytes: io.len()?,
            path,
            records: records
                .iter()
                .map(|scanned| RecordSummary {
                    offset: scanned.offset,
                    tx: scanned.record.tx.0,
                    pages: scanned.record.page_count(),
                    bytes: scanned.len,
                    compressed: scanned.compressed,
                })
                .collect(),
            damage: match stop {
                ScanStop::End => None,
                ScanStop::Damaged { offset, reason } => Some((offset, reason)),
            },
        });
    }
    Ok(out)
}

#[derive(Debug)]
struct JournalFile {
    number: u64,
    path: PathBuf,
    last_tx: Option<TxId>,
}

/// Append position captured when a batch starts.
#[derive(Clone, Copy, Debug)]
struct BatchMark {
    file: u64,
    offset: u64,
    last_tx: Option<TxId>,
}

struct JournalState {
    files: Vec<JournalFile>,
    current: Arc<dyn FileIo>,
    append_offset: u64,
    batch: Option<BatchMark>,
    stats: JournalStats,
}

/// Append side of the write-ahead journal.
pub struct Journal {
    dir: PathBuf,
    provider: Arc<dyn IoProvider>,
    options: JournalOptions,
    state: Mutex<JournalState>,
}

impl Journal {
    /// Scans `dir` and returns the records newer than `last_flushed`.
    ///
    /// The file holding the crash point is truncated there and later files are
    /// deleted, so a repeated scan sees the same history.
    pub fn recover(
        dir: &Path,
        provider: &dyn IoProvider,
        options: &JournalOptions,
        last_flushed: TxId,
    ) -> Result<RecoveredJournal> {
        let files = list_files(dir)?;
        let mut recovered = RecoveredJournal {
            next_file_number: files.last().map(|(n, _)| n + 1).unwrap_or(1),
            ..RecoveredJournal::default()
        };
        let mut prev: Option<TxId> = None;
        for (number, path) in files {
            if recovered.crash_point.is_some() {
                debug!(file = number, "journal.recover.discard_file");
                fs::remove_file(&path)?;
                continue;
            }
            recovered.files_scanned += 1;
            let io = provider.open(&path)?;
            let (records, stop) = scan_file(io.as_ref(), options.page_size, Some(options.env_id))?;
            for scanned in records {
                let tx = scanned.record.tx;
                let discontinuous = match prev {
                    Some(prev) => tx != prev.next(),
                    None => tx > last_flushed.next(),
                };
                if discontinuous {
                    recovered.crash_point = Some(CrashPoint {
                        file_number: number,
                        offset: scanned.offset,
                        reason: "transaction id discontinuity",
                    });
                    break;
                }
                prev = Some(tx);
                if tx > last_flushed {
                    recovered.records.push(scanned.record);
                } else {
                    recovered.skipped += 1;
                }
            }
            if recovered.crash_point.is_none() {
                if let ScanStop::Damaged { offset, reason } = stop {
                    recovered.crash_point = Some(CrashPoint {
                        file_number: number,
                        offset,
                        reason,
                    });
                }
            }
            if let Some(crash) = &recovered.crash_point {
                warn!(
                    file = crash.file_number,
                    offset = crash.offset,
                    reason = crash.reason,
                    "journal.recover.crash_point"
                );
                io.set_len(crash.offset)?;
                io.sync_all()?;
            }
        }
        info!(
            records = recovered.records.len(),
            skipped = recovered.skipped,
            files = recovered.files_scanned,
            "journal.recover.complete"
        );
        Ok(recovered)
    }

    /// Starts a fresh journal in `dir`, deleting any existing journal files.
    pub fn create(
        dir: &Path,
        provider: Arc<dyn IoProvider>,
        options: JournalOptions,
        first_number: u64,
    ) -> Result<Self> {
        if options.size_limit < FILE_HEADER_LEN + RECORD_HEADER_LEN as u64 {
            return Err(TesseraError::Invalid("journal size limit too small"));
        }
        fs::create_dir_all(dir)?;
        for (number, path) in list_files(dir)? {
            debug!(file = number, "journal.create.remove_stale");
            fs::remove_file(path)?;
        }
        let number = first_number.max(1);
        let (file, io) = Self::start_file(dir, provider.as_ref(), &options, number)?;
        info!(dir = %dir.display(), file = number, "journal.create");
        Ok(Self {
            dir: dir.to_path_buf(),
            provider,
            options,
            state: Mutex::new(JournalState {
                files: vec![file],
                current: io,
                append_offset: FILE_HEADER_LEN,
                batch: None,
                stats: JournalStats {
                    files: 1,
                    current_file: number,
                    ..JournalStats::default()
                },
            }),
        })
    }

    fn start_file(
        dir: &Path,
        provider: &dyn IoProvider,
        options: &JournalOptions,
        number: u64,
    ) -> Result<(JournalFile, Arc<dyn FileIo>)> {
        let path = dir.join(journal_file_name(number));
        let io = provider.open(&path)?;
        io.set_len(0)?;
        let header = FileHeader {
            page_size: options.page_size,
            number,
            env_id: options.env_id,
        };
        io.write_at(0, &header.encode())?;
        io.sync_all()?;
        Ok((
            JournalFile {
                number,
                path,
                last_tx: None,
            },
            io,
        ))
    }

    /// Appends one record to the current file, rotating first when it would not fit.
    ///
    /// The record is not durable until [`sync`](Self::sync) returns.
    pub fn append(&self, record: &JournalRecord) -> Result<u64> {
        let bytes = record.encode(self.options.compression)?;
        let mut state = self.state.lock();
        let has_records = state.append_offset > FILE_HEADER_LEN;
        if has_records && state.append_offset + bytes.len() as u64 > self.options.size_limit {
            self.rotate(&mut state)?;
        }
        state.current.write_at(state.append_offset, &bytes)?;
        state.append_offset += bytes.len() as u64;
        if let Some(file) = state.files.last_mut() {
            file.last_tx = Some(record.tx);
        }
        state.stats.bytes_appended += bytes.len() as u64;
        state.stats.records_appended += 1;
        debug!(
            tx = record.tx.0,
            pages = record.page_count(),
            bytes = bytes.len(),
            "journal.append"
        );
        Ok(bytes.len() as u64)
    }

    fn rotate(&self, state: &mut JournalState) -> Result<()> {
        state.current.sync_all()?;
        let number = state.stats.current_file + 1;
        let (file, io) = Self::start_file(&self.dir, self.provider.as_ref(), &self.options, number)?;
        state.files.push(file);
        state.current = io;
        state.append_offset = FILE_HEADER_LEN;
        state.stats.current_file = number;
        state.stats.files = state.files.len();
        state.stats.rotations += 1;
        info!(file = number, "journal.rotate");
        Ok(())
    }

    /// Remembers the current append position as the start of a batch.
    ///
    /// [`abort_batch`](Self::abort_batch) cuts the journal back to this point;
    /// [`finish_batch`](Self::finish_batch) forgets it.
    pub fn begin_batch(&self) {
        let mut state = self.state.lock();
        let mark = BatchMark {
            file: state.stats.current_file,
            offset: state.append_offset,
            last_tx: state.files.last().and_then(|file| file.last_tx),
        };
        state.batch = Some(mark);
    }

    /// Forgets the mark set by [`begin_batch`](Self::begin_batch).
    pub fn finish_batch(&self) {
        self.state.lock().batch = None;
    }

    /// Removes everything appended since [`begin_batch`](Self::begin_batch).
    ///
    /// Files started during the batch are deleted and the file that was current
    /// at the mark is truncated back to it, so records whose sync failed are
    /// never replayed. Does nothing without a mark.
    pub fn abort_batch(&self) -> Result<()> {
        let mut state = self.state.lock();
        let Some(mark) = state.batch.take() else {
            return Ok(());
        };
        let mut reopen = false;
        while state.files.len() > 1 && state.files.last().is_some_and(|f| f.number > mark.file) {
            if let Some(file) = state.files.pop() {
                match fs::remove_file(&file.path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                debug!(file = file.number, "journal.abort_batch.remove");
                reopen = true;
            }
        }
        if reopen {
            if let Some(file) = state.files.last() {
                let number = file.number;
                state.current = self.provider.open(&file.path)?;
                state.stats.current_file = number;
            }
        }
        state.current.set_len(mark.offset)?;
        state.append_offset = mark.offset;
        if let Some(file) = state.files.last_mut() {
            file.last_tx = mark.last_tx;
        }
        state.stats.files = state.files.len();
        let current = Arc::clone(&state.current);
        drop(state);
        if let Err(err) = current.sync_all() {
            warn!(error = %err, "journal.abort_batch.sync_failed");
        }
        info!(file = mark.file, offset = mark.offset, "journal.abort_batch");
        Ok(())
    }

    /// Makes every appended record durable.
    pub fn sync(&self) -> Result<()> {
        let current = {
            let mut state = self.state.lock();
            state.stats.syncs += 1;
            Arc::clone(&state.current)
        };
        current.sync_all()
    }

    /// Drops journal content fully reflected in the data file up to `flushed`.
    ///
    /// Older files are deleted; the current file is truncated back to its header
    /// when every record in it is covered. Returns the number of files retired.
    pub fn retire_up_to(&self, flushed: TxId) -> Result<usize> {
        let mut state = self.state.lock();
        let mut retired = 0;
        while state.files.len() > 1 {
            let covered = state.files[0].last_tx.map_or(true, |tx| tx <= flushed);
            if !covered {
                break;
            }
            let file = state.files.remove(0);
            fs::remove_file(&file.path)?;
            debug!(file = file.number, "journal.retire.remove");
            retired += 1;
            // A batch that rotated before writing here restarts at the next header.
            if state.batch.is_some_and(|mark| mark.file == file.number) {
                let next = state.files[0].number;
                state.batch = Some(BatchMark {
                    file: next,
                    offset: FILE_HEADER_LEN,
                    last_tx: None,
                });
            }
        }
        let current_covered = state
            .files
            .last()
            .and_then(|file| file.last_tx)
            .is_some_and(|tx| tx <= flushed);
        if current_covered {
            state.current.set_len(FILE_HEADER_LEN)?;
            state.current.sync_all()?;
            state.append_offset = FILE_HEADER_LEN;
            let current_file = state.stats.current_file;
            if let Some(mark) = state.batch.as_mut().filter(|mark| mark.file == current_file) {
                mark.offset = FILE_HEADER_LEN;
                mark.last_tx = None;
            }
            if let Some(file) = state.files.last_mut() {
                file.last_tx = None;
                debug!(file = file.number, "journal.retire.truncate");
            }
            retired += 1;
        }
        state.stats.retired_files += retired as u64;
        state.stats.files = state.files.len();
        Ok(retired)
    }

    /// Activity counters.
    pub fn stats(&self) -> JournalStats {
        self.state.lock().stats
    }

    /// Directory holding the journal files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Configuration in effect.
    pub fn options(&self) -> &JournalOptions {
        &self.options
    }
}
