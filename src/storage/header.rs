use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

use crate::primitives::alloc::Extent;
use crate::primitives::io::{FileIo, IoProvider};
use crate::types::{checksum, Result, TesseraError, TxId};

const HEADER_MAGIC: [u8; 4] = *b"TSHD";
const HEADER_VERSION: u16 = 1;
const FIXED_LEN: usize = 4 + 2 + 2 + 4 + 8 * 6 + 4;

/// Appends `suffix` to the final component of `path`.
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Durable environment state written after every flush.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct EnvHeader {
    pub page_size: u32,
    pub env_id: u64,
    pub sequence: u64,
    pub last_flushed: TxId,
    pub next_page: u64,
    pub file_pages: u64,
    pub journal_next_file: u64,
    pub free: Vec<Extent>,
}

impl EnvHeader {
    fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(FIXED_LEN + self.free.len() * 16 + 4);
        buf.put_slice(&HEADER_MAGIC);
        buf.put_u16(HEADER_VERSION);
        buf.put_u16(0);
        buf.put_u32(self.page_size);
        buf.put_u64(self.env_id);
        buf.put_u64(self.sequence);
        buf.put_u64(self.last_flushed.0);
        buf.put_u64(self.next_page);
        buf.put_u64(self.file_pages);
        buf.put_u64(self.journal_next_file);
        buf.put_u32(self.free.len() as u32);
        for extent in &self.free {
            buf.put_u64(extent.start);
            buf.put_u64(extent.len);
        }
        buf.put_u32(0);
        checksum::seal_trailer(&mut buf);
        buf.to_vec()
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FIXED_LEN + 4 {
            return Err(TesseraError::Corruption("header truncated"));
        }
        let mut cur = checksum::verify_trailer(src, "environment header")?;
        if cur[..4] != HEADER_MAGIC {
            return Err(TesseraError::Corruption("header magic mismatch"));
        }
        cur.advance(4);
        if cur.get_u16() != HEADER_VERSION {
            return Err(TesseraError::Corruption("unsupported header version"));
        }
        cur.advance(2);
        let page_size = cur.get_u32();
        let env_id = cur.get_u64();
        let sequence = cur.get_u64();
        let last_flushed = TxId(cur.get_u64());
        let next_page = cur.get_u64();
        let file_pages = cur.get_u64();
        let journal_next_file = cur.get_u64();
        let count = cur.get_u32() as usize;
        if cur.remaining() != count * 16 {
            return Err(TesseraError::Corruption("header extent list length"));
        }
        let mut free = Vec::with_capacity(count);
        for _ in 0..count {
            free.push(Extent {
                start: cur.get_u64(),
                len: cur.get_u64(),
            });
        }
        Ok(Self {
            page_size,
            env_id,
            sequence,
            last_flushed,
            next_page,
            file_pages,
            journal_next_file,
            free,
        })
    }
}

/// Two alternating header copies; a torn write only ever damages the older one.
pub(crate) struct HeaderStore {
    copies: [Arc<dyn FileIo>; 2],
    active: Option<usize>,
    sequence: u64,
}

impl HeaderStore {
    /// Opens both copies and returns the newest valid header, if any.
    pub fn open(base: &Path, provider: &dyn IoProvider) -> Result<(Self, Option<EnvHeader>)> {
        let copies = [
            provider.open(&sibling(base, "-header.one"))?,
            provider.open(&sibling(base, "-header.two"))?,
        ];
        let mut best: Option<(usize, EnvHeader)> = None;
        for (idx, io) in copies.iter().enumerate() {
            let len = io.len()?;
            if len == 0 {
                continue;
            }
            let mut buf = vec![0u8; len as usize];
            io.read_at(0, &mut buf)?;
            match EnvHeader::decode(&buf) {
                Ok(header) => {
                    if best.as_ref().map_or(true, |(_, b)| header.sequence > b.sequence) {
                        best = Some((idx, header));
                    }
                }
                Err(err) => warn!(copy = idx, error = %err, "header.copy.invalid"),
            }
        }
        let store = Self {
            copies,
            active: best.as_ref().map(|(idx, _)| *idx),
            sequence: best.as_ref().map(|(_, h)| h.sequence).unwrap_or(0),
        };
        Ok((store, best.map(|(_, header)| header)))
    }

    /// Writes `header` to the inactive copy and syncs it.
    pub fn write(&mut self, header: &mut EnvHeader) -> Result<()> {
        let target = match self.active {
            Some(idx) => 1 - idx,
            None => 0,
        };
        header.sequence = self.sequence + 1;
        let bytes = header.encode();
        let io = &self.copies[target];
        io.write_at(0, &bytes)?;
        io.set_len(bytes.len() as u64)?;
        io.sync_all()?;
        self.active = Some(target);
        self.sequence = header.sequence;
        debug!(
            copy = target,
            sequence = header.sequence,
            last_flushed = header.last_flushed.0,
            "header.write"
        );
        Ok(())
    }
}
