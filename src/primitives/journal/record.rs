#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use crate::primitives::alloc::{AllocDelta, Extent};
use crate::types::{checksum, PageNumber, Result, TesseraError, TxId};

/// Magic bytes opening every record header.
pub const RECORD_MAGIC: [u8; 4] = *b"TSRC";
/// Encoded size of a record header.
pub const RECORD_HEADER_LEN: usize = 40;
/// Flag bit set when the payload is snappy-compressed.
pub const FLAG_SNAPPY: u32 = 1;

mod layout {
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const FLAGS: Range<usize> = 4..8;
    pub const TX_ID: Range<usize> = 8..16;
    pub const PAGE_COUNT: Range<usize> = 16..20;
    pub const PAYLOAD_LEN: Range<usize> = 24..32;
    pub const PAYLOAD_CRC32: Range<usize> = 32..36;
    pub const HEADER_CRC32: Range<usize> = 36..40;
}

/// Page image carried by a record.
#[derive(Clone, Debug)]
pub struct JournalPage {
    /// First page of the image.
    pub page: PageNumber,
    /// Run length in pages.
    pub pages: u32,
    /// Full image, `pages * page_size` bytes.
    pub data: Arc<[u8]>,
}

/// Everything one committed transaction changed.
#[derive(Clone, Debug)]
pub struct JournalRecord {
    /// Committing transaction.
    pub tx: TxId,
    /// Allocator changes made by the transaction.
    pub delta: AllocDelta,
    /// Dirty page images.
    pub pages: Vec<JournalPage>,
}

impl JournalRecord {
    /// Total pages carried, counting every page of an overflow run.
    pub fn page_count(&self) -> u32 {
        self.pages.iter().map(|p| p.pages).sum()
    }

    /// Serializes header and payload, compressing the payload when it helps.
    pub fn encode(&self, compress: bool) -> Result<Vec<u8>> {
        let raw = self.encode_payload();
        let (flags, payload) = if compress {
            let packed = snap::raw::Encoder::new()
                .compress_vec(&raw)
                .map_err(|_| TesseraError::Invalid("journal payload compression failed"))?;
            if packed.len() < raw.len() {
                (FLAG_SNAPPY, packed)
            } else {
                (0, raw)
            }
        } else {
            (0, raw)
        };
        let header = RecordHeader {
            flags,
            tx: self.tx,
            page_count: self.page_count(),
            payload_len: payload.len() as u64,
            payload_crc32: checksum::crc32(&payload),
        };
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn encode_payload(&self) -> Vec<u8> {
        let data_len: usize = self.pages.iter().map(|p| p.data.len() + 12).sum();
        let extents = self.delta.freed.len() + self.delta.reused.len();
        let mut buf = BytesMut::with_capacity(28 + extents * 16 + data_len);
        buf.put_u64(self.delta.next_page);
        buf.put_u64(self.delta.file_pages);
        buf.put_u32(self.delta.freed.len() as u32);
        buf.put_u32(self.delta.reused.len() as u32);
        buf.put_u32(self.pages.len() as u32);
        for extent in self.delta.freed.iter().chain(self.delta.reused.iter()) {
            buf.put_u64(extent.start);
            buf.put_u64(extent.len);
        }
        for page in &self.pages {
            buf.put_u64(page.page.0);
            buf.put_u32(page.pages);
            buf.put_slice(&page.data);
        }
        buf.to_vec()
    }

    /// Rebuilds a record from a verified header and its raw payload bytes.
    pub(crate) fn decode(header: &RecordHeader, stored: &[u8], page_size: u32) -> Result<Self> {
        checksum::verify(stored, header.payload_crc32, "journal record payload")?;
        let inflated;
        let mut src: &[u8] = if header.flags & FLAG_SNAPPY != 0 {
            inflated = snap::raw::Decoder::new()
                .decompress_vec(stored)
                .map_err(|_| TesseraError::Corruption("journal payload does not decompress"))?;
            inflated.as_slice()
        } else {
            stored
        };
        let next_page = take_u64(&mut src)?;
        let file_pages = take_u64(&mut src)?;
        let freed_count = take_u32(&mut src)? as usize;
        let reused_count = take_u32(&mut src)? as usize;
        let entry_count = take_u32(&mut src)? as usize;
        let mut extents = Vec::with_capacity((freed_count + reused_count).min(4096));
        for _ in 0..freed_count + reused_count {
            let start = take_u64(&mut src)?;
            let len = take_u64(&mut src)?;
            extents.push(Extent { start, len });
        }
        let reused = extents.split_off(freed_count);
        let mut pages = Vec::with_capacity(entry_count.min(4096));
        for _ in 0..entry_count {
            let page = PageNumber(take_u64(&mut src)?);
            let run = take_u32(&mut src)?;
            let len = (run as usize)
                .checked_mul(page_size as usize)
                .filter(|len| *len <= src.remaining())
                .ok_or(TesseraError::Corruption("journal page image truncated"))?;
            let data: Arc<[u8]> = Arc::from(&src[..len]);
            src.advance(len);
            pages.push(JournalPage {
                page,
                pages: run,
                data,
            });
        }
        if src.has_remaining() {
            return Err(TesseraError::Corruption("journal payload has trailing bytes"));
        }
        let record = JournalRecord {
            tx: header.tx,
            delta: AllocDelta {
                next_page,
                file_pages,
                freed: extents,
                reused,
            },
            pages,
        };
        if record.page_count() != header.page_count {
            return Err(TesseraError::Corruption("journal page count mismatch"));
        }
        Ok(record)
    }
}

fn take_u64(src: &mut &[u8]) -> Result<u64> {
    if src.remaining() < 8 {
        return Err(TesseraError::Corruption("journal payload truncated"));
    }
    Ok(src.get_u64())
}

fn take_u32(src: &mut &[u8]) -> Result<u32> {
    if src.remaining() < 4 {
        return Err(TesseraError::Corruption("journal payload truncated"));
    }
    Ok(src.get_u32())
}

/// Fixed-size header preceding each record payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub flags: u32,
    pub tx: TxId,
    pub page_count: u32,
    pub payload_len: u64,
    pub payload_crc32: u32,
}

impl RecordHeader {
    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        buf[layout::MAGIC].copy_from_slice(&RECORD_MAGIC);
        buf[layout::FLAGS].copy_from_slice(&self.flags.to_be_bytes());
        buf[layout::TX_ID].copy_from_slice(&self.tx.0.to_be_bytes());
        buf[layout::PAGE_COUNT].copy_from_slice(&self.page_count.to_be_bytes());
        buf[layout::PAYLOAD_LEN].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[layout::PAYLOAD_CRC32].copy_from_slice(&self.payload_crc32.to_be_bytes());
        checksum::seal_trailer(&mut buf);
        buf
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < RECORD_HEADER_LEN {
            return Err(TesseraError::Corruption("journal record header truncated"));
        }
        if src[layout::MAGIC] != RECORD_MAGIC {
            return Err(TesseraError::ChecksumMismatch("journal record magic"));
        }
        let body = checksum::verify_trailer(&src[..RECORD_HEADER_LEN], "journal record header")?;
        let mut fields = &body[layout::FLAGS.start..];
        let flags = fields.get_u32();
        let tx = TxId(fields.get_u64());
        let page_count = fields.get_u32();
        fields.advance(4);
        let payload_len = fields.get_u64();
        let payload_crc32 = fields.get_u32();
        Ok(Self {
            flags,
            tx,
            page_count,
            payload_len,
            payload_crc32,
        })
    }
}
