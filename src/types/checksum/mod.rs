#![forbid(unsafe_code)]

//! CRC32 framing for the on-disk structures.
//!
//! Headers (the environment header, journal file headers and journal record
//! headers) end in a big-endian CRC32 of every byte before it. Record payloads
//! carry their CRC32 in the record header instead.

use super::{Result, TesseraError};

/// Length of the CRC32 trailer.
pub const TRAILER_LEN: usize = 4;

/// CRC32 (IEEE) of `bytes`.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Fills the last [`TRAILER_LEN`] bytes of `frame` with the CRC32 of the rest.
pub fn seal_trailer(frame: &mut [u8]) {
    debug_assert!(frame.len() >= TRAILER_LEN);
    let (body, trailer) = frame.split_at_mut(frame.len() - TRAILER_LEN);
    trailer.copy_from_slice(&crc32(body).to_be_bytes());
}

/// Checks the CRC32 trailer of `frame` and returns the bytes it covers.
///
/// `what` names the structure in the mismatch error.
pub fn verify_trailer<'a>(frame: &'a [u8], what: &'static str) -> Result<&'a [u8]> {
    if frame.len() < TRAILER_LEN {
        return Err(TesseraError::Corruption("checksummed frame truncated"));
    }
    let (body, trailer) = frame.split_at(frame.len() - TRAILER_LEN);
    let mut stored = [0u8; TRAILER_LEN];
    stored.copy_from_slice(trailer);
    verify(body, u32::from_be_bytes(stored), what)?;
    Ok(body)
}

/// Checks `bytes` against a CRC32 stored elsewhere.
pub fn verify(bytes: &[u8], expected: u32, what: &'static str) -> Result<()> {
    if crc32(bytes) != expected {
        return Err(TesseraError::ChecksumMismatch(what));
    }
    Ok(())
}
