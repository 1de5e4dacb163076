//! Store layout detection.
//!
//! Legacy files have no marker at all, so any first byte (including the
//! versioned marker value) can be the first byte of a legacy record count.
//! Detection therefore only commits to [`Layout::Versioned`] when three
//! increasingly specific pieces of evidence agree:
//!
//! 1. the first byte is [`VERSION_MARKER`];
//! 2. the following little-endian `u32` record count is non-zero;
//! 3. the next 16 bytes, the first record's handle, equal [`ROOT_HANDLE`].
//!
//! Anything else, including a prefix too short to answer a step, is Legacy.
//! A marker followed by a zero count is deliberately Legacy: it cannot be
//! told apart from a legacy file whose first bytes happen to match.

use std::io::{self, Read};

use crate::record::{HANDLE_LEN, Layout, ROOT_HANDLE, StoreReader};

/// First byte of every versioned store file.
pub const VERSION_MARKER: u8 = 0x01;

/// Bytes [`detect`] needs to see to make a full decision.
pub const DETECT_PREFIX_LEN: usize = 1 + 4 + HANDLE_LEN;

/// Classifies a store from its leading bytes.
pub fn detect(prefix: &[u8]) -> Layout {
    let mut prefix_reader = StoreReader::new(prefix, prefix.len() as u64);

    match prefix_reader.read_u8("version marker") {
        Ok(VERSION_MARKER) => {}
        _ => return Layout::Legacy,
    }
    match prefix_reader.read_u32("record count") {
        Ok(count) if count > 0 => {}
        _ => return Layout::Legacy,
    }
    match prefix_reader.read_handle("first handle") {
        Ok(first) if first == ROOT_HANDLE => Layout::Versioned,
        _ => Layout::Legacy,
    }
}

/// Reads up to [`DETECT_PREFIX_LEN`] bytes, stopping early only at end of stream.
pub fn read_prefix<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = vec![0u8; DETECT_PREFIX_LEN];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    prefix.truncate(filled);
    Ok(prefix)
}
