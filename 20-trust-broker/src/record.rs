//! Key record codec for the persistent store.
//!
//! A record is a fixed header followed by its blobs. The header layout
//! depends on the store's [`Layout`]:
//!
//! | field         | Legacy | Versioned |
//! |---------------|--------|-----------|
//! | handle        | 16     | 16        |
//! | parent handle | 16     | 16        |
//! | public size   | u16    | u16       |
//! | private size  | u16    | u16       |
//! | vendor size   | -      | u32       |
//! | cache flags   | u16    | u16       |
//!
//! Blobs follow in the order public, private, vendor. Every integer is
//! little-endian.
//!
//! Decoding goes through [`StoreReader`], a cursor that knows the stated
//! total size of the stream and refuses to read past it, so a corrupted
//! length field can never trigger an oversized allocation.

use std::fmt;
use std::io::{self, Read};

use thiserror::Error;

use crate::error::ErrorClass;

/// Width of a key handle in bytes.
pub const HANDLE_LEN: usize = 16;

/// Reserved handle naming the top of the hierarchy.
///
/// This is the well-known storage root key UUID. The record carrying this
/// handle, when present, is the storage root key itself.
pub const ROOT_HANDLE: Handle = Handle([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

/// Fixed-size opaque identifier naming one key record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(pub [u8; HANDLE_LEN]);

impl Handle {
    pub const fn new(bytes: [u8; HANDLE_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a handle from a slice that must be exactly [`HANDLE_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; HANDLE_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; HANDLE_LEN] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        *self == ROOT_HANDLE
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({self})")
    }
}

/// On-disk layout of a store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Version 0: no marker byte, no vendor blob.
    Legacy,
    /// Version 1: leading marker byte, 32-bit vendor blob length.
    Versioned,
}

impl Layout {
    /// Size of one record header in this layout.
    pub const fn header_len(self) -> usize {
        match self {
            Layout::Legacy => 2 * HANDLE_LEN + 3 * 2,
            Layout::Versioned => 2 * HANDLE_LEN + 3 * 2 + 4,
        }
    }

    pub const fn version(self) -> u8 {
        match self {
            Layout::Legacy => 0,
            Layout::Versioned => 1,
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Legacy => f.write_str("legacy (v0)"),
            Layout::Versioned => f.write_str("versioned (v1)"),
        }
    }
}

/// One entry in the persistent key hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub handle: Handle,
    pub parent: Handle,
    pub public_blob: Vec<u8>,
    pub private_blob: Vec<u8>,
    /// Only representable in [`Layout::Versioned`] stores.
    pub vendor_blob: Vec<u8>,
    /// Opaque to the store; passed through unmodified.
    pub cache_flags: u16,
}

impl KeyRecord {
    /// Creates a record with empty blobs.
    pub fn new(handle: Handle, parent: Handle) -> Self {
        Self {
            handle,
            parent,
            public_blob: Vec::new(),
            private_blob: Vec::new(),
            vendor_blob: Vec::new(),
            cache_flags: 0,
        }
    }

    pub fn with_public(mut self, blob: impl Into<Vec<u8>>) -> Self {
        self.public_blob = blob.into();
        self
    }

    pub fn with_private(mut self, blob: impl Into<Vec<u8>>) -> Self {
        self.private_blob = blob.into();
        self
    }

    pub fn with_vendor(mut self, blob: impl Into<Vec<u8>>) -> Self {
        self.vendor_blob = blob.into();
        self
    }

    pub fn with_cache_flags(mut self, flags: u16) -> Self {
        self.cache_flags = flags;
        self
    }

    /// True for the storage root key record.
    pub fn is_root_key(&self) -> bool {
        self.handle.is_root()
    }

    /// Number of bytes [`encode_record`] produces for this record.
    pub fn encoded_len(&self, layout: Layout) -> usize {
        let vendor = match layout {
            Layout::Legacy => 0,
            Layout::Versioned => self.vendor_blob.len(),
        };
        layout.header_len() + self.public_blob.len() + self.private_blob.len() + vendor
    }

    /// Checks that every blob fits its length field in `layout`.
    pub fn check_encodable(&self, layout: Layout) -> Result<(), CodecError> {
        blob_len_u16("public blob", &self.public_blob)?;
        blob_len_u16("private blob", &self.private_blob)?;
        match layout {
            Layout::Legacy if !self.vendor_blob.is_empty() => {
                Err(CodecError::VendorBlobUnsupported {
                    len: self.vendor_blob.len(),
                })
            }
            Layout::Legacy => Ok(()),
            Layout::Versioned => blob_len_u32("vendor blob", &self.vendor_blob).map(|_| ()),
        }
    }
}

/// Failures while decoding or encoding a single record.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated record: {field} needs {needed} bytes but only {available} remain")]
    TruncatedRecord {
        field: &'static str,
        needed: u64,
        available: u64,
    },

    #[error("{field} declares {declared} bytes at offset {position}, past the {total}-byte stream")]
    SizeOverflow {
        field: &'static str,
        declared: u64,
        position: u64,
        total: u64,
    },

    #[error("{field} is {len} bytes, too long for its {width}-bit length field")]
    BlobTooLarge {
        field: &'static str,
        len: usize,
        width: u8,
    },

    #[error("legacy layout cannot carry a {len}-byte vendor blob")]
    VendorBlobUnsupported { len: usize },

    #[error("store read failed: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CodecError::Io(_) => ErrorClass::Io,
            _ => ErrorClass::Format,
        }
    }
}

/// Read cursor over a store stream with a stated total size.
///
/// Tracks how many bytes have been consumed and rejects any read that would
/// cross the stated end, whether or not the underlying reader could supply
/// more.
pub struct StoreReader<R> {
    inner: R,
    position: u64,
    total: u64,
}

impl<R: Read> StoreReader<R> {
    pub fn new(inner: R, total: u64) -> Self {
        Self {
            inner,
            position: 0,
            total,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.position)
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        let mut buf = [0u8; 1];
        self.fill(field, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        let mut buf = [0u8; 2];
        self.fill(field, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        let mut buf = [0u8; 4];
        self.fill(field, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_handle(&mut self, field: &'static str) -> Result<Handle, CodecError> {
        let mut buf = [0u8; HANDLE_LEN];
        self.fill(field, &mut buf)?;
        Ok(Handle(buf))
    }

    /// Reads a blob whose length came from the stream itself.
    ///
    /// The declared length is checked against the stated total before any
    /// buffer is allocated.
    pub fn read_blob(&mut self, field: &'static str, declared: u64) -> Result<Vec<u8>, CodecError> {
        if declared > self.remaining() {
            return Err(CodecError::SizeOverflow {
                field,
                declared,
                position: self.position,
                total: self.total,
            });
        }
        let mut blob = vec![0u8; declared as usize];
        self.fill(field, &mut blob)?;
        Ok(blob)
    }

    fn fill(&mut self, field: &'static str, buf: &mut [u8]) -> Result<(), CodecError> {
        let needed = buf.len() as u64;
        if needed > self.remaining() {
            return Err(CodecError::TruncatedRecord {
                field,
                needed,
                available: self.remaining(),
            });
        }

        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(CodecError::TruncatedRecord {
                        field,
                        needed,
                        available: filled as u64,
                    });
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        self.position += needed;
        Ok(())
    }
}

/// Decodes one record in `layout` from the cursor.
pub fn decode_record<R: Read>(
    reader: &mut StoreReader<R>,
    layout: Layout,
) -> Result<KeyRecord, CodecError> {
    let handle = reader.read_handle("handle")?;
    let parent = reader.read_handle("parent handle")?;
    let public_size = reader.read_u16("public size")?;
    let private_size = reader.read_u16("private size")?;
    let vendor_size = match layout {
        Layout::Legacy => 0,
        Layout::Versioned => reader.read_u32("vendor size")?,
    };
    let cache_flags = reader.read_u16("cache flags")?;

    let public_blob = reader.read_blob("public blob", u64::from(public_size))?;
    let private_blob = reader.read_blob("private blob", u64::from(private_size))?;
    let vendor_blob = match layout {
        Layout::Legacy => Vec::new(),
        Layout::Versioned => reader.read_blob("vendor blob", u64::from(vendor_size))?,
    };

    Ok(KeyRecord {
        handle,
        parent,
        public_blob,
        private_blob,
        vendor_blob,
        cache_flags,
    })
}

/// Encodes one record in `layout`.
pub fn encode_record(record: &KeyRecord, layout: Layout) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(record.encoded_len(layout));
    encode_record_into(record, layout, &mut out)?;
    Ok(out)
}

/// Appends the encoding of `record` to `out`.
///
/// Length fields are recomputed from the blobs actually present. Nothing is
/// appended when the record does not fit the layout.
pub fn encode_record_into(
    record: &KeyRecord,
    layout: Layout,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    record.check_encodable(layout)?;
    let public_size = blob_len_u16("public blob", &record.public_blob)?;
    let private_size = blob_len_u16("private blob", &record.private_blob)?;

    out.extend_from_slice(record.handle.as_bytes());
    out.extend_from_slice(record.parent.as_bytes());
    out.extend_from_slice(&public_size.to_le_bytes());
    out.extend_from_slice(&private_size.to_le_bytes());
    if layout == Layout::Versioned {
        let vendor_size = blob_len_u32("vendor blob", &record.vendor_blob)?;
        out.extend_from_slice(&vendor_size.to_le_bytes());
    }
    out.extend_from_slice(&record.cache_flags.to_le_bytes());

    out.extend_from_slice(&record.public_blob);
    out.extend_from_slice(&record.private_blob);
    if layout == Layout::Versioned {
        out.extend_from_slice(&record.vendor_blob);
    }
    Ok(())
}

fn blob_len_u16(field: &'static str, blob: &[u8]) -> Result<u16, CodecError> {
    u16::try_from(blob.len()).map_err(|_| CodecError::BlobTooLarge {
        field,
        len: blob.len(),
        width: 16,
    })
}

fn blob_len_u32(field: &'static str, blob: &[u8]) -> Result<u32, CodecError> {
    u32::try_from(blob.len()).map_err(|_| CodecError::BlobTooLarge {
        field,
        len: blob.len(),
        width: 32,
    })
}
