//! In-memory key hierarchy and its on-disk encoding.
//!
//! A [`KeyStore`] is an ordered list of [`KeyRecord`]s forming a forest:
//! every record's parent is either [`ROOT_HANDLE`] or another record in the
//! same store. Loading rejects anything else, and [`KeyStore::insert`] /
//! [`KeyStore::remove`] keep it that way.
//!
//! The store does no locking of its own. Callers that share it across
//! threads go through [`crate::backing::StoreHandle`].

use std::collections::HashMap;
use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::{debug, warn};

use crate::detect::{VERSION_MARKER, detect, read_prefix};
use crate::error::ErrorClass;
use crate::record::{
    CodecError, Handle, KeyRecord, Layout, ROOT_HANDLE, StoreReader, decode_record,
    encode_record_into,
};

/// Why a store file was refused at load time.
#[derive(Debug, Error)]
pub enum CorruptReason {
    #[error("record {index} of {count}: {source}")]
    Record {
        index: u32,
        count: u32,
        #[source]
        source: CodecError,
    },

    #[error("handle {0} appears more than once")]
    DuplicateHandle(Handle),

    #[error("{handle} names parent {parent}, which is not in the store")]
    DanglingParent { handle: Handle, parent: Handle },

    #[error("parent chain starting at {0} loops back on itself")]
    Cycle(Handle),

    #[error("root key names {parent} as its parent")]
    RootKeyParent { parent: Handle },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupt key store: {0}")]
    CorruptStore(#[source] CorruptReason),

    #[error("handle {0} is already registered")]
    DuplicateHandle(Handle),

    #[error("parent {parent} of {handle} is not registered")]
    UnknownParent { handle: Handle, parent: Handle },

    #[error("handle {0} is not registered")]
    UnknownHandle(Handle),

    #[error("{handle} still has {children} dependent key(s)")]
    HasChildren { handle: Handle, children: usize },

    #[error("the root key must name the root identifier as its parent, not {parent}")]
    RootKeyParent { parent: Handle },

    #[error("record {handle} cannot be stored in the {layout} layout: {source}")]
    InvalidRecord {
        handle: Handle,
        layout: Layout,
        #[source]
        source: CodecError,
    },

    #[error("a non-empty versioned store must begin with the root key")]
    AmbiguousLayout,

    #[error("store read failed: {0}")]
    ReadFailed(#[source] io::Error),

    #[error("store write failed: {0}")]
    WriteFailed(#[source] io::Error),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::CorruptStore(CorruptReason::Record { .. }) => ErrorClass::Format,
            StoreError::CorruptStore(_) => ErrorClass::Integrity,
            StoreError::DuplicateHandle(_)
            | StoreError::UnknownParent { .. }
            | StoreError::UnknownHandle(_)
            | StoreError::HasChildren { .. }
            | StoreError::RootKeyParent { .. } => ErrorClass::Integrity,
            StoreError::InvalidRecord { .. } | StoreError::AmbiguousLayout => ErrorClass::Format,
            StoreError::ReadFailed(_) | StoreError::WriteFailed(_) => ErrorClass::Io,
        }
    }
}

/// Forest of key records plus the layout it is persisted in.
#[derive(Debug, Clone)]
pub struct KeyStore {
    layout: Layout,
    records: Vec<KeyRecord>,
    /// handle -> position in `records`
    index: HashMap<Handle, usize>,
    /// parent handle -> number of records naming it
    children: HashMap<Handle, usize>,
}

impl KeyStore {
    /// Creates an empty store that will persist in `layout`.
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            records: Vec::new(),
            index: HashMap::new(),
            children: HashMap::new(),
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in persistence order.
    pub fn records(&self) -> &[KeyRecord] {
        &self.records
    }

    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.records.iter().map(|record| record.handle)
    }

    /// Loads a store from `reader`, whose total size is `total_len` bytes.
    ///
    /// A zero-length stream is an empty legacy store.
    pub fn load<R: Read>(mut reader: R, total_len: u64) -> Result<Self, StoreError> {
        if total_len == 0 {
            debug!("empty store stream, starting with no keys");
            return Ok(Self::new(Layout::Legacy));
        }

        let prefix = read_prefix(&mut reader).map_err(StoreError::ReadFailed)?;
        let layout = detect(&prefix);
        let mut cursor = StoreReader::new(prefix.as_slice().chain(reader), total_len);

        let header = |source: CodecError| match source {
            CodecError::Io(err) => StoreError::ReadFailed(err),
            source => StoreError::CorruptStore(CorruptReason::Record {
                index: 0,
                count: 0,
                source,
            }),
        };
        if layout == Layout::Versioned {
            cursor.read_u8("version marker").map_err(header)?;
        }
        let count = cursor.read_u32("record count").map_err(header)?;

        // Never trust the count for allocation: each record needs at least a header.
        let plausible = cursor.remaining() / layout.header_len() as u64;
        let mut records = Vec::with_capacity(plausible.min(u64::from(count)) as usize);
        for index in 0..count {
            let record = decode_record(&mut cursor, layout).map_err(|source| match source {
                CodecError::Io(err) => StoreError::ReadFailed(err),
                source => StoreError::CorruptStore(CorruptReason::Record {
                    index,
                    count,
                    source,
                }),
            })?;
            records.push(record);
        }

        if cursor.remaining() > 0 {
            warn!(
                trailing = cursor.remaining(),
                "ignoring bytes after the last declared record"
            );
        }

        validate_forest(&records).map_err(StoreError::CorruptStore)?;

        let mut store = Self::new(layout);
        store.records = records;
        store.reindex();
        debug!(%layout, keys = store.len(), "loaded key store");
        Ok(store)
    }

    /// Loads a store held entirely in memory.
    pub fn load_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        Self::load(bytes, bytes.len() as u64)
    }

    /// Writes the whole store to `writer`.
    ///
    /// The encoding is built in memory first, so an unencodable store writes
    /// nothing at all.
    pub fn persist<W: Write>(&self, writer: &mut W) -> Result<(), StoreError> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes).map_err(StoreError::WriteFailed)?;
        writer.flush().map_err(StoreError::WriteFailed)
    }

    /// Encodes the store in its layout.
    ///
    /// An empty store always encodes as a legacy zero count: a versioned
    /// marker followed by zero records would be re-detected as legacy.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        if self.records.is_empty() {
            return Ok(0u32.to_le_bytes().to_vec());
        }

        let mut out = Vec::new();
        if self.layout == Layout::Versioned {
            if !self.records[0].is_root_key() {
                return Err(StoreError::AmbiguousLayout);
            }
            out.push(VERSION_MARKER);
        }
        // Bounded by u16/u32 blob fields and handle uniqueness long before u32::MAX.
        out.extend_from_slice(&(self.records.len() as u32).to_le_bytes());
        for record in &self.records {
            encode_record_into(record, self.layout, &mut out).map_err(|source| {
                StoreError::InvalidRecord {
                    handle: record.handle,
                    layout: self.layout,
                    source,
                }
            })?;
        }
        Ok(out)
    }

    pub fn lookup(&self, handle: &Handle) -> Option<&KeyRecord> {
        self.index.get(handle).map(|&position| &self.records[position])
    }

    pub fn contains(&self, handle: &Handle) -> bool {
        self.index.contains_key(handle)
    }

    /// Number of records naming `handle` as their parent.
    pub fn child_count(&self, handle: &Handle) -> usize {
        self.children.get(handle).copied().unwrap_or(0)
    }

    /// Adds a record whose parent is already present (or is the root identifier).
    ///
    /// The root key is placed first so a versioned store stays detectable.
    pub fn insert(&mut self, record: KeyRecord) -> Result<(), StoreError> {
        if self.index.contains_key(&record.handle) {
            return Err(StoreError::DuplicateHandle(record.handle));
        }
        if record.is_root_key() && !record.parent.is_root() {
            return Err(StoreError::RootKeyParent {
                parent: record.parent,
            });
        }
        if !record.parent.is_root() && !self.index.contains_key(&record.parent) {
            return Err(StoreError::UnknownParent {
                handle: record.handle,
                parent: record.parent,
            });
        }
        record
            .check_encodable(self.layout)
            .map_err(|source| StoreError::InvalidRecord {
                handle: record.handle,
                layout: self.layout,
                source,
            })?;

        if record.is_root_key() {
            self.records.insert(0, record);
            self.reindex();
        } else {
            *self.children.entry(record.parent).or_default() += 1;
            self.index.insert(record.handle, self.records.len());
            self.records.push(record);
        }
        Ok(())
    }

    /// Removes a record that no other record names as its parent.
    pub fn remove(&mut self, handle: &Handle) -> Result<KeyRecord, StoreError> {
        let Some(&position) = self.index.get(handle) else {
            return Err(StoreError::UnknownHandle(*handle));
        };
        let children = self.child_count(handle);
        if children > 0 {
            return Err(StoreError::HasChildren {
                handle: *handle,
                children,
            });
        }

        let record = self.records.remove(position);
        self.index.remove(handle);
        for (offset, moved) in self.records[position..].iter().enumerate() {
            self.index.insert(moved.handle, position + offset);
        }
        if !record.is_root_key() {
            self.release_child(&record.parent);
        }
        if self.records.is_empty() && self.layout != Layout::Legacy {
            // An empty store persists as a legacy zero count and reloads as legacy.
            debug!(from = %self.layout, "store emptied, reverting to the legacy layout");
            self.layout = Layout::Legacy;
        }
        Ok(record)
    }

    fn release_child(&mut self, parent: &Handle) {
        if let Some(count) = self.children.get_mut(parent) {
            *count -= 1;
            if *count == 0 {
                self.children.remove(parent);
            }
        }
    }

    fn reindex(&mut self) {
        self.index.clear();
        self.children.clear();
        for (position, record) in self.records.iter().enumerate() {
            self.index.insert(record.handle, position);
            if !record.is_root_key() {
                *self.children.entry(record.parent).or_default() += 1;
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    OnPath,
    Done,
}

/// Checks uniqueness, parent presence and acyclicity of a decoded record list.
fn validate_forest(records: &[KeyRecord]) -> Result<(), CorruptReason> {
    let mut index = HashMap::with_capacity(records.len());
    for (position, record) in records.iter().enumerate() {
        if index.insert(record.handle, position).is_some() {
            return Err(CorruptReason::DuplicateHandle(record.handle));
        }
    }

    for record in records {
        if record.is_root_key() {
            if !record.parent.is_root() {
                return Err(CorruptReason::RootKeyParent {
                    parent: record.parent,
                });
            }
        } else if !record.parent.is_root() && !index.contains_key(&record.parent) {
            return Err(CorruptReason::DanglingParent {
                handle: record.handle,
                parent: record.parent,
            });
        }
    }

    let mut visits = vec![Visit::New; records.len()];
    let mut path = Vec::new();
    for start in 0..records.len() {
        let mut current = start;
        loop {
            match visits[current] {
                Visit::Done => break,
                Visit::OnPath => return Err(CorruptReason::Cycle(records[current].handle)),
                Visit::New => {
                    visits[current] = Visit::OnPath;
                    path.push(current);
                    let parent = records[current].parent;
                    if parent == ROOT_HANDLE {
                        break;
                    }
                    current = index[&parent];
                }
            }
        }
        for walked in path.drain(..) {
            visits[walked] = Visit::Done;
        }
    }
    Ok(())
}
