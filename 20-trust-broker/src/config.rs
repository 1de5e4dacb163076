//! Runtime configuration for the daemon.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;

pub const DEFAULT_PORT: u16 = 30003;
pub const DEFAULT_MAX_THREADS: usize = 10;
pub const DEFAULT_STORE_PATH: &str = "/var/lib/tpm/system.data";
pub const DEFAULT_DEVICE_PATH: &str = "/dev/tpm0";
/// Largest request payload accepted before the connection is dropped.
pub const DEFAULT_MAX_PAYLOAD: u32 = 64 * 1024;

/// When the in-memory store is written back to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FlushPolicy {
    /// Persist after every successful mutation.
    #[default]
    WriteThrough,
    /// Persist on an explicit flush request and at shutdown.
    Explicit,
}

/// What to do when the store file on disk cannot be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CorruptStorePolicy {
    /// Exit with the load error.
    #[default]
    Refuse,
    /// Start from an empty store; the file is overwritten on the next persist.
    Empty,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen: SocketAddr,
    /// Upper bound on concurrently served connections.
    pub max_threads: usize,
    pub store_path: PathBuf,
    pub max_payload: u32,
    pub flush: FlushPolicy,
    pub on_corrupt_store: CorruptStorePolicy,
    /// Trust-anchor character device; `None` answers every command with a failure.
    pub device: Option<PathBuf>,
    /// Operation ids non-local peers may issue.
    pub remote_ops: Vec<u32>,
    /// Per-read timeout on client sockets. `None` blocks until data or close.
    pub read_timeout: Option<Duration>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_threads: DEFAULT_MAX_THREADS,
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            max_payload: DEFAULT_MAX_PAYLOAD,
            flush: FlushPolicy::default(),
            on_corrupt_store: CorruptStorePolicy::default(),
            device: Some(PathBuf::from(DEFAULT_DEVICE_PATH)),
            remote_ops: Vec::new(),
            read_timeout: None,
        }
    }
}

impl DaemonConfig {
    /// Settings the dispatcher needs at request time.
    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            max_threads: self.max_threads,
            max_payload: self.max_payload,
            remote_ops: self.remote_ops.clone(),
            read_timeout: self.read_timeout,
        }
    }
}

/// Subset of [`DaemonConfig`] owned by the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_threads: usize,
    pub max_payload: u32,
    pub remote_ops: Vec<u32>,
    pub read_timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DaemonConfig::default().dispatch()
    }
}
