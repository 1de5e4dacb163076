use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{
    CorruptStorePolicy, DEFAULT_DEVICE_PATH, DEFAULT_MAX_PAYLOAD, DEFAULT_MAX_THREADS,
    DEFAULT_STORE_PATH, DaemonConfig, FlushPolicy,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Trust-anchor key broker daemon", long_about = None)]
pub struct Cli {
    /// Socket address to accept client connections on.
    #[arg(long, default_value = "127.0.0.1:30003")]
    pub listen: SocketAddr,

    /// Maximum number of connections served at once; extra clients are refused.
    #[arg(long, default_value_t = DEFAULT_MAX_THREADS)]
    pub max_threads: usize,

    /// System key store file.
    #[arg(long, default_value = DEFAULT_STORE_PATH)]
    pub store: PathBuf,

    /// Largest request payload in bytes; bigger packets drop the connection.
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD)]
    pub max_packet: u32,

    /// When registry changes reach the store file.
    #[arg(long, value_enum, default_value_t = FlushPolicy::WriteThrough)]
    pub flush: FlushPolicy,

    /// What to do if the store file cannot be parsed.
    #[arg(long, value_enum, default_value_t = CorruptStorePolicy::Refuse)]
    pub on_corrupt_store: CorruptStorePolicy,

    /// Trust-anchor character device.
    #[arg(long, default_value = DEFAULT_DEVICE_PATH)]
    pub device: PathBuf,

    /// Run without a trust-anchor device; anchor commands fail.
    #[arg(long)]
    pub no_device: bool,

    /// Operation ids remote peers may issue, e.g. `0x13,0x65`.
    #[arg(long = "remote-op", value_delimiter = ',', value_parser = parse_operation)]
    pub remote_ops: Vec<u32>,

    /// Per-read timeout on client sockets in milliseconds.
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,
}

impl Cli {
    pub fn into_config(self) -> DaemonConfig {
        DaemonConfig {
            listen: self.listen,
            max_threads: self.max_threads,
            store_path: self.store,
            max_payload: self.max_packet,
            flush: self.flush,
            on_corrupt_store: self.on_corrupt_store,
            device: (!self.no_device).then_some(self.device),
            remote_ops: self.remote_ops,
            read_timeout: self.read_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Accepts decimal or `0x`-prefixed hexadecimal operation ids.
fn parse_operation(raw: &str) -> Result<u32, String> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|err| format!("invalid operation id `{raw}`: {err}"))
}
