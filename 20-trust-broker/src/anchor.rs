//! The hardware trust anchor, as seen by the dispatcher.
//!
//! The daemon never interprets trust-anchor commands. It hands the payload
//! of any operation it does not serve itself to a [`TrustAnchor`] together
//! with the caller's context, and relays whatever comes back.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::trace;

use crate::context::ContextId;
use crate::error::ErrorClass;

/// Largest reply the device driver hands back in one read.
const DEVICE_BUFFER: usize = 4096;

#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("no trust anchor device is configured")]
    Unavailable,

    #[error("trust anchor device {path} failed: {source}")]
    Device {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AnchorError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Io
    }
}

pub trait TrustAnchor: Send + Sync {
    /// Runs one opaque command on behalf of `context`.
    fn execute(
        &self,
        context: ContextId,
        ordinal: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, AnchorError>;
}

/// Used when the daemon runs without a device.
pub struct UnavailableAnchor;

impl TrustAnchor for UnavailableAnchor {
    fn execute(&self, _: ContextId, _: u32, _: &[u8]) -> Result<Vec<u8>, AnchorError> {
        Err(AnchorError::Unavailable)
    }
}

/// Character-device passthrough: write the command, read the reply.
///
/// The device handles one command at a time, so calls are serialized.
pub struct DeviceAnchor {
    path: PathBuf,
    device: Mutex<File>,
}

impl DeviceAnchor {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AnchorError> {
        let path = path.as_ref().to_path_buf();
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| AnchorError::Device {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            device: Mutex::new(device),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrustAnchor for DeviceAnchor {
    fn execute(
        &self,
        context: ContextId,
        ordinal: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, AnchorError> {
        let device_err = |source| AnchorError::Device {
            path: self.path.clone(),
            source,
        };
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);

        device.write_all(payload).map_err(device_err)?;
        let mut reply = vec![0u8; DEVICE_BUFFER];
        let n = device.read(&mut reply).map_err(device_err)?;
        reply.truncate(n);

        trace!(context, ordinal, sent = payload.len(), received = n, "trust anchor command");
        Ok(reply)
    }
}
