//! Client connection streams.
//!
//! The dispatcher only needs a byte stream it can read and write, a way to
//! force that stream closed from another thread during shutdown, and enough
//! about the peer to label logs and apply the remote-operation allow-list.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// Forces a connection closed, unblocking any thread reading from it.
pub trait Closer: Send + Sync {
    fn close(&self);
}

pub trait Connection: Read + Write + Send + 'static {
    fn closer(&self) -> io::Result<Box<dyn Closer>>;

    /// Peer name for diagnostics.
    fn peer_label(&self) -> String;

    /// True when the peer runs on this machine.
    fn is_local(&self) -> bool;

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Closer for TcpStream {
    fn close(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

impl Connection for TcpStream {
    fn closer(&self) -> io::Result<Box<dyn Closer>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn peer_label(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown peer".to_string())
    }

    fn is_local(&self) -> bool {
        self.peer_addr()
            .map(|addr| addr.ip().to_canonical().is_loopback())
            .unwrap_or(false)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}
