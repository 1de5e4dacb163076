//! Error taxonomy shared by every component.
//!
//! Each module keeps its own error enum; [`ErrorClass`] is the coarse
//! category the dispatcher uses to decide between failing one request,
//! closing one connection, or refusing to start.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The store file cannot be read or written in its layout.
    Format,
    /// Cycle, dangling parent, duplicate handle, or a removal that would orphan keys.
    Integrity,
    /// Malformed or oversized packet; the offending connection is closed.
    Protocol,
    /// Pool full or shutting down; the connection is refused.
    Capacity,
    /// Underlying stream failure.
    Io,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Format => "format",
            ErrorClass::Integrity => "integrity",
            ErrorClass::Protocol => "protocol",
            ErrorClass::Capacity => "capacity",
            ErrorClass::Io => "io",
        };
        f.write_str(name)
    }
}
