//! Request framing on client connections.
//!
//! Every request is a 12-byte header followed by its payload:
//!
//! ```text
//! +--------------+----------------+------------+-----------------+
//! | operation id | payload length | context id | payload ...     |
//! |  u32 BE      |  u32 BE        |  u32 BE    | (length bytes)  |
//! +--------------+----------------+------------+-----------------+
//! ```
//!
//! Responses mirror it with a result code in place of the operation id.
//! The framer checks the declared length against its limit before touching
//! the payload, so an oversized request never gets buffered.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::error::ErrorClass;

pub const HEADER_LEN: usize = 12;

/// Initial receive buffer size; grows only up to the configured limit.
pub const INITIAL_BUFFER: usize = 1024;

/// Operations the daemon serves itself. Anything else goes to the trust anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    OpenContext,
    CloseContext,
    RegisterKey,
    UnregisterKey,
    GetRegisteredKey,
    EnumerateKeys,
    FlushStore,
    Anchor(u32),
}

impl Operation {
    pub const OPEN_CONTEXT: u32 = 0x0001;
    pub const CLOSE_CONTEXT: u32 = 0x0002;
    pub const REGISTER_KEY: u32 = 0x0010;
    pub const UNREGISTER_KEY: u32 = 0x0011;
    pub const GET_REGISTERED_KEY: u32 = 0x0012;
    pub const ENUMERATE_KEYS: u32 = 0x0013;
    pub const FLUSH_STORE: u32 = 0x0014;

    pub fn from_id(id: u32) -> Self {
        match id {
            Self::OPEN_CONTEXT => Operation::OpenContext,
            Self::CLOSE_CONTEXT => Operation::CloseContext,
            Self::REGISTER_KEY => Operation::RegisterKey,
            Self::UNREGISTER_KEY => Operation::UnregisterKey,
            Self::GET_REGISTERED_KEY => Operation::GetRegisteredKey,
            Self::ENUMERATE_KEYS => Operation::EnumerateKeys,
            Self::FLUSH_STORE => Operation::FlushStore,
            other => Operation::Anchor(other),
        }
    }

    pub fn id(self) -> u32 {
        match self {
            Operation::OpenContext => Self::OPEN_CONTEXT,
            Operation::CloseContext => Self::CLOSE_CONTEXT,
            Operation::RegisterKey => Self::REGISTER_KEY,
            Operation::UnregisterKey => Self::UNREGISTER_KEY,
            Operation::GetRegisteredKey => Self::GET_REGISTERED_KEY,
            Operation::EnumerateKeys => Self::ENUMERATE_KEYS,
            Operation::FlushStore => Self::FLUSH_STORE,
            Operation::Anchor(id) => id,
        }
    }
}

/// Status carried in the first field of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0x00,
    DuplicateHandle = 0x10,
    UnknownParent = 0x11,
    UnknownHandle = 0x12,
    HasChildren = 0x13,
    InvalidRecord = 0x14,
    BadPayload = 0x20,
    UnknownContext = 0x21,
    ContextAlreadyOpen = 0x22,
    NotPermitted = 0x23,
    StoreIo = 0x30,
    StoreFormat = 0x31,
    AnchorFailure = 0x40,
}

impl ResultCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        let code = match value {
            0x00 => ResultCode::Success,
            0x10 => ResultCode::DuplicateHandle,
            0x11 => ResultCode::UnknownParent,
            0x12 => ResultCode::UnknownHandle,
            0x13 => ResultCode::HasChildren,
            0x14 => ResultCode::InvalidRecord,
            0x20 => ResultCode::BadPayload,
            0x21 => ResultCode::UnknownContext,
            0x22 => ResultCode::ContextAlreadyOpen,
            0x23 => ResultCode::NotPermitted,
            0x30 => ResultCode::StoreIo,
            0x31 => ResultCode::StoreFormat,
            0x40 => ResultCode::AnchorFailure,
            _ => return None,
        };
        Some(code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub operation: u32,
    pub payload_len: u32,
    pub context: u32,
}

impl PacketHeader {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Self {
        let field = |at: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[at..at + 4]);
            u32::from_be_bytes(word)
        };
        Self {
            operation: field(0),
            payload_len: field(4),
            context: field(8),
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.operation.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.context.to_be_bytes());
        bytes
    }
}

/// One framed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub operation: u32,
    pub context: u32,
    pub payload: Vec<u8>,
}

impl RequestEnvelope {
    pub fn new(operation: u32, context: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            operation,
            context,
            payload: payload.into(),
        }
    }

    /// Wire form, as a client would send it.
    pub fn encode(&self) -> Vec<u8> {
        let header = PacketHeader {
            operation: self.operation,
            payload_len: self.payload.len() as u32,
            context: self.context,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub code: ResultCode,
    pub context: u32,
    pub payload: Vec<u8>,
}

impl ResponseEnvelope {
    pub fn ok(context: u32, payload: Vec<u8>) -> Self {
        Self {
            code: ResultCode::Success,
            context,
            payload,
        }
    }

    pub fn error(code: ResultCode, context: u32) -> Self {
        Self {
            code,
            context,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let header = PacketHeader {
            operation: self.code as u32,
            payload_len: self.payload.len() as u32,
            context: self.context,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Reads one complete response; used by clients.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;
        let header = PacketHeader::parse(&header);
        let code = ResultCode::from_u32(header.operation).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown result code {:#x}", header.operation),
            )
        })?;
        let mut payload = vec![0u8; header.payload_len as usize];
        reader.read_exact(&mut payload)?;
        Ok(Self {
            code,
            context: header.context,
            payload,
        })
    }
}

/// Writes a response and flushes it so the client sees it promptly.
pub fn write_response<W: Write>(writer: &mut W, response: &ResponseEnvelope) -> io::Result<()> {
    writer.write_all(&response.encode())?;
    writer.flush()
}

#[derive(Debug, Error)]
pub enum FrameError {
    /// Not enough bytes yet; call again once more arrive.
    #[error("incomplete packet")]
    IncompletePacket,

    #[error("declared payload of {declared} bytes exceeds the {max}-byte limit")]
    OversizedPacket { declared: u32, max: u32 },

    /// Peer closed the stream between packets.
    #[error("connection closed")]
    Closed,

    #[error("connection read failed: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FrameError::Io(_) | FrameError::Closed => ErrorClass::Io,
            FrameError::IncompletePacket | FrameError::OversizedPacket { .. } => {
                ErrorClass::Protocol
            }
        }
    }
}

/// Incremental reader of request envelopes.
///
/// Partial reads are kept between calls, so a caller that gets
/// [`FrameError::IncompletePacket`] simply calls again.
pub struct PacketFramer {
    max_payload: u32,
    header: [u8; HEADER_LEN],
    header_filled: usize,
    pending: Option<PacketHeader>,
    payload: Vec<u8>,
    payload_filled: usize,
}

impl PacketFramer {
    pub fn new(max_payload: u32) -> Self {
        Self {
            max_payload,
            header: [0u8; HEADER_LEN],
            header_filled: 0,
            pending: None,
            payload: Vec::with_capacity(INITIAL_BUFFER.min(max_payload as usize)),
            payload_filled: 0,
        }
    }

    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// True when no bytes of a packet are buffered.
    pub fn is_idle(&self) -> bool {
        self.header_filled == 0 && self.pending.is_none()
    }

    pub fn read_packet<R: Read>(&mut self, stream: &mut R) -> Result<RequestEnvelope, FrameError> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                let header = self.read_header(stream)?;
                if header.payload_len > self.max_payload {
                    self.reset();
                    return Err(FrameError::OversizedPacket {
                        declared: header.payload_len,
                        max: self.max_payload,
                    });
                }
                self.pending = Some(header);
                self.payload.clear();
                self.payload.resize(header.payload_len as usize, 0);
                self.payload_filled = 0;
                header
            }
        };

        while self.payload_filled < self.payload.len() {
            let n = read_some(stream, &mut self.payload[self.payload_filled..])?;
            if n == 0 {
                self.reset();
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a packet payload",
                )
                .into());
            }
            self.payload_filled += n;
            if self.payload_filled < self.payload.len() {
                return Err(FrameError::IncompletePacket);
            }
        }

        let payload = std::mem::replace(
            &mut self.payload,
            Vec::with_capacity(INITIAL_BUFFER.min(self.max_payload as usize)),
        );
        self.reset();
        Ok(RequestEnvelope {
            operation: header.operation,
            context: header.context,
            payload,
        })
    }

    fn read_header<R: Read>(&mut self, stream: &mut R) -> Result<PacketHeader, FrameError> {
        while self.header_filled < HEADER_LEN {
            let n = read_some(stream, &mut self.header[self.header_filled..])?;
            if n == 0 {
                let partial = self.header_filled > 0;
                self.reset();
                if partial {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside a packet header",
                    )
                    .into());
                }
                return Err(FrameError::Closed);
            }
            self.header_filled += n;
            if self.header_filled < HEADER_LEN {
                return Err(FrameError::IncompletePacket);
            }
        }
        Ok(PacketHeader::parse(&self.header))
    }

    fn reset(&mut self) {
        self.header_filled = 0;
        self.pending = None;
        self.payload_filled = 0;
        self.payload.clear();
    }
}

/// One read call; transient conditions surface as an incomplete packet.
fn read_some<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<usize, FrameError> {
    match stream.read(buf) {
        Ok(n) => Ok(n),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ) =>
        {
            Err(FrameError::IncompletePacket)
        }
        Err(err) => Err(err.into()),
    }
}
