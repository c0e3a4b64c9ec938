//! TFTP packet codec.
//!
//! Implements the five packet kinds of RFC 1350 with their wire layout:
//!
//! | Opcode | Name | Fields after opcode |
//! |---|---|---|
//! | 1 | RRQ | filename (NUL-terminated) + mode (NUL-terminated) |
//! | 2 | WRQ | filename (NUL-terminated) + mode (NUL-terminated) |
//! | 3 | DATA | block# (u16) + payload (0–512 bytes) |
//! | 4 | ACK | block# (u16) |
//! | 5 | ERROR | code (u16) + message (NUL-terminated) |
//!
//! All multi-byte integers are big-endian. A DATA payload shorter than
//! [`BLOCK_SIZE`] marks the final block of a transfer.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Fixed TFTP data block size in bytes.
pub const BLOCK_SIZE: usize = 512;

/// Largest possible TFTP datagram: 2-byte opcode + 2-byte block number +
/// one full data block.
pub const MAX_PACKET_SIZE: usize = 4 + BLOCK_SIZE;

/// TFTP protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Read Request (RRQ) - Opcode 1
    ReadRequest = 1,
    /// Write Request (WRQ) - Opcode 2
    WriteRequest = 2,
    /// Data block - Opcode 3
    Data = 3,
    /// Acknowledgment - Opcode 4
    Ack = 4,
    /// Error report - Opcode 5
    Error = 5,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP error codes as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Error code 0: not defined, see error message.
    Undefined = 0,
    /// Error code 1: file not found.
    FileNotFound = 1,
    /// Error code 2: access violation.
    AccessViolation = 2,
    /// Error code 3: disk full or allocation exceeded.
    DiskFull = 3,
    /// Error code 4: illegal TFTP operation.
    IllegalOperation = 4,
    /// Error code 5: unknown transfer ID.
    UnknownTransferId = 5,
    /// Error code 6: file already exists.
    FileExists = 6,
    /// Error code 7: no such user.
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Undefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileExists),
            7 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Default human-readable message for this error code.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Undefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP transfer modes.
///
/// Netascii is accepted on the wire but transferred with octet semantics;
/// no newline translation is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Binary mode, bytes transferred as-is. Mode string: "octet".
    Octet,
    /// Text mode. Mode string: "netascii". Accepted but treated as octet.
    NetAscii,
}

impl TransferMode {
    /// Case-insensitive parse of a wire mode string.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::NetAscii),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
        }
    }
}

impl FromStr for TransferMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_wire(s).ok_or_else(|| Error::Malformed(format!("invalid transfer mode: {s:?}")))
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A decoded TFTP packet. Immutable once constructed.
///
/// Block numbers are unsigned 16-bit and wrap modulo 65536.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest { filename: String, mode: TransferMode },
    WriteRequest { filename: String, mode: TransferMode },
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
}

impl Packet {
    pub fn read_request(filename: impl Into<String>, mode: TransferMode) -> Self {
        Self::ReadRequest {
            filename: filename.into(),
            mode,
        }
    }

    pub fn write_request(filename: impl Into<String>, mode: TransferMode) -> Self {
        Self::WriteRequest {
            filename: filename.into(),
            mode,
        }
    }

    pub fn data(block: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self::Data {
            block,
            payload: payload.into(),
        }
    }

    pub fn ack(block: u16) -> Self {
        Self::Ack { block }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Self::ReadRequest { .. } => Opcode::ReadRequest,
            Self::WriteRequest { .. } => Opcode::WriteRequest,
            Self::Data { .. } => Opcode::Data,
            Self::Ack { .. } => Opcode::Ack,
            Self::Error { .. } => Opcode::Error,
        }
    }

    /// Serialize this packet to its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        buf.extend_from_slice(&self.opcode().as_u16().to_be_bytes());

        match self {
            Self::ReadRequest { filename, mode } | Self::WriteRequest { filename, mode } => {
                buf.extend_from_slice(filename.as_bytes());
                buf.push(0);
                buf.extend_from_slice(mode.as_str().as_bytes());
                buf.push(0);
            }
            Self::Data { block, payload } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Self::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Self::Error { code, message } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
            }
        }

        buf
    }

    /// Parse a raw datagram into a packet.
    ///
    /// Fails with [`Error::Malformed`] when fewer than two bytes are supplied,
    /// the opcode is unrecognized, a fixed-width field cannot be fully read,
    /// or a string field is missing its NUL terminator. Never reads past the
    /// end of the buffer.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < 2 {
            return Err(Error::Malformed("packet shorter than 2 bytes".into()));
        }

        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = Opcode::from_u16(opcode)
            .ok_or_else(|| Error::Malformed(format!("unknown opcode {opcode}")))?;
        let body = &buf[2..];

        match opcode {
            Opcode::ReadRequest | Opcode::WriteRequest => {
                let (filename, rest) = take_string(body)?;
                let (mode, _) = take_string(rest)?;
                let mode = mode.parse()?;
                Ok(match opcode {
                    Opcode::ReadRequest => Packet::ReadRequest { filename, mode },
                    _ => Packet::WriteRequest { filename, mode },
                })
            }
            Opcode::Data => {
                let (block, payload) = take_u16(body)?;
                Ok(Packet::Data {
                    block,
                    payload: payload.to_vec(),
                })
            }
            Opcode::Ack => {
                let (block, _) = take_u16(body)?;
                Ok(Packet::Ack { block })
            }
            Opcode::Error => {
                let (code, rest) = take_u16(body)?;
                let code = ErrorCode::from_u16(code)
                    .ok_or_else(|| Error::Malformed(format!("unknown error code {code}")))?;
                let (message, _) = take_string(rest)?;
                Ok(Packet::Error { code, message })
            }
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadRequest { filename, mode } => write!(f, "RRQ {filename:?} {mode}"),
            Self::WriteRequest { filename, mode } => write!(f, "WRQ {filename:?} {mode}"),
            Self::Data { block, payload } => write!(f, "DATA block {block} ({} bytes)", payload.len()),
            Self::Ack { block } => write!(f, "ACK block {block}"),
            Self::Error { code, message } => write!(f, "ERROR {code}: {message}"),
        }
    }
}

/// Read a big-endian u16 off the front of `buf`.
fn take_u16(buf: &[u8]) -> Result<(u16, &[u8]), Error> {
    if buf.len() < 2 {
        return Err(Error::Malformed("truncated 16-bit field".into()));
    }
    Ok((u16::from_be_bytes([buf[0], buf[1]]), &buf[2..]))
}

/// Read a NUL-terminated UTF-8 string off the front of `buf`.
///
/// A missing terminator fails closed rather than reading to the end of the
/// buffer.
fn take_string(buf: &[u8]) -> Result<(String, &[u8]), Error> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Malformed("string field missing NUL terminator".into()))?;
    let s = std::str::from_utf8(&buf[..end])
        .map_err(|_| Error::Malformed("string field is not valid UTF-8".into()))?;
    Ok((s.to_string(), &buf[end + 1..]))
}
