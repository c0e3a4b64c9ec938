//! Error taxonomy for the crate.

use crate::protocol::{ErrorCode, Packet};

/// Errors produced by TFTP transfers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer reported an error over the wire. The code and message are
    /// surfaced verbatim.
    #[error("peer reported {code}: {message}")]
    Protocol { code: ErrorCode, message: String },

    /// The retry budget was exhausted waiting for a qualifying packet.
    #[error("timed out after {attempts} attempts")]
    Timeout { attempts: u32 },

    /// A datagram could not be decoded.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The caller cancelled the transfer between blocks.
    #[error("transfer cancelled")]
    Cancelled,

    /// A local socket or filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Construct a locally-detected policy error carrying a protocol code.
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// The wire representation of this failure, if it has one.
    ///
    /// Policy errors keep their code; everything else maps to `Undefined`
    /// with the display text as the message. Returns `None` for failures
    /// that must not be reported to the peer.
    pub fn to_packet(&self) -> Option<Packet> {
        match self {
            Self::Protocol { code, message } => Some(Packet::error(*code, message.clone())),
            Self::Io(e) => Some(Packet::error(ErrorCode::Undefined, e.to_string())),
            Self::Timeout { .. } | Self::Malformed(_) | Self::Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_error_keeps_its_code() {
        let err = Error::protocol(ErrorCode::FileExists, "File already exists");
        match err.to_packet() {
            Some(Packet::Error { code, message }) => {
                assert_eq!(code, ErrorCode::FileExists);
                assert_eq!(message, "File already exists");
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn timeout_has_no_wire_form() {
        assert!(Error::Timeout { attempts: 5 }.to_packet().is_none());
        assert!(Error::Cancelled.to_packet().is_none());
    }
}
