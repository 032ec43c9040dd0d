//! Protocol error types for the packet transport layer.
//!
//! # Error classification
//!
//! - **Framing errors**: malformed or oversized frames, unknown numeric
//!   opcodes. Fatal to the connection that produced them.
//! - **Protocol errors**: a well-formed packet the server cannot honor,
//!   such as no handler under the fatal policy or an unexpected opcode on
//!   an awaited response. Fatal to the operation in progress, never
//!   silently swallowed.
//! - **Lifecycle**: `ConnectionClosed` for correlation waits cancelled by a
//!   connection teardown. Plain writes on a closed connection are NOT an
//!   error; they are a successful no-op (hardware reconnect races).

use std::io;

use thiserror::Error;
use vaclink_core::bus::BusError;
use vaclink_core::repository::RepositoryError;

/// Maximum frame size in bytes (4 MiB).
///
/// Map-data frames are the largest this protocol carries; the length prefix
/// is validated against this bound BEFORE any allocation.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Errors raised by the packet transport layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame length prefix exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Size announced by the length prefix.
        size: usize,
        /// Maximum allowed frame size.
        max: usize,
    },

    /// Frame bytes do not form a packet.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What went wrong while decoding.
        reason: String,
    },

    /// The numeric opcode is not in the protocol table.
    ///
    /// Distinct from a *known* opcode with no registered handler: an unknown
    /// code means the framer produced something that is not a packet, which
    /// is a defect, not a routing decision.
    #[error("unknown opcode 0x{code:04x}")]
    UnknownOpcode {
        /// The unrecognized wire code.
        code: u16,
    },

    /// An observed opcode has no registered handler (fatal policy).
    #[error("No event handler found for packet event '{name}'")]
    NoHandler {
        /// Opcode name that arrived unhandled.
        name: String,
    },

    /// An awaited response carried a different opcode than expected.
    #[error("unexpected response opcode '{actual}' (expected '{expected}')")]
    UnexpectedOpcode {
        /// The opcode name the exchange expected.
        expected: &'static str,
        /// The opcode name that actually arrived.
        actual: &'static str,
    },

    /// A payload is missing or mistypes a required field.
    #[error("malformed '{opcode}' payload: {reason}")]
    Payload {
        /// Opcode whose payload was malformed.
        opcode: &'static str,
        /// What was missing or wrong.
        reason: String,
    },

    /// The connection closed while an operation was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// A dispatch-bus handler failed; propagated to the publisher.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Device or connection storage failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Underlying transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Returns `true` for defects in the byte stream itself, which tear the
    /// producing connection down.
    #[must_use]
    pub const fn is_framing_defect(&self) -> bool {
        matches!(
            self,
            Self::FrameTooLarge { .. } | Self::InvalidFrame { .. } | Self::UnknownOpcode { .. }
        )
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_handler_message_matches_wire_contract() {
        let err = ProtocolError::NoHandler {
            name: "DEVICE_STATUS_REPORT_REQ".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No event handler found for packet event 'DEVICE_STATUS_REPORT_REQ'"
        );
    }

    #[test]
    fn framing_defect_classification() {
        assert!(ProtocolError::UnknownOpcode { code: 0xbeef }.is_framing_defect());
        assert!(ProtocolError::FrameTooLarge {
            size: MAX_FRAME_SIZE + 1,
            max: MAX_FRAME_SIZE
        }
        .is_framing_defect());
        assert!(!ProtocolError::ConnectionClosed.is_framing_defect());
    }
}
