//! Packet model: opcodes, payloads, and the request/response construction
//! rules.
//!
//! A packet is one framed protocol message: a channel type byte, a flow
//! counter (response depth), the `(user, device)` identity pair, a
//! process-unique correlation sequence, and a payload made of a symbolic
//! opcode plus a decoded data document.
//!
//! Construction rules:
//!
//! - [`Packet::request`] draws a fresh sequence from a process-global
//!   monotonic counter.
//! - [`Packet::response_to`] echoes the request's sequence, increments the
//!   flow counter, and swaps the identity pair (protocol convention).

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use vaclink_core::identity::{DeviceId, Identity, UserId};

/// Channel a connection was accepted on; fixes the packet `ctype` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Command channel (default port 4010).
    Command,
    /// Map-data channel (default port 4030).
    Map,
    /// Stateless time-sync channel (default port 4050).
    TimeSync,
}

impl ChannelKind {
    /// Wire `ctype` value for this channel.
    #[must_use]
    pub const fn ctype(self) -> u8 {
        match self {
            Self::Command => 0x01,
            Self::Map => 0x02,
            Self::TimeSync => 0x03,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Command => "command",
            Self::Map => "map",
            Self::TimeSync => "time-sync",
        };
        f.write_str(name)
    }
}

macro_rules! opcodes {
    ($($variant:ident = ($code:expr, $name:literal)),* $(,)?) => {
        /// Symbolic and numeric identifier of a payload's meaning.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $(
                #[doc = $name]
                $variant,
            )*
        }

        impl Opcode {
            /// Numeric wire code.
            #[must_use]
            pub const fn code(self) -> u16 {
                match self {
                    $(Self::$variant => $code,)*
                }
            }

            /// Symbolic name used as the dispatch channel.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            /// Resolves a numeric wire code.
            #[must_use]
            pub const fn from_code(code: u16) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    ClientOnlineReq = (0x0001, "CLIENT_ONLINE_REQ"),
    ClientOnlineRsp = (0x0002, "CLIENT_ONLINE_RSP"),
    ClientHeartbeatReq = (0x0003, "CLIENT_HEARTBEAT_REQ"),
    ClientHeartbeatRsp = (0x0004, "CLIENT_HEARTBEAT_RSP"),
    DeviceTimeSyncRsp = (0x0006, "DEVICE_TIME_SYNC_RSP"),
    DeviceStatusReportReq = (0x0010, "DEVICE_STATUS_REPORT_REQ"),
    DeviceStatusReportRsp = (0x0011, "DEVICE_STATUS_REPORT_RSP"),
    DeviceAutoCleanReq = (0x0020, "DEVICE_AUTO_CLEAN_REQ"),
    DeviceAutoCleanRsp = (0x0021, "DEVICE_AUTO_CLEAN_RSP"),
    DeviceAreaCleanReq = (0x0022, "DEVICE_AREA_CLEAN_REQ"),
    DeviceAreaCleanRsp = (0x0023, "DEVICE_AREA_CLEAN_RSP"),
    DeviceModeCtrlReq = (0x0024, "DEVICE_MODE_CTRL_REQ"),
    DeviceModeCtrlRsp = (0x0025, "DEVICE_MODE_CTRL_RSP"),
    DeviceMapGlobalInfoReq = (0x0030, "DEVICE_MAP_GLOBAL_INFO_REQ"),
    DeviceMapGlobalInfoRsp = (0x0031, "DEVICE_MAP_GLOBAL_INFO_RSP"),
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Opcode plus the schema-decoded body.
///
/// The body rides as a JSON document; payload schema internals are owned by
/// the framer boundary and never inspected by the correlation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// What the body means.
    pub opcode: Opcode,
    /// Decoded structured content; `Value::Null` for an empty body.
    pub data: Value,
}

/// Process-global monotonic correlation sequence.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Channel type byte.
    pub ctype: u8,
    /// Response depth counter, incremented per response.
    pub flow: u8,
    /// User identity field.
    pub user_id: UserId,
    /// Device identity field.
    pub device_id: DeviceId,
    /// Correlation token, unique per process for requests.
    pub sequence: u64,
    /// Opcode and decoded body.
    pub payload: Payload,
}

impl Packet {
    /// Builds a fresh request packet with a new correlation sequence.
    #[must_use]
    pub fn request(channel: ChannelKind, opcode: Opcode, data: Value, identity: Identity) -> Self {
        Self {
            ctype: channel.ctype(),
            flow: 0,
            user_id: identity.user_id,
            device_id: identity.device_id,
            sequence: next_sequence(),
            payload: Payload { opcode, data },
        }
    }

    /// Builds the response to this packet.
    ///
    /// The identity pair is swapped (protocol convention), the flow counter
    /// advances, and the correlation sequence is preserved so the peer can
    /// match the response to its request.
    #[must_use]
    pub fn response_to(&self, opcode: Opcode, data: Value) -> Self {
        let swapped = self.identity().swapped();
        Self {
            ctype: self.ctype,
            flow: self.flow.wrapping_add(1),
            user_id: swapped.user_id,
            device_id: swapped.device_id,
            sequence: self.sequence,
            payload: Payload { opcode, data },
        }
    }

    /// The identity pair carried in the header.
    #[must_use]
    pub const fn identity(&self) -> Identity {
        Identity::new(self.user_id, self.device_id)
    }
}
