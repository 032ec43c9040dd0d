//! Packet transport and correlation layer.
//!
//! The submodules follow the life of a packet: bytes become [`Packet`]s in
//! [`framing`], travel on a [`connection::Connection`], are routed by the
//! [`server`] registry, and fan out on the [`bus::PacketBus`].

pub mod bus;
pub mod connection;
pub mod error;
pub mod framing;
pub mod packet;
pub mod server;

pub use bus::{PacketBus, PacketMessage, UnhandledPolicy};
pub use connection::Connection;
pub use error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};
pub use framing::PacketCodec;
pub use packet::{ChannelKind, Opcode, Packet, Payload};
pub use server::{BoundPorts, ProtocolServer, ServerConfig};
