//! vaclink-daemon - robot vacuum gateway daemon library.
//!
//! Server side of the binary TCP protocol cloud-connected robot vacuums
//! speak: packet transport, request/response correlation, and the device
//! orchestration built on top of it.
//!
//! # Modules
//!
//! - [`protocol`]: framing, connections, the listener registry, and the
//!   dual-channel dispatch bus
//! - [`handlers`]: business handlers on the opcode-name channel
//! - [`mode_ctrl`]: mode-change orchestration (command exchange plus the
//!   bounded status poll)

pub mod handlers;
pub mod mode_ctrl;
pub mod protocol;
