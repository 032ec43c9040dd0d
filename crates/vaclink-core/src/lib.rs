//! Shared domain model and async primitives for the vaclink protocol server.
//!
//! This crate carries everything the transport layer consumes but does not
//! own:
//!
//! - [`identity`]: validated identity value objects carried in every packet
//! - [`device`]: the device aggregate boundary (live mode, capability query,
//!   domain events)
//! - [`repository`]: async lookup/persistence seams with in-memory backends
//! - [`bus`]: the generic named publish/subscribe bus
//! - [`waiter`]: a bounded poll-until-condition primitive
//!
//! The wire protocol itself (packets, framing, connections) lives in
//! `vaclink-daemon`.

pub mod bus;
pub mod device;
pub mod identity;
pub mod repository;
pub mod waiter;

pub use bus::{BusError, EventBus, HandlerId};
pub use device::{Capability, Device, DeviceEvent, Mode, System};
pub use identity::{DeviceId, DeviceSerial, Identity, UserId, ValidationError};
pub use repository::{
    ConnectionRecord, ConnectionStore, DeviceRepository, InMemoryConnectionStore,
    InMemoryDeviceRepository, RepositoryError,
};
pub use waiter::{wait_for, WaitOptions, WaitTimeout};
