//! The device aggregate boundary.
//!
//! The transport layer reads a device's live operating mode, queries its
//! capabilities, and nothing else; mode is written by the status-report
//! handler when the robot pushes a status packet. The aggregate accumulates
//! domain events explicitly ([`Device::add_event`] / [`Device::drain_events`])
//! instead of inheriting an event-publishing base class.
//!
//! Live state sits behind locks because the daemon runs on a multi-threaded
//! runtime: a status handler on one task can update the mode while a
//! mode-change poll reads it from another.

use std::fmt;
use std::sync::{Mutex, RwLock};

use crate::identity::{DeviceId, DeviceSerial, UserId};

/// Device operating mode, reported asynchronously by status packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// No status has been observed yet.
    Unknown,
    /// No special mode active.
    None,
    /// Spot cleaning.
    Spot,
    /// Zone cleaning.
    Zone,
    /// Mopping.
    Mop,
}

impl Mode {
    /// Maps a wire work-mode code onto the mode set.
    ///
    /// Codes outside the known table map to [`Mode::Unknown`]; the
    /// mode-change machinery rejects `Unknown` as a target, so unrecognized
    /// codes can never be requested back.
    #[must_use]
    pub const fn from_work_mode(code: u8) -> Self {
        match code {
            0 | 4 | 5 | 10 => Self::None,
            1 | 6 | 11 => Self::Spot,
            3 | 9 => Self::Zone,
            7 | 12 => Self::Mop,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::None => "none",
            Self::Spot => "spot",
            Self::Zone => "zone",
            Self::Mop => "mop",
        };
        f.write_str(name)
    }
}

/// Optional hardware/firmware capability of a device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// The device supports persistent map plans.
    MapPlans,
    /// The device carries a water tank.
    WaterTank,
}

/// Capability set of a device model.
#[derive(Debug, Clone, Default)]
pub struct System {
    capabilities: Vec<Capability>,
}

impl System {
    /// Builds a capability set.
    #[must_use]
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// Whether the device supports `capability`.
    #[must_use]
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Domain event recorded by the aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The live mode changed.
    ModeChanged {
        /// Mode before the change.
        previous: Mode,
        /// Mode after the change.
        current: Mode,
    },
}

/// One physical robot's last-known state.
///
/// Read-mostly from the transport layer's perspective: the registry
/// associates it with a connection, the mode-change machinery reads
/// [`Device::mode`], and the status handler writes it.
#[derive(Debug)]
pub struct Device {
    id: DeviceId,
    user_id: UserId,
    serial: DeviceSerial,
    system: System,
    mode: RwLock<Mode>,
    events: Mutex<Vec<DeviceEvent>>,
}

impl Device {
    /// Builds a device aggregate with an unknown initial mode.
    #[must_use]
    pub fn new(id: DeviceId, user_id: UserId, serial: DeviceSerial, system: System) -> Self {
        Self {
            id,
            user_id,
            serial,
            system,
            mode: RwLock::new(Mode::Unknown),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Device identity.
    #[must_use]
    pub const fn id(&self) -> DeviceId {
        self.id
    }

    /// Owning user identity.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Serial number.
    #[must_use]
    pub const fn serial(&self) -> &DeviceSerial {
        &self.serial
    }

    /// Capability set.
    #[must_use]
    pub const fn system(&self) -> &System {
        &self.system
    }

    /// Current live mode.
    ///
    /// # Panics
    ///
    /// Panics if the mode lock is poisoned, which requires a prior panic
    /// while holding it.
    #[must_use]
    pub fn mode(&self) -> Mode {
        *self.mode.read().expect("mode lock poisoned")
    }

    /// Updates the live mode, recording a [`DeviceEvent::ModeChanged`] when
    /// the value actually changes.
    ///
    /// # Panics
    ///
    /// Panics if the mode lock is poisoned.
    pub fn set_mode(&self, mode: Mode) {
        let previous = {
            let mut guard = self.mode.write().expect("mode lock poisoned");
            std::mem::replace(&mut *guard, mode)
        };
        if previous != mode {
            self.add_event(DeviceEvent::ModeChanged {
                previous,
                current: mode,
            });
        }
    }

    /// Records a domain event on the aggregate.
    ///
    /// # Panics
    ///
    /// Panics if the event lock is poisoned.
    pub fn add_event(&self, event: DeviceEvent) {
        self.events.lock().expect("event lock poisoned").push(event);
    }

    /// Takes all accumulated events, leaving the aggregate empty.
    ///
    /// # Panics
    ///
    /// Panics if the event lock is poisoned.
    #[must_use]
    pub fn drain_events(&self) -> Vec<DeviceEvent> {
        std::mem::take(&mut *self.events.lock().expect("event lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new(
            DeviceId::from_raw(7),
            UserId::from_raw(1),
            DeviceSerial::new("SN-TEST-7").unwrap(),
            System::new([Capability::MapPlans]),
        )
    }

    #[test]
    fn initial_mode_is_unknown() {
        assert_eq!(device().mode(), Mode::Unknown);
    }

    #[test]
    fn set_mode_records_a_change_event() {
        let device = device();
        device.set_mode(Mode::Spot);
        device.set_mode(Mode::Spot); // no-op, no event
        device.set_mode(Mode::None);

        let events = device.drain_events();
        assert_eq!(
            events,
            vec![
                DeviceEvent::ModeChanged {
                    previous: Mode::Unknown,
                    current: Mode::Spot
                },
                DeviceEvent::ModeChanged {
                    previous: Mode::Spot,
                    current: Mode::None
                },
            ]
        );
        assert!(device.drain_events().is_empty());
    }

    #[test]
    fn capability_query() {
        let device = device();
        assert!(device.system().supports(Capability::MapPlans));
        assert!(!device.system().supports(Capability::WaterTank));
    }

    #[test]
    fn work_mode_mapping() {
        assert_eq!(Mode::from_work_mode(0), Mode::None);
        assert_eq!(Mode::from_work_mode(1), Mode::Spot);
        assert_eq!(Mode::from_work_mode(9), Mode::Zone);
        assert_eq!(Mode::from_work_mode(7), Mode::Mop);
        assert_eq!(Mode::from_work_mode(200), Mode::Unknown);
    }

    #[test]
    fn mode_display_is_lowercase() {
        assert_eq!(Mode::Spot.to_string(), "spot");
        assert_eq!(Mode::None.to_string(), "none");
    }
}
