//! Identity value objects carried in every protocol packet.
//!
//! Every packet carries a `(user, device)` identity pair of 32-bit values.
//! The zero value is meaningful on the wire: it is the "no identity" marker
//! used before a device has announced itself and by the stateless time-sync
//! channel.
//!
//! # The identity swap
//!
//! A response packet carries its request's identity pair with the user and
//! device values exchanged. The manufacturer protocol mandates the swap;
//! [`Identity::swapped`] preserves it exactly.

use std::fmt;

use thiserror::Error;

/// Validation failure for a value object constructor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required string field was empty or blank.
    #[error("{field} must not be empty")]
    Empty {
        /// Name of the offending field.
        field: &'static str,
    },
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    Ok(())
}

/// 32-bit user identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(u32);

impl UserId {
    /// The zero identity.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw wire value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw wire value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this is the zero identity.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 32-bit device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    /// The zero identity.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw wire value.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw wire value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this is the zero identity.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `(user, device)` identity pair carried in a packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// User identity field.
    pub user_id: UserId,
    /// Device identity field.
    pub device_id: DeviceId,
}

impl Identity {
    /// The all-zero identity pair.
    pub const ZERO: Self = Self {
        user_id: UserId::ZERO,
        device_id: DeviceId::ZERO,
    };

    /// Builds an identity pair.
    #[must_use]
    pub const fn new(user_id: UserId, device_id: DeviceId) -> Self {
        Self { user_id, device_id }
    }

    /// Returns the pair with the user and device raw values exchanged.
    ///
    /// Responses carry the request identity swapped; this is a protocol
    /// convention and is preserved verbatim.
    #[must_use]
    pub const fn swapped(self) -> Self {
        Self {
            user_id: UserId::from_raw(self.device_id.raw()),
            device_id: DeviceId::from_raw(self.user_id.raw()),
        }
    }

    /// Whether both halves are the zero identity.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.user_id.is_zero() && self.device_id.is_zero()
    }
}

/// Validated device serial number, as printed on the unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceSerial(String);

impl DeviceSerial {
    /// Builds a serial from its string form.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] for an empty or blank input.
    pub fn new(serial: impl Into<String>) -> Result<Self, ValidationError> {
        let serial = serial.into();
        require_non_empty("device serial", &serial)?;
        Ok(Self(serial))
    }

    /// The serial as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_identity_is_zero() {
        assert!(Identity::ZERO.is_zero());
        assert!(UserId::ZERO.is_zero());
        assert!(DeviceId::ZERO.is_zero());
        assert!(!DeviceId::from_raw(7).is_zero());
    }

    #[test]
    fn swap_exchanges_raw_values() {
        let identity = Identity::new(UserId::from_raw(11), DeviceId::from_raw(22));
        let swapped = identity.swapped();
        assert_eq!(swapped.user_id.raw(), 22);
        assert_eq!(swapped.device_id.raw(), 11);
        // Swapping twice restores the original.
        assert_eq!(swapped.swapped(), identity);
    }

    #[test]
    fn serial_rejects_blank_input() {
        assert!(DeviceSerial::new("CONGA-1234").is_ok());
        assert_eq!(
            DeviceSerial::new("   "),
            Err(ValidationError::Empty {
                field: "device serial"
            })
        );
        assert_eq!(
            DeviceSerial::new(""),
            Err(ValidationError::Empty {
                field: "device serial"
            })
        );
    }
}
