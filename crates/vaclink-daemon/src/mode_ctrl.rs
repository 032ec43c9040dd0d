//! Mode-change orchestration.
//!
//! Changing a robot's operating mode is a two-phase affair: a per-target
//! command exchange the robot acknowledges immediately, then a bounded poll
//! on the device's live mode, because the robot only *reports* the new mode
//! in a later status packet. The acknowledgement's opcode is asserted; a
//! mismatched response is a protocol error, not a silent success.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::debug;
use vaclink_core::device::{Capability, Device, Mode};
use vaclink_core::waiter::{wait_for, WaitOptions, WaitTimeout, DEFAULT_INTERVAL};

use crate::protocol::{Connection, Opcode, ProtocolError};

/// Default bound on the post-acknowledgement mode poll.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Map-info mask bit requesting spot-clean positioning.
const MASK_SPOT: u32 = 0x200;
/// Map-info mask bit requesting zone-clean geometry.
const MASK_ZONE: u32 = 0x100;
/// Wire mode code the robot understands as mopping.
const WORK_MODE_MOP: u8 = 7;

/// Mode-change failure.
#[derive(Debug, Error)]
pub enum ModeChangeError {
    /// The requested target mode cannot be commanded.
    #[error("cannot request a change to mode '{0}'")]
    UnsupportedTarget(Mode),

    /// The robot acknowledged but never reported the new mode in time.
    #[error("Unable to change device mode from '{from}' to '{to}'")]
    Timeout {
        /// Mode at the start of the change.
        from: Mode,
        /// Requested target mode.
        to: Mode,
        /// The elapsed poll bound.
        #[source]
        source: WaitTimeout,
    },

    /// The command exchange itself failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Mode-change driver with a configurable poll cadence.
#[derive(Debug, Clone, Copy)]
pub struct ModeControl {
    timeout: Duration,
    interval: Duration,
}

impl Default for ModeControl {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl ModeControl {
    /// Creates a driver with the default cadence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the overall poll bound.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the mode poll interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Drives `device` on `connection` into `target` mode.
    ///
    /// A device already in the target mode is an immediate success with no
    /// wire traffic.
    ///
    /// # Errors
    ///
    /// Returns [`ModeChangeError::UnsupportedTarget`] for [`Mode::Unknown`],
    /// [`ModeChangeError::Timeout`] when the robot never reports the new
    /// mode, and [`ModeChangeError::Protocol`] for exchange failures.
    pub async fn change_mode(
        &self,
        connection: &Arc<Connection>,
        device: &Arc<Device>,
        target: Mode,
    ) -> Result<(), ModeChangeError> {
        if target == Mode::Unknown {
            return Err(ModeChangeError::UnsupportedTarget(target));
        }

        let from = device.mode();
        if from == target {
            debug!(device = %device.id(), mode = %target, "device already in target mode");
            return Ok(());
        }

        match target {
            Mode::Unknown => unreachable!("rejected before any exchange"),
            Mode::None => {
                exchange(
                    connection,
                    Opcode::DeviceAutoCleanReq,
                    json!({ "ctrlValue": 0, "cleanType": 2 }),
                    Opcode::DeviceAutoCleanRsp,
                )
                .await?;
            }
            Mode::Spot => {
                exchange(
                    connection,
                    Opcode::DeviceMapGlobalInfoReq,
                    json!({ "mask": map_mask(device) | MASK_SPOT }),
                    Opcode::DeviceMapGlobalInfoRsp,
                )
                .await?;
            }
            Mode::Zone => {
                exchange(
                    connection,
                    Opcode::DeviceAreaCleanReq,
                    json!({ "ctrlValue": 0 }),
                    Opcode::DeviceAreaCleanRsp,
                )
                .await?;
                exchange(
                    connection,
                    Opcode::DeviceMapGlobalInfoReq,
                    json!({ "mask": map_mask(device) | MASK_ZONE }),
                    Opcode::DeviceMapGlobalInfoRsp,
                )
                .await?;
            }
            Mode::Mop => {
                exchange(
                    connection,
                    Opcode::DeviceModeCtrlReq,
                    json!({ "mode": WORK_MODE_MOP }),
                    Opcode::DeviceModeCtrlRsp,
                )
                .await?;
            }
        }

        let options = WaitOptions::default()
            .with_interval(self.interval)
            .with_timeout(self.timeout);
        wait_for(|| device.mode() == target, options)
            .await
            .map_err(|source| ModeChangeError::Timeout {
                from,
                to: target,
                source,
            })?;

        debug!(device = %device.id(), %from, to = %target, "mode change observed");
        Ok(())
    }
}

/// One command exchange: send, await the correlated response, assert its
/// opcode.
async fn exchange(
    connection: &Arc<Connection>,
    request: Opcode,
    body: serde_json::Value,
    ack: Opcode,
) -> Result<(), ModeChangeError> {
    let message = connection.send_and_wait(request, body).await?;
    let actual = message.packet.payload.opcode;
    if actual != ack {
        return Err(ProtocolError::UnexpectedOpcode {
            expected: ack.name(),
            actual: actual.name(),
        }
        .into());
    }
    Ok(())
}

/// Base map-info mask; devices with persistent map plans get the wider one.
fn map_mask(device: &Device) -> u32 {
    if device.system().supports(Capability::MapPlans) {
        0x78ff
    } else {
        0xff
    }
}

#[cfg(test)]
mod tests {
    use vaclink_core::device::System;
    use vaclink_core::identity::{DeviceId, DeviceSerial, UserId};

    use super::*;

    fn device(capabilities: impl IntoIterator<Item = Capability>) -> Device {
        Device::new(
            DeviceId::from_raw(5),
            UserId::from_raw(2),
            DeviceSerial::new("SN-5").unwrap(),
            System::new(capabilities),
        )
    }

    #[test]
    fn map_mask_widens_with_map_plans() {
        assert_eq!(map_mask(&device([Capability::MapPlans])), 0x78ff);
        assert_eq!(map_mask(&device([])), 0xff);
    }

    #[test]
    fn timeout_message_names_both_modes() {
        let err = ModeChangeError::Timeout {
            from: Mode::None,
            to: Mode::Spot,
            source: WaitTimeout {
                timeout: DEFAULT_TIMEOUT,
            },
        };
        assert_eq!(
            err.to_string(),
            "Unable to change device mode from 'none' to 'spot'"
        );
    }

    #[test]
    fn unknown_target_is_rejected_in_display_form() {
        let err = ModeChangeError::UnsupportedTarget(Mode::Unknown);
        assert_eq!(err.to_string(), "cannot request a change to mode 'unknown'");
    }
}
