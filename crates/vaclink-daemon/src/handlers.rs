//! Business handlers on the opcode-name channel.
//!
//! [`register_handlers`] wires everything a running daemon needs on the
//! dispatch bus: the online handshake, heartbeats, status reports, and
//! debug-level sinks for the response opcodes the mode-change machinery
//! awaits on the token channel. Under the fatal unhandled-opcode policy
//! every opcode a robot is known to send must have a handler here.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use vaclink_core::bus::DynError;
use vaclink_core::device::Mode;
use vaclink_core::identity::DeviceSerial;
use vaclink_core::repository::DeviceRepository;

use crate::protocol::{Opcode, PacketBus, PacketMessage, ProtocolError};

/// Result code for a successful response payload.
pub const RESULT_OK: i64 = 0;
/// Result code for an online request naming an unregistered serial.
pub const RESULT_UNREGISTERED_DEVICE: i64 = 12_002;

/// Registers the daemon's standard handler set on `bus`.
pub fn register_handlers(bus: &PacketBus, devices: Arc<dyn DeviceRepository>) {
    bus.on(Opcode::ClientOnlineReq, {
        let devices = Arc::clone(&devices);
        move |message| {
            let devices = Arc::clone(&devices);
            async move { handle_client_online(message, devices).await }
        }
    });

    bus.on(Opcode::ClientHeartbeatReq, |message| async move {
        handle_heartbeat(message).await
    });

    bus.on(Opcode::DeviceStatusReportReq, |message| async move {
        handle_status_report(message).await
    });

    // The mode-change machinery consumes these on the token channel; the
    // name channel still needs a registration under the fatal policy.
    for opcode in [
        Opcode::DeviceAutoCleanRsp,
        Opcode::DeviceAreaCleanRsp,
        Opcode::DeviceModeCtrlRsp,
        Opcode::DeviceMapGlobalInfoRsp,
    ] {
        bus.on(opcode, move |message| async move {
            debug!(
                opcode = %message.packet.payload.opcode,
                sequence = message.packet.sequence,
                "acknowledgement observed"
            );
            Ok(())
        });
    }
}

/// Online handshake: look the serial up, accept or reject.
async fn handle_client_online(
    message: PacketMessage,
    devices: Arc<dyn DeviceRepository>,
) -> Result<(), DynError> {
    let serial_field = require_str(&message, "deviceSerialNumber")?;
    let serial = DeviceSerial::new(serial_field).map_err(|e| {
        Box::new(ProtocolError::Payload {
            opcode: Opcode::ClientOnlineReq.name(),
            reason: e.to_string(),
        }) as DynError
    })?;

    let body = match devices.find_one_by_serial(&serial).await? {
        Some(device) => {
            info!(device = %device.id(), serial = %serial, "device online");
            json!({ "result": RESULT_OK })
        }
        None => {
            warn!(serial = %serial, "online request from unregistered device");
            json!({
                "result": RESULT_UNREGISTERED_DEVICE,
                "reason": format!("No registered device found with serial number '{serial}'"),
            })
        }
    };

    message
        .connection
        .respond(Opcode::ClientOnlineRsp, body, &message.packet)
        .await?;
    Ok(())
}

async fn handle_heartbeat(message: PacketMessage) -> Result<(), DynError> {
    message
        .connection
        .respond(
            Opcode::ClientHeartbeatRsp,
            json!({ "result": RESULT_OK }),
            &message.packet,
        )
        .await?;
    Ok(())
}

/// Status report: fold the pushed work mode into the associated device's
/// live state, then acknowledge.
async fn handle_status_report(message: PacketMessage) -> Result<(), DynError> {
    let work_mode = require_u64(&message, "workMode")?;
    let mode = Mode::from_work_mode(u8::try_from(work_mode).unwrap_or(u8::MAX));

    match message.connection.device() {
        Some(device) => {
            device.set_mode(mode);
            debug!(device = %device.id(), %mode, "status report applied");
        }
        None => debug!("status report on a connection with no device association"),
    }

    message
        .connection
        .respond(
            Opcode::DeviceStatusReportRsp,
            json!({ "result": RESULT_OK }),
            &message.packet,
        )
        .await?;
    Ok(())
}

fn require_str<'a>(message: &'a PacketMessage, field: &'static str) -> Result<&'a str, DynError> {
    message.packet.payload.data[field]
        .as_str()
        .ok_or_else(|| missing_field(message, field))
}

fn require_u64(message: &PacketMessage, field: &'static str) -> Result<u64, DynError> {
    message.packet.payload.data[field]
        .as_u64()
        .ok_or_else(|| missing_field(message, field))
}

fn missing_field(message: &PacketMessage, field: &'static str) -> DynError {
    let observed = match &message.packet.payload.data {
        Value::Null => "an empty body".to_string(),
        data => format!("body {data}"),
    };
    Box::new(ProtocolError::Payload {
        opcode: message.packet.payload.opcode.name(),
        reason: format!("missing or mistyped field '{field}' in {observed}"),
    })
}

#[cfg(test)]
mod tests {
    use vaclink_core::repository::InMemoryDeviceRepository;

    use super::*;

    #[test]
    fn handler_registration_covers_inbound_opcodes() {
        let bus = PacketBus::new();
        register_handlers(&bus, Arc::new(InMemoryDeviceRepository::new()));

        for opcode in [
            Opcode::ClientOnlineReq,
            Opcode::ClientHeartbeatReq,
            Opcode::DeviceStatusReportReq,
            Opcode::DeviceAutoCleanRsp,
            Opcode::DeviceAreaCleanRsp,
            Opcode::DeviceModeCtrlRsp,
            Opcode::DeviceMapGlobalInfoRsp,
        ] {
            assert_eq!(bus.listener_count(opcode), 1, "{opcode} uncovered");
        }
        assert_eq!(bus.listener_count(Opcode::ClientOnlineRsp), 0);
    }
}
