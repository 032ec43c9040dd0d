//! Wire framing: the boundary between the byte stream and typed packets.
//!
//! Frames are length-prefixed, little-endian, with a fixed 24-byte header:
//!
//! ```text
//! +--------+-------+------+-----------+---------+----------+--------+------+
//! | len u32| ctype | flow | device u32| user u32| seq u64  | op u16 | body |
//! +--------+-------+------+-----------+---------+----------+--------+------+
//! ```
//!
//! `len` counts the whole frame including itself. The body is the decoded
//! payload document in JSON form; an absent body decodes to `Value::Null`.
//! The length prefix is validated against [`MAX_FRAME_SIZE`] before any
//! allocation. An unrecognized numeric opcode is a fatal decode error for
//! the connection, as is any header that cannot be parsed.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use vaclink_core::identity::{DeviceId, UserId};

use super::error::{ProtocolError, MAX_FRAME_SIZE};
use super::packet::{Opcode, Packet, Payload};

/// Fixed header size: length prefix through opcode.
const HEADER_SIZE: usize = 4 + 1 + 1 + 4 + 4 + 8 + 2;

/// Length-prefixed packet codec.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl PacketCodec {
    /// Creates a codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let frame_len = u32::from_le_bytes(len_bytes) as usize;

        if frame_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: MAX_FRAME_SIZE,
            });
        }
        if frame_len < HEADER_SIZE {
            return Err(ProtocolError::InvalidFrame {
                reason: format!("frame length {frame_len} is shorter than the {HEADER_SIZE}-byte header"),
            });
        }
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(4);
        let ctype = frame.get_u8();
        let flow = frame.get_u8();
        let device_id = DeviceId::from_raw(frame.get_u32_le());
        let user_id = UserId::from_raw(frame.get_u32_le());
        let sequence = frame.get_u64_le();
        let code = frame.get_u16_le();

        let opcode =
            Opcode::from_code(code).ok_or(ProtocolError::UnknownOpcode { code })?;

        let data = if frame.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&frame).map_err(|e| ProtocolError::InvalidFrame {
                reason: format!("undecodable '{}' body: {e}", opcode.name()),
            })?
        };

        Ok(Some(Packet {
            ctype,
            flow,
            user_id,
            device_id,
            sequence,
            payload: Payload { opcode, data },
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = match &packet.payload.data {
            Value::Null => Vec::new(),
            data => serde_json::to_vec(data).map_err(|e| ProtocolError::InvalidFrame {
                reason: format!("unencodable '{}' body: {e}", packet.payload.opcode.name()),
            })?,
        };

        let frame_len = HEADER_SIZE + body.len();
        if frame_len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(frame_len);
        dst.put_u32_le(u32::try_from(frame_len).map_err(|_| ProtocolError::FrameTooLarge {
            size: frame_len,
            max: MAX_FRAME_SIZE,
        })?);
        dst.put_u8(packet.ctype);
        dst.put_u8(packet.flow);
        dst.put_u32_le(packet.device_id.raw());
        dst.put_u32_le(packet.user_id.raw());
        dst.put_u64_le(packet.sequence);
        dst.put_u16_le(packet.payload.opcode.code());
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use vaclink_core::identity::Identity;

    use super::*;
    use crate::protocol::packet::ChannelKind;

    fn encode(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        PacketCodec::new().encode(packet.clone(), &mut buf).unwrap();
        buf
    }

    #[test]
    fn frames_survive_the_codec() {
        let packet = Packet::request(
            ChannelKind::Command,
            Opcode::ClientOnlineReq,
            json!({ "deviceSerialNumber": "SN-42" }),
            Identity::ZERO,
        );
        let mut buf = encode(&packet);
        let decoded = PacketCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let packet = Packet::request(
            ChannelKind::Map,
            Opcode::DeviceMapGlobalInfoReq,
            json!({ "mask": 0x78ff }),
            Identity::ZERO,
        );
        let full = encode(&packet);

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(PacketCodec::new().decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        assert!(PacketCodec::new().decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn oversized_length_prefix_is_rejected_before_buffering() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(u32::try_from(MAX_FRAME_SIZE + 1).unwrap());
        let err = PacketCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn unknown_opcode_is_a_fatal_decode_error() {
        let packet = Packet::request(
            ChannelKind::Command,
            Opcode::ClientHeartbeatReq,
            Value::Null,
            Identity::ZERO,
        );
        let mut buf = encode(&packet);
        // Corrupt the opcode field (offset 22).
        buf[22] = 0xfe;
        buf[23] = 0xff;
        let err = PacketCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOpcode { code: 0xfffe }));
    }

    #[test]
    fn short_header_is_invalid() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(10);
        let err = PacketCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFrame { .. }));
    }
}
