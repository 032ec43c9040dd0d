//! One accepted socket and its send/respond/await API.
//!
//! A [`Connection`] owns the write half of a framed TCP stream; the read
//! half is returned to the registry, which runs the per-connection read
//! task. The device association is replaceable and set only by the
//! registry during identity reconciliation.
//!
//! # Closed-connection writes
//!
//! Robots reconnect abruptly; a command handler racing a reconnect must not
//! blow up because its write lost. `send`/`respond` on a connection whose
//! socket is gone are therefore silent no-op successes. Correlation waits
//! are different: a wait that can never resolve is a leak, so
//! `send_and_wait` on a closed connection fails fast with
//! [`ProtocolError::ConnectionClosed`], and [`Connection::close`] cancels
//! every outstanding wait the same way.

use std::sync::{Arc, Mutex, RwLock};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;
use uuid::Uuid;
use vaclink_core::device::Device;
use vaclink_core::identity::Identity;

use super::bus::{PacketBus, PacketMessage};
use super::error::{ProtocolError, ProtocolResult};
use super::framing::PacketCodec;
use super::packet::{ChannelKind, Opcode, Packet};

/// Read half of a connection's framed stream, consumed by the registry.
pub type PacketStream = SplitStream<Framed<TcpStream, PacketCodec>>;

type PacketSink = SplitSink<Framed<TcpStream, PacketCodec>, Packet>;

/// Wrapper around one live device socket.
pub struct Connection {
    id: Uuid,
    channel: ChannelKind,
    bus: Arc<PacketBus>,
    writer: tokio::sync::Mutex<Option<PacketSink>>,
    device: RwLock<Option<Arc<Device>>>,
    pending: Mutex<Vec<u64>>,
}

impl Connection {
    /// Wraps an accepted socket, returning the connection and the read half
    /// of its packet stream.
    #[must_use]
    pub fn from_stream(
        stream: TcpStream,
        channel: ChannelKind,
        bus: Arc<PacketBus>,
    ) -> (Arc<Self>, PacketStream) {
        let (sink, packets) = Framed::new(stream, PacketCodec::new()).split();
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            channel,
            bus,
            writer: tokio::sync::Mutex::new(Some(sink)),
            device: RwLock::new(None),
            pending: Mutex::new(Vec::new()),
        });
        (connection, packets)
    }

    /// Generated connection identity.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Channel this connection was accepted on.
    #[must_use]
    pub const fn channel(&self) -> ChannelKind {
        self.channel
    }

    /// Currently associated device, if any.
    ///
    /// # Panics
    ///
    /// Panics if the device lock is poisoned.
    #[must_use]
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.read().expect("device lock poisoned").clone()
    }

    /// Replaces the device association. Registry-only mutation.
    ///
    /// # Panics
    ///
    /// Panics if the device lock is poisoned.
    pub fn set_device(&self, device: Option<Arc<Device>>) {
        *self.device.write().expect("device lock poisoned") = device;
    }

    /// Identity pair for outbound requests: the associated device's, or the
    /// zero identity before any association exists.
    fn identity(&self) -> Identity {
        self.device()
            .map_or(Identity::ZERO, |device| {
                Identity::new(device.user_id(), device.id())
            })
    }

    /// Whether the underlying socket is still live.
    pub async fn is_open(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Builds and writes a fresh request packet.
    ///
    /// A closed socket is a silent no-op success.
    ///
    /// # Errors
    ///
    /// Returns an I/O error only for a failed write on a live socket.
    pub async fn send(&self, opcode: Opcode, data: Value) -> ProtocolResult<()> {
        let packet = Packet::request(self.channel, opcode, data, self.identity());
        self.write(packet).await.map(|_| ())
    }

    /// Builds and writes the response to `original`.
    ///
    /// Identity swap, flow increment, and sequence echo are the packet
    /// model's concern ([`Packet::response_to`]). A closed socket is a
    /// silent no-op success.
    ///
    /// # Errors
    ///
    /// Returns an I/O error only for a failed write on a live socket.
    pub async fn respond(&self, opcode: Opcode, data: Value, original: &Packet) -> ProtocolResult<()> {
        self.write(original.response_to(opcode, data)).await.map(|_| ())
    }

    /// Sends a fresh request and awaits the inbound packet that carries its
    /// correlation token.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ConnectionClosed`] when the socket is
    /// already gone or closes before the response arrives.
    pub async fn send_and_wait(&self, opcode: Opcode, data: Value) -> ProtocolResult<PacketMessage> {
        let packet = Packet::request(self.channel, opcode, data, self.identity());
        self.write_and_wait(packet).await
    }

    /// Sends the response to `original` and awaits the packet echoing the
    /// same correlation token back.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ConnectionClosed`] when the socket is
    /// already gone or closes before the follow-up arrives.
    pub async fn respond_and_wait(
        &self,
        opcode: Opcode,
        data: Value,
        original: &Packet,
    ) -> ProtocolResult<PacketMessage> {
        self.write_and_wait(original.response_to(opcode, data)).await
    }

    /// Ends the underlying socket and cancels outstanding correlation
    /// waits. Idempotent; closing a closed connection is a no-op.
    pub async fn close(&self) {
        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                debug!(connection = %self.id, error = %e, "socket close failed");
            }
        }
        let pending = std::mem::take(&mut *self.pending.lock().expect("pending lock poisoned"));
        for sequence in pending {
            self.bus.cancel_token(sequence);
        }
    }

    /// Writes `packet`, reporting whether bytes actually left.
    async fn write(&self, packet: Packet) -> ProtocolResult<bool> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            None => {
                debug!(
                    connection = %self.id,
                    opcode = %packet.payload.opcode,
                    "skipped write on closed connection"
                );
                Ok(false)
            }
            Some(sink) => {
                sink.send(packet).await?;
                Ok(true)
            }
        }
    }

    async fn write_and_wait(&self, packet: Packet) -> ProtocolResult<PacketMessage> {
        let sequence = packet.sequence;

        // The waiter must exist before the bytes leave; a fast responder's
        // reply can be published before this task resumes.
        let receiver = self.bus.subscribe_token(sequence);
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .push(sequence);

        let written = match self.write(packet).await {
            Ok(written) => written,
            Err(e) => {
                self.forget_pending(sequence);
                self.bus.cancel_token(sequence);
                return Err(e);
            }
        };
        if !written {
            // The socket was gone before the request existed on the wire;
            // nothing can ever resolve this token.
            self.forget_pending(sequence);
            self.bus.cancel_token(sequence);
            return Err(ProtocolError::ConnectionClosed);
        }

        let message = receiver
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.forget_pending(sequence);
        Ok(message)
    }

    fn forget_pending(&self, sequence: u64) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .retain(|s| *s != sequence);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn writes_on_a_closed_connection_are_silent_no_ops() {
        let (server, _client) = connected_pair().await;
        let bus = Arc::new(PacketBus::new());
        let (connection, _packets) = Connection::from_stream(server, ChannelKind::Command, bus);

        connection.close().await;
        assert!(!connection.is_open().await);

        connection
            .send(Opcode::ClientHeartbeatReq, Value::Null)
            .await
            .unwrap();

        let original = Packet::request(
            ChannelKind::Command,
            Opcode::ClientOnlineReq,
            json!({ "deviceSerialNumber": "SN-1" }),
            Identity::ZERO,
        );
        connection
            .respond(Opcode::ClientOnlineRsp, json!({ "result": 0 }), &original)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (server, _client) = connected_pair().await;
        let bus = Arc::new(PacketBus::new());
        let (connection, _packets) = Connection::from_stream(server, ChannelKind::Command, bus);
        connection.close().await;
        connection.close().await;
    }

    #[tokio::test]
    async fn send_and_wait_on_a_closed_connection_fails_fast() {
        let (server, _client) = connected_pair().await;
        let bus = Arc::new(PacketBus::new());
        let (connection, _packets) = Connection::from_stream(server, ChannelKind::Command, bus);

        connection.close().await;
        let err = connection
            .send_and_wait(Opcode::DeviceAutoCleanReq, json!({ "ctrlValue": 0 }))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn respond_and_wait_on_a_closed_connection_fails_fast() {
        let (server, _client) = connected_pair().await;
        let bus = Arc::new(PacketBus::new());
        let (connection, _packets) = Connection::from_stream(server, ChannelKind::Command, bus);

        connection.close().await;
        let original = Packet::request(
            ChannelKind::Command,
            Opcode::DeviceStatusReportReq,
            json!({ "workMode": 1 }),
            Identity::ZERO,
        );
        let err = connection
            .respond_and_wait(
                Opcode::DeviceStatusReportRsp,
                json!({ "result": 0 }),
                &original,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn respond_and_wait_resolves_with_the_echoed_sequence() {
        let (server, client) = connected_pair().await;
        let bus = Arc::new(PacketBus::new());
        let (connection, mut packets) =
            Connection::from_stream(server, ChannelKind::Command, Arc::clone(&bus));

        let original = Packet::request(
            ChannelKind::Command,
            Opcode::DeviceStatusReportReq,
            json!({ "workMode": 1 }),
            Identity::ZERO,
        );
        let sequence = original.sequence;

        // Peer follows the response up with a packet carrying the same
        // sequence.
        let peer = tokio::spawn(async move {
            let mut framed = Framed::new(client, PacketCodec::new());
            let response = framed.next().await.unwrap().unwrap();
            assert_eq!(response.sequence, sequence);
            assert_eq!(response.payload.opcode, Opcode::DeviceStatusReportRsp);
            let follow_up =
                response.response_to(Opcode::DeviceStatusReportReq, json!({ "workMode": 1 }));
            framed.send(follow_up).await.unwrap();
        });

        // Registry-equivalent read loop: resolve tokens as packets arrive.
        let read_loop = {
            let bus = Arc::clone(&bus);
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                while let Some(Ok(packet)) = packets.next().await {
                    let sequence = packet.sequence;
                    bus.resolve_token(
                        sequence,
                        PacketMessage {
                            packet,
                            connection: Arc::clone(&connection),
                        },
                    );
                }
            })
        };

        let message = connection
            .respond_and_wait(
                Opcode::DeviceStatusReportRsp,
                json!({ "result": 0 }),
                &original,
            )
            .await
            .unwrap();
        assert_eq!(message.packet.sequence, sequence);
        assert_eq!(message.packet.payload.opcode, Opcode::DeviceStatusReportReq);

        peer.await.unwrap();
        read_loop.abort();
    }

    #[tokio::test]
    async fn close_cancels_an_outstanding_wait() {
        let (server, client) = connected_pair().await;
        let bus = Arc::new(PacketBus::new());
        let (connection, _packets) =
            Connection::from_stream(server, ChannelKind::Command, Arc::clone(&bus));

        let waiting = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection
                    .send_and_wait(Opcode::DeviceAutoCleanReq, json!({ "ctrlValue": 0 }))
                    .await
            })
        };

        // Let the request hit the wire, then tear the connection down.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        connection.close().await;

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
        drop(client);
    }

    #[tokio::test]
    async fn send_and_wait_resolves_with_the_matching_token() {
        let (server, client) = connected_pair().await;
        let bus = Arc::new(PacketBus::new());
        let (connection, mut packets) =
            Connection::from_stream(server, ChannelKind::Command, Arc::clone(&bus));

        // Peer answers the request, echoing its sequence.
        let peer = tokio::spawn(async move {
            let mut framed = Framed::new(client, PacketCodec::new());
            let request = framed.next().await.unwrap().unwrap();
            let response = request.response_to(Opcode::DeviceAutoCleanRsp, json!({ "result": 0 }));
            framed.send(response).await.unwrap();
            framed
        });

        // Registry-equivalent read loop: resolve tokens as packets arrive.
        let read_loop = {
            let bus = Arc::clone(&bus);
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                while let Some(Ok(packet)) = packets.next().await {
                    let sequence = packet.sequence;
                    bus.resolve_token(
                        sequence,
                        PacketMessage {
                            packet,
                            connection: Arc::clone(&connection),
                        },
                    );
                }
            })
        };

        let message = connection
            .send_and_wait(Opcode::DeviceAutoCleanReq, json!({ "ctrlValue": 0 }))
            .await
            .unwrap();
        assert_eq!(message.packet.payload.opcode, Opcode::DeviceAutoCleanRsp);
        assert_eq!(message.packet.payload.data["result"], 0);

        let _framed = peer.await.unwrap();
        read_loop.abort();
    }

    #[tokio::test]
    async fn resolving_an_unclaimed_token_is_silent() {
        let (server, _client) = connected_pair().await;
        let bus = Arc::new(PacketBus::new());
        let (connection, _packets) =
            Connection::from_stream(server, ChannelKind::Command, Arc::clone(&bus));

        let stray = Packet::request(
            ChannelKind::Command,
            Opcode::DeviceAutoCleanRsp,
            Value::Null,
            Identity::ZERO,
        );
        let sequence = stray.sequence;
        assert!(!bus.resolve_token(
            sequence,
            PacketMessage {
                packet: stray,
                connection,
            }
        ));
    }
}
