//! Listener registry and server dispatcher.
//!
//! Three independent TCP listeners make up the server: the command channel
//! (default 4010), the map-data channel (default 4030), and the stateless
//! time-sync channel (default 4050). Accepted sockets on the first two are
//! wrapped in [`Connection`]s, tracked per listener, and read by one task
//! per connection; the time-sync listener answers each socket with a single
//! current-time packet and closes it.
//!
//! # Inbound packet path
//!
//! 1. Reconcile device identity: the zero wire identity clears the
//!    connection's association; a differing identity triggers a repository
//!    lookup and reassignment; the updated connection record is persisted.
//! 2. Publish the packet on the correlation-token channel (zero waiters is
//!    fine) and on the opcode-name channel, where the unhandled-opcode
//!    policy applies.
//!
//! A failure on one connection's packet path is logged and tears down that
//! connection only; it never takes the process down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vaclink_core::identity::DeviceId;
use vaclink_core::repository::{ConnectionRecord, ConnectionStore, DeviceRepository};

use super::bus::{PacketBus, PacketMessage, UnhandledPolicy};
use super::connection::{Connection, PacketStream};
use super::error::{ProtocolError, ProtocolResult};
use super::packet::{ChannelKind, Opcode, Packet};

/// Default command channel port.
pub const DEFAULT_COMMAND_PORT: u16 = 4010;
/// Default map-data channel port.
pub const DEFAULT_MAP_PORT: u16 = 4030;
/// Default time-sync channel port.
pub const DEFAULT_TIME_SYNC_PORT: u16 = 4050;

/// Default cap on concurrent connections across all listeners.
const MAX_CONNECTIONS: usize = 256;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host for all three listeners.
    pub host: String,
    /// Command channel port; 0 picks an ephemeral port.
    pub command_port: u16,
    /// Map-data channel port; 0 picks an ephemeral port.
    pub map_port: u16,
    /// Time-sync channel port; 0 picks an ephemeral port.
    pub time_sync_port: u16,
    /// Cap on concurrent connections across all listeners.
    pub max_connections: usize,
    /// What to do with a well-formed packet nobody handles.
    pub unhandled_policy: UnhandledPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            command_port: DEFAULT_COMMAND_PORT,
            map_port: DEFAULT_MAP_PORT,
            time_sync_port: DEFAULT_TIME_SYNC_PORT,
            max_connections: MAX_CONNECTIONS,
            unhandled_policy: UnhandledPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Sets the bind host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets all three listener ports.
    #[must_use]
    pub const fn with_ports(mut self, command: u16, map: u16, time_sync: u16) -> Self {
        self.command_port = command;
        self.map_port = map;
        self.time_sync_port = time_sync;
        self
    }

    /// Sets the concurrent connection cap.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the unhandled-opcode policy.
    #[must_use]
    pub const fn with_unhandled_policy(mut self, policy: UnhandledPolicy) -> Self {
        self.unhandled_policy = policy;
        self
    }

    /// Localhost config with ephemeral ports, for tests.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self::default().with_host("127.0.0.1").with_ports(0, 0, 0)
    }
}

/// Ports the three listeners actually bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundPorts {
    /// Command channel port.
    pub command: u16,
    /// Map-data channel port.
    pub map: u16,
    /// Time-sync channel port.
    pub time_sync: u16,
}

struct Shared {
    bus: Arc<PacketBus>,
    devices: Arc<dyn DeviceRepository>,
    connections: Arc<dyn ConnectionStore>,
    registry: Mutex<HashMap<ChannelKind, HashMap<uuid::Uuid, Arc<Connection>>>>,
    permits: Arc<Semaphore>,
    policy: UnhandledPolicy,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The protocol server: three listeners plus the live-connection registry.
pub struct ProtocolServer {
    shared: Arc<Shared>,
    ports: BoundPorts,
}

impl ProtocolServer {
    /// Binds all three listeners and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when any listener cannot bind.
    pub async fn bind(
        config: ServerConfig,
        bus: Arc<PacketBus>,
        devices: Arc<dyn DeviceRepository>,
        connections: Arc<dyn ConnectionStore>,
    ) -> ProtocolResult<Self> {
        let command = TcpListener::bind((config.host.as_str(), config.command_port)).await?;
        let map = TcpListener::bind((config.host.as_str(), config.map_port)).await?;
        let time_sync = TcpListener::bind((config.host.as_str(), config.time_sync_port)).await?;

        let ports = BoundPorts {
            command: command.local_addr()?.port(),
            map: map.local_addr()?.port(),
            time_sync: time_sync.local_addr()?.port(),
        };

        let shared = Arc::new(Shared {
            bus,
            devices,
            connections,
            registry: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(config.max_connections)),
            policy: config.unhandled_policy,
            tasks: Mutex::new(Vec::new()),
        });

        let accept_tasks = vec![
            tokio::spawn(accept_loop(
                Arc::clone(&shared),
                command,
                ChannelKind::Command,
            )),
            tokio::spawn(accept_loop(Arc::clone(&shared), map, ChannelKind::Map)),
            tokio::spawn(time_sync_loop(Arc::clone(&shared), time_sync)),
        ];
        shared.tasks.lock().await.extend(accept_tasks);

        info!(
            host = %config.host,
            command_port = ports.command,
            map_port = ports.map,
            time_sync_port = ports.time_sync,
            "protocol server bound"
        );

        Ok(Self { shared, ports })
    }

    /// Ports the listeners actually bound.
    #[must_use]
    pub const fn ports(&self) -> BoundPorts {
        self.ports
    }

    /// The dispatch bus this server publishes on.
    #[must_use]
    pub fn bus(&self) -> Arc<PacketBus> {
        Arc::clone(&self.shared.bus)
    }

    /// Live connections on `channel`.
    pub async fn connections(&self, channel: ChannelKind) -> Vec<Arc<Connection>> {
        self.shared
            .registry
            .lock()
            .await
            .get(&channel)
            .map(|tracked| tracked.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The connection currently associated with `device_id`, if any.
    pub async fn connection_for_device(&self, device_id: DeviceId) -> Option<Arc<Connection>> {
        self.shared
            .registry
            .lock()
            .await
            .values()
            .flat_map(HashMap::values)
            .find(|connection| {
                connection
                    .device()
                    .is_some_and(|device| device.id() == device_id)
            })
            .cloned()
    }

    /// Stops all three listeners, closing every tracked connection.
    pub async fn close(&self) {
        for task in self.shared.tasks.lock().await.drain(..) {
            task.abort();
        }

        let tracked: Vec<Arc<Connection>> = self
            .shared
            .registry
            .lock()
            .await
            .drain()
            .flat_map(|(_, connections)| connections.into_values())
            .collect();
        for connection in tracked {
            connection.close().await;
            if let Err(e) = self.shared.connections.remove_one(connection.id()).await {
                warn!(connection = %connection.id(), error = %e, "connection record cleanup failed");
            }
        }

        info!("protocol server closed");
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, channel: ChannelKind) {
    loop {
        let permit = match Arc::clone(&shared.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        match listener.accept().await {
            Ok((stream, peer)) => {
                let (connection, packets) =
                    Connection::from_stream(stream, channel, Arc::clone(&shared.bus));
                debug!(
                    connection = %connection.id(),
                    %peer,
                    %channel,
                    "accepted connection"
                );
                shared
                    .registry
                    .lock()
                    .await
                    .entry(channel)
                    .or_default()
                    .insert(connection.id(), Arc::clone(&connection));

                let read_task = tokio::spawn(read_loop(
                    Arc::clone(&shared),
                    connection,
                    packets,
                    permit,
                ));
                let mut tasks = shared.tasks.lock().await;
                // Reap handles of read tasks that already ran to completion,
                // or the list grows unboundedly under reconnect churn.
                tasks.retain(|task| !task.is_finished());
                tasks.push(read_task);
            }
            Err(e) => {
                warn!(%channel, error = %e, "accept failed");
                drop(permit);
            }
        }
    }
}

/// Per-connection read task: wire order in, both dispatch channels out.
async fn read_loop(
    shared: Arc<Shared>,
    connection: Arc<Connection>,
    mut packets: PacketStream,
    _permit: OwnedSemaphorePermit,
) {
    while let Some(item) = packets.next().await {
        match item {
            Ok(packet) => {
                if let Err(e) = shared.handle_packet(&connection, packet).await {
                    error!(
                        connection = %connection.id(),
                        error = %e,
                        "packet handling failed; closing connection"
                    );
                    break;
                }
            }
            Err(e) => {
                // The framer produced something that is not a packet; that
                // is a defect on this connection, never silently dropped.
                error!(
                    connection = %connection.id(),
                    error = %e,
                    "framing defect; closing connection"
                );
                break;
            }
        }
    }
    shared.teardown(&connection).await;
}

/// Stateless responder on the time-sync listener: one current-time packet
/// with the zero identity, then close.
async fn time_sync_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let permit = match Arc::clone(&shared.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        match listener.accept().await {
            Ok((stream, peer)) => {
                let bus = Arc::clone(&shared.bus);
                tokio::spawn(async move {
                    let _permit = permit;
                    let (connection, _packets) =
                        Connection::from_stream(stream, ChannelKind::TimeSync, bus);
                    debug!(connection = %connection.id(), %peer, "time-sync request");

                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map_or(0, |elapsed| elapsed.as_secs());
                    let body = json!({ "result": 0, "body": { "time": now } });
                    if let Err(e) = connection.send(Opcode::DeviceTimeSyncRsp, body).await {
                        warn!(connection = %connection.id(), error = %e, "time-sync send failed");
                    }
                    connection.close().await;
                });
            }
            Err(e) => {
                warn!(error = %e, "time-sync accept failed");
                drop(permit);
            }
        }
    }
}

impl Shared {
    async fn handle_packet(
        &self,
        connection: &Arc<Connection>,
        packet: Packet,
    ) -> ProtocolResult<()> {
        // Responses carry the swapped identity pair; only device-initiated
        // requests drive the association.
        if packet.flow == 0 {
            self.reconcile_device(connection, &packet).await?;
        }

        let opcode = packet.payload.opcode;
        let sequence = packet.sequence;
        let message = PacketMessage {
            packet,
            connection: Arc::clone(connection),
        };

        // Token channel first so a pending send_and_wait is resolvable as
        // soon as possible; both channels fire independently.
        if self.bus.resolve_token(sequence, message.clone()) {
            debug!(
                connection = %connection.id(),
                sequence,
                opcode = %opcode,
                "resolved pending correlation"
            );
        }

        if self.bus.listener_count(opcode) == 0 {
            match self.policy {
                UnhandledPolicy::Fatal => {
                    return Err(ProtocolError::NoHandler {
                        name: opcode.name().to_string(),
                    });
                }
                UnhandledPolicy::Warn => {
                    warn!(opcode = %opcode, "no handler registered; skipping packet");
                    return Ok(());
                }
            }
        }

        self.bus.emit(opcode, message).await
    }

    /// Keeps the connection's device association in step with the identity
    /// the wire carries, persisting the record when it changes.
    async fn reconcile_device(
        &self,
        connection: &Arc<Connection>,
        packet: &Packet,
    ) -> ProtocolResult<()> {
        let wire_id = packet.device_id;
        let current = connection.device().map(|device| device.id());

        let changed = match (wire_id.is_zero(), current) {
            (true, None) => false,
            (true, Some(_)) => {
                connection.set_device(None);
                true
            }
            (false, Some(id)) if id == wire_id => false,
            (false, _) => {
                let device = self.devices.find_one_by_id(wire_id).await?;
                if device.is_none() {
                    debug!(device = %wire_id, "packet carries an unregistered device identity");
                }
                connection.set_device(device);
                true
            }
        };

        if changed {
            self.connections
                .save_one(ConnectionRecord {
                    id: connection.id(),
                    device_id: connection.device().map(|device| device.id()),
                })
                .await?;
        }
        Ok(())
    }

    async fn teardown(&self, connection: &Arc<Connection>) {
        connection.close().await;
        if let Some(tracked) = self.registry.lock().await.get_mut(&connection.channel()) {
            tracked.remove(&connection.id());
        }
        if let Err(e) = self.connections.remove_one(connection.id()).await {
            warn!(connection = %connection.id(), error = %e, "connection record cleanup failed");
        }
        debug!(connection = %connection.id(), "connection closed");
    }
}
