use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace};

use crate::codec::sendable::SendablePacket;
use crate::connection::{Connection, Role};
use crate::context::SocketContext;
use crate::error::CloseReason;
use crate::events::{ConnectionEvent, PacketDispatcher};
use crate::multiplexer::{DatagramHandler, Multiplexer};
use crate::structure_type::{SendRoute, TransportKind};
use crate::tcp::TcpWriter;
use crate::udp::datagram::UdpMessage;

/// Hands datagrams from the server to the client's connection
struct ClientRouter {
    connection: Weak<Connection>,
    server_addr: SocketAddr,
    crypto: bool,
}

#[async_trait]
impl DatagramHandler for ClientRouter {
    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        if from != self.server_addr {
            debug!("datagram from {:?}, which is not the server - dropping", from);
            return;
        }
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        match UdpMessage::deser(BytesMut::from(datagram), self.crypto) {
            Ok(message) => connection.on_udp_datagram(from, message),
            Err(e) => debug!("dropping datagram from {:?}: {}", from, e),
        }
    }
}

/// A single connection to a [`crate::server::SocketServer`]. The client drives the handshakes of
///  the UDP leg and sends heartbeats while it is open. Received packets go to the dispatcher
///  passed to [`SocketClient::connect`].
pub struct SocketClient {
    context: Arc<SocketContext>,
    connection: Arc<Connection>,
    multiplexer: Multiplexer,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketClient {
    pub async fn connect(context: Arc<SocketContext>, dispatcher: Arc<dyn PacketDispatcher>) -> anyhow::Result<SocketClient> {
        let config = context.config.clone();
        let connection = Connection::new(context.clone(), Role::Client, None, dispatcher, None, None);
        let multiplexer = Multiplexer::new(context.pools.clone());

        if config.transport_mode.uses(TransportKind::Tcp) {
            let stream = TcpStream::connect(config.addr).await?;
            info!("connected to {:?} via TCP from {:?}", config.addr, stream.local_addr()?);
            stream.set_nodelay(true)?;

            let (read_half, write_half) = stream.into_split();
            connection.attach_tcp(Arc::new(TcpWriter::spawn(write_half, connection.close_request()))).await;
            connection.set_tcp_read_task(Multiplexer::spawn_stream_reader(context.pools.clone(), read_half, connection.clone()));
        }

        let mut tasks = Vec::new();
        if config.transport_mode.uses(TransportKind::Udp) {
            let bind_addr = if config.addr.is_ipv4() {
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
            }
            else {
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
            };
            let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
            debug!("bound UDP socket to {:?}", socket.local_addr()?);

            connection.attach_udp(Arc::new(socket.clone()), Some(config.addr)).await;
            multiplexer.register_datagram_socket(socket, Arc::new(ClientRouter {
                connection: Arc::downgrade(&connection),
                server_addr: config.addr,
                crypto: config.crypto,
            }));
            tasks.push(Self::spawn_udp_handshake(connection.clone(), config.handshake_retry_interval));
        }

        if config.keep_alive {
            tasks.push(Self::spawn_heartbeat(connection.clone(), config.heartbeat_interval));
        }

        Ok(SocketClient {
            context,
            connection,
            multiplexer,
            tasks,
        })
    }

    /// Re-sends the current step of the UDP handshake until the UDP leg is ready
    fn spawn_udp_handshake(connection: Arc<Connection>, retry_interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if !connection.is_available() || connection.handshake_complete(TransportKind::Udp).await {
                    break;
                }
                connection.retry_udp_handshake().await;
                time::sleep(retry_interval).await;
            }
            trace!("UDP handshake task finished");
        })
    }

    /// Legs that are not ready are skipped, so a stalled UDP handshake does not starve the TCP leg
    fn spawn_heartbeat(connection: Arc<Connection>, heartbeat_interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(heartbeat_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !connection.is_available() {
                    break;
                }
                connection.send_keep_alive().await;
            }
        })
    }

    pub fn context(&self) -> &Arc<SocketContext> {
        &self.context
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    /// Waits until all legs completed their handshake
    pub async fn wait_ready(&self, timeout: Duration) -> anyhow::Result<()> {
        let mut events = self.connection.subscribe();
        let wait = async {
            loop {
                if self.connection.is_ready().await {
                    return Ok(());
                }
                if !self.connection.is_available() {
                    bail!("connection closed during the handshake");
                }
                match events.recv().await {
                    Ok(ConnectionEvent::Closed { reason, .. }) => bail!("connection closed during the handshake: {:?}", reason),
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => bail!("event channel closed"),
                }
            }
        };
        match time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => bail!("handshake did not complete within {:?}", timeout),
        }
    }

    pub fn new_packet(&self, protocol_code: i16, command_id: Option<i64>) -> SendablePacket {
        SendablePacket::new(self.context.pools.clone(), protocol_code, command_id)
    }

    pub async fn send(&self, packet: SendablePacket, route: SendRoute) -> anyhow::Result<()> {
        self.connection.send_packet(packet, route).await
    }

    pub async fn close(&mut self) {
        self.connection.close(CloseReason::ExternalForced).await;
        self.multiplexer.shutdown();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if self.connection.is_available() && tokio::runtime::Handle::try_current().is_ok() {
            self.connection.close_request().request_close(CloseReason::ExternalForced);
        }
    }
}
