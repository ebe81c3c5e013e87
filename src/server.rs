use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, instrument, trace, warn};

use crate::connection::{Connection, Role};
use crate::context::SocketContext;
use crate::error::CloseReason;
use crate::events::{ConnectionEvent, EventNotifier, PacketDispatcher};
use crate::handshake::HandshakeMode;
use crate::multiplexer::{AcceptHandler, DatagramHandler, Multiplexer};
use crate::registry::{ConnectionIdentity, ConnectionRegistry};
use crate::structure_type::{StructureType, TransportKind};
use crate::tcp::TcpWriter;
use crate::udp::datagram::{ser_header_only, UdpMessage};
use crate::udp::DatagramSocket;

/// Turns accepted streams and incoming datagrams into connections
struct ServerRouter {
    context: Arc<SocketContext>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<dyn PacketDispatcher>,
    events: Arc<EventNotifier>,
    closed_sender: mpsc::UnboundedSender<ConnectionIdentity>,
    udp_socket: Option<Arc<UdpSocket>>,
}

impl ServerRouter {
    fn new_connection(&self, identity: ConnectionIdentity) -> Arc<Connection> {
        Connection::new(
            self.context.clone(),
            Role::Server,
            Some(identity),
            self.dispatcher.clone(),
            Some(self.events.clone()),
            Some(self.closed_sender.clone()),
        )
    }

    fn register(&self, connection: Arc<Connection>) {
        let connection_id = connection.connection_id();
        self.registry.insert(connection);
        self.events.send_event(ConnectionEvent::NewConnection { connection_id });
    }
}

#[async_trait]
impl AcceptHandler for ServerRouter {
    #[instrument(skip(self, stream))]
    async fn on_accept(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY: {}", e);
        }

        let identity = self.registry.issue_identity();
        info!("new TCP connection {} from {:?}", identity.connection_id, peer_addr);

        let connection = self.new_connection(identity);
        self.register(connection.clone());

        let (read_half, write_half) = stream.into_split();
        connection.attach_tcp(Arc::new(TcpWriter::spawn(write_half, connection.close_request()))).await;
        if let Some(socket) = &self.udp_socket {
            connection.attach_udp(Arc::new(socket.clone()), None).await;
        }
        connection.set_tcp_read_task(Multiplexer::spawn_stream_reader(self.context.pools.clone(), read_half, connection.clone()));

        if let Err(e) = connection.start_tcp_handshake().await {
            warn!("connection {}: could not start handshake: {}", identity.connection_id, e);
            connection.close(CloseReason::Internal).await;
        }
    }
}

#[async_trait]
impl DatagramHandler for ServerRouter {
    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        let Some(socket) = &self.udp_socket else {
            return;
        };
        let message = match UdpMessage::deser(BytesMut::from(datagram), self.context.config.crypto) {
            Ok(message) => message,
            Err(e) => {
                debug!("dropping datagram from {:?}: {}", from, e);
                return;
            }
        };

        match message {
            UdpMessage::ConnectionRequest => {
                if self.context.config.transport_mode.uses(TransportKind::Tcp) {
                    debug!("UDP connection request from {:?} while TCP is used - dropping", from);
                    return;
                }
                let identity = self.registry.issue_identity();
                debug!("issuing UDP identity {} to {:?}", identity.connection_id, from);
                self.registry.add_pending(identity);
                socket.send_datagram(from, &ser_header_only(StructureType::ConnectionUdpAck, identity)).await;
            }
            UdpMessage::Handshake { identity, mode: HandshakeMode::SelfHandshake, .. } if self.registry.take_pending(identity) => {
                info!("new UDP connection {} from {:?}", identity.connection_id, from);
                let connection = self.new_connection(identity);
                connection.attach_udp(Arc::new(socket.clone()), None).await;
                self.register(connection.clone());
                connection.on_udp_datagram(from, message);
            }
            message => {
                let Some(identity) = message.identity() else {
                    return;
                };
                match self.registry.get(identity) {
                    Some(connection) => connection.on_udp_datagram(from, message),
                    None => trace!("datagram from {:?} for unknown connection {} - dropping", from, identity.connection_id),
                }
            }
        }
    }
}

/// Accepts connections on a TCP listener and / or a UDP socket, depending on the transport mode.
///  Both are bound to the same port.
///
/// Packets received on any of the server's connections go to the dispatcher passed to
///  [`SocketServer::start`].
pub struct SocketServer {
    context: Arc<SocketContext>,
    registry: Arc<ConnectionRegistry>,
    events: Arc<EventNotifier>,
    multiplexer: Multiplexer,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketServer {
    pub async fn start(context: Arc<SocketContext>, dispatcher: Arc<dyn PacketDispatcher>) -> anyhow::Result<SocketServer> {
        let config = context.config.clone();
        let registry = Arc::new(ConnectionRegistry::new());
        let events = Arc::new(EventNotifier::new(config.event_channel_capacity));
        let multiplexer = Multiplexer::new(context.pools.clone());

        let listener = if config.transport_mode.uses(TransportKind::Tcp) {
            let listener = TcpListener::bind(config.addr).await?;
            info!("bound TCP listener to {:?}", listener.local_addr()?);
            Some(listener)
        }
        else {
            None
        };

        let udp_socket = if config.transport_mode.uses(TransportKind::Udp) {
            // an ephemeral TCP port is shared with UDP
            let udp_addr = match &listener {
                Some(listener) => listener.local_addr()?,
                None => config.addr,
            };
            let socket = Arc::new(UdpSocket::bind(udp_addr).await?);
            info!("bound UDP socket to {:?}", socket.local_addr()?);
            Some(socket)
        }
        else {
            None
        };

        let local_addr = match (&listener, &udp_socket) {
            (Some(listener), _) => listener.local_addr()?,
            (None, Some(socket)) => socket.local_addr()?,
            (None, None) => bail!("transport mode {:?} uses no transport", config.transport_mode),
        };

        let (closed_sender, closed_receiver) = mpsc::unbounded_channel();
        let router = Arc::new(ServerRouter {
            context: context.clone(),
            registry: registry.clone(),
            dispatcher,
            events: events.clone(),
            closed_sender,
            udp_socket: udp_socket.clone(),
        });

        if let Some(listener) = listener {
            multiplexer.register_listener(listener, router.clone());
        }
        if let Some(socket) = udp_socket {
            multiplexer.register_datagram_socket(socket, router.clone());
        }

        let tasks = vec![
            Self::spawn_removal(registry.clone(), events.clone(), closed_receiver),
            Self::spawn_sweep(context.clone(), registry.clone()),
        ];

        Ok(SocketServer {
            context,
            registry,
            events,
            multiplexer,
            local_addr,
            tasks,
        })
    }

    /// Removes closed connections from the registry
    fn spawn_removal(registry: Arc<ConnectionRegistry>, events: Arc<EventNotifier>, mut closed: mpsc::UnboundedReceiver<ConnectionIdentity>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(identity) = closed.recv().await {
                if registry.remove(identity.connection_id).is_some() {
                    debug!("removed connection {}", identity.connection_id);
                    events.send_event(ConnectionEvent::RemovedConnection { connection_id: identity.connection_id });
                }
            }
        })
    }

    /// Periodically drops expired pending UDP identities and, with keep-alive on, closes
    ///  connections that went silent
    fn spawn_sweep(context: Arc<SocketContext>, registry: Arc<ConnectionRegistry>) -> JoinHandle<()> {
        let config = context.config.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(config.keep_alive_sweep_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.expire_pending(config.pending_identity_max_age);
                if config.keep_alive {
                    trace!("keep-alive sweep over {} connections", registry.len());
                    registry.close_idle(config.keep_alive_max_age).await;
                }
            }
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<SocketContext> {
        &self.context
    }

    /// Events of all connections, plus `NewConnection` and `RemovedConnection`
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn connection(&self, connection_id: u32) -> Option<Arc<Connection>> {
        self.registry.get_by_id(connection_id)
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.all()
    }

    pub fn num_connections(&self) -> usize {
        self.registry.len()
    }

    /// identities issued for UDP connection requests whose handshake has not started yet
    pub fn num_pending_identities(&self) -> usize {
        self.registry.num_pending()
    }

    /// Stops accepting, and closes all connections
    pub async fn shutdown(&mut self) {
        info!("shutting down server on {:?}", self.local_addr);
        self.multiplexer.shutdown();
        for connection in self.registry.all() {
            connection.close(CloseReason::ExternalForced).await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketConfig;
    use crate::events::MockPacketDispatcher;
    use crate::structure_type::TransportMode;
    use crate::udp::datagram::{ser_connection_request, ser_handshake};
    use rstest::rstest;
    use std::time::Duration;
    use tokio::runtime::Builder;

    fn config(mode: TransportMode) -> SocketConfig {
        let mut config = SocketConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        config.transport_mode = mode;
        config
    }

    /// none of these tests exchange DATA
    fn ignore_packets() -> Arc<dyn PacketDispatcher> {
        Arc::new(MockPacketDispatcher::new())
    }

    async fn recv_datagram(socket: &UdpSocket) -> UdpMessage {
        let mut buf = [0u8; 512];
        let (n, _) = time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await.unwrap().unwrap();
        UdpMessage::deser(BytesMut::from(&buf[..n]), true).unwrap()
    }

    #[rstest]
    #[case::tcp(TransportMode::Tcp)]
    #[case::udp(TransportMode::Udp)]
    #[case::both(TransportMode::Both)]
    fn test_binds_per_mode(#[case] mode: TransportMode) {
        Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
            let context = SocketContext::new(config(mode)).unwrap();
            let mut server = SocketServer::start(context, ignore_packets()).await.unwrap();
            assert_ne!(server.local_addr().port(), 0);
            assert_eq!(server.num_connections(), 0);
            server.shutdown().await;
        });
    }

    #[test]
    fn test_accept_starts_tcp_handshake() {
        Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
            use tokio::io::AsyncReadExt;

            let context = SocketContext::new(config(TransportMode::Tcp)).unwrap();
            let server = SocketServer::start(context, ignore_packets()).await.unwrap();
            let mut events = server.subscribe();

            let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
            assert_eq!(events.recv().await.unwrap(), ConnectionEvent::NewConnection { connection_id: 1 });

            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(head[0], u8::from(StructureType::HandshakeTcp));
            assert!(server.connection(1).is_some());
            assert!(server.connection(2).is_none());

            drop(stream);
            let mut removed = false;
            while let Ok(Ok(event)) = time::timeout(Duration::from_secs(5), events.recv()).await {
                if event == (ConnectionEvent::RemovedConnection { connection_id: 1 }) {
                    removed = true;
                    break;
                }
            }
            assert!(removed);
            assert_eq!(server.num_connections(), 0);
        });
    }

    #[test]
    fn test_udp_connection_request() {
        Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
            let context = SocketContext::new(config(TransportMode::Udp)).unwrap();
            let server = SocketServer::start(context, ignore_packets()).await.unwrap();
            let mut events = server.subscribe();

            let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            client.send_to(&ser_connection_request(), server.local_addr()).await.unwrap();
            let UdpMessage::ConnectionAck { identity } = recv_datagram(&client).await else {
                panic!("expected connection ACK");
            };
            assert_eq!(server.num_connections(), 0);

            client.send_to(&ser_handshake(identity, HandshakeMode::SelfHandshake, None), server.local_addr()).await.unwrap();
            match recv_datagram(&client).await {
                UdpMessage::HandshakeAck { identity: acked, mode, public_key } => {
                    assert_eq!(acked, identity);
                    assert_eq!(mode, HandshakeMode::SelfHandshake);
                    assert!(public_key.is_some());
                }
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(events.recv().await.unwrap(), ConnectionEvent::NewConnection { connection_id: identity.connection_id });
            assert_eq!(server.num_connections(), 1);
        });
    }

    #[test]
    fn test_pending_identities_expire() {
        Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
            let mut config = config(TransportMode::Udp);
            config.keep_alive = false;
            config.keep_alive_sweep_interval = Duration::from_millis(100);
            config.pending_identity_max_age = Duration::from_secs(1);
            let context = SocketContext::new(config).unwrap();
            let server = SocketServer::start(context, ignore_packets()).await.unwrap();

            let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            for _ in 0..200 {
                client.send_to(&ser_connection_request(), server.local_addr()).await.unwrap();
                assert!(matches!(recv_datagram(&client).await, UdpMessage::ConnectionAck { .. }));
            }
            assert_eq!(server.num_pending_identities(), 200);

            time::sleep(Duration::from_millis(1500)).await;
            assert_eq!(server.num_pending_identities(), 0);
            assert_eq!(server.num_connections(), 0);
        });
    }

    #[test]
    fn test_udp_handshake_requires_issued_identity() {
        Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
            let context = SocketContext::new(config(TransportMode::Udp)).unwrap();
            let server = SocketServer::start(context, ignore_packets()).await.unwrap();

            let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let forged = ConnectionIdentity { connection_id: 1, check_code: 12345 };
            client.send_to(&ser_handshake(forged, HandshakeMode::SelfHandshake, None), server.local_addr()).await.unwrap();

            let mut buf = [0u8; 512];
            assert!(time::timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await.is_err());
            assert_eq!(server.num_connections(), 0);
        });
    }

    #[test]
    fn test_keep_alive_sweep() {
        Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
            let mut config = config(TransportMode::Tcp);
            config.keep_alive_sweep_interval = Duration::from_millis(50);
            config.keep_alive_max_age = Duration::from_millis(100);
            let context = SocketContext::new(config).unwrap();
            let server = SocketServer::start(context, ignore_packets()).await.unwrap();
            let mut events = server.subscribe();

            let _stream = TcpStream::connect(server.local_addr()).await.unwrap();

            let mut closed_reason = None;
            while let Ok(Ok(event)) = time::timeout(Duration::from_secs(5), events.recv()).await {
                if let ConnectionEvent::Closed { reason, .. } = event {
                    closed_reason = Some(reason);
                    break;
                }
            }
            assert_eq!(closed_reason, Some(CloseReason::Internal));
        });
    }
}
