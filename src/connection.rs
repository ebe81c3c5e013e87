use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::codec::frame::TcpFrame;
use crate::codec::receivable::ReceivablePacket;
use crate::codec::sendable::SendablePacket;
use crate::context::SocketContext;
use crate::crypto::key_exchange::{open_seed, SeedOffer, PUBLIC_KEY_LEN};
use crate::crypto::{PacketCipher, Trailer};
use crate::error::{CloseReason, CloseRequest};
use crate::events::{ConnectionEvent, EventNotifier, PacketDispatcher};
use crate::handshake::{tcp_handshake_frame, HandshakeMode, KeyOffer, LegState};
use crate::multiplexer::StreamHandler;
use crate::registry::ConnectionIdentity;
use crate::structure_type::{SendRoute, StructureType, TransportKind};
use crate::tcp::{DataVerdict, StreamSink, TcpLeg};
use crate::udp::datagram::{open_ack, ser_ack, ser_connection_request, ser_handshake, ser_handshake_ack, ser_handshake_ack_ack, ser_header_only, UdpMessage};
use crate::udp::receiver::UdpReceiver;
use crate::udp::sender::UdpSender;
use crate::udp::DatagramSocket;
use crate::util::random::RngRandom;
use crate::util::safe_converter::PrecheckedCast;

/// The server accepts connections and is the responder in all handshakes, the client initiates
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Server,
    Client,
}

/// The socket a UDP leg sends on. A server shares its socket between all connections, and learns
///  a connection's peer address from its first handshake datagram.
struct UdpLink {
    socket: Arc<dyn DatagramSocket>,
    peer_addr: Option<SocketAddr>,
}

/// The reliable channel of a UDP leg, created when the leg's handshake completes
struct UdpChannel {
    sender: UdpSender,
    receiver: UdpReceiver,
}

struct ConnectionInner {
    tcp_state: LegState,
    udp_state: LegState,
    cipher: Option<Arc<PacketCipher>>,
    tcp: Option<TcpLeg>,
    udp_link: Option<UdpLink>,
    udp: Option<UdpChannel>,
    /// packets sent before their leg was ready
    outbound: VecDeque<(SendablePacket, SendRoute)>,
    /// client side of a UDP self-handshake: the seed, kept for retries
    pending_seed: Option<Bytes>,
    ready_notified: bool,
}

impl ConnectionInner {
    fn leg_state(&self, kind: TransportKind) -> LegState {
        match kind {
            TransportKind::Tcp => self.tcp_state,
            TransportKind::Udp => self.udp_state,
        }
    }

    fn udp_peer(&self) -> Option<(Arc<dyn DatagramSocket>, SocketAddr)> {
        let link = self.udp_link.as_ref()?;
        Some((link.socket.clone(), link.peer_addr?))
    }
}

/// Cuts the reference cycle between a connection and the parts that can request its closing
struct ConnectionCloser(Weak<Connection>);

impl CloseRequest for ConnectionCloser {
    fn request_close(&self, reason: CloseReason) {
        if let Some(connection) = self.0.upgrade() {
            tokio::spawn(async move {
                connection.close(reason).await;
            });
        }
    }
}

/// One logical connection with up to two legs (TCP and UDP), each with its own handshake.
///
/// Received bytes / datagrams are put into an inbox by the I/O loops, and processed on the
///  worker pool under the connection's lock, so processing order equals arrival order.
pub struct Connection {
    myself: Weak<Connection>,
    context: Arc<SocketContext>,
    role: Role,
    /// assigned by the server, i.e. known from the start on the server side and received during
    ///  the handshake by a client
    identity: OnceLock<ConnectionIdentity>,
    available: AtomicBool,
    tcp_inbox: Mutex<BytesMut>,
    udp_inbox: Mutex<VecDeque<(SocketAddr, UdpMessage)>>,
    last_keep_alive: Mutex<Instant>,
    tcp_read_task: Mutex<Option<AbortHandle>>,
    inner: RwLock<ConnectionInner>,
    dispatcher: Arc<dyn PacketDispatcher>,
    events: EventNotifier,
    upstream_events: Option<Arc<EventNotifier>>,
    closed_notification: Option<mpsc::UnboundedSender<ConnectionIdentity>>,
}

impl Connection {
    pub fn new(
        context: Arc<SocketContext>,
        role: Role,
        identity: Option<ConnectionIdentity>,
        dispatcher: Arc<dyn PacketDispatcher>,
        upstream_events: Option<Arc<EventNotifier>>,
        closed_notification: Option<mpsc::UnboundedSender<ConnectionIdentity>>,
    ) -> Arc<Connection> {
        let events = EventNotifier::new(context.config.event_channel_capacity);
        Arc::new_cyclic(|myself| Connection {
            myself: myself.clone(),
            context,
            role,
            available: AtomicBool::new(true),
            tcp_inbox: Default::default(),
            udp_inbox: Default::default(),
            last_keep_alive: Mutex::new(Instant::now()),
            tcp_read_task: Default::default(),
            identity: identity.map(OnceLock::from).unwrap_or_default(),
            inner: RwLock::new(ConnectionInner {
                tcp_state: LegState::Idle,
                udp_state: LegState::Idle,
                cipher: None,
                tcp: None,
                udp_link: None,
                udp: None,
                outbound: VecDeque::new(),
                pending_seed: None,
                ready_notified: false,
            }),
            dispatcher,
            events,
            upstream_events,
            closed_notification,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn identity(&self) -> Option<ConnectionIdentity> {
        self.identity.get().copied()
    }

    /// 0 until the identity is known
    pub fn connection_id(&self) -> u32 {
        self.identity().map(|i| i.connection_id).unwrap_or(0)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub async fn handshake_complete(&self, kind: TransportKind) -> bool {
        self.inner.read().await.leg_state(kind) == LegState::Ready
    }

    /// all legs required by the transport mode completed their handshake
    pub async fn is_ready(&self) -> bool {
        self.inner.read().await.ready_notified
    }

    pub fn idle_for(&self) -> Duration {
        self.last_keep_alive.lock().unwrap().elapsed()
    }

    fn refresh_keep_alive(&self) {
        *self.last_keep_alive.lock().unwrap() = Instant::now();
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(upstream) = &self.upstream_events {
            upstream.send_event(event.clone());
        }
        self.events.send_event(event);
    }

    /// A handle for closing this connection from places that must not hold on to it, e.g. a
    ///  TCP writer task
    pub fn close_request(&self) -> Arc<dyn CloseRequest> {
        Arc::new(ConnectionCloser(self.myself.clone()))
    }

    fn crypto_cipher(&self, inner: &ConnectionInner) -> Option<Arc<PacketCipher>> {
        if self.context.config.crypto {
            inner.cipher.clone()
        }
        else {
            None
        }
    }

    pub async fn attach_tcp(&self, sink: Arc<dyn StreamSink>) {
        let mut inner = self.inner.write().await;
        inner.tcp = Some(TcpLeg::new(sink, &self.context.config));
    }

    /// The read loop of the TCP leg is stopped when the connection closes
    pub fn set_tcp_read_task(&self, read_task: AbortHandle) {
        let mut slot = self.tcp_read_task.lock().unwrap();
        if self.is_available() {
            *slot = Some(read_task);
        }
        else {
            read_task.abort();
        }
    }

    /// `peer_addr` is `None` for a server-side connection, it is set by the UDP handshake
    pub async fn attach_udp(&self, socket: Arc<dyn DatagramSocket>, peer_addr: Option<SocketAddr>) {
        let mut inner = self.inner.write().await;
        inner.udp_link = Some(UdpLink { socket, peer_addr });
    }

    //---------------------------------------- handshake initiation

    /// Server side: send identity and public key to the client
    pub async fn start_tcp_handshake(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if self.role != Role::Server || inner.tcp_state != LegState::Idle {
            bail!("TCP handshake can only be started by a server, and only once");
        }
        let Some(identity) = self.identity() else {
            bail!("server connection without identity");
        };
        let Some(tcp) = &inner.tcp else {
            bail!("no TCP leg");
        };

        let mut body = BytesMut::new();
        KeyOffer {
            identity,
            public_key: self.context.key_pair.public_key(),
        }.ser(&mut body);
        tcp.send(tcp_handshake_frame(StructureType::HandshakeTcp, &body))?;

        debug!("connection {}: sent TCP handshake", identity.connection_id);
        inner.tcp_state = LegState::KeyExchangeSent;
        Ok(())
    }

    /// Client side: (re-)send the current step of the UDP handshake. In transport mode 'both',
    ///  this waits for the TCP handshake and then uses it.
    pub async fn retry_udp_handshake(&self) {
        let mut inner = self.inner.write().await;
        if self.role != Role::Client || !self.is_available() {
            return;
        }
        let Some((socket, peer_addr)) = inner.udp_peer() else {
            return;
        };

        let via_tcp = self.context.config.transport_mode.uses(TransportKind::Tcp);
        let datagram = match (inner.udp_state, self.identity()) {
            (LegState::Ready, _) => return,
            (_, Some(identity)) if via_tcp => {
                if inner.tcp_state != LegState::Ready {
                    return;
                }
                inner.udp_state = LegState::KeyExchangeSent;
                ser_handshake(identity, HandshakeMode::ViaTcp, self.crypto_cipher(&inner).as_deref())
            }
            (_, None) if via_tcp => return,
            (LegState::Idle, _) => ser_connection_request(),
            (LegState::KeyExchangeSent, Some(identity)) => ser_handshake(identity, HandshakeMode::SelfHandshake, None),
            (LegState::KeyInstalled, Some(identity)) => match &inner.pending_seed {
                Some(seed) => ser_handshake_ack_ack(identity, seed),
                None => return,
            },
            (_, None) => ser_connection_request(),
        };

        trace!("sending UDP handshake step to {:?}", peer_addr);
        socket.send_datagram(peer_addr, &datagram).await;
    }

    //---------------------------------------- inbound

    /// Called from a TCP read loop: buffer the bytes and process them on the worker pool
    pub fn on_tcp_bytes(&self, data: &[u8]) {
        if !self.is_available() {
            return;
        }
        self.tcp_inbox.lock().unwrap().extend_from_slice(data);

        if let Some(connection) = self.myself.upgrade() {
            self.context.workers.submit(async move {
                connection.process_tcp().await;
            });
        }
    }

    /// Called from a UDP receive loop for a datagram that was routed to this connection
    pub fn on_udp_datagram(&self, from: SocketAddr, message: UdpMessage) {
        if !self.is_available() {
            return;
        }
        self.udp_inbox.lock().unwrap().push_back((from, message));

        if let Some(connection) = self.myself.upgrade() {
            self.context.workers.submit(async move {
                connection.process_udp().await;
            });
        }
    }

    pub async fn process_tcp(&self) {
        let mut inner = self.inner.write().await;
        if !self.is_available() {
            return;
        }

        let data = self.tcp_inbox.lock().unwrap().split();
        let Some(tcp) = inner.tcp.as_mut() else {
            debug!("connection {}: TCP data without TCP leg - discarding", self.connection_id());
            return;
        };
        tcp.push(&data);

        loop {
            let frame = match inner.tcp.as_mut().map(|tcp| tcp.next_frame()) {
                Some(Ok(Some(frame))) => frame,
                Some(Ok(None)) | None => break,
                Some(Err(e)) => {
                    warn!("connection {}: corrupt TCP stream: {}", self.connection_id(), e);
                    self.close_locked(&mut inner, CloseReason::Internal).await;
                    return;
                }
            };

            if let Err(reason) = self.on_tcp_frame(&mut inner, frame).await {
                self.close_locked(&mut inner, reason).await;
                return;
            }
        }
    }

    async fn on_tcp_frame(&self, inner: &mut ConnectionInner, frame: TcpFrame) -> Result<(), CloseReason> {
        let connection_id = self.connection_id();
        match frame {
            TcpFrame::Data { sequence, mut payload, trailer } => {
                if inner.tcp_state != LegState::Ready {
                    warn!("connection {}: DATA before the TCP handshake completed", connection_id);
                    return Err(CloseReason::Internal);
                }
                let cipher = self.crypto_cipher(inner);
                let Some(tcp) = inner.tcp.as_mut() else {
                    return Ok(());
                };
                match tcp.accept_data(sequence, &mut payload, trailer, cipher.as_deref()) {
                    DataVerdict::Accepted => self.dispatch_packet(connection_id, payload.freeze()).await,
                    DataVerdict::Rejected => Ok(()),
                    DataVerdict::Fatal => Err(CloseReason::Internal),
                }
            }
            TcpFrame::Handshake { tag: StructureType::HandshakeTcp, body } => self.on_tcp_key_offer(inner, body),
            TcpFrame::Handshake { tag: StructureType::HandshakeTcpAck, body } => self.on_tcp_seed(inner, body).await,
            TcpFrame::Handshake { tag, .. } => {
                warn!("connection {}: unexpected handshake frame {:?}", connection_id, tag);
                Err(CloseReason::Internal)
            }
            TcpFrame::Control(StructureType::HandshakeTcpAckAck) => self.on_tcp_handshake_confirmed(inner).await,
            TcpFrame::Control(StructureType::KeepAlive) => {
                self.on_keep_alive(connection_id, TransportKind::Tcp);
                if let Some(tcp) = &inner.tcp {
                    if let Err(e) = tcp.send_control(StructureType::KeepAliveAck) {
                        debug!("connection {}: error sending keep-alive ACK: {}", connection_id, e);
                    }
                }
                Ok(())
            }
            TcpFrame::Control(StructureType::KeepAliveAck) => {
                trace!("connection {}: keep-alive ACK on TCP", connection_id);
                self.refresh_keep_alive();
                Ok(())
            }
            TcpFrame::Control(StructureType::Close) => {
                debug!("connection {}: peer closed the connection", connection_id);
                Err(CloseReason::PeerDisconnect)
            }
            TcpFrame::Control(StructureType::ConnectionTcp) => {
                debug!("connection {}: ignoring TCP connection request - the handshake starts on accept", connection_id);
                Ok(())
            }
            TcpFrame::Control(tag) => {
                warn!("connection {}: {:?} is not valid on TCP", connection_id, tag);
                Err(CloseReason::Internal)
            }
        }
    }

    /// Client: the server sent identity and public key, reply with the seed
    fn on_tcp_key_offer(&self, inner: &mut ConnectionInner, mut body: Bytes) -> Result<(), CloseReason> {
        if self.role != Role::Client || inner.tcp_state != LegState::Idle {
            warn!("connection {}: unexpected TCP key offer", self.connection_id());
            return Err(CloseReason::Internal);
        }
        let offer = KeyOffer::deser(&mut body)
            .map_err(|e| {
                warn!("malformed TCP key offer: {}", e);
                CloseReason::Internal
            })?;
        let seed = SeedOffer::generate::<RngRandom>()
            .map_err(|_| CloseReason::Internal)?;

        let sealed = seed.seal_for(&offer.public_key);
        let Some(tcp) = &inner.tcp else {
            return Err(CloseReason::Internal);
        };
        tcp.send(tcp_handshake_frame(StructureType::HandshakeTcpAck, &sealed))
            .map_err(|_| CloseReason::Internal)?;

        debug!("connection {}: received TCP key offer, sent seed", offer.identity.connection_id);
        let _ = self.identity.set(offer.identity);
        inner.cipher = Some(Arc::new(PacketCipher::new(seed.key, offer.identity.connection_id, offer.identity.check_code)));
        inner.tcp_state = LegState::KeyInstalled;
        Ok(())
    }

    /// Server: the client sent its seed, install the key and confirm
    async fn on_tcp_seed(&self, inner: &mut ConnectionInner, body: Bytes) -> Result<(), CloseReason> {
        if self.role != Role::Server || inner.tcp_state != LegState::KeyExchangeSent {
            warn!("connection {}: unexpected TCP seed", self.connection_id());
            return Err(CloseReason::Internal);
        }
        let Some(identity) = self.identity() else {
            return Err(CloseReason::Internal);
        };
        let key = open_seed(&body)
            .map_err(|e| {
                warn!("connection {}: key exchange failed: {}", identity.connection_id, e);
                CloseReason::Internal
            })?;
        inner.cipher = Some(Arc::new(PacketCipher::new(key, identity.connection_id, identity.check_code)));

        if let Some(tcp) = &inner.tcp {
            tcp.send_control(StructureType::HandshakeTcpAckAck)
                .map_err(|_| CloseReason::Internal)?;
        }
        self.on_leg_ready(inner, TransportKind::Tcp).await;
        Ok(())
    }

    /// Client: the server installed the key
    async fn on_tcp_handshake_confirmed(&self, inner: &mut ConnectionInner) -> Result<(), CloseReason> {
        if self.role != Role::Client || inner.tcp_state != LegState::KeyInstalled {
            warn!("connection {}: unexpected TCP handshake confirmation", self.connection_id());
            return Err(CloseReason::Internal);
        }
        self.on_leg_ready(inner, TransportKind::Tcp).await;

        // the UDP leg piggybacks on the TCP handshake
        if let (Some(identity), Some((socket, peer_addr))) = (self.identity(), inner.udp_peer()) {
            if inner.udp_state != LegState::Ready {
                inner.udp_state = LegState::KeyExchangeSent;
                let datagram = ser_handshake(identity, HandshakeMode::ViaTcp, self.crypto_cipher(inner).as_deref());
                socket.send_datagram(peer_addr, &datagram).await;
            }
        }
        Ok(())
    }

    pub async fn process_udp(&self) {
        let mut inner = self.inner.write().await;
        loop {
            if !self.is_available() {
                return;
            }
            let Some((from, message)) = self.udp_inbox.lock().unwrap().pop_front() else {
                return;
            };

            if let Err(reason) = self.on_udp_message(&mut inner, from, message).await {
                self.close_locked(&mut inner, reason).await;
                return;
            }
        }
    }

    async fn on_udp_message(&self, inner: &mut ConnectionInner, from: SocketAddr, message: UdpMessage) -> Result<(), CloseReason> {
        let connection_id = self.connection_id();

        if let Some(identity) = message.identity() {
            if self.identity().is_some() && self.identity() != Some(identity) {
                debug!("connection {}: datagram from {:?} with wrong identity - dropping", connection_id, from);
                return Ok(());
            }
        }

        match message {
            UdpMessage::ConnectionRequest => {
                debug!("connection {}: unexpected UDP connection request - dropping", connection_id);
            }
            UdpMessage::ConnectionAck { identity } => {
                if self.role == Role::Client && self.identity().is_none() && inner.udp_state == LegState::Idle {
                    debug!("received UDP identity {}", identity.connection_id);
                    let _ = self.identity.set(identity);
                    inner.udp_state = LegState::KeyExchangeSent;
                    self.send_udp(inner, &ser_handshake(identity, HandshakeMode::SelfHandshake, None)).await;
                }
            }
            UdpMessage::Handshake { identity, mode, trailer } => {
                if self.role == Role::Server {
                    self.on_udp_handshake_request(inner, from, identity, mode, trailer).await?;
                }
            }
            UdpMessage::HandshakeAck { identity, mode, public_key } => {
                if self.role == Role::Client {
                    self.on_udp_handshake_ack(inner, identity, mode, public_key).await?;
                }
            }
            UdpMessage::HandshakeAckAck { identity, sealed_seed, .. } => {
                if self.role == Role::Server {
                    self.on_udp_seed(inner, identity, sealed_seed).await?;
                }
            }
            UdpMessage::HandshakeAckAckAck { .. } => {
                if self.role == Role::Client && inner.udp_state == LegState::KeyInstalled {
                    inner.pending_seed = None;
                    self.on_leg_ready(inner, TransportKind::Udp).await;
                }
            }
            UdpMessage::Data { sequence, fragment, trailer, .. } => {
                let cipher = self.crypto_cipher(inner);
                let Some(identity) = self.identity() else {
                    return Ok(());
                };
                let Some(channel) = inner.udp.as_mut() else {
                    debug!("connection {}: UDP DATA before the UDP handshake completed - dropping", connection_id);
                    return Ok(());
                };
                let outcome = channel.receiver.on_data(sequence, fragment, trailer, cipher.as_deref())
                    .map_err(|e| {
                        warn!("connection {}: corrupt UDP stream: {}", connection_id, e);
                        CloseReason::Internal
                    })?;

                if let Some(ack) = outcome.ack {
                    channel.sender.send_control(&ser_ack(identity, ack, cipher.as_deref())).await;
                }
                for record in outcome.records {
                    self.dispatch_packet(connection_id, record).await?;
                }
            }
            UdpMessage::Ack { payload, trailer, .. } => {
                let cipher = self.crypto_cipher(inner);
                let Some(channel) = &inner.udp else {
                    return Ok(());
                };
                match open_ack(payload, trailer, cipher.as_deref()) {
                    Some(sequence) => channel.sender.on_ack(sequence).await,
                    None => debug!("connection {}: ACK failed verification - dropping", connection_id),
                }
            }
            UdpMessage::KeepAlive { identity } => {
                self.on_keep_alive(connection_id, TransportKind::Udp);
                self.send_udp(inner, &ser_header_only(StructureType::KeepAliveAck, identity)).await;
            }
            UdpMessage::KeepAliveAck { .. } => {
                trace!("connection {}: keep-alive ACK on UDP", connection_id);
                self.refresh_keep_alive();
            }
            UdpMessage::Close { .. } => {
                debug!("connection {}: peer closed the connection", connection_id);
                return Err(CloseReason::PeerDisconnect);
            }
        }
        Ok(())
    }

    /// Server: HANDSHAKE_UDP, either completing the UDP leg right away (via TCP) or starting the
    ///  leg's own key exchange
    async fn on_udp_handshake_request(&self, inner: &mut ConnectionInner, from: SocketAddr, identity: ConnectionIdentity, mode: HandshakeMode, trailer: Option<Trailer>) -> Result<(), CloseReason> {
        match mode {
            HandshakeMode::ViaTcp => {
                if inner.tcp_state != LegState::Ready {
                    debug!("connection {}: UDP handshake via TCP before TCP is ready - dropping", identity.connection_id);
                    return Ok(());
                }
                if let Some(cipher) = self.crypto_cipher(inner) {
                    let verified = trailer
                        .map(|t| cipher.decrypt_and_verify(StructureType::HandshakeUdp, 0, &mut [0u8; 0], &t))
                        .unwrap_or(false);
                    if !verified {
                        debug!("connection {}: UDP handshake from {:?} failed verification - dropping", identity.connection_id, from);
                        return Ok(());
                    }
                }

                self.bind_udp_peer(inner, from);
                if inner.udp_state != LegState::Ready {
                    self.on_leg_ready(inner, TransportKind::Udp).await;
                }
                self.send_udp(inner, &ser_handshake_ack(identity, HandshakeMode::ViaTcp, None)).await;
            }
            HandshakeMode::SelfHandshake => {
                if inner.udp_state == LegState::Ready {
                    debug!("connection {}: duplicate UDP handshake - ignoring", identity.connection_id);
                    return Ok(());
                }
                self.bind_udp_peer(inner, from);
                inner.udp_state = LegState::KeyExchangeSent;
                let public_key = self.context.key_pair.public_key();
                self.send_udp(inner, &ser_handshake_ack(identity, HandshakeMode::SelfHandshake, Some(&public_key))).await;
            }
        }
        Ok(())
    }

    /// Client: HANDSHAKE_UDP_ACK
    async fn on_udp_handshake_ack(&self, inner: &mut ConnectionInner, identity: ConnectionIdentity, mode: HandshakeMode, public_key: Option<[u8; PUBLIC_KEY_LEN]>) -> Result<(), CloseReason> {
        match (mode, inner.udp_state) {
            (HandshakeMode::ViaTcp, LegState::KeyExchangeSent) => {
                self.on_leg_ready(inner, TransportKind::Udp).await;
            }
            (HandshakeMode::SelfHandshake, LegState::KeyExchangeSent) => {
                let Some(public_key) = public_key else {
                    return Err(CloseReason::Internal);
                };
                let seed = SeedOffer::generate::<RngRandom>()
                    .map_err(|_| CloseReason::Internal)?;
                let sealed = seed.seal_for(&public_key);

                inner.cipher = Some(Arc::new(PacketCipher::new(seed.key, identity.connection_id, identity.check_code)));
                inner.udp_state = LegState::KeyInstalled;
                self.send_udp(inner, &ser_handshake_ack_ack(identity, &sealed)).await;
                inner.pending_seed = Some(sealed);
            }
            (_, state) => {
                trace!("connection {}: ignoring UDP handshake ACK in state {:?}", identity.connection_id, state);
            }
        }
        Ok(())
    }

    /// Server: HANDSHAKE_UDP_ACK_ACK with the client's seed
    async fn on_udp_seed(&self, inner: &mut ConnectionInner, identity: ConnectionIdentity, sealed_seed: Bytes) -> Result<(), CloseReason> {
        match inner.udp_state {
            LegState::KeyExchangeSent => {
                let key = open_seed(&sealed_seed)
                    .map_err(|e| {
                        warn!("connection {}: UDP key exchange failed: {}", identity.connection_id, e);
                        CloseReason::Internal
                    })?;
                inner.cipher = Some(Arc::new(PacketCipher::new(key, identity.connection_id, identity.check_code)));
                self.on_leg_ready(inner, TransportKind::Udp).await;
                self.send_udp(inner, &ser_header_only(StructureType::HandshakeUdpAckAckAck, identity)).await;
            }
            LegState::Ready => {
                // our confirmation got lost
                self.send_udp(inner, &ser_header_only(StructureType::HandshakeUdpAckAckAck, identity)).await;
            }
            state => {
                debug!("connection {}: unexpected UDP seed in state {:?} - dropping", identity.connection_id, state);
            }
        }
        Ok(())
    }

    fn bind_udp_peer(&self, inner: &mut ConnectionInner, from: SocketAddr) {
        if let Some(link) = inner.udp_link.as_mut() {
            if link.peer_addr != Some(from) {
                debug!("connection {}: UDP peer is {:?}", self.connection_id(), from);
                link.peer_addr = Some(from);
            }
        }
    }

    /// sends a datagram outside the reliable channel
    async fn send_udp(&self, inner: &ConnectionInner, datagram: &[u8]) {
        match inner.udp_peer() {
            Some((socket, peer_addr)) => socket.send_datagram(peer_addr, datagram).await,
            None => debug!("connection {}: no UDP peer address - not sending", self.connection_id()),
        }
    }

    fn on_keep_alive(&self, connection_id: u32, transport: TransportKind) {
        trace!("connection {}: keep-alive on {:?}", connection_id, transport);
        self.refresh_keep_alive();
        self.emit(ConnectionEvent::KeepAliveReceived { connection_id, transport });
    }

    async fn dispatch_packet(&self, connection_id: u32, payload: Bytes) -> Result<(), CloseReason> {
        match ReceivablePacket::parse(payload, self.context.config.data_transfer) {
            Ok(packet) => {
                trace!("connection {}: received packet with protocol code {}", connection_id, packet.protocol_code);
                self.dispatcher.on_packet(connection_id, packet).await;
                Ok(())
            }
            Err(e) => {
                warn!("connection {}: {}", connection_id, e);
                Err(CloseReason::Internal)
            }
        }
    }

    async fn on_leg_ready(&self, inner: &mut ConnectionInner, kind: TransportKind) {
        match kind {
            TransportKind::Tcp => inner.tcp_state = LegState::Ready,
            TransportKind::Udp => {
                inner.udp_state = LegState::Ready;
                if let (Some(identity), Some((socket, peer_addr))) = (self.identity(), inner.udp_peer()) {
                    let config = &self.context.config;
                    inner.udp = Some(UdpChannel {
                        sender: UdpSender::new(config.clone(), socket, peer_addr, identity, self.crypto_cipher(inner), self.close_request()),
                        receiver: UdpReceiver::new(config.udp_window_size.prechecked_cast(), config.max_frame_len),
                    });
                }
            }
        }

        let connection_id = self.connection_id();
        info!("connection {}: {:?} handshake complete", connection_id, kind);
        self.emit(ConnectionEvent::HandshakeComplete { connection_id, transport: kind });

        let mode = self.context.config.transport_mode;
        let all_ready = [TransportKind::Tcp, TransportKind::Udp].into_iter()
            .filter(|k| mode.uses(*k))
            .all(|k| inner.leg_state(k) == LegState::Ready);
        if all_ready && !inner.ready_notified {
            inner.ready_notified = true;
            self.emit(ConnectionEvent::Ready { connection_id });
        }

        self.flush_outbound(inner).await;
    }

    //---------------------------------------- outbound

    fn resolve_route(&self, inner: &ConnectionInner, route: SendRoute) -> Option<TransportKind> {
        let ready = |kind| self.context.config.transport_mode.uses(kind) && inner.leg_state(kind) == LegState::Ready;
        match route {
            SendRoute::Tcp => ready(TransportKind::Tcp).then_some(TransportKind::Tcp),
            SendRoute::Udp => ready(TransportKind::Udp).then_some(TransportKind::Udp),
            SendRoute::Auto => {
                if ready(TransportKind::Udp) {
                    Some(TransportKind::Udp)
                }
                else if ready(TransportKind::Tcp) {
                    Some(TransportKind::Tcp)
                }
                else {
                    None
                }
            }
        }
    }

    /// Sends a packet, or queues it until the leg it needs has completed its handshake
    pub async fn send_packet(&self, packet: SendablePacket, route: SendRoute) -> anyhow::Result<()> {
        if !self.is_available() {
            bail!("connection is closed");
        }
        let config = &self.context.config;
        if packet.command_id().is_some() != config.data_transfer {
            bail!("packets must carry a command id if and only if data transfer mode is on");
        }
        if packet.frame_len() > config.max_frame_len {
            bail!("packet length {} exceeds the maximum frame length of {}", packet.frame_len(), config.max_frame_len);
        }
        match route {
            SendRoute::Tcp if !config.transport_mode.uses(TransportKind::Tcp) => bail!("TCP is not used in transport mode {:?}", config.transport_mode),
            SendRoute::Udp if !config.transport_mode.uses(TransportKind::Udp) => bail!("UDP is not used in transport mode {:?}", config.transport_mode),
            _ => {}
        }

        let mut inner = self.inner.write().await;
        match self.resolve_route(&inner, route) {
            Some(kind) => self.do_send(&mut inner, packet, kind).await,
            None => {
                trace!("connection {}: leg not ready - queueing packet", self.connection_id());
                inner.outbound.push_back((packet, route));
                Ok(())
            }
        }
    }

    async fn do_send(&self, inner: &mut ConnectionInner, packet: SendablePacket, kind: TransportKind) -> anyhow::Result<()> {
        match kind {
            TransportKind::Tcp => {
                let cipher = self.crypto_cipher(inner);
                let Some(tcp) = inner.tcp.as_mut() else {
                    bail!("no TCP leg");
                };
                let sequence = tcp.next_send_sequence();
                let finalized = packet.finalize(TransportKind::Tcp, cipher.as_deref(), Some(sequence))?;
                tcp.send(Bytes::copy_from_slice(finalized.as_ref()))
            }
            TransportKind::Udp => {
                let Some(channel) = &inner.udp else {
                    bail!("no UDP channel");
                };
                let finalized = packet.finalize(TransportKind::Udp, None, None)?;
                channel.sender.enqueue(finalized.as_ref()).await
            }
        }
    }

    async fn flush_outbound(&self, inner: &mut ConnectionInner) {
        let mut still_waiting = VecDeque::new();
        while let Some((packet, route)) = inner.outbound.pop_front() {
            match self.resolve_route(inner, route) {
                Some(kind) => {
                    if let Err(e) = self.do_send(inner, packet, kind).await {
                        debug!("connection {}: error sending queued packet: {}", self.connection_id(), e);
                    }
                }
                None => still_waiting.push_back((packet, route)),
            }
        }
        inner.outbound = still_waiting;
    }

    /// Sends a keep-alive on every ready leg
    pub async fn send_keep_alive(&self) {
        let inner = self.inner.read().await;
        if !self.is_available() {
            return;
        }
        if inner.tcp_state == LegState::Ready {
            if let Some(tcp) = &inner.tcp {
                if let Err(e) = tcp.send_control(StructureType::KeepAlive) {
                    debug!("connection {}: error sending keep-alive: {}", self.connection_id(), e);
                }
            }
        }
        if let (Some(channel), Some(identity)) = (&inner.udp, self.identity()) {
            channel.sender.send_control(&ser_header_only(StructureType::KeepAlive, identity)).await;
        }
    }

    //---------------------------------------- close

    /// Closing is idempotent: only the first call has an effect
    pub async fn close(&self, reason: CloseReason) {
        let mut inner = self.inner.write().await;
        self.close_locked(&mut inner, reason).await;
    }

    async fn close_locked(&self, inner: &mut ConnectionInner, reason: CloseReason) {
        if !self.available.swap(false, Ordering::AcqRel) {
            return;
        }
        let connection_id = self.connection_id();
        info!("closing connection {}: {:?}", connection_id, reason);

        if reason != CloseReason::PeerDisconnect {
            if let Some(tcp) = &inner.tcp {
                if inner.tcp_state == LegState::Ready {
                    if let Err(e) = tcp.send_control(StructureType::Close) {
                        debug!("connection {}: error sending CLOSE: {}", connection_id, e);
                    }
                }
            }
            if let (Some(channel), Some(identity)) = (&inner.udp, self.identity()) {
                channel.sender.send_control(&ser_header_only(StructureType::Close, identity)).await;
            }
        }

        if let Some(read_task) = self.tcp_read_task.lock().unwrap().take() {
            read_task.abort();
        }
        if let Some(mut tcp) = inner.tcp.take() {
            tcp.shutdown();
        }
        if let Some(mut channel) = inner.udp.take() {
            channel.sender.dispose().await;
            channel.receiver.clear();
        }
        inner.udp_link = None;
        if !inner.outbound.is_empty() {
            debug!("connection {}: discarding {} queued packets", connection_id, inner.outbound.len());
            inner.outbound.clear();
        }
        inner.pending_seed = None;
        self.tcp_inbox.lock().unwrap().clear();
        self.udp_inbox.lock().unwrap().clear();

        self.emit(ConnectionEvent::Closed { connection_id, reason });
        if let (Some(notification), Some(identity)) = (&self.closed_notification, self.identity()) {
            let _ = notification.send(identity);
        }
    }
}

impl StreamHandler for Connection {
    fn on_readable(&self, data: &[u8]) {
        self.on_tcp_bytes(data);
    }

    fn on_closed(&self, reason: CloseReason) {
        self.close_request().request_close(reason);
    }
}
