use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::codec::receivable::ReceivablePacket;
use crate::error::CloseReason;
use crate::structure_type::TransportKind;

/// Connection lifecycle, as seen by application code. Received packets do not go through here
///  but to a [`PacketDispatcher`].
///
/// Connection ids are assigned by the server during the handshake. Events for a client
///  connection that never received its id carry id 0.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    /// a server registered a new connection
    NewConnection { connection_id: u32 },
    /// a server removed a closed connection from its registry
    RemovedConnection { connection_id: u32 },
    HandshakeComplete { connection_id: u32, transport: TransportKind },
    /// all legs required by the transport mode completed their handshake
    Ready { connection_id: u32 },
    KeepAliveReceived { connection_id: u32, transport: TransportKind },
    Closed { connection_id: u32, reason: CloseReason },
}

/// Receives the packets of every connection it is registered with. Each connection calls it in
///  stream order, one packet at a time.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketDispatcher: Send + Sync + 'static {
    async fn on_packet(&self, connection_id: u32, packet: ReceivablePacket);
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedPacket {
    pub connection_id: u32,
    pub packet: ReceivablePacket,
}

/// Application code that prefers pulling packets from a channel. The channel is unbounded: a
///  slow consumer accumulates packets rather than losing them.
#[async_trait]
impl PacketDispatcher for mpsc::UnboundedSender<ReceivedPacket> {
    async fn on_packet(&self, connection_id: u32, packet: ReceivablePacket) {
        if self.send(ReceivedPacket { connection_id, packet }).is_err() {
            trace!("packet receiver was dropped - discarding packet from connection {}", connection_id);
        }
    }
}

pub struct EventNotifier {
    sender: broadcast::Sender<ConnectionEvent>,
}
impl EventNotifier {
    pub fn new(capacity: usize) -> EventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        EventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ConnectionEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
