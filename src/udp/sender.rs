use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::config::SocketConfig;
use crate::crypto::PacketCipher;
use crate::error::{CloseReason, CloseRequest};
use crate::registry::ConnectionIdentity;
use crate::udp::datagram::ser_data;
use crate::udp::DatagramSocket;

/// A DATA datagram that was sent and is waiting for its ACK
struct WindowCell {
    datagram: Bytes,
    send_count: u32,
    acked: bool,
    timer: Option<JoinHandle<()>>,
}

impl WindowCell {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct UdpSenderInner {
    config: Arc<SocketConfig>,
    socket: Arc<dyn DatagramSocket>,
    peer_addr: SocketAddr,
    identity: ConnectionIdentity,
    cipher: Option<Arc<PacketCipher>>,
    close_request: Arc<dyn CloseRequest>,

    next_sequence: u32,
    /// serialized datagrams that did not fit into the window yet
    queue: VecDeque<(u32, Bytes)>,
    window: BTreeMap<u32, WindowCell>,
    disposed: bool,
}

impl UdpSenderInner {
    async fn pump(&mut self, myself: &Weak<RwLock<UdpSenderInner>>) {
        while self.window.len() < self.config.udp_window_size {
            let Some((sequence, datagram)) = self.queue.pop_front() else {
                break;
            };

            trace!("sending UDP datagram #{} to {:?}", sequence, self.peer_addr);
            self.socket.send_datagram(self.peer_addr, &datagram).await;

            let timer = arm_ack_timer(myself.clone(), sequence, self.config.udp_first_ack_timeout);
            self.window.insert(sequence, WindowCell {
                datagram,
                send_count: 1,
                acked: false,
                timer: Some(timer),
            });
        }
    }

    /// Cells leave the window strictly in sequence order, even if ACKs arrive out of order
    fn retire_acknowledged_prefix(&mut self) {
        while let Some(entry) = self.window.first_entry() {
            if !entry.get().acked {
                break;
            }
            trace!("retiring UDP datagram #{}", entry.key());
            entry.remove();
        }
    }
}

fn arm_ack_timer(inner: Weak<RwLock<UdpSenderInner>>, sequence: u32, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        time::sleep(timeout).await;
        if let Some(inner) = inner.upgrade() {
            UdpSender::on_ack_timeout(&inner, sequence).await;
        }
    })
}

/// The sending half of a UDP leg: it splits outgoing packet records into fragments, keeps up to
///  `udp_window_size` of them in flight and retransmits fragments whose ACK does not arrive in
///  time.
///
/// Control datagrams (ACKs, keep-alives, ...) bypass the window, see [`UdpSender::send_control`].
pub struct UdpSender {
    inner: Arc<RwLock<UdpSenderInner>>,
}

impl UdpSender {
    pub fn new(
        config: Arc<SocketConfig>,
        socket: Arc<dyn DatagramSocket>,
        peer_addr: SocketAddr,
        identity: ConnectionIdentity,
        cipher: Option<Arc<PacketCipher>>,
        close_request: Arc<dyn CloseRequest>,
    ) -> UdpSender {
        UdpSender {
            inner: Arc::new(RwLock::new(UdpSenderInner {
                config,
                socket,
                peer_addr,
                identity,
                cipher,
                close_request,
                next_sequence: 0,
                queue: VecDeque::new(),
                window: BTreeMap::new(),
                disposed: false,
            })),
        }
    }

    pub async fn peer_addr(&self) -> SocketAddr {
        self.inner.read().await.peer_addr
    }

    /// Queues a packet record (see [`crate::codec::sendable::SendablePacket::finalize`]) for
    ///  reliable transmission
    pub async fn enqueue(&self, record: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner.disposed {
            bail!("UDP leg to {:?} is closed", inner.peer_addr);
        }

        let fragment_len = inner.config.udp_fragment_len();
        for fragment in record.chunks(fragment_len) {
            let sequence = inner.next_sequence;
            inner.next_sequence = sequence.wrapping_add(1);
            let datagram = ser_data(inner.identity, sequence, fragment, inner.cipher.as_deref());
            inner.queue.push_back((sequence, datagram));
        }

        inner.pump(&Arc::downgrade(&self.inner)).await;
        Ok(())
    }

    pub async fn on_ack(&self, sequence: u32) {
        let mut inner = self.inner.write().await;
        match inner.window.get_mut(&sequence) {
            Some(cell) => {
                cell.acked = true;
                cell.cancel_timer();
            }
            None => {
                trace!("ACK for UDP datagram #{} that is not in the send window - ignoring", sequence);
                return;
            }
        }

        inner.retire_acknowledged_prefix();
        inner.pump(&Arc::downgrade(&self.inner)).await;
    }

    async fn on_ack_timeout(inner_arc: &Arc<RwLock<UdpSenderInner>>, sequence: u32) {
        let mut inner = inner_arc.write().await;
        if inner.disposed {
            return;
        }

        let max_resends = inner.config.udp_max_resends;
        let resend_timeout = inner.config.udp_resend_ack_timeout;
        let peer_addr = inner.peer_addr;

        let Some(cell) = inner.window.get_mut(&sequence) else {
            return;
        };
        if cell.acked {
            return;
        }

        if cell.send_count > max_resends {
            warn!("UDP datagram #{} to {:?} was not acknowledged after {} resends - peer is unreachable", sequence, peer_addr, max_resends);
            inner.close_request.request_close(CloseReason::PeerDisconnect);
            return;
        }

        debug!("no ACK for UDP datagram #{} to {:?} - resending", sequence, peer_addr);
        cell.send_count += 1;
        cell.timer = Some(arm_ack_timer(Arc::downgrade(inner_arc), sequence, resend_timeout));
        let datagram = cell.datagram.clone();
        inner.socket.send_datagram(peer_addr, &datagram).await;
    }

    /// Sends a datagram immediately, without sequence number or retransmission
    pub async fn send_control(&self, datagram: &[u8]) {
        let inner = self.inner.read().await;
        if !inner.disposed {
            inner.socket.send_datagram(inner.peer_addr, datagram).await;
        }
    }

    /// number of sent datagrams that are not retired yet
    pub async fn outstanding(&self) -> usize {
        self.inner.read().await.window.len()
    }

    /// number of datagrams waiting for room in the window
    pub async fn queued(&self) -> usize {
        self.inner.read().await.queue.len()
    }

    /// Cancels all timers and discards unsent and unacknowledged datagrams
    pub async fn dispose(&self) {
        let mut inner = self.inner.write().await;
        inner.disposed = true;
        for cell in inner.window.values_mut() {
            cell.cancel_timer();
        }
        inner.window.clear();
        inner.queue.clear();
    }
}
