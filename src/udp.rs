//! The reliable UDP leg of a connection: datagram layout, a windowed sender with ACK timeouts and
//!  retransmission, and a receiver that restores sequence order.

pub mod datagram;
pub mod receiver;
pub mod sender;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a datagram on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Send errors are logged and otherwise ignored: the retransmission logic or the keep-alive
    ///  sweep handles lost datagrams.
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]);
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);

        if let Err(e) = self.send_to(buf, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }
}
