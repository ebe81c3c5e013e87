use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::structure_type::TransportMode;
use crate::udp::datagram::{UDP_DATA_HEADER_LEN, UDP_HEADER_LEN};
use crate::crypto::TRAILER_LEN;

#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// For a server, this is the address the TCP listener and the UDP socket are bound to. For a
    ///  client, it is the server's address. TCP and UDP share the same port.
    pub addr: SocketAddr,

    /// The legs a connection uses. A connection is only reported as ready when all of its legs
    ///  have completed their handshake.
    pub transport_mode: TransportMode,

    /// In 'data transfer' mode, each DATA packet carries an additional 8 byte command id after the
    ///  protocol code. This is used for routing through intermediaries. Both sides must agree on
    ///  this setting, there is no negotiation.
    pub data_transfer: bool,

    /// Whether DATA packets (and UDP ACKs) are keystream-encrypted and carry an integrity trailer.
    ///  Both sides must agree on this setting.
    pub crypto: bool,

    /// If true, a server closes connections that sent no keep-alive for `keep_alive_max_age`, and a
    ///  client sends heartbeats every `heartbeat_interval`.
    pub keep_alive: bool,
    pub keep_alive_sweep_interval: Duration,
    pub keep_alive_max_age: Duration,
    pub heartbeat_interval: Duration,

    /// A client re-sends its current UDP handshake step at this interval until the UDP leg is ready
    pub handshake_retry_interval: Duration,
    /// A server forgets an identity issued for a UDP connection request if the handshake does not
    ///  start within this time. Expiry is checked every `keep_alive_sweep_interval`.
    pub pending_identity_max_age: Duration,

    /// This is the maximum number of UDP datagrams that are sent but not yet acknowledged
    pub udp_window_size: usize,
    /// timeout for the ACK after the first send of a UDP datagram
    pub udp_first_ack_timeout: Duration,
    /// timeout for the ACK after each resend of a UDP datagram
    pub udp_resend_ack_timeout: Duration,
    /// a datagram that is still not acknowledged after this many resends causes the connection to
    ///  be closed
    pub udp_max_resends: u32,

    /// Size of pooled buffers for TCP reads
    pub tcp_buffer_size: usize,
    /// Size of pooled buffers for UDP datagrams. This is the maximum datagram size, so it must be
    ///  supported by all network hops between peers.
    pub udp_buffer_size: usize,
    /// This is the number of buffers that are pooled at a given time - buffers in excess of this
    ///  number are discarded when they are returned.
    pub tcp_pool_size: usize,
    pub udp_pool_size: usize,

    /// maximum number of concurrently running decode / dispatch tasks
    pub worker_pool_size: usize,

    /// TCP frames (and reassembled UDP packets) longer than this are treated as a protocol
    ///  violation
    pub max_frame_len: usize,

    /// number of consecutive rejected TCP DATA frames (sequence or integrity mismatch) after which
    ///  the connection is closed
    pub max_sequence_mismatches: u32,

    pub event_channel_capacity: usize,
}

impl SocketConfig {
    pub fn new(addr: SocketAddr) -> SocketConfig {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        SocketConfig {
            addr,
            transport_mode: TransportMode::Both,
            data_transfer: false,
            crypto: true,
            keep_alive: true,
            keep_alive_sweep_interval: Duration::from_secs(15),
            keep_alive_max_age: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(10),
            handshake_retry_interval: Duration::from_secs(1),
            pending_identity_max_age: Duration::from_secs(30),
            udp_window_size: 10,
            udp_first_ack_timeout: Duration::from_millis(750),
            udp_resend_ack_timeout: Duration::from_millis(300),
            udp_max_resends: 10,
            tcp_buffer_size: 1024,
            udp_buffer_size: 512,
            tcp_pool_size: 10000,
            udp_pool_size: 10000,
            worker_pool_size: parallelism + 10,
            max_frame_len: 16*1024*1024,
            max_sequence_mismatches: 3,
            event_channel_capacity: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.udp_window_size == 0 {
            bail!("UDP window size must be at least 1");
        }
        if self.udp_buffer_size <= UDP_DATA_HEADER_LEN + TRAILER_LEN || self.udp_buffer_size <= UDP_HEADER_LEN + 1 + 4 + 32 {
            bail!("UDP buffer size {} is too small for a single datagram", self.udp_buffer_size);
        }
        if self.tcp_buffer_size == 0 {
            bail!("TCP buffer size must not be 0");
        }
        if self.tcp_pool_size == 0 || self.udp_pool_size == 0 {
            bail!("buffer pool sizes must not be 0");
        }
        if self.worker_pool_size == 0 {
            bail!("worker pool size must not be 0");
        }
        if self.keep_alive_max_age.is_zero() {
            bail!("keep-alive max age must not be 0");
        }
        if self.keep_alive_sweep_interval.is_zero() {
            bail!("keep-alive sweep interval must not be 0");
        }
        if self.max_sequence_mismatches == 0 {
            bail!("max sequence mismatches must be at least 1");
        }
        if self.event_channel_capacity == 0 {
            bail!("event channel capacity must not be 0");
        }
        Ok(())
    }

    /// the maximum number of stream payload bytes in a single UDP DATA datagram
    pub fn udp_fragment_len(&self) -> usize {
        self.udp_buffer_size - UDP_DATA_HEADER_LEN - TRAILER_LEN
    }
}
