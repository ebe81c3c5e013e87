//! The I/O loops: a TCP accept loop, a read loop per TCP stream and a receive loop per UDP
//!  socket. They only move bytes between sockets and pooled buffers and hand them to their
//!  handler, which is expected to return quickly (decoding happens on the worker pool).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::buffer_pool::BufferPools;
use crate::error::CloseReason;
use crate::structure_type::TransportKind;

#[async_trait]
pub trait AcceptHandler: Send + Sync + 'static {
    async fn on_accept(&self, stream: TcpStream, peer_addr: SocketAddr);
}

pub trait StreamHandler: Send + Sync + 'static {
    fn on_readable(&self, data: &[u8]);
    /// called once, when the stream reached EOF or failed
    fn on_closed(&self, reason: CloseReason);
}

#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]);
}

/// Owns the long-running listener and datagram loops of a server or client. They are aborted
///  when the multiplexer is shut down or dropped.
pub struct Multiplexer {
    pools: Arc<BufferPools>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Multiplexer {
    pub fn new(pools: Arc<BufferPools>) -> Multiplexer {
        Multiplexer {
            pools,
            tasks: Default::default(),
        }
    }

    pub fn register_listener(&self, listener: TcpListener, handler: Arc<dyn AcceptHandler>) {
        let handle = tokio::spawn(async move {
            info!("starting accept loop on {:?}", listener.local_addr());
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!("accepted TCP connection from {:?}", peer_addr);
                        handler.on_accept(stream, peer_addr).await;
                    }
                    Err(e) => {
                        error!("error accepting TCP connection: {}", e);
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(handle.abort_handle());
    }

    pub fn register_datagram_socket(&self, socket: Arc<UdpSocket>, handler: Arc<dyn DatagramHandler>) {
        let pools = self.pools.clone();
        let handle = tokio::spawn(async move {
            info!("starting datagram receive loop on {:?}", socket.local_addr());
            let buf_size = pools.pool(TransportKind::Udp).buf_size();
            loop {
                let mut buf = pools.acquire(TransportKind::Udp);
                buf.resize(buf_size, 0);

                let (num_read, from) = match socket.recv_from(&mut buf).await {
                    Ok(x) => x,
                    Err(e) => {
                        // e.g. ICMP 'port unreachable' reported for an earlier send
                        debug!("UDP socket error: {}", e);
                        pools.release(TransportKind::Udp, buf);
                        continue;
                    }
                };
                buf.truncate(num_read);

                let correlation_id = Uuid::new_v4();
                let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
                trace!(parent: &span, "received {} bytes from {:?}", num_read, from);

                handler.on_datagram(from, &buf).instrument(span).await;
                pools.release(TransportKind::Udp, buf);
            }
        });
        self.tasks.lock().unwrap().push(handle.abort_handle());
    }

    /// Starts reading a TCP stream. The returned handle belongs to the stream's owner, aborting
    ///  it stops the read loop without notifying the handler.
    pub fn spawn_stream_reader<R>(pools: Arc<BufferPools>, mut read_half: R, handler: Arc<dyn StreamHandler>) -> AbortHandle
    where R: AsyncRead + Unpin + Send + 'static
    {
        let handle = tokio::spawn(async move {
            loop {
                let mut buf = pools.acquire(TransportKind::Tcp);
                match read_half.read_buf(&mut buf).await {
                    Ok(0) => {
                        debug!("TCP stream closed by peer");
                        pools.release(TransportKind::Tcp, buf);
                        handler.on_closed(CloseReason::PeerDisconnect);
                        return;
                    }
                    Ok(n) => {
                        trace!("read {} bytes from TCP stream", n);
                        handler.on_readable(&buf);
                        pools.release(TransportKind::Tcp, buf);
                    }
                    Err(e) => {
                        debug!("error reading from TCP stream: {}", e);
                        pools.release(TransportKind::Tcp, buf);
                        handler.on_closed(CloseReason::Internal);
                        return;
                    }
                }
            }
        });
        handle.abort_handle()
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
