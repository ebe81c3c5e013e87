use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::config::SocketConfig;
use crate::structure_type::TransportKind;

/// A pool of fixed-size buffers. An empty pool allocates a fresh buffer rather than failing, and
///  a full pool discards returned buffers.
///
/// The pool retains no reference to buffers that are checked out: the caller owns them
///  exclusively until it returns them (or drops them, which is fine as well).
pub struct BufferPool {
    buf_size: usize,
    max_pooled: usize,
    buffers: Mutex<Vec<BytesMut>>,
    checked_out: AtomicUsize,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pooled: usize) -> BufferPool {
        BufferPool {
            buf_size,
            max_pooled,
            buffers: Mutex::new(Vec::new()),
            checked_out: AtomicUsize::new(0),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_from_pool(&self) -> BytesMut {
        self.checked_out.fetch_add(1, Ordering::AcqRel);
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        let _ = self.checked_out.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        if buffer.capacity() < self.buf_size {
            // the buffer was split or frozen somewhere along the way and lost its capacity
            trace!("discarding returned buffer with reduced capacity");
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_pooled {
            buffers.push(buffer)
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    /// number of buffers currently in the pool
    pub fn available(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    /// number of buffers handed out and not returned. Buffers that are dropped instead of returned
    ///  stay counted.
    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::Acquire)
    }
}

/// One pool per transport kind because TCP and UDP use different buffer sizes
pub struct BufferPools {
    tcp: BufferPool,
    udp: BufferPool,
}

impl BufferPools {
    pub fn new(config: &SocketConfig) -> BufferPools {
        BufferPools {
            tcp: BufferPool::new(config.tcp_buffer_size, config.tcp_pool_size),
            udp: BufferPool::new(config.udp_buffer_size, config.udp_pool_size),
        }
    }

    pub fn pool(&self, kind: TransportKind) -> &BufferPool {
        match kind {
            TransportKind::Tcp => &self.tcp,
            TransportKind::Udp => &self.udp,
        }
    }

    pub fn acquire(&self, kind: TransportKind) -> BytesMut {
        self.pool(kind).get_from_pool()
    }

    pub fn release(&self, kind: TransportKind, buffer: BytesMut) {
        self.pool(kind).return_to_pool(buffer)
    }
}
