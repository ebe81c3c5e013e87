use std::sync::Arc;

use tracing::info;

use crate::buffer_pool::BufferPools;
use crate::config::SocketConfig;
use crate::crypto::key_exchange::KeyPair;
use crate::util::random::RngRandom;
use crate::worker::WorkerPool;

/// Everything a server or client shares between its connections. It is created explicitly and
///  handed to constructors, there are no process-wide singletons.
pub struct SocketContext {
    pub config: Arc<SocketConfig>,
    pub pools: Arc<BufferPools>,
    pub workers: WorkerPool,
    pub key_pair: KeyPair,
}

impl SocketContext {
    pub fn new(config: SocketConfig) -> anyhow::Result<Arc<SocketContext>> {
        config.validate()?;
        info!("creating socket context for {:?} ({:?}, crypto: {}, data transfer: {})", config.addr, config.transport_mode, config.crypto, config.data_transfer);

        Ok(Arc::new(SocketContext {
            pools: Arc::new(BufferPools::new(&config)),
            workers: WorkerPool::new(config.worker_pool_size),
            key_pair: KeyPair::generate::<RngRandom>(),
            config: Arc::new(config),
        }))
    }
}

impl Drop for SocketContext {
    fn drop(&mut self) {
        self.workers.shutdown();
    }
}
