use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::connection::Connection;
use crate::error::CloseReason;
use crate::util::random::{Random, RngRandom};

/// The pair that identifies a connection on the wire. The check code is random, so knowing (or
///  guessing) a connection id is not sufficient for injecting datagrams into the connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnectionIdentity {
    pub connection_id: u32,
    pub check_code: u32,
}

/// A server's connections by id, plus identities that were handed out through a UDP connection
///  request and have no connection yet
pub struct ConnectionRegistry {
    next_id: Mutex<u32>,
    connections: RwLock<FxHashMap<u32, Arc<Connection>>>,
    /// connection id -> (check code, time of issue)
    pending_udp: Mutex<FxHashMap<u32, (u32, Instant)>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        ConnectionRegistry::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> ConnectionRegistry {
        ConnectionRegistry {
            next_id: Mutex::new(1),
            connections: Default::default(),
            pending_udp: Default::default(),
        }
    }

    pub fn issue_identity(&self) -> ConnectionIdentity {
        self.issue_identity_with::<RngRandom>()
    }

    /// connection ids are strictly increasing, check codes are random
    pub fn issue_identity_with<R: Random>(&self) -> ConnectionIdentity {
        let connection_id = {
            let mut next_id = self.next_id.lock().unwrap();
            let result = *next_id;
            *next_id = next_id.wrapping_add(1).max(1);
            result
        };
        ConnectionIdentity {
            connection_id,
            check_code: R::check_code(),
        }
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        let Some(identity) = connection.identity() else {
            debug!("not registering connection without identity");
            return;
        };
        trace!("registering connection {}", identity.connection_id);
        self.connections.write().unwrap()
            .insert(identity.connection_id, connection);
    }

    /// Looks up a connection by id alone. This is for local callers, datagrams must go through
    ///  [`ConnectionRegistry::get`].
    pub fn get_by_id(&self, connection_id: u32) -> Option<Arc<Connection>> {
        self.connections.read().unwrap()
            .get(&connection_id)
            .cloned()
    }

    /// Looks up a connection, verifying the check code
    pub fn get(&self, identity: ConnectionIdentity) -> Option<Arc<Connection>> {
        let connections = self.connections.read().unwrap();
        let connection = connections.get(&identity.connection_id)?;
        if connection.identity() != Some(identity) {
            debug!("check code mismatch for connection {}", identity.connection_id);
            return None;
        }
        Some(connection.clone())
    }

    pub fn remove(&self, connection_id: u32) -> Option<Arc<Connection>> {
        self.connections.write().unwrap()
            .remove(&connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().unwrap()
            .values()
            .cloned()
            .collect()
    }

    pub fn add_pending(&self, identity: ConnectionIdentity) {
        self.pending_udp.lock().unwrap()
            .insert(identity.connection_id, (identity.check_code, Instant::now()));
    }

    /// Removes a pending identity, returning `true` if it was present
    pub fn take_pending(&self, identity: ConnectionIdentity) -> bool {
        let mut pending = self.pending_udp.lock().unwrap();
        match pending.get(&identity.connection_id) {
            Some((check_code, _)) if *check_code == identity.check_code => {
                pending.remove(&identity.connection_id);
                true
            }
            _ => false,
        }
    }

    /// Forgets identities whose handshake did not start within `max_age`. A client whose request
    ///  is forgotten this way asks again and gets a new identity.
    pub fn expire_pending(&self, max_age: Duration) {
        let mut pending = self.pending_udp.lock().unwrap();
        let before = pending.len();
        pending.retain(|_, (_, issued)| issued.elapsed() <= max_age);
        if pending.len() < before {
            debug!("expired {} pending UDP identities", before - pending.len());
        }
    }

    pub fn num_pending(&self) -> usize {
        self.pending_udp.lock().unwrap().len()
    }

    /// Closes all connections that did not receive a keep-alive for longer than `max_age`. The
    ///  closed connections are removed from the registry through their close notification.
    pub async fn close_idle(&self, max_age: Duration) {
        // snapshot so no lock is held while closing
        let idle = self.all().into_iter()
            .filter(|c| c.idle_for() > max_age)
            .collect::<Vec<_>>();

        for connection in idle {
            info!("connection {:?}: no keep-alive for {:?} - closing", connection.identity(), connection.idle_for());
            connection.close(CloseReason::Internal).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketConfig;
    use crate::connection::Role;
    use crate::context::SocketContext;
    use crate::events::{MockPacketDispatcher, PacketDispatcher};
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};
    use std::net::SocketAddr;
    use tokio::runtime::Builder;
    use tokio::time;

    fn context() -> Arc<SocketContext> {
        SocketContext::new(SocketConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))).unwrap()
    }

    fn dispatcher() -> Arc<dyn PacketDispatcher> {
        Arc::new(MockPacketDispatcher::new())
    }

    #[test]
    fn test_issue_identity() {
        let _lock = MOCK_RANDOM_MUTEX.lock();
        let ctx = MockRandom::check_code_context();
        ctx.expect().return_const(99u32);

        let registry = ConnectionRegistry::new();
        assert_eq!(registry.issue_identity_with::<MockRandom>(), ConnectionIdentity { connection_id: 1, check_code: 99 });
        assert_eq!(registry.issue_identity_with::<MockRandom>(), ConnectionIdentity { connection_id: 2, check_code: 99 });
    }

    #[test]
    fn test_pending() {
        let registry = ConnectionRegistry::new();
        let identity = ConnectionIdentity { connection_id: 4, check_code: 5 };
        registry.add_pending(identity);

        assert!(!registry.take_pending(ConnectionIdentity { connection_id: 4, check_code: 6 }));
        assert!(registry.take_pending(identity));
        assert!(!registry.take_pending(identity));
        assert_eq!(registry.num_pending(), 0);
    }

    #[test]
    fn test_expire_pending() {
        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap().block_on(async {
            let registry = ConnectionRegistry::new();
            for _ in 0..200 {
                registry.add_pending(registry.issue_identity());
            }
            time::sleep(Duration::from_secs(3)).await;
            let young = registry.issue_identity();
            registry.add_pending(young);

            registry.expire_pending(Duration::from_secs(5));
            assert_eq!(registry.num_pending(), 201);

            time::sleep(Duration::from_secs(3)).await;
            registry.expire_pending(Duration::from_secs(5));
            assert_eq!(registry.num_pending(), 1);
            assert!(registry.take_pending(young));

            registry.expire_pending(Duration::from_secs(5));
            assert_eq!(registry.num_pending(), 0);
        });
    }

    #[test]
    fn test_lookup_verifies_check_code() {
        Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
            let registry = ConnectionRegistry::new();
            let identity = ConnectionIdentity { connection_id: 3, check_code: 8 };
            registry.insert(Connection::new(context(), Role::Server, Some(identity), dispatcher(), None, None));

            assert!(registry.get(identity).is_some());
            assert!(registry.get(ConnectionIdentity { connection_id: 3, check_code: 9 }).is_none());
            assert!(registry.get(ConnectionIdentity { connection_id: 4, check_code: 8 }).is_none());
            assert_eq!(registry.get_by_id(3).map(|c| c.identity()), Some(Some(identity)));
            assert!(registry.get_by_id(4).is_none());

            assert!(registry.remove(3).is_some());
            assert!(registry.is_empty());
        });
    }

    #[test]
    fn test_close_idle() {
        Builder::new_current_thread().enable_all().start_paused(true).build().unwrap().block_on(async {
            let context = context();
            let registry = ConnectionRegistry::new();
            let old = Connection::new(context.clone(), Role::Server, Some(ConnectionIdentity { connection_id: 1, check_code: 1 }), dispatcher(), None, None);
            registry.insert(old.clone());

            time::sleep(Duration::from_secs(10)).await;
            let young = Connection::new(context.clone(), Role::Server, Some(ConnectionIdentity { connection_id: 2, check_code: 1 }), dispatcher(), None, None);
            registry.insert(young.clone());

            time::sleep(Duration::from_secs(6)).await;
            registry.close_idle(Duration::from_secs(15)).await;

            assert!(!old.is_available());
            assert!(young.is_available());
        });
    }
}
