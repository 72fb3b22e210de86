use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use switchyard_rpc::{ClientConnection, InFlightRequests};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::error::ClientError;
use crate::node::{Node, NodeId};

#[derive(Clone)]
/// A per node pool of reusable client connections.
///
/// Each connection is multiplexed, a connection is only checked out for
/// as long as it takes to write a request and replies are matched up through
/// the shared in-flight table. No more than `max_connections_per_node`
/// connections are ever open to a single node.
pub struct ConnectionPool(Arc<PoolInner>);

struct PoolInner {
    max_connections_per_node: usize,
    connect_timeout: Duration,
    in_flight: InFlightRequests,
    nodes: RwLock<HashMap<NodeId, Arc<NodeSlots>>>,
    closed: AtomicBool,
}

struct NodeSlots {
    node_id: NodeId,
    address: String,
    permits: Arc<Semaphore>,
    slots: Mutex<SlotList>,
}

#[derive(Default)]
struct SlotList {
    idle: VecDeque<Arc<ClientConnection>>,
    num_open: usize,
    evicted: bool,
}

impl NodeSlots {
    fn new(node: &Node, max_connections: usize) -> Self {
        Self {
            node_id: node.id,
            address: node.address.clone(),
            permits: Arc::new(Semaphore::new(max_connections)),
            slots: Mutex::new(SlotList::default()),
        }
    }

    /// Takes the most recently used idle connection which is still open.
    fn take_idle(&self) -> Option<Arc<ClientConnection>> {
        let mut slots = self.slots.lock();
        while let Some(connection) = slots.idle.pop_back() {
            if !connection.is_closed() {
                return Some(connection);
            }
            slots.num_open -= 1;
        }
        None
    }

    fn opened(&self) {
        self.slots.lock().num_open += 1;
    }

    fn give_back(&self, connection: Arc<ClientConnection>) {
        let mut slots = self.slots.lock();
        if slots.evicted || connection.is_closed() {
            slots.num_open -= 1;
            drop(slots);
            connection.close();
            return;
        }
        slots.idle.push_back(connection);
    }

    fn discard(&self, connection: &ClientConnection) {
        self.slots.lock().num_open -= 1;
        connection.close();
    }

    /// Closes every idle connection and stops handing out new ones.
    ///
    /// Connections checked out at the time are closed when given back.
    fn evict(&self) {
        self.permits.close();

        let idle = {
            let mut slots = self.slots.lock();
            slots.evicted = true;
            slots.num_open -= slots.idle.len();
            std::mem::take(&mut slots.idle)
        };

        for connection in idle {
            connection.close();
        }
    }
}

impl ConnectionPool {
    pub fn new(
        max_connections_per_node: usize,
        connect_timeout: Duration,
        in_flight: InFlightRequests,
    ) -> Self {
        Self(Arc::new(PoolInner {
            max_connections_per_node: max_connections_per_node.max(1),
            connect_timeout,
            in_flight,
            nodes: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }))
    }

    /// Checks out a connection to the given node.
    ///
    /// An idle connection is reused if one exists, otherwise a new one is
    /// opened. If every connection to the node is checked out the call waits
    /// for one to be given back, up to the connect timeout.
    pub async fn acquire(&self, node: &Node) -> Result<PooledConnection, ClientError> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Connection(
                "The connection pool has been closed.".to_string(),
            ));
        }

        let slots = self.slots_for(node);
        let permit = tokio::time::timeout(
            self.0.connect_timeout,
            slots.permits.clone().acquire_owned(),
        )
        .await;

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ClientError::Connection(format!(
                    "Node {} was removed from the pool.",
                    node.id
                )))
            },
            Err(_) => {
                warn!(
                    node_id = node.id,
                    max_connections = self.0.max_connections_per_node,
                    "Timed out waiting for a free connection."
                );
                return Err(ClientError::PoolExhausted {
                    node_id: node.id,
                    timeout: self.0.connect_timeout,
                });
            },
        };

        if let Some(connection) = slots.take_idle() {
            return Ok(PooledConnection::new(slots, connection, permit));
        }

        let addr = node
            .socket_addr()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        let connection =
            ClientConnection::connect(addr, self.0.connect_timeout, self.0.in_flight.clone())
                .await
                .map_err(|e| {
                    warn!(
                        node_id = node.id,
                        target_addr = %addr,
                        error = %e,
                        "Failed to connect to node."
                    );
                    ClientError::Connection(e.to_string())
                })?;

        trace!(node_id = node.id, target_addr = %addr, "Opened new pooled connection.");
        slots.opened();

        Ok(PooledConnection::new(slots, Arc::new(connection), permit))
    }

    /// Gives a healthy connection back to the pool.
    pub fn release(&self, connection: PooledConnection) {
        drop(connection);
    }

    /// Closes a connection which failed during use instead of returning it
    /// to the pool.
    pub fn invalidate(&self, mut connection: PooledConnection) {
        debug!(
            node_id = connection.slots.node_id,
            connection_id = connection.connection.id(),
            "Invalidating pooled connection."
        );
        connection.invalidated = true;
    }

    /// Closes and evicts every connection to the given node.
    ///
    /// Requests still waiting on a reply from those connections fail.
    pub fn on_node_removed(&self, node_id: NodeId) {
        let removed = self.0.nodes.write().remove(&node_id);
        if let Some(slots) = removed {
            info!(
                node_id = node_id,
                target_addr = %slots.address,
                "Evicting connections to node."
            );
            slots.evict();
        }
    }

    /// The number of open connections to the given node.
    pub fn num_connections(&self, node_id: NodeId) -> usize {
        self.0
            .nodes
            .read()
            .get(&node_id)
            .map(|slots| slots.slots.lock().num_open)
            .unwrap_or(0)
    }

    /// Closes every connection in the pool.
    pub fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
        let nodes = std::mem::take(&mut *self.0.nodes.write());
        for slots in nodes.into_values() {
            slots.evict();
        }
    }

    fn slots_for(&self, node: &Node) -> Arc<NodeSlots> {
        {
            let nodes = self.0.nodes.read();
            if let Some(slots) = nodes.get(&node.id) {
                if slots.address == node.address {
                    return slots.clone();
                }
            }
        }

        let mut nodes = self.0.nodes.write();
        if let Some(slots) = nodes.get(&node.id) {
            if slots.address == node.address {
                return slots.clone();
            }
        }

        let slots = Arc::new(NodeSlots::new(node, self.0.max_connections_per_node));
        if let Some(previous) = nodes.insert(node.id, slots.clone()) {
            info!(
                node_id = node.id,
                old_addr = %previous.address,
                new_addr = %node.address,
                "Node address changed, evicting old connections."
            );
            previous.evict();
        }

        slots
    }
}

/// A connection checked out from the [ConnectionPool].
///
/// Dropping it gives the connection back to the pool.
pub struct PooledConnection {
    slots: Arc<NodeSlots>,
    connection: Arc<ClientConnection>,
    invalidated: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(
        slots: Arc<NodeSlots>,
        connection: Arc<ClientConnection>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            slots,
            connection,
            invalidated: false,
            _permit: permit,
        }
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.slots.node_id
    }

    #[inline]
    pub fn connection(&self) -> &ClientConnection {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.invalidated {
            self.slots.discard(&self.connection);
        } else {
            self.slots.give_back(self.connection.clone());
        }
    }
}

impl Debug for PooledConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("node_id", &self.slots.node_id)
            .field("connection", &self.connection)
            .field("invalidated", &self.invalidated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use switchyard_rpc::{HandlerRegistry, Server, WorkerPoolConfig};

    use super::*;

    async fn start_server() -> Server {
        let addr = test_helper::get_unused_addr();
        Server::listen(addr, HandlerRegistry::default(), WorkerPoolConfig::default())
            .await
            .unwrap()
    }

    fn node_for(id: NodeId, addr: SocketAddr) -> Node {
        Node::new(id, addr.to_string()).with_available(true)
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let _ = tracing_subscriber::fmt::try_init();

        let server = start_server().await;
        let node = node_for(1, server.local_addr());
        let pool = ConnectionPool::new(2, Duration::from_secs(1), InFlightRequests::default());

        let first = pool.acquire(&node).await.unwrap();
        let first_id = first.connection().id();
        pool.release(first);

        let second = pool.acquire(&node).await.unwrap();
        assert_eq!(second.connection().id(), first_id);
        assert_eq!(pool.num_connections(1), 1);
    }

    #[tokio::test]
    async fn test_pool_exhausted() {
        let _ = tracing_subscriber::fmt::try_init();

        let server = start_server().await;
        let node = node_for(1, server.local_addr());
        let pool =
            ConnectionPool::new(2, Duration::from_millis(100), InFlightRequests::default());

        let first = pool.acquire(&node).await.unwrap();
        let second = pool.acquire(&node).await.unwrap();
        assert_ne!(first.connection().id(), second.connection().id());
        assert_eq!(pool.num_connections(1), 2);

        let err = pool.acquire(&node).await.unwrap_err();
        assert_eq!(
            err,
            ClientError::PoolExhausted {
                node_id: 1,
                timeout: Duration::from_millis(100),
            }
        );
        assert_eq!(pool.num_connections(1), 2);

        let waiter = {
            let pool = pool.clone();
            let node = node.clone();
            tokio::spawn(async move { pool.acquire(&node).await.map(|c| c.connection().id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let released_id = second.connection().id();
        drop(second);

        assert_eq!(waiter.await.unwrap(), Ok(released_id));
        assert_eq!(pool.num_connections(1), 2);
        drop(first);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let _ = tracing_subscriber::fmt::try_init();

        let server = start_server().await;
        let node = node_for(1, server.local_addr());
        let pool = ConnectionPool::new(2, Duration::from_secs(1), InFlightRequests::default());

        let first = pool.acquire(&node).await.unwrap();
        let first_id = first.connection().id();
        pool.invalidate(first);
        assert_eq!(pool.num_connections(1), 0);

        let second = pool.acquire(&node).await.unwrap();
        assert_ne!(second.connection().id(), first_id);
    }

    #[tokio::test]
    async fn test_node_removed() {
        let _ = tracing_subscriber::fmt::try_init();

        let server = start_server().await;
        let node = node_for(1, server.local_addr());
        let pool = ConnectionPool::new(2, Duration::from_secs(1), InFlightRequests::default());

        let idle = pool.acquire(&node).await.unwrap();
        let busy = pool.acquire(&node).await.unwrap();
        pool.release(idle);

        pool.on_node_removed(1);
        assert_eq!(pool.num_connections(1), 0);
        assert!(!busy.connection().is_closed());
        let busy_id = busy.connection().id();
        drop(busy);

        let fresh = pool.acquire(&node).await.unwrap();
        assert_ne!(fresh.connection().id(), busy_id);
        assert_eq!(pool.num_connections(1), 1);
        drop(fresh);

        pool.close();
        assert!(matches!(
            pool.acquire(&node).await,
            Err(ClientError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let _ = tracing_subscriber::fmt::try_init();

        let node = node_for(1, test_helper::get_unused_addr());
        let pool = ConnectionPool::new(2, Duration::from_secs(1), InFlightRequests::default());
        assert!(matches!(
            pool.acquire(&node).await,
            Err(ClientError::Connection(_))
        ));
        assert_eq!(pool.num_connections(1), 0);
    }
}
