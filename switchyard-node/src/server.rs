use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_rpc::{HandlerRegistry, RequestHandler, Serializer, Server, WorkerPoolConfig};
use tracing::{error, info, warn};

use crate::error::NodeError;
use crate::listener::{ClusterListener, ListenerKey};
use crate::membership::ClusterMembership;
use crate::node::{ClusterSnapshot, NodeId};

#[derive(Debug, Clone)]
/// Configuration for the [NetworkServer].
pub struct NetworkServerConfig {
    pub service_name: String,

    /// The number of request workers kept alive while idle.
    pub request_thread_core_pool_size: usize,

    /// The maximum number of request workers.
    pub request_thread_max_pool_size: usize,

    /// How long a worker above the core size may idle before it exits.
    pub request_thread_keep_alive: Duration,

    /// The number of requests which may wait for a free worker before
    /// further requests are rejected as overloaded.
    pub request_queue_size: usize,
}

impl Default for NetworkServerConfig {
    fn default() -> Self {
        Self {
            service_name: crate::membership::DEFAULT_SERVICE_NAME.to_string(),
            request_thread_core_pool_size: 5,
            request_thread_max_pool_size: 10,
            request_thread_keep_alive: Duration::from_secs(300),
            request_queue_size: 100,
        }
    }
}

impl NetworkServerConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    pub fn with_pool_size(mut self, core: usize, max: usize) -> Self {
        self.request_thread_core_pool_size = core;
        self.request_thread_max_pool_size = max;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.request_thread_keep_alive = keep_alive;
        self
    }

    pub fn with_request_queue_size(mut self, size: usize) -> Self {
        self.request_queue_size = size;
        self
    }

    fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(
            self.request_thread_core_pool_size,
            self.request_thread_max_pool_size,
            self.request_thread_keep_alive,
        )
        .with_queue_size(self.request_queue_size)
    }
}

/// Serves requests on behalf of a cluster node.
///
/// Handlers are registered up front, binding starts the RPC server on the
/// node's registered address and marks the node available so clients begin
/// routing requests to it.
///
/// Availability is tied to the membership's registry session. Whenever the
/// membership establishes a new session the node is marked available again,
/// until [NetworkServer::mark_unavailable] or [NetworkServer::shutdown] is
/// called.
pub struct NetworkServer {
    config: NetworkServerConfig,
    membership: ClusterMembership,
    handlers: Mutex<Option<HandlerRegistry>>,
    bound: Mutex<Option<BoundServer>>,
}

struct BoundServer {
    node_id: NodeId,
    server: Server,
    availability: Arc<Availability>,
    listener_key: Option<ListenerKey>,
}

/// Whether the bound node should be advertised as available.
///
/// Registry updates are made while holding the lock.
struct Availability {
    node_id: NodeId,
    membership: ClusterMembership,
    advertise: tokio::sync::Mutex<bool>,
}

impl Availability {
    async fn withdraw(&self) -> Result<(), NodeError> {
        let mut advertise = self.advertise.lock().await;
        *advertise = false;
        self.membership.mark_unavailable(self.node_id).await
    }
}

#[async_trait]
impl ClusterListener for Availability {
    async fn on_connected(&self, snapshot: Arc<ClusterSnapshot>) {
        let advertise = self.advertise.lock().await;
        if !*advertise {
            return;
        }

        match snapshot.get(self.node_id) {
            Some(node) if node.available => {},
            Some(_) => {
                info!(node_id = self.node_id, "Marking bound node available.");
                if let Err(e) = self.membership.mark_available(self.node_id).await {
                    warn!(node_id = self.node_id, error = %e, "Failed to mark node as available.");
                }
            },
            None => {
                warn!(
                    node_id = self.node_id,
                    "Bound node is no longer part of the cluster, not marking it available."
                );
            },
        }
    }
}

impl NetworkServer {
    pub fn new(config: NetworkServerConfig, membership: ClusterMembership) -> Self {
        Self {
            config,
            membership,
            handlers: Mutex::new(Some(HandlerRegistry::default())),
            bound: Mutex::new(None),
        }
    }

    /// Registers the handler for the request type described by the serializer.
    ///
    /// Handlers cannot be added once the server is bound.
    pub fn register_handler<Req, Resp, H, S>(
        &self,
        handler: H,
        serializer: S,
    ) -> Result<(), NodeError>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        H: RequestHandler<Req, Resp>,
        S: Serializer<Req, Resp>,
    {
        let mut handlers = self.handlers.lock();
        let handlers = handlers.as_mut().ok_or(NodeError::AlreadyBound)?;
        handlers.register(handler, serializer);
        Ok(())
    }

    /// Starts serving requests as the given node.
    ///
    /// The server listens on the address the node is registered with.
    pub async fn bind(&self, node_id: NodeId) -> Result<(), NodeError> {
        let node = self
            .membership
            .current_nodes()
            .get(node_id)
            .cloned()
            .ok_or(NodeError::InvalidNode(node_id))?;

        let listen_addr = node.socket_addr().await?;
        self.bind_with_listen_addr(node_id, listen_addr).await
    }

    /// Starts serving requests as the given node, listening on an address
    /// other than the registered one.
    ///
    /// This is used when the registered address is not one which can be
    /// bound locally, for example when listening on `0.0.0.0`.
    pub async fn bind_with_listen_addr(
        &self,
        node_id: NodeId,
        listen_addr: SocketAddr,
    ) -> Result<(), NodeError> {
        if !self.membership.current_nodes().contains(node_id) {
            return Err(NodeError::InvalidNode(node_id));
        }

        let handlers = self
            .handlers
            .lock()
            .take()
            .ok_or(NodeError::AlreadyBound)?;

        let server =
            Server::listen(listen_addr, handlers, self.config.worker_pool_config()).await?;

        if let Err(e) = self.membership.mark_available(node_id).await {
            error!(
                node_id = node_id,
                error = %e,
                "Failed to mark node as available, stopping server."
            );
            server.shutdown();
            return Err(e);
        }

        let availability = Arc::new(Availability {
            node_id,
            membership: self.membership.clone(),
            advertise: tokio::sync::Mutex::new(true),
        });
        let listener_key = match self.membership.add_listener(availability.clone()) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(
                    node_id = node_id,
                    error = %e,
                    "Failed to watch the registry session, availability will not be renewed."
                );
                None
            },
        };

        info!(
            service_name = %self.config.service_name,
            node_id = node_id,
            listen_addr = %server.local_addr(),
            "Node is bound and available."
        );

        *self.bound.lock() = Some(BoundServer {
            node_id,
            server,
            availability,
            listener_key,
        });
        Ok(())
    }

    /// The address the server is listening on, if bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
            .lock()
            .as_ref()
            .map(|bound| bound.server.local_addr())
    }

    /// The node the server is bound as.
    pub fn node_id(&self) -> Option<NodeId> {
        self.bound.lock().as_ref().map(|bound| bound.node_id)
    }

    /// Stops clients from routing new requests to this node.
    ///
    /// The server keeps answering requests it receives, the node is not
    /// marked available again when the registry session is renewed.
    pub async fn mark_unavailable(&self) -> Result<(), NodeError> {
        let availability = self.availability().ok_or(NodeError::NotBound)?;
        availability.withdraw().await
    }

    /// Marks the node unavailable and stops the server.
    ///
    /// Open connections are closed, requests still awaiting a reply fail on
    /// the client side with a connection error.
    pub async fn shutdown(&self) {
        let availability = match self.availability() {
            Some(availability) => availability,
            None => return,
        };

        if let Err(e) = availability.withdraw().await {
            warn!(node_id = availability.node_id, error = %e, "Failed to mark node as unavailable.");
        }

        let bound = self.bound.lock().take();
        if let Some(bound) = bound {
            info!(node_id = bound.node_id, "Shutting down network server.");
            if let Some(key) = bound.listener_key {
                self.membership.remove_listener(key);
            }
            bound.server.shutdown();
        }
    }

    fn availability(&self) -> Option<Arc<Availability>> {
        self.bound
            .lock()
            .as_ref()
            .map(|bound| bound.availability.clone())
    }
}

impl Drop for NetworkServer {
    fn drop(&mut self) {
        if let Some(key) = self.bound.get_mut().as_mut().and_then(|b| b.listener_key.take()) {
            self.membership.remove_listener(key);
        }
    }
}
