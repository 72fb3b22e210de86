use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_rpc::{
    spawn_reaper,
    type_tag,
    ErrorCode,
    InFlightRequests,
    ReaperHandle,
    ResponseHandle,
    Serializer,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::balancer::LoadBalancer;
use crate::error::{ClientError, NodeError};
use crate::listener::{ClusterListener, ListenerKey};
use crate::membership::{ClusterMembership, MembershipState};
use crate::network::ConnectionPool;
use crate::node::ClusterSnapshot;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
/// Decides how requests are routed while the registry session is lost but
/// has not yet expired.
pub enum StaleSnapshotPolicy {
    #[default]
    /// Fail every request with [ClientError::ClusterUnavailable].
    FailFast,
    /// Keep routing requests using the last known snapshot.
    UseLastKnown,
}

#[derive(Debug, Clone)]
/// Configuration for the [NetworkClient].
pub struct NetworkClientConfig {
    pub service_name: String,

    /// How long to wait for a connection, either a new one to be opened
    /// or a pooled one to become free.
    pub connect_timeout: Duration,

    /// How long writing a request may take.
    ///
    /// This is also the default deadline for a reply.
    pub write_timeout: Duration,

    /// The maximum number of connections opened to a single node.
    pub max_connections_per_node: usize,

    /// The maximum age of an in-flight request before it is failed
    /// regardless of its deadline.
    pub stale_request_timeout: Duration,

    /// How often in-flight requests are checked for expiry.
    pub stale_request_cleanup_frequency: Duration,

    pub stale_snapshot_policy: StaleSnapshotPolicy,
}

impl Default for NetworkClientConfig {
    fn default() -> Self {
        Self {
            service_name: crate::membership::DEFAULT_SERVICE_NAME.to_string(),
            connect_timeout: Duration::from_millis(1000),
            write_timeout: Duration::from_millis(150),
            max_connections_per_node: 5,
            stale_request_timeout: Duration::from_secs(10 * 60),
            stale_request_cleanup_frequency: Duration::from_secs(10 * 60),
            stale_snapshot_policy: StaleSnapshotPolicy::default(),
        }
    }
}

impl NetworkClientConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_max_connections_per_node(mut self, max: usize) -> Self {
        self.max_connections_per_node = max;
        self
    }

    pub fn with_stale_request_timeout(mut self, timeout: Duration) -> Self {
        self.stale_request_timeout = timeout;
        self
    }

    pub fn with_stale_request_cleanup_frequency(mut self, frequency: Duration) -> Self {
        self.stale_request_cleanup_frequency = frequency;
        self
    }

    pub fn with_stale_snapshot_policy(mut self, policy: StaleSnapshotPolicy) -> Self {
        self.stale_snapshot_policy = policy;
        self
    }
}

#[derive(Clone)]
/// Routes requests to the nodes of the cluster.
///
/// Each request is sent to the node picked by the load balancer over a
/// pooled, multiplexed connection. Replies are matched to their request by
/// correlation token, requests which never receive a reply are failed by a
/// background reaper once they pass their deadline.
///
/// This is cheap to clone.
pub struct NetworkClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: NetworkClientConfig,
    membership: ClusterMembership,
    balancer: Box<dyn LoadBalancer>,
    pool: ConnectionPool,
    in_flight: InFlightRequests,
    reaper: ReaperHandle,
    listener_key: Mutex<Option<ListenerKey>>,
    shut_down: AtomicBool,
}

impl NetworkClient {
    /// Creates a new client routing requests across the given membership.
    ///
    /// Connections to nodes which leave the cluster are evicted from the pool
    /// as soon as the membership observes the change.
    pub fn new(
        config: NetworkClientConfig,
        membership: ClusterMembership,
        balancer: impl LoadBalancer,
    ) -> Result<Self, NodeError> {
        let in_flight = InFlightRequests::default();
        let pool = ConnectionPool::new(
            config.max_connections_per_node,
            config.connect_timeout,
            in_flight.clone(),
        );

        let listener_key = membership.add_listener(Arc::new(PoolEvictionListener {
            pool: pool.clone(),
            last_seen: Mutex::new(None),
        }))?;

        let reaper = spawn_reaper(
            in_flight.clone(),
            config.stale_request_cleanup_frequency,
            config.stale_request_timeout,
        );

        info!(
            service_name = %config.service_name,
            max_connections_per_node = config.max_connections_per_node,
            policy = ?config.stale_snapshot_policy,
            "Created network client."
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                membership,
                balancer: Box::new(balancer),
                pool,
                in_flight,
                reaper,
                listener_key: Mutex::new(Some(listener_key)),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &NetworkClientConfig {
        &self.inner.config
    }

    #[inline]
    pub fn membership(&self) -> &ClusterMembership {
        &self.inner.membership
    }

    #[inline]
    /// The connection pool used by the client.
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    #[inline]
    /// The number of requests still awaiting a reply.
    pub fn num_in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Sends a request to a node picked by the load balancer.
    ///
    /// The reply must arrive within the configured write timeout.
    pub async fn send_request<Req, Resp, S>(
        &self,
        request: &Req,
        serializer: &S,
    ) -> Result<ResponseHandle<Resp>, ClientError>
    where
        Resp: Send + 'static,
        S: Serializer<Req, Resp> + Clone,
    {
        self.dispatch(request, serializer, self.inner.config.write_timeout, None)
            .await
    }

    /// Sends a request which must receive a reply within the given timeout.
    pub async fn send_request_with_timeout<Req, Resp, S>(
        &self,
        request: &Req,
        serializer: &S,
        timeout: Duration,
    ) -> Result<ResponseHandle<Resp>, ClientError>
    where
        Resp: Send + 'static,
        S: Serializer<Req, Resp> + Clone,
    {
        self.dispatch(request, serializer, timeout, None).await
    }

    /// Sends a request, passing the hint to the load balancer.
    pub async fn send_request_with_hint<Req, Resp, S>(
        &self,
        request: &Req,
        serializer: &S,
        hint: &[u8],
    ) -> Result<ResponseHandle<Resp>, ClientError>
    where
        Resp: Send + 'static,
        S: Serializer<Req, Resp> + Clone,
    {
        self.dispatch(
            request,
            serializer,
            self.inner.config.write_timeout,
            Some(hint),
        )
        .await
    }

    /// Sends a request and waits for the reply.
    pub async fn request<Req, Resp, S>(
        &self,
        request: &Req,
        serializer: &S,
    ) -> Result<Resp, ClientError>
    where
        Resp: Send + 'static,
        S: Serializer<Req, Resp> + Clone,
    {
        let handle = self.send_request(request, serializer).await?;
        handle.await.map_err(ClientError::from)
    }

    /// Shuts the client down.
    ///
    /// Every open connection is closed and requests awaiting a reply fail.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(service_name = %self.inner.config.service_name, "Shutting down network client.");
        self.inner.reaper.stop();
        if let Some(key) = self.inner.listener_key.lock().take() {
            self.inner.membership.remove_listener(key);
        }
        self.inner.pool.close();
    }

    async fn dispatch<Req, Resp, S>(
        &self,
        request: &Req,
        serializer: &S,
        timeout: Duration,
        hint: Option<&[u8]>,
    ) -> Result<ResponseHandle<Resp>, ClientError>
    where
        Resp: Send + 'static,
        S: Serializer<Req, Resp> + Clone,
    {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(ClientError::ClusterUnavailable);
        }

        let snapshot = self.routable_snapshot()?;
        let node = self.inner.balancer.select_node(&snapshot, hint)?;

        let payload = serializer
            .request_to_bytes(request)
            .map_err(ClientError::Protocol)?;
        let tag = type_tag(serializer.request_name());

        let connection = self.inner.pool.acquire(&node).await?;
        let deadline = Instant::now() + timeout;

        let decoder = serializer.clone();
        let sent = connection
            .connection()
            .send_request(
                tag,
                payload,
                deadline,
                self.inner.config.write_timeout,
                move |buf| decoder.response_from_bytes(buf),
            )
            .await;

        match sent {
            Ok(handle) => {
                self.inner.pool.release(connection);
                Ok(handle)
            },
            Err(status) if status.code == ErrorCode::ConnectionError => {
                warn!(
                    node_id = node.id,
                    target_addr = %node.address,
                    error = %status,
                    "Failed to write request, invalidating connection."
                );
                self.inner.pool.invalidate(connection);
                Err(ClientError::from(status))
            },
            Err(status) => {
                // Nothing was written, the connection is still healthy.
                self.inner.pool.release(connection);
                Err(ClientError::from(status))
            },
        }
    }

    /// The snapshot requests are routed with, given the membership state
    /// and the stale snapshot policy.
    fn routable_snapshot(&self) -> Result<Arc<ClusterSnapshot>, ClientError> {
        let membership = &self.inner.membership;
        let snapshot = membership.current_nodes();

        match membership.state() {
            MembershipState::Connected if !snapshot.is_stale() => Ok(snapshot),
            MembershipState::ShutDown => Err(ClientError::ClusterUnavailable),
            _ => match self.inner.config.stale_snapshot_policy {
                StaleSnapshotPolicy::UseLastKnown if !snapshot.is_empty() => {
                    debug!(version = snapshot.version(), "Routing with last known snapshot.");
                    Ok(snapshot)
                },
                _ => Err(ClientError::ClusterUnavailable),
            },
        }
    }
}

/// Evicts pooled connections to nodes which have left the cluster.
struct PoolEvictionListener {
    pool: ConnectionPool,
    last_seen: Mutex<Option<Arc<ClusterSnapshot>>>,
}

impl PoolEvictionListener {
    fn observe(&self, snapshot: Arc<ClusterSnapshot>) {
        let previous = self.last_seen.lock().replace(snapshot.clone());
        let previous = match previous {
            Some(previous) => previous,
            None => return,
        };

        // Nodes which only became unavailable keep their connections,
        // the balancer already stops routing to them.
        for node_id in snapshot.diff(&previous).removed {
            self.pool.on_node_removed(node_id);
        }
    }
}

#[async_trait]
impl ClusterListener for PoolEvictionListener {
    async fn on_connected(&self, snapshot: Arc<ClusterSnapshot>) {
        self.observe(snapshot);
    }

    async fn on_nodes_changed(&self, snapshot: Arc<ClusterSnapshot>) {
        self.observe(snapshot);
    }

    async fn on_shutdown(&self) {
        self.pool.close();
    }
}
