use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

use crate::error::NodeError;
use crate::listener::{ClusterEvent, ClusterListener, ListenerBus, ListenerKey};
use crate::node::{ClusterSnapshot, Node, NodeId};
use crate::registry::{NodeRegistry, RegistryEvent};
use crate::statistics::ClusterStatistics;

pub static DEFAULT_SERVICE_NAME: &str = "switchyard";
const MAX_BACKOFF_MULTIPLIER: u32 = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MembershipState {
    Disconnected,
    Connecting,
    Connected,
    ShutDown,
}

#[derive(Debug, Clone)]
/// Configuration for the cluster membership.
pub struct MembershipConfig {
    /// The name of the service the cluster provides.
    pub service_name: String,

    /// How long the registry session may stay disconnected before the
    /// last known snapshot is treated as invalid.
    pub session_timeout: Duration,

    /// How long `connect` waits for the first snapshot.
    pub connect_timeout: Duration,

    /// The number of events which may be queued for a single listener.
    pub listener_queue_size: usize,

    /// How long an event may wait for room in a listener's queue before the
    /// listener is detached.
    pub listener_dispatch_timeout: Duration,

    /// The base delay between attempts to establish a new registry session.
    pub reconnect_backoff: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            session_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            listener_queue_size: 128,
            listener_dispatch_timeout: Duration::from_secs(5),
            reconnect_backoff: if cfg!(test) {
                Duration::from_millis(10)
            } else {
                Duration::from_millis(500)
            },
        }
    }
}

impl MembershipConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_listener_queue_size(mut self, size: usize) -> Self {
        self.listener_queue_size = size;
        self
    }

    pub fn with_listener_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.listener_dispatch_timeout = timeout;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }
}

#[derive(Clone)]
/// Tracks the nodes of the cluster through a [NodeRegistry].
///
/// A single task consumes the registry's events in order, publishing a new
/// [ClusterSnapshot] for every change and fanning the change out to
/// listeners. This is cheap to clone.
pub struct ClusterMembership {
    inner: Arc<MembershipInner>,
}

struct MembershipInner {
    registry: Arc<dyn NodeRegistry>,
    config: MembershipConfig,
    state: watch::Sender<MembershipState>,
    snapshot: watch::Sender<Arc<ClusterSnapshot>>,
    listeners: ListenerBus,
    statistics: ClusterStatistics,
    next_version: AtomicU64,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterMembership {
    pub fn new(registry: impl NodeRegistry, config: MembershipConfig) -> Self {
        Self::from_shared(Arc::new(registry), config)
    }

    pub fn from_shared(registry: Arc<dyn NodeRegistry>, config: MembershipConfig) -> Self {
        let statistics = ClusterStatistics::default();
        let listeners = ListenerBus::new(
            config.listener_queue_size,
            config.listener_dispatch_timeout,
            statistics.clone(),
        );
        let (state, _) = watch::channel(MembershipState::Disconnected);
        let (snapshot, _) = watch::channel(Arc::new(ClusterSnapshot::default()));

        Self {
            inner: Arc::new(MembershipInner {
                registry,
                config,
                state,
                snapshot,
                listeners,
                statistics,
                next_version: AtomicU64::new(1),
                actor: Mutex::new(None),
            }),
        }
    }

    /// Connects to the registry and waits for the first snapshot.
    pub async fn connect(&self) -> Result<(), NodeError> {
        match self.state() {
            MembershipState::ShutDown => return Err(NodeError::ShutDown),
            MembershipState::Connected => return Ok(()),
            _ => {},
        }

        info!(
            service_name = %self.inner.config.service_name,
            "Connecting to the cluster registry."
        );
        self.inner.set_state(MembershipState::Connecting);
        self.start_actor();

        let connect_timeout = self.inner.config.connect_timeout;
        let connected = timeout(connect_timeout, self.inner.registry.connect()).await;
        match connected {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                self.inner.set_state(MembershipState::Disconnected);
                return Err(NodeError::Connection(e.to_string()));
            },
            Err(_) => {
                self.inner.set_state(MembershipState::Disconnected);
                return Err(NodeError::Connection(format!(
                    "Registry did not respond within {connect_timeout:?}"
                )));
            },
        }

        self.await_connection(connect_timeout)
            .await
            .map_err(|e| match e {
                NodeError::Timeout(_) => NodeError::Connection(format!(
                    "No cluster snapshot was received within {connect_timeout:?}"
                )),
                other => other,
            })
    }

    /// Waits for the membership to reach the connected state.
    pub async fn await_connection(&self, wait: Duration) -> Result<(), NodeError> {
        let mut state = self.inner.state.subscribe();
        let waiter = async move {
            loop {
                match *state.borrow_and_update() {
                    MembershipState::Connected => return Ok(()),
                    MembershipState::ShutDown => return Err(NodeError::ShutDown),
                    _ => {},
                }

                if state.changed().await.is_err() {
                    return Err(NodeError::ShutDown);
                }
            }
        };

        timeout(wait, waiter)
            .await
            .map_err(|_| NodeError::Timeout(wait))?
    }

    #[inline]
    /// The current snapshot of the cluster.
    pub fn current_nodes(&self) -> Arc<ClusterSnapshot> {
        self.inner.snapshot.borrow().clone()
    }

    #[inline]
    pub fn state(&self) -> MembershipState {
        *self.inner.state.borrow()
    }

    /// Returns if the current snapshot is a last known view kept while
    /// the registry session is lost.
    pub fn is_stale(&self) -> bool {
        self.current_nodes().is_stale()
    }

    #[inline]
    pub fn config(&self) -> &MembershipConfig {
        &self.inner.config
    }

    #[inline]
    /// Gets the live cluster statistics.
    pub fn statistics(&self) -> ClusterStatistics {
        self.inner.statistics.clone()
    }

    /// Get a stream of snapshot changes.
    pub fn snapshot_changes(&self) -> WatchStream<Arc<ClusterSnapshot>> {
        WatchStream::new(self.inner.snapshot.subscribe())
    }

    /// Registers a listener for membership events.
    ///
    /// If the membership is connected the listener immediately receives
    /// `on_connected` with the current snapshot.
    pub fn add_listener(
        &self,
        listener: Arc<dyn ClusterListener>,
    ) -> Result<ListenerKey, NodeError> {
        self.ensure_running()?;

        let inner = &self.inner;
        let key = inner.listeners.add(listener, || {
            if *inner.state.borrow() == MembershipState::Connected {
                Some(ClusterEvent::Connected(inner.snapshot.borrow().clone()))
            } else {
                None
            }
        });

        Ok(key)
    }

    /// Removes a listener, returning `false` if it was not registered.
    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        self.inner.listeners.remove(key)
    }

    /// Registers a node in the cluster, updating its address if it already exists.
    pub async fn add_node(&self, node_id: NodeId, address: &str) -> Result<(), NodeError> {
        self.ensure_running()?;
        info!(node_id = node_id, address = %address, "Adding node to the cluster.");
        self.inner.registry.create_node(node_id, address).await?;
        Ok(())
    }

    /// Removes a node from the cluster, removing an unknown node is a no-op.
    pub async fn remove_node(&self, node_id: NodeId) -> Result<(), NodeError> {
        self.ensure_running()?;
        info!(node_id = node_id, "Removing node from the cluster.");
        self.inner.registry.delete_node(node_id).await?;
        Ok(())
    }

    pub async fn mark_available(&self, node_id: NodeId) -> Result<(), NodeError> {
        self.ensure_running()?;
        self.inner.registry.set_available(node_id, true).await?;
        Ok(())
    }

    pub async fn mark_unavailable(&self, node_id: NodeId) -> Result<(), NodeError> {
        self.ensure_running()?;
        self.inner.registry.set_available(node_id, false).await?;
        Ok(())
    }

    /// Waits until every given node is part of the snapshot and available.
    pub async fn wait_for_nodes(
        &self,
        node_ids: &[NodeId],
        timeout_after: Duration,
    ) -> Result<(), NodeError> {
        self.ensure_running()?;

        let is_ready = |snapshot: &ClusterSnapshot| {
            node_ids
                .iter()
                .all(|id| snapshot.get(*id).map(|n| n.available).unwrap_or(false))
        };

        let mut changes = self.snapshot_changes();
        let waiter = async move {
            while let Some(snapshot) = changes.next().await {
                if is_ready(snapshot.as_ref()) {
                    return true;
                }
            }
            false
        };

        match timeout(timeout_after, waiter).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(NodeError::ShutDown),
            Err(_) => Err(NodeError::Timeout(timeout_after)),
        }
    }

    /// Shuts the membership down.
    ///
    /// Every listener receives `on_shutdown` before this returns and the
    /// registry session is closed. Any further operation fails.
    pub async fn shutdown(&self) {
        if self.state() == MembershipState::ShutDown {
            return;
        }

        info!(
            service_name = %self.inner.config.service_name,
            "Shutting down cluster membership."
        );
        self.inner.set_state(MembershipState::ShutDown);

        if let Some(actor) = self.inner.actor.lock().take() {
            actor.abort();
        }

        self.inner.listeners.shutdown().await;
        self.inner.registry.close().await;
    }

    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.state() == MembershipState::ShutDown {
            return Err(NodeError::ShutDown);
        }
        Ok(())
    }

    fn start_actor(&self) {
        let mut actor = self.inner.actor.lock();
        if actor.is_some() {
            return;
        }

        // Subscribe before connecting so the first session event is not missed.
        let events = self.inner.registry.watch();
        *actor = Some(tokio::spawn(run_membership(self.inner.clone(), events)));
    }
}

impl MembershipInner {
    fn set_state(&self, state: MembershipState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(previous = ?previous, current = ?state, "Membership state changed.");
        }
    }

    fn is_shut_down(&self) -> bool {
        *self.state.borrow() == MembershipState::ShutDown
    }

    fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    fn publish(&self, snapshot: ClusterSnapshot) -> Arc<ClusterSnapshot> {
        self.statistics
            .num_nodes
            .store(snapshot.len() as u64, Ordering::Relaxed);
        self.statistics
            .num_available_nodes
            .store(snapshot.available_nodes().len() as u64, Ordering::Relaxed);

        let snapshot = Arc::new(snapshot);
        self.snapshot.send_replace(snapshot.clone());
        snapshot
    }

    async fn on_session_connected(&self, nodes: Vec<Node>) {
        let snapshot = self.publish(ClusterSnapshot::new(self.next_version(), nodes));
        info!(
            num_nodes = snapshot.len(),
            num_available = snapshot.available_nodes().len(),
            "Connected to the cluster registry."
        );

        self.listeners
            .publish_after(
                || self.set_state(MembershipState::Connected),
                ClusterEvent::Connected(snapshot),
            )
            .await;
    }

    async fn on_nodes_changed(&self, added: Vec<Node>, removed: Vec<NodeId>, updated: Vec<Node>) {
        let current = self.snapshot.borrow().clone();
        let mut nodes = current
            .nodes()
            .iter()
            .map(|node| (node.id, node.clone()))
            .collect::<BTreeMap<_, _>>();

        for node in added.into_iter().chain(updated) {
            nodes.insert(node.id, node);
        }
        for node_id in removed.iter() {
            nodes.remove(node_id);
        }

        let snapshot = self.publish(ClusterSnapshot::new(self.next_version(), nodes.into_values()));
        info!(
            num_nodes = snapshot.len(),
            num_available = snapshot.available_nodes().len(),
            version = snapshot.version(),
            "Cluster membership has changed."
        );

        self.listeners
            .publish(ClusterEvent::NodesChanged(snapshot))
            .await;
    }

    async fn on_session_disconnected(&self) {
        warn!("Lost connection to the cluster registry, keeping last known nodes.");

        let current = self.snapshot.borrow().clone();
        self.publish(current.to_stale(self.next_version()));
        self.set_state(MembershipState::Disconnected);
        self.listeners.publish(ClusterEvent::Disconnected).await;
        self.set_state(MembershipState::Connecting);
    }

    /// Drops the last known snapshot once it can no longer be trusted.
    fn invalidate_snapshot(&self) {
        self.publish(ClusterSnapshot::invalidated(self.next_version()));
    }

    async fn on_session_expired(&self) {
        error!("Cluster registry session expired, invalidating cluster snapshot.");

        self.invalidate_snapshot();
        self.set_state(MembershipState::Disconnected);
        self.listeners.publish(ClusterEvent::Disconnected).await;
        self.set_state(MembershipState::Connecting);
        self.reconnect().await;
    }

    /// Establishes a new registry session, backing off between attempts.
    async fn reconnect(&self) {
        let mut attempt = 0u32;
        loop {
            if self.is_shut_down() {
                return;
            }

            match self.registry.connect().await {
                Ok(()) => {
                    self.statistics
                        .num_reconnects
                        .fetch_add(1, Ordering::Relaxed);
                    info!(attempt = attempt, "Established a new registry session.");
                    return;
                },
                Err(e) => {
                    let delay = backoff_delay(self.config.reconnect_backoff, attempt);
                    warn!(
                        error = %e,
                        attempt = attempt,
                        retry_in = ?delay,
                        "Failed to establish a new registry session."
                    );
                    sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                },
            }
        }
    }
}

/// The delay before the given reconnect attempt.
///
/// The delay doubles with each attempt up to a limit, with up to half
/// the base delay of random jitter added.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32
        .saturating_pow(attempt)
        .min(MAX_BACKOFF_MULTIPLIER);
    let jitter_ms = (base.as_millis() as u64 / 2).max(1);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
    base * multiplier + jitter
}

/// Consumes registry events until the membership shuts down.
async fn run_membership(inner: Arc<MembershipInner>, events: flume::Receiver<RegistryEvent>) {
    let mut session_deadline: Option<Instant> = None;

    loop {
        let event = match session_deadline {
            Some(deadline) => {
                tokio::select! {
                    event = events.recv_async() => event,
                    _ = sleep_until(deadline) => {
                        warn!(
                            session_timeout = ?inner.config.session_timeout,
                            "Registry session did not recover in time, invalidating cluster snapshot."
                        );
                        session_deadline = None;
                        inner.invalidate_snapshot();
                        continue;
                    },
                }
            },
            None => events.recv_async().await,
        };

        let event = match event {
            Ok(event) => event,
            Err(_) => {
                debug!("Registry event stream closed, stopping membership task.");
                break;
            },
        };

        if inner.is_shut_down() {
            break;
        }

        match event {
            RegistryEvent::SessionConnected { nodes } => {
                session_deadline = None;
                inner.on_session_connected(nodes).await;
            },
            RegistryEvent::NodesChanged {
                added,
                removed,
                updated,
            } => {
                inner.on_nodes_changed(added, removed, updated).await;
            },
            RegistryEvent::SessionDisconnected => {
                session_deadline = Some(Instant::now() + inner.config.session_timeout);
                inner.on_session_disconnected().await;
            },
            RegistryEvent::SessionExpired => {
                session_deadline = None;
                inner.on_session_expired().await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_millis(100);

        let first = backoff_delay(base, 0);
        assert!(first >= base && first <= base + base / 2);

        let third = backoff_delay(base, 2);
        assert!(third >= base * 4 && third <= base * 4 + base / 2);

        let capped = backoff_delay(base, 40);
        assert!(capped <= base * MAX_BACKOFF_MULTIPLIER + base / 2);
    }
}
