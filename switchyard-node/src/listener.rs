use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::node::ClusterSnapshot;
use crate::statistics::ClusterStatistics;

#[async_trait]
/// Receives cluster membership events.
///
/// Each listener is driven by its own task so a slow listener never holds
/// up membership updates or other listeners. Events arrive in the order the
/// membership observed them.
pub trait ClusterListener: Send + Sync + 'static {
    /// The membership connected to the registry.
    ///
    /// Listeners added while the membership is connected receive this
    /// straight away with the current snapshot.
    async fn on_connected(&self, _snapshot: Arc<ClusterSnapshot>) {}

    async fn on_nodes_changed(&self, _snapshot: Arc<ClusterSnapshot>) {}

    /// The registry session was lost.
    async fn on_disconnected(&self) {}

    /// The membership is shutting down, no further events follow.
    async fn on_shutdown(&self) {}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Identifies a registered listener.
pub struct ListenerKey(u64);

#[derive(Debug, Clone)]
pub(crate) enum ClusterEvent {
    Connected(Arc<ClusterSnapshot>),
    NodesChanged(Arc<ClusterSnapshot>),
    Disconnected,
    Shutdown,
}

struct ListenerEntry {
    tx: flume::Sender<ClusterEvent>,
    handle: JoinHandle<()>,
}

/// Fans membership events out to listeners.
///
/// Every listener owns a bounded queue drained by its own task. Events are
/// queued to listeners in registration order.
pub(crate) struct ListenerBus {
    next_key: AtomicU64,
    listeners: RwLock<BTreeMap<ListenerKey, ListenerEntry>>,
    queue_size: usize,
    dispatch_timeout: Duration,
    statistics: ClusterStatistics,
}

impl ListenerBus {
    pub(crate) fn new(
        queue_size: usize,
        dispatch_timeout: Duration,
        statistics: ClusterStatistics,
    ) -> Self {
        Self {
            next_key: AtomicU64::new(0),
            listeners: RwLock::new(BTreeMap::new()),
            queue_size: queue_size.max(1),
            dispatch_timeout,
            statistics,
        }
    }

    /// Registers a listener.
    ///
    /// `initial` is called while the listener table is locked, an event it
    /// returns is queued ahead of anything published afterwards.
    pub(crate) fn add(
        &self,
        listener: Arc<dyn ClusterListener>,
        initial: impl FnOnce() -> Option<ClusterEvent>,
    ) -> ListenerKey {
        let key = ListenerKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = flume::bounded(self.queue_size);

        let mut listeners = self.listeners.write();
        if let Some(event) = initial() {
            // The queue is fresh so this can only fail if it has no room at all.
            let _ = tx.try_send(event);
        }

        let handle = tokio::spawn(drive_listener(key, listener, rx));
        listeners.insert(key, ListenerEntry { tx, handle });
        self.statistics
            .num_listeners
            .store(listeners.len() as u64, Ordering::Relaxed);

        key
    }

    /// Removes a listener.
    ///
    /// The listener still receives any events already queued for it.
    pub(crate) fn remove(&self, key: ListenerKey) -> bool {
        let mut listeners = self.listeners.write();
        let removed = listeners.remove(&key).is_some();
        self.statistics
            .num_listeners
            .store(listeners.len() as u64, Ordering::Relaxed);
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Queues an event for every listener.
    ///
    /// A listener whose queue stays full for longer than the dispatch
    /// timeout is detached.
    pub(crate) async fn publish(&self, event: ClusterEvent) {
        let targets = collect_targets(&self.listeners.read());
        self.dispatch(targets, event).await
    }

    /// Applies `update` and queues the event for every listener registered
    /// at that moment.
    ///
    /// Listeners added concurrently either see the state before `update` and
    /// receive the event, or the state after it and do not.
    pub(crate) async fn publish_after(&self, update: impl FnOnce(), event: ClusterEvent) {
        let targets = {
            let listeners = self.listeners.write();
            update();
            collect_targets(&listeners)
        };
        self.dispatch(targets, event).await
    }

    async fn dispatch(
        &self,
        targets: Vec<(ListenerKey, flume::Sender<ClusterEvent>)>,
        event: ClusterEvent,
    ) {
        for (key, tx) in targets {
            let sent =
                tokio::time::timeout(self.dispatch_timeout, tx.send_async(event.clone())).await;

            match sent {
                Ok(Ok(())) => {},
                Ok(Err(_)) => {
                    debug!(listener = ?key, "Listener task has stopped, removing listener.");
                    self.remove(key);
                },
                Err(_) => {
                    error!(
                        listener = ?key,
                        dispatch_timeout = ?self.dispatch_timeout,
                        "Listener is not keeping up with cluster events, detaching listener."
                    );
                    self.detach(key);
                },
            }
        }
    }

    /// Publishes the shutdown event and waits for every listener to finish
    /// processing its queue.
    pub(crate) async fn shutdown(&self) {
        self.publish(ClusterEvent::Shutdown).await;

        let entries = {
            let mut listeners = self.listeners.write();
            std::mem::take(&mut *listeners)
        };
        self.statistics.num_listeners.store(0, Ordering::Relaxed);

        for (key, entry) in entries {
            drop(entry.tx);
            if tokio::time::timeout(self.dispatch_timeout, entry.handle)
                .await
                .is_err()
            {
                error!(listener = ?key, "Listener did not finish processing events in time.");
            }
        }
    }

    fn detach(&self, key: ListenerKey) {
        let mut listeners = self.listeners.write();
        if let Some(entry) = listeners.remove(&key) {
            entry.handle.abort();
        }
        self.statistics
            .num_listeners
            .store(listeners.len() as u64, Ordering::Relaxed);
    }
}

impl Drop for ListenerBus {
    fn drop(&mut self) {
        for entry in self.listeners.get_mut().values() {
            entry.handle.abort();
        }
    }
}

fn collect_targets(
    listeners: &BTreeMap<ListenerKey, ListenerEntry>,
) -> Vec<(ListenerKey, flume::Sender<ClusterEvent>)> {
    listeners
        .iter()
        .map(|(key, entry)| (*key, entry.tx.clone()))
        .collect()
}

async fn drive_listener(
    key: ListenerKey,
    listener: Arc<dyn ClusterListener>,
    events: flume::Receiver<ClusterEvent>,
) {
    while let Ok(event) = events.recv_async().await {
        match event {
            ClusterEvent::Connected(snapshot) => listener.on_connected(snapshot).await,
            ClusterEvent::NodesChanged(snapshot) => listener.on_nodes_changed(snapshot).await,
            ClusterEvent::Disconnected => listener.on_disconnected().await,
            ClusterEvent::Shutdown => {
                listener.on_shutdown().await;
                break;
            },
        }
    }

    debug!(listener = ?key, "Listener task has stopped.");
}
