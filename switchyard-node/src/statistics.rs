use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the cluster membership.
pub struct ClusterStatistics(Arc<ClusterStatisticsInner>);

impl Deref for ClusterStatistics {
    type Target = ClusterStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct ClusterStatisticsInner {
    pub(crate) num_nodes: Counter,
    pub(crate) num_available_nodes: Counter,
    pub(crate) num_reconnects: Counter,
    pub(crate) num_listeners: Counter,
}

impl ClusterStatisticsInner {
    /// The number of nodes in the current snapshot.
    pub fn num_nodes(&self) -> u64 {
        self.num_nodes.load(Ordering::Relaxed)
    }

    /// The number of nodes in the current snapshot which accept requests.
    pub fn num_available_nodes(&self) -> u64 {
        self.num_available_nodes.load(Ordering::Relaxed)
    }

    /// The number of times a new registry session had to be established
    /// after the previous one expired.
    pub fn num_reconnects(&self) -> u64 {
        self.num_reconnects.load(Ordering::Relaxed)
    }

    pub fn num_listeners(&self) -> u64 {
        self.num_listeners.load(Ordering::Relaxed)
    }
}
