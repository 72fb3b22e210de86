use std::sync::atomic::{AtomicUsize, Ordering};

use crate::node::{ClusterSnapshot, Node};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("The snapshot contains no available nodes.")]
pub struct NoAvailableNode;

/// Picks the node a request is sent to.
///
/// Strategies only consider the available nodes of the snapshot they are
/// given, selection must be reproducible for the same snapshot and sequence
/// of calls.
pub trait LoadBalancer: Send + Sync + 'static {
    fn select_node(
        &self,
        snapshot: &ClusterSnapshot,
        hint: Option<&[u8]>,
    ) -> Result<Node, NoAvailableNode>;
}

#[derive(Debug, Default)]
/// Cycles through the available nodes in ID order.
///
/// The cursor is taken modulo the number of available nodes so a change in
/// membership between calls shifts the cycle but never fails.
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select_node(
        &self,
        snapshot: &ClusterSnapshot,
        _hint: Option<&[u8]>,
    ) -> Result<Node, NoAvailableNode> {
        let nodes = snapshot.available_nodes();
        if nodes.is_empty() {
            return Err(NoAvailableNode);
        }

        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(nodes[cursor % nodes.len()].clone())
    }
}

#[derive(Debug, Default, Copy, Clone)]
/// Routes requests carrying the same hint to the same node while membership
/// is unchanged.
///
/// Requests without a hint go to the available node with the lowest ID.
pub struct ConsistentHash;

impl LoadBalancer for ConsistentHash {
    fn select_node(
        &self,
        snapshot: &ClusterSnapshot,
        hint: Option<&[u8]>,
    ) -> Result<Node, NoAvailableNode> {
        let nodes = snapshot.available_nodes();
        if nodes.is_empty() {
            return Err(NoAvailableNode);
        }

        let idx = match hint {
            Some(hint) => crc32fast::hash(hint) as usize % nodes.len(),
            None => 0,
        };
        Ok(nodes[idx].clone())
    }
}
