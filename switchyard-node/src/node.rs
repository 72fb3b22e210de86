use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;

/// A unique ID for a node within a cluster.
pub type NodeId = i32;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// An addressable server instance participating in the cluster.
pub struct Node {
    /// A unique ID for the given node in the cluster.
    pub id: NodeId,
    /// The `host:port` address the node accepts requests on.
    pub address: String,
    /// If the node is currently accepting requests.
    ///
    /// A node is registered ahead of time and only becomes available once
    /// its server has bound.
    pub available: bool,
}

impl Node {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            available: false,
        }
    }

    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    /// Resolves the node's address.
    pub async fn socket_addr(&self) -> io::Result<SocketAddr> {
        if let Ok(addr) = self.address.parse::<SocketAddr>() {
            return Ok(addr);
        }

        tokio::net::lookup_host(self.address.as_str())
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    ErrorKind::AddrNotAvailable,
                    format!("Address {} did not resolve.", self.address),
                )
            })
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// An immutable, point in time view of the cluster.
///
/// Snapshots are replaced wholesale on every change and shared behind an
/// `Arc`, a reader holding one always sees a consistent view.
pub struct ClusterSnapshot {
    version: u64,
    stale: bool,
    nodes: Vec<Node>,
    available: Vec<Node>,
}

impl ClusterSnapshot {
    /// Creates a new snapshot from a set of nodes.
    ///
    /// Nodes are ordered by ID, if an ID appears more than once the last
    /// entry wins.
    pub fn new(version: u64, nodes: impl IntoIterator<Item = Node>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|node| (node.id, node))
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect::<Vec<_>>();

        let available = nodes
            .iter()
            .filter(|node| node.available)
            .cloned()
            .collect();

        Self {
            version,
            stale: false,
            nodes,
            available,
        }
    }

    /// Produces a copy of this snapshot which is marked as stale.
    pub(crate) fn to_stale(&self, version: u64) -> Self {
        Self {
            version,
            stale: true,
            nodes: self.nodes.clone(),
            available: self.available.clone(),
        }
    }

    /// An empty snapshot marked as stale.
    pub(crate) fn invalidated(version: u64) -> Self {
        Self {
            version,
            stale: true,
            nodes: Vec::new(),
            available: Vec::new(),
        }
    }

    #[inline]
    /// The version of the snapshot, newer snapshots have larger versions.
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    /// Returns if the snapshot is a last known view kept while the
    /// registry session is lost.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    #[inline]
    /// All nodes in the snapshot ordered by ID.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[inline]
    /// The available nodes in the snapshot ordered by ID.
    pub fn available_nodes(&self) -> &[Node] {
        &self.available
    }

    pub fn get(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes
            .binary_search_by_key(&node_id, |node| node.id)
            .ok()
            .map(|idx| &self.nodes[idx])
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.get(node_id).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Works out which nodes became routable and which stopped being
    /// routable since the `old` snapshot.
    ///
    /// A node which changes its address both leaves with the old address
    /// and joins with the new one. Nodes no longer registered at all are
    /// also listed in `removed`.
    pub fn diff(&self, old: &ClusterSnapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();

        for node in old.nodes() {
            if !self.contains(node.id) {
                diff.removed.push(node.id);
            }
        }

        for node in old.available_nodes() {
            match self.get(node.id) {
                Some(current) if current.available && current.address == node.address => {},
                _ => diff.left.push(node.clone()),
            }
        }

        for node in self.available_nodes() {
            match old.get(node.id) {
                Some(previous) if previous.available && previous.address == node.address => {},
                _ => diff.joined.push(node.clone()),
            }
        }

        diff
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub joined: Vec<Node>,
    pub left: Vec<Node>,
    /// Nodes which were unregistered, whether or not they were available.
    pub removed: Vec<NodeId>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty() && self.removed.is_empty()
    }
}
