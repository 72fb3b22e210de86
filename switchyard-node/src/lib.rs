//! # Switchyard Node
//!
//! Cluster membership and request routing for switchyard nodes.
//!
//! A [ClusterMembership] tracks the nodes registered in a [NodeRegistry]
//! and publishes an immutable [ClusterSnapshot] for every change. The
//! [NetworkClient] routes requests across the available nodes of the
//! snapshot through a [LoadBalancer] and a per node [ConnectionPool], while
//! a [NetworkServer] serves requests on behalf of a node and marks it
//! available once bound.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use switchyard_node::{
//!     ClusterMembership,
//!     MembershipConfig,
//!     MemoryRegistry,
//!     NetworkClient,
//!     NetworkClientConfig,
//!     NetworkServer,
//!     NetworkServerConfig,
//!     RoundRobin,
//! };
//! use switchyard_rpc::{RkyvSerializer, Status};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let registry = MemoryRegistry::new();
//!
//! let membership = ClusterMembership::new(registry.new_session(), MembershipConfig::default());
//! membership.connect().await?;
//! membership.add_node(1, "127.0.0.1:8010").await?;
//!
//! let server = NetworkServer::new(NetworkServerConfig::default(), membership.clone());
//! server.register_handler(
//!     |msg: String| Ok::<_, Status>(format!("pong: {msg}")),
//!     RkyvSerializer::<String, String>::new(),
//! )?;
//! # while !membership.current_nodes().contains(1) {
//! #     tokio::time::sleep(Duration::from_millis(10)).await;
//! # }
//! server.bind(1).await?;
//! membership.wait_for_nodes(&[1], Duration::from_secs(1)).await?;
//!
//! let client = NetworkClient::new(
//!     NetworkClientConfig::default(),
//!     membership.clone(),
//!     RoundRobin::new(),
//! )?;
//! let reply = client
//!     .request(&"ping".to_string(), &RkyvSerializer::<String, String>::new())
//!     .await?;
//! assert_eq!(reply, "pong: ping");
//!
//! client.shutdown();
//! server.shutdown().await;
//! membership.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod balancer;
mod client;
mod error;
mod listener;
mod membership;
mod network;
mod node;
mod registry;
mod server;
mod statistics;

pub use balancer::{ConsistentHash, LoadBalancer, NoAvailableNode, RoundRobin};
pub use client::{NetworkClient, NetworkClientConfig, StaleSnapshotPolicy};
pub use error::{ClientError, NodeError, RegistryError};
pub use listener::{ClusterListener, ListenerKey};
pub use membership::{
    ClusterMembership,
    MembershipConfig,
    MembershipState,
    DEFAULT_SERVICE_NAME,
};
pub use network::{ConnectionPool, PooledConnection};
pub use node::{ClusterSnapshot, Node, NodeId, SnapshotDiff};
pub use registry::{MemoryRegistry, NodeRegistry, RegistryEvent, SessionState};
pub use server::{NetworkServer, NetworkServerConfig};
pub use statistics::ClusterStatistics;
