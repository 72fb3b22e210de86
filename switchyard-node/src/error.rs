use std::io;
use std::time::Duration;

use switchyard_rpc::{ErrorCode, ServerBindError, Status};
use thiserror::Error;

use crate::balancer::NoAvailableNode;
use crate::node::NodeId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("The registry session has expired.")]
    /// The session was lost, a new one must be established with `connect`.
    SessionExpired,

    #[error("The registry session is not connected.")]
    NotConnected,

    #[error("The registry is unreachable: {0}")]
    Unreachable(String),

    #[error("The registry session has been closed.")]
    Closed,

    #[error("Node {0} does not exist in the registry.")]
    NoSuchNode(NodeId),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Registry operation failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("Failed to connect to the cluster: {0}")]
    /// The membership could not establish its registry session.
    Connection(String),

    #[error("Node {0} is not part of the cluster.")]
    InvalidNode(NodeId),

    #[error("The server has already been bound to a node.")]
    AlreadyBound,

    #[error("The server is not bound to a node.")]
    NotBound,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("The cluster membership has been shut down.")]
    ShutDown,

    #[error("{0}")]
    /// An IO error has occurred,
    IO(#[from] io::Error),

    #[error("Failed to start server: {0}")]
    Server(#[from] ServerBindError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
/// The reasons a request sent through the cluster can fail.
///
/// Failures which happen before anything is written to the wire are returned
/// when sending, everything else settles the request's handle.
pub enum ClientError {
    #[error("Connection error: {0}")]
    /// A transport failure, the request may be retried.
    Connection(String),

    #[error("No connection to node {node_id} became free within {timeout:?}")]
    PoolExhausted { node_id: NodeId, timeout: Duration },

    #[error("No available node could be selected.")]
    NoAvailableNode,

    #[error("The cluster membership is not connected to the registry.")]
    ClusterUnavailable,

    #[error("The request did not complete before its deadline.")]
    RequestTimeout,

    #[error("The remote handler failed: {0}")]
    /// The handler ran and failed, the request may have had side effects.
    Handler(Status),

    #[error("Protocol error: {0}")]
    /// The request could not be encoded or was not understood by the server.
    Protocol(Status),

    #[error("The request was cancelled.")]
    Cancelled,
}

impl ClientError {
    /// Returns if the request is known to have never reached a handler.
    ///
    /// Overloaded servers reject requests before running them.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Handler(status) => status.code == ErrorCode::Overloaded,
            Self::Protocol(_) => false,
            _ => true,
        }
    }
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        match status.code {
            ErrorCode::HandlerError | ErrorCode::Overloaded => Self::Handler(status),
            ErrorCode::UnknownHandler | ErrorCode::InvalidPayload => Self::Protocol(status),
            ErrorCode::ConnectionError => Self::Connection(status.message),
            ErrorCode::Timeout => Self::RequestTimeout,
            ErrorCode::Cancelled => Self::Cancelled,
        }
    }
}

impl From<NoAvailableNode> for ClientError {
    fn from(_: NoAvailableNode) -> Self {
        Self::NoAvailableNode
    }
}
