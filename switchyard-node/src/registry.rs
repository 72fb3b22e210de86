use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::node::{Node, NodeId};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// The state of a registry session.
pub enum SessionState {
    /// The session is being established or is recovering from a lost connection.
    Connecting,
    Connected,
    /// The session was lost, anything it owned has been released.
    Expired,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A change notification from the registry.
pub enum RegistryEvent {
    /// The session is (re)established, `nodes` is the full current node set.
    SessionConnected { nodes: Vec<Node> },
    /// A delta to the node set.
    NodesChanged {
        added: Vec<Node>,
        removed: Vec<NodeId>,
        updated: Vec<Node>,
    },
    /// The connection to the registry was lost, the session may still recover.
    SessionDisconnected,
    /// The session is gone, a new one must be established.
    SessionExpired,
}

#[async_trait]
/// The coordination service holding the cluster's node set.
///
/// Events for a session are delivered, in order, to every receiver created
/// with [NodeRegistry::watch].
pub trait NodeRegistry: Send + Sync + 'static {
    /// Establishes a session with the registry.
    ///
    /// Connecting an expired session starts a new one.
    async fn connect(&self) -> Result<(), RegistryError>;

    fn session_state(&self) -> SessionState;

    /// Subscribes to the session's events.
    fn watch(&self) -> flume::Receiver<RegistryEvent>;

    /// Registers a node, re-registering an existing ID updates its address.
    async fn create_node(&self, node_id: NodeId, address: &str) -> Result<(), RegistryError>;

    /// Removes a node, removing an ID which does not exist is a no-op.
    async fn delete_node(&self, node_id: NodeId) -> Result<(), RegistryError>;

    /// Marks a node as available or unavailable.
    ///
    /// Availability is owned by the session which set it and is released
    /// when that session expires or closes.
    async fn set_available(&self, node_id: NodeId, available: bool) -> Result<(), RegistryError>;

    async fn list_nodes(&self) -> Result<Vec<Node>, RegistryError>;

    /// Closes the session.
    async fn close(&self);
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
/// A complete in-process registry.
///
/// Every session created from the same registry, see [MemoryRegistry::new_session],
/// shares the same node set. Clones share the same session.
///
/// Failures can be injected with [MemoryRegistry::disconnect],
/// [MemoryRegistry::expire_session] and [MemoryRegistry::set_unreachable].
pub struct MemoryRegistry {
    backend: Arc<Mutex<Backend>>,
    session_id: u64,
}

#[derive(Default)]
struct Backend {
    nodes: BTreeMap<NodeId, Node>,
    sessions: BTreeMap<u64, Session>,
    unreachable: bool,
}

struct Session {
    state: SessionState,
    watchers: Vec<flume::Sender<RegistryEvent>>,
    owned_availability: BTreeSet<NodeId>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            watchers: Vec::new(),
            owned_availability: BTreeSet::new(),
        }
    }

    fn emit(&mut self, event: RegistryEvent) {
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Backend {
    fn session(&mut self, session_id: u64) -> Result<&mut Session, RegistryError> {
        if self.unreachable {
            return Err(RegistryError::Unreachable(
                "The registry is not accepting connections.".to_string(),
            ));
        }

        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(RegistryError::Closed)?;

        match session.state {
            SessionState::Connected => Ok(session),
            SessionState::Connecting => Err(RegistryError::NotConnected),
            SessionState::Expired => Err(RegistryError::SessionExpired),
            SessionState::Closed => Err(RegistryError::Closed),
        }
    }

    /// Sends the change to every connected session.
    fn broadcast(&mut self, event: RegistryEvent) {
        for session in self.sessions.values_mut() {
            if session.state == SessionState::Connected {
                session.emit(event.clone());
            }
        }
    }

    /// Drops availability marks owned by a session which is going away.
    fn release_availability(&mut self, session_id: u64) {
        let owned = match self.sessions.get_mut(&session_id) {
            Some(session) => std::mem::take(&mut session.owned_availability),
            None => return,
        };

        let mut updated = Vec::new();
        for node_id in owned {
            if let Some(node) = self.nodes.get_mut(&node_id) {
                if node.available {
                    node.available = false;
                    updated.push(node.clone());
                }
            }
        }

        if !updated.is_empty() {
            debug!(
                session_id = session_id,
                num_nodes = updated.len(),
                "Released availability owned by session."
            );
            self.broadcast(RegistryEvent::NodesChanged {
                added: Vec::new(),
                removed: Vec::new(),
                updated,
            });
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    /// Creates a new, empty, registry and a session to it.
    pub fn new() -> Self {
        Self::with_backend(Arc::new(Mutex::new(Backend::default())))
    }

    /// Creates a new session to the same registry.
    pub fn new_session(&self) -> Self {
        Self::with_backend(self.backend.clone())
    }

    fn with_backend(backend: Arc<Mutex<Backend>>) -> Self {
        let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        backend.lock().sessions.insert(session_id, Session::new());
        Self {
            backend,
            session_id,
        }
    }

    /// Simulates the session losing its connection to the registry.
    ///
    /// The session keeps everything it owns and recovers with [MemoryRegistry::reconnect].
    pub fn disconnect(&self) {
        let mut backend = self.backend.lock();
        if let Some(session) = backend.sessions.get_mut(&self.session_id) {
            if session.state == SessionState::Connected {
                info!(session_id = self.session_id, "Registry session disconnected.");
                session.state = SessionState::Connecting;
                session.emit(RegistryEvent::SessionDisconnected);
            }
        }
    }

    /// Restores a disconnected session.
    pub fn reconnect(&self) {
        let mut backend = self.backend.lock();
        let nodes = backend.nodes.values().cloned().collect::<Vec<_>>();
        if let Some(session) = backend.sessions.get_mut(&self.session_id) {
            if session.state == SessionState::Connecting {
                info!(session_id = self.session_id, "Registry session reconnected.");
                session.state = SessionState::Connected;
                session.emit(RegistryEvent::SessionConnected { nodes });
            }
        }
    }

    /// Simulates the registry expiring the session.
    pub fn expire_session(&self) {
        let mut backend = self.backend.lock();
        let expired = match backend.sessions.get_mut(&self.session_id) {
            Some(session)
                if matches!(
                    session.state,
                    SessionState::Connected | SessionState::Connecting
                ) =>
            {
                warn!(session_id = self.session_id, "Registry session expired.");
                session.state = SessionState::Expired;
                session.emit(RegistryEvent::SessionExpired);
                true
            },
            _ => false,
        };

        if expired {
            backend.release_availability(self.session_id);
        }
    }

    /// Makes the registry refuse connections and operations from every session.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.backend.lock().unreachable = unreachable;
    }
}

#[async_trait]
impl NodeRegistry for MemoryRegistry {
    async fn connect(&self) -> Result<(), RegistryError> {
        let mut backend = self.backend.lock();
        if backend.unreachable {
            return Err(RegistryError::Unreachable(
                "The registry is not accepting connections.".to_string(),
            ));
        }

        let nodes = backend.nodes.values().cloned().collect::<Vec<_>>();
        let session = backend
            .sessions
            .get_mut(&self.session_id)
            .ok_or(RegistryError::Closed)?;

        match session.state {
            SessionState::Connected => Ok(()),
            SessionState::Closed => Err(RegistryError::Closed),
            SessionState::Connecting | SessionState::Expired => {
                session.state = SessionState::Connected;
                session.emit(RegistryEvent::SessionConnected { nodes });
                Ok(())
            },
        }
    }

    fn session_state(&self) -> SessionState {
        self.backend
            .lock()
            .sessions
            .get(&self.session_id)
            .map(|session| session.state)
            .unwrap_or(SessionState::Closed)
    }

    fn watch(&self) -> flume::Receiver<RegistryEvent> {
        let (tx, rx) = flume::unbounded();
        if let Some(session) = self.backend.lock().sessions.get_mut(&self.session_id) {
            session.watchers.push(tx);
        }
        rx
    }

    async fn create_node(&self, node_id: NodeId, address: &str) -> Result<(), RegistryError> {
        let mut backend = self.backend.lock();
        backend.session(self.session_id)?;

        let event = match backend.nodes.get_mut(&node_id) {
            Some(existing) if existing.address == address => return Ok(()),
            Some(existing) => {
                existing.address = address.to_string();
                RegistryEvent::NodesChanged {
                    added: Vec::new(),
                    removed: Vec::new(),
                    updated: vec![existing.clone()],
                }
            },
            None => {
                let node = Node::new(node_id, address);
                backend.nodes.insert(node_id, node.clone());
                RegistryEvent::NodesChanged {
                    added: vec![node],
                    removed: Vec::new(),
                    updated: Vec::new(),
                }
            },
        };

        backend.broadcast(event);
        Ok(())
    }

    async fn delete_node(&self, node_id: NodeId) -> Result<(), RegistryError> {
        let mut backend = self.backend.lock();
        backend.session(self.session_id)?;

        if backend.nodes.remove(&node_id).is_some() {
            backend.broadcast(RegistryEvent::NodesChanged {
                added: Vec::new(),
                removed: vec![node_id],
                updated: Vec::new(),
            });
        }

        Ok(())
    }

    async fn set_available(&self, node_id: NodeId, available: bool) -> Result<(), RegistryError> {
        let mut backend = self.backend.lock();
        backend.session(self.session_id)?;

        let node = backend
            .nodes
            .get_mut(&node_id)
            .ok_or(RegistryError::NoSuchNode(node_id))?;
        let changed = node.available != available;
        node.available = available;
        let updated = node.clone();

        if let Some(session) = backend.sessions.get_mut(&self.session_id) {
            if available {
                session.owned_availability.insert(node_id);
            } else {
                session.owned_availability.remove(&node_id);
            }
        }

        if changed {
            backend.broadcast(RegistryEvent::NodesChanged {
                added: Vec::new(),
                removed: Vec::new(),
                updated: vec![updated],
            });
        }

        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, RegistryError> {
        let mut backend = self.backend.lock();
        backend.session(self.session_id)?;
        Ok(backend.nodes.values().cloned().collect())
    }

    async fn close(&self) {
        let mut backend = self.backend.lock();
        backend.release_availability(self.session_id);
        if let Some(session) = backend.sessions.get_mut(&self.session_id) {
            session.state = SessionState::Closed;
            session.watchers.clear();
        }
    }
}
