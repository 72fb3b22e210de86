use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::handler::HandlerRegistry;
use crate::worker_pool::{WorkerPool, WorkerPoolConfig};

#[derive(Debug, thiserror::Error)]
/// The server could not be started.
pub enum ServerBindError {
    #[error("Failed to bind listener: {0}")]
    Bind(io::Error),

    #[error("Failed to start worker pool: {0}")]
    Workers(io::Error),
}

/// A RPC server instance.
///
/// Each accepted connection is read by its own task, requests are executed
/// on a shared worker pool and replies are written back as they complete.
pub struct Server {
    local_addr: SocketAddr,
    state: ServerState,
    handle: JoinHandle<()>,
}

impl Server {
    /// Binds the listener and spawns the RPC server task.
    pub async fn listen(
        addr: SocketAddr,
        registry: HandlerRegistry,
        pool_config: WorkerPoolConfig,
    ) -> Result<Self, ServerBindError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(ServerBindError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerBindError::Bind)?;

        let pool = WorkerPool::new(format!("rpc-{}", local_addr.port()), pool_config)
            .map_err(ServerBindError::Workers)?;

        let state = ServerState {
            handlers: Arc::new(registry),
            pool,
        };
        let handle = crate::net::start_rpc_server(listener, state.clone());

        info!(
            listen_addr = %local_addr,
            num_handlers = state.handlers.len(),
            "RPC server is listening."
        );

        Ok(Self {
            local_addr,
            state,
            handle,
        })
    }

    #[inline]
    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    /// The number of live workers in the server's pool.
    pub fn num_workers(&self) -> usize {
        self.state.pool.num_workers()
    }

    /// Signals the server to shutdown.
    ///
    /// The listener and all open connections are closed.
    pub fn shutdown(&self) {
        self.handle.abort();
        self.state.pool.shutdown();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone)]
/// Represents the shared state of the RPC server.
pub(crate) struct ServerState {
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) pool: WorkerPool,
}
