//! The network runtime for switchyard.
//!
//! Requests travel as length prefixed frames across plain TCP connections,
//! each carrying a correlation token so many requests can share a single
//! connection and be answered out of order. Servers run handlers on a bounded
//! worker pool and refuse work they cannot queue.
//!
//! ```rust
//! use std::net::SocketAddr;
//! use std::time::Duration;
//!
//! use switchyard_rpc::{
//!     ClientConnection,
//!     HandlerRegistry,
//!     InFlightRequests,
//!     RkyvSerializer,
//!     Serializer,
//!     Server,
//!     Status,
//!     WorkerPoolConfig,
//! };
//! use tokio::time::Instant;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut registry = HandlerRegistry::default();
//!     registry.register(
//!         |name: String| -> Result<String, Status> { Ok(format!("Hello, {name}!")) },
//!         RkyvSerializer::<String, String>::with_name("greet"),
//!     );
//!
//!     let bind = "127.0.0.1:0".parse::<SocketAddr>()?;
//!     let server = Server::listen(bind, registry, WorkerPoolConfig::default()).await?;
//!
//!     let in_flight = InFlightRequests::default();
//!     let connection = ClientConnection::connect(
//!         server.local_addr(),
//!         Duration::from_secs(1),
//!         in_flight,
//!     )
//!     .await?;
//!
//!     let serializer = RkyvSerializer::<String, String>::with_name("greet");
//!     let payload = serializer.request_to_bytes(&"Bobby".to_string())?;
//!     let handle = connection
//!         .send_request(
//!             switchyard_rpc::type_tag(serializer.request_name()),
//!             payload,
//!             Instant::now() + Duration::from_secs(1),
//!             Duration::from_millis(150),
//!             move |bytes| serializer.response_from_bytes(bytes),
//!         )
//!         .await?;
//!
//!     assert_eq!(handle.await?, "Hello, Bobby!");
//!
//!     server.shutdown();
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate tracing;

mod handler;
mod in_flight;
mod net;
mod reaper;
mod serializer;
mod server;
mod worker_pool;

/// The scratch space allocated when archiving values with rkyv.
pub const SCRATCH_SPACE: usize = 4096;

pub use handler::{HandlerRegistry, RequestHandler};
pub use in_flight::{InFlightRequests, PendingRequest, ResponseHandle};
pub use net::{
    type_tag,
    ArchivedErrorCode,
    ArchivedStatus,
    ClientConnectError,
    ClientConnection,
    ErrorCode,
    Frame,
    FrameError,
    FrameKind,
    Status,
    HEADER_SIZE,
    MAX_FRAME_SIZE,
};
pub use reaper::{spawn_reaper, ReaperHandle, MIN_CLEANUP_FREQUENCY};
pub use serializer::{RkyvSerializer, Serializer};
pub use server::{Server, ServerBindError};
pub use worker_pool::{Job, Rejected, WorkerPool, WorkerPoolConfig};
