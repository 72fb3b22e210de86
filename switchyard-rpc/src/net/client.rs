use std::fmt::{Debug, Formatter};
use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use super::frame::{self, Frame, FrameError, FrameKind, MAX_FRAME_SIZE};
use crate::in_flight::{InFlightRequests, ResponseHandle};
use crate::Status;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error)]
/// The client failed to establish a connection to the remote server.
pub enum ClientConnectError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to connect within {0:?}")]
    Timeout(Duration),
}

/// A multiplexed client connection.
///
/// Any number of requests may be in flight on the connection at once, replies
/// are matched to their requests by correlation token so they may arrive in
/// any order. Writers are serialized by the connection.
pub struct ClientConnection {
    id: u64,
    remote_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    in_flight: InFlightRequests,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl ClientConnection {
    /// Connects to a remote RPC server.
    ///
    /// Replies read from the connection settle requests in the given
    /// in-flight table.
    pub async fn connect(
        remote_addr: SocketAddr,
        connect_timeout: Duration,
        in_flight: InFlightRequests,
    ) -> Result<Self, ClientConnectError> {
        let stream = timeout(connect_timeout, TcpStream::connect(remote_addr))
            .await
            .map_err(|_| ClientConnectError::Timeout(connect_timeout))??;
        stream.set_nodelay(true)?;

        let (read, write) = stream.into_split();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_replies(
            id,
            remote_addr,
            read,
            in_flight.clone(),
            closed.clone(),
        ));

        trace!(connection_id = id, remote_addr = %remote_addr, "Opened client connection.");

        Ok(Self {
            id,
            remote_addr,
            writer: Mutex::new(write),
            in_flight,
            closed,
            reader,
        })
    }

    #[inline]
    /// The process unique ID of the connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    /// The address of the remote server.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[inline]
    /// Returns if the connection can no longer be used.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends a request across the connection.
    ///
    /// The request is registered as in-flight before it is written so a
    /// reply can never arrive ahead of its registration. If the write fails
    /// the request is discarded and a connection status returned, the
    /// connection should then be discarded by the caller.
    ///
    /// Payloads larger than [MAX_FRAME_SIZE] are refused with an invalid
    /// payload status before anything is written.
    pub async fn send_request<Resp>(
        &self,
        tag: u64,
        payload: Vec<u8>,
        deadline: Instant,
        write_timeout: Duration,
        decode: impl FnOnce(&[u8]) -> Result<Resp, Status> + Send + 'static,
    ) -> Result<ResponseHandle<Resp>, Status> {
        if payload.len() > MAX_FRAME_SIZE {
            warn!(
                connection_id = self.id,
                len = payload.len(),
                "Refusing to send a request larger than the maximum frame size."
            );
            return Err(Status::invalid());
        }

        let handle = self
            .in_flight
            .register(self.id, self.remote_addr, deadline, decode);

        let frame = Frame::request(handle.token(), tag, payload);
        self.write_frame(&frame, write_timeout)
            .await
            .map_err(Status::connection)?;

        Ok(handle)
    }

    /// Writes a single frame to the connection.
    pub async fn write_frame(&self, frame: &Frame, write_timeout: Duration) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                ErrorKind::NotConnected,
                "Connection has already been closed.",
            ));
        }

        let buffer = frame.encode();
        let mut writer = self.writer.lock().await;

        let result = timeout(write_timeout, async {
            writer.write_all(&buffer).await?;
            writer.flush().await
        })
        .await;

        match result {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                ErrorKind::TimedOut,
                format!("Failed to write request within {write_timeout:?}"),
            )),
        }
    }

    /// Closes the connection, failing any requests still awaiting a reply.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.reader.abort();
        let num_failed = self.in_flight.fail_connection(
            self.id,
            &Status::connection(format!("Connection to {} was closed.", self.remote_addr)),
        );

        debug!(
            connection_id = self.id,
            remote_addr = %self.remote_addr,
            num_failed = num_failed,
            "Closed client connection."
        );
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl Debug for ClientConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reads replies from the connection until it closes.
async fn read_replies(
    id: u64,
    remote_addr: SocketAddr,
    read: OwnedReadHalf,
    in_flight: InFlightRequests,
    closed: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(read);

    let reason = loop {
        let frame = match frame::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Status::connection("Connection closed by remote server."),
            Err(FrameError::Checksum { token, .. }) => {
                warn!(connection_id = id, token = token, "Received corrupted reply.");
                in_flight.settle(token, Err(Status::invalid()));
                continue;
            },
            Err(e) => {
                warn!(
                    connection_id = id,
                    remote_addr = %remote_addr,
                    error = %e,
                    "Failed to read from connection.",
                );
                break Status::connection(e);
            },
        };

        let token = frame.token;
        let settled = match frame.kind {
            FrameKind::Response => in_flight.settle(token, Ok(frame.payload)),
            FrameKind::Error => in_flight.settle(token, Err(frame.to_status())),
            FrameKind::Request => {
                warn!(
                    connection_id = id,
                    remote_addr = %remote_addr,
                    "Server sent a request frame to a client, ignoring."
                );
                continue;
            },
        };

        if !settled {
            debug!(
                connection_id = id,
                token = token,
                "Discarding reply for a request which has already been settled."
            );
        }
    };

    closed.store(true, Ordering::SeqCst);
    let num_failed = in_flight.fail_connection(id, &reason);
    if num_failed > 0 {
        warn!(
            connection_id = id,
            remote_addr = %remote_addr,
            num_failed = num_failed,
            reason = %reason,
            "Connection lost with requests in flight."
        );
    }
}
