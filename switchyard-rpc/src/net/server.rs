use std::net::SocketAddr;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use super::frame::{self, Frame, FrameError, FrameKind};
use crate::server::ServerState;
use crate::Status;

/// Starts the RPC server.
///
/// This takes an already bound listener and the server state. Aborting the
/// returned task aborts every connection it accepted.
pub(crate) fn start_rpc_server(listener: TcpListener, state: ServerState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            connections.spawn(handle_connection(stream, remote_addr, state.clone()));
                        },
                        Err(e) => {
                            error!(error = ?e, "Server failed to accept connection.");
                        },
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {},
            }
        }
    })
}

/// A single connection handler.
///
/// Requests are read and dispatched in arrival order while replies are
/// written by a separate writer as each handler completes.
async fn handle_connection(stream: TcpStream, remote_addr: SocketAddr, state: ServerState) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(remote_addr = %remote_addr, error = ?e, "Failed to set TCP_NODELAY.");
    }

    trace!(remote_addr = %remote_addr, "Accepted connection.");

    let (read, write) = stream.into_split();
    let (tx, rx) = flume::unbounded();

    tokio::join!(
        read_requests(read, remote_addr, state, tx),
        write_replies(write, remote_addr, rx),
    );

    trace!(remote_addr = %remote_addr, "Connection closed.");
}

async fn read_requests(
    read: OwnedReadHalf,
    remote_addr: SocketAddr,
    state: ServerState,
    replies: flume::Sender<Frame>,
) {
    let mut reader = BufReader::new(read);

    loop {
        match frame::read_frame(&mut reader).await {
            Ok(Some(frame)) => dispatch(frame, remote_addr, &state, &replies),
            Ok(None) => break,
            Err(FrameError::Checksum { token, tag, .. }) => {
                warn!(remote_addr = %remote_addr, token = token, "Received corrupted request.");
                send_reply(&replies, Frame::error(token, tag, &Status::invalid()));
            },
            Err(e) => {
                warn!(
                    remote_addr = %remote_addr,
                    error = %e,
                    "Encountered an error while reading from connection."
                );
                break;
            },
        }
    }
}

fn dispatch(
    frame: Frame,
    remote_addr: SocketAddr,
    state: &ServerState,
    replies: &flume::Sender<Frame>,
) {
    let Frame {
        kind,
        token,
        tag,
        payload,
    } = frame;

    if kind != FrameKind::Request {
        warn!(remote_addr = %remote_addr, kind = ?kind, "Client sent a non-request frame.");
        send_reply(replies, Frame::error(token, tag, &Status::invalid()));
        return;
    }

    let handler = match state.handlers.get(tag) {
        Some(registered) => registered.handler.clone(),
        None => {
            let status =
                Status::unknown_handler(format!("Unknown handler for type tag {tag}"));
            send_reply(replies, Frame::error(token, tag, &status));
            return;
        },
    };

    let tx = replies.clone();
    let job = Box::new(move || {
        let reply = match handler.try_handle(&payload) {
            Ok(buffer) => Frame::response(token, tag, buffer),
            Err(status) => Frame::error(token, tag, &status),
        };
        send_reply(&tx, reply);
    });

    if let Err(rejected) = state.pool.try_execute(job) {
        warn!(
            remote_addr = %remote_addr,
            workers = rejected.workers,
            queued = rejected.queued,
            "Rejected request, server is overloaded."
        );
        send_reply(replies, Frame::error(token, tag, &Status::overloaded(rejected)));
    }
}

fn send_reply(replies: &flume::Sender<Frame>, frame: Frame) {
    if replies.send(frame).is_err() {
        debug!("Dropping reply for a connection which has already closed.");
    }
}

async fn write_replies(
    write: OwnedWriteHalf,
    remote_addr: SocketAddr,
    replies: flume::Receiver<Frame>,
) {
    let mut writer = BufWriter::new(write);

    while let Ok(frame) = replies.recv_async().await {
        if let Err(e) = writer.write_all(&frame.encode()).await {
            warn!(remote_addr = %remote_addr, error = ?e, "Failed to write reply.");
            return;
        }

        if replies.is_empty() {
            if let Err(e) = writer.flush().await {
                warn!(remote_addr = %remote_addr, error = ?e, "Failed to write reply.");
                return;
            }
        }
    }

    let _ = writer.shutdown().await;
}
