use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::Status;

type ResultSink = oneshot::Sender<Result<Bytes, Status>>;
type Decoder<Resp> = Box<dyn FnOnce(&[u8]) -> Result<Resp, Status> + Send>;

/// A request which has been written (or is about to be written) to a
/// connection and is waiting on a reply.
pub struct PendingRequest {
    /// The connection the request was written to.
    pub connection_id: u64,
    /// The address of the remote peer.
    pub remote_addr: SocketAddr,
    pub submitted_at: Instant,
    pub deadline: Instant,
    sink: ResultSink,
}

impl PendingRequest {
    fn is_expired(&self, now: Instant, max_age: Duration) -> bool {
        now >= self.deadline || now.saturating_duration_since(self.submitted_at) >= max_age
    }
}

impl Debug for PendingRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .field("submitted_at", &self.submitted_at)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[derive(Clone, Default)]
/// The table of every request awaiting a reply, keyed by correlation token.
///
/// Settling a request removes it from the table, the removal is the single
/// atomic transition which decides who resolves the caller's handle. Responses,
/// timeouts, cancellation and connection failures all race through the same
/// removal so each handle is settled exactly once.
///
/// This is cheap to clone.
pub struct InFlightRequests(Arc<InFlightInner>);

#[derive(Default)]
struct InFlightInner {
    requests: DashMap<u64, PendingRequest>,
    next_token: AtomicU64,
}

impl InFlightRequests {
    /// Registers a new pending request and returns the handle the caller awaits.
    ///
    /// The `decode` function turns the raw reply payload into the response type.
    pub fn register<Resp>(
        &self,
        connection_id: u64,
        remote_addr: SocketAddr,
        deadline: Instant,
        decode: impl FnOnce(&[u8]) -> Result<Resp, Status> + Send + 'static,
    ) -> ResponseHandle<Resp> {
        // Tokens start at 1, 0 is never handed out.
        let token = self.0.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let (sink, rx) = oneshot::channel();

        let pending = PendingRequest {
            connection_id,
            remote_addr,
            submitted_at: Instant::now(),
            deadline,
            sink,
        };
        self.0.requests.insert(token, pending);

        ResponseHandle {
            token,
            rx,
            in_flight: self.clone(),
            decode: Some(Box::new(decode)),
            done: false,
        }
    }

    /// Settles the request with the given result.
    ///
    /// Returns `false` if the request was already settled by someone else.
    pub fn settle(&self, token: u64, result: Result<Bytes, Status>) -> bool {
        match self.0.requests.remove(&token) {
            Some((_, pending)) => {
                // The caller may have stopped listening, that is not an error.
                let _ = pending.sink.send(result);
                true
            },
            None => false,
        }
    }

    /// Fails the request with a cancellation status.
    pub fn cancel(&self, token: u64) -> bool {
        self.settle(token, Err(Status::cancelled()))
    }

    /// Fails every request which was written to the given connection.
    ///
    /// Returns the number of requests failed.
    pub fn fail_connection(&self, connection_id: u64, status: &Status) -> usize {
        let tokens = self
            .0
            .requests
            .iter()
            .filter(|entry| entry.connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();

        let mut num_failed = 0;
        for token in tokens {
            let removed = self
                .0
                .requests
                .remove_if(&token, |_, pending| pending.connection_id == connection_id);

            if let Some((_, pending)) = removed {
                let _ = pending.sink.send(Err(status.clone()));
                num_failed += 1;
            }
        }

        num_failed
    }

    /// Fails every request which has passed its deadline or is older than `max_age`.
    ///
    /// Entries are checked and removed one at a time so the table is never
    /// locked for the duration of the whole sweep.
    pub fn expire(&self, now: Instant, max_age: Duration) -> usize {
        let tokens = self
            .0
            .requests
            .iter()
            .filter(|entry| entry.is_expired(now, max_age))
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();

        let mut num_expired = 0;
        for token in tokens {
            let removed = self
                .0
                .requests
                .remove_if(&token, |_, pending| pending.is_expired(now, max_age));

            if let Some((_, pending)) = removed {
                debug!(
                    token = token,
                    remote_addr = %pending.remote_addr,
                    age = ?now.saturating_duration_since(pending.submitted_at),
                    "Expiring stale request."
                );
                let _ = pending.sink.send(Err(Status::timeout()));
                num_expired += 1;
            }
        }

        num_expired
    }

    /// Removes a request without settling it.
    fn discard(&self, token: u64) {
        self.0.requests.remove(&token);
    }

    #[inline]
    pub fn contains(&self, token: u64) -> bool {
        self.0.requests.contains_key(&token)
    }

    #[inline]
    /// The number of requests currently awaiting a reply.
    pub fn len(&self) -> usize {
        self.0.requests.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.requests.is_empty()
    }
}

/// A handle to the eventual reply of a request.
///
/// Await the handle to get the decoded reply. Dropping the handle before it
/// completes abandons the request.
pub struct ResponseHandle<Resp> {
    token: u64,
    rx: oneshot::Receiver<Result<Bytes, Status>>,
    in_flight: InFlightRequests,
    decode: Option<Decoder<Resp>>,
    done: bool,
}

impl<Resp> ResponseHandle<Resp> {
    #[inline]
    /// The correlation token of the request.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Cancels the request.
    ///
    /// Returns `false` if the request had already been settled, in which
    /// case awaiting the handle produces the original outcome.
    pub fn cancel(&self) -> bool {
        self.in_flight.cancel(self.token)
    }
}

impl<Resp> Future for ResponseHandle<Resp> {
    type Output = Result<Resp, Status>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let result = match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.done = true;

        let outcome = match result {
            Ok(Ok(payload)) => match this.decode.take() {
                Some(decode) => decode(&payload),
                None => Err(Status::invalid()),
            },
            Ok(Err(status)) => Err(status),
            Err(_) => Err(Status::connection(
                "The request was dropped before it could be settled.",
            )),
        };

        Poll::Ready(outcome)
    }
}

impl<Resp> Drop for ResponseHandle<Resp> {
    fn drop(&mut self) {
        if !self.done {
            self.in_flight.discard(self.token);
        }
    }
}

impl<Resp> Debug for ResponseHandle<Resp> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("token", &self.token)
            .field("done", &self.done)
            .finish()
    }
}
