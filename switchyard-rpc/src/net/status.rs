use std::error::Error;
use std::fmt::{Debug, Display, Formatter};

use rkyv::{Archive, Deserialize, Serialize};

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, PartialEq, Eq, Clone)]
#[archive(compare(PartialEq), check_bytes)]
#[archive_attr(derive(PartialEq, Eq, Debug))]
/// Status information around the cause of a request failing.
///
/// This includes a generic status code and message. Statuses travel across
/// the wire inside error frames and are also used locally to settle
/// in-flight requests which never got a reply.
pub struct Status {
    /// The generic error code of the request.
    pub code: ErrorCode,
    /// The display message for the error.
    pub message: String,
}

impl Status {
    /// The remote handler ran but returned an error or panicked.
    pub fn handler(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::HandlerError,
            message: msg.to_string(),
        }
    }

    /// The server is at capacity and refused to queue the request.
    pub fn overloaded(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            message: msg.to_string(),
        }
    }

    /// The server has no handler registered for the request type.
    pub fn unknown_handler(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::UnknownHandler,
            message: msg.to_string(),
        }
    }

    /// The provided message data is invalid or unable to be deserialized
    /// by the peer processing it.
    pub fn invalid() -> Self {
        Self {
            code: ErrorCode::InvalidPayload,
            message: "Invalid message payload was provided to be deserialized."
                .to_string(),
        }
    }

    /// The connection is closed or interrupted during the operation.
    pub fn connection(msg: impl Display) -> Self {
        Self {
            code: ErrorCode::ConnectionError,
            message: msg.to_string(),
        }
    }

    /// The operation took too long to be completed and was aborted.
    pub fn timeout() -> Self {
        Self {
            code: ErrorCode::Timeout,
            message: "The operation took to long to be completed.".to_string(),
        }
    }

    /// The caller gave up on the request before it was answered.
    pub fn cancelled() -> Self {
        Self {
            code: ErrorCode::Cancelled,
            message: "The request was cancelled by the caller.".to_string(),
        }
    }

    /// Returns if the failure happened in transport rather than on the remote
    /// handler.
    ///
    /// Callers can use this to decide whether a non-idempotent request may
    /// be retried.
    pub fn is_transport_error(&self) -> bool {
        matches!(self.code, ErrorCode::ConnectionError | ErrorCode::Timeout)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl Debug for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Status")
            .field("code", &self.code)
            .field("message", &self.message)
            .finish()
    }
}

impl Error for Status {}

#[repr(C)]
#[derive(Serialize, Deserialize, Archive, PartialEq, Eq, Debug, Copy, Clone)]
#[archive(compare(PartialEq), check_bytes)]
#[archive_attr(derive(Debug, PartialEq, Eq))]
/// A generic error code describing the high level reason why the request failed.
pub enum ErrorCode {
    /// The remote handler ran but returned an error or panicked.
    HandlerError,
    /// The server's worker pool and queue are full.
    Overloaded,
    /// The server has no handler registered for the request type.
    UnknownHandler,
    /// The provided message data is invalid or unable to be deserialized
    /// by the peer processing it.
    InvalidPayload,
    /// The connection is closed or interrupted during the operation.
    ConnectionError,
    /// The operation took too long to be completed and was aborted.
    Timeout,
    /// The caller cancelled the request.
    Cancelled,
}
