use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::net::{type_tag, MAX_FRAME_SIZE};
use crate::serializer::Serializer;
use crate::{ErrorCode, Status};

/// Processes a single request type.
///
/// Handlers run on the server's worker pool, a handler may block without
/// stalling other connections. Returning an error, or panicking, produces a
/// handler error reply which the client can tell apart from a transport failure.
pub trait RequestHandler<Req, Resp>: Send + Sync + 'static {
    fn handle_request(&self, request: Req) -> Result<Resp, Status>;
}

impl<F, Req, Resp> RequestHandler<Req, Resp> for F
where
    F: Fn(Req) -> Result<Resp, Status> + Send + Sync + 'static,
{
    fn handle_request(&self, request: Req) -> Result<Resp, Status> {
        (self)(request)
    }
}

/// A registry linking request type tags with their handlers.
///
/// Since the server cannot know which payload belongs to which handler ahead
/// of time, requests are routed at runtime using the type tag carried in
/// each frame. The registry is frozen once the server starts.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<u64, RegisteredHandler>,
}

#[derive(Clone)]
pub(crate) struct RegisteredHandler {
    pub(crate) name: String,
    pub(crate) handler: Arc<dyn OpaqueHandler>,
}

impl HandlerRegistry {
    /// Adds a handler for the request type described by the serializer.
    ///
    /// Registering a second handler for the same request name replaces the first.
    pub fn register<Req, Resp, H, S>(&mut self, handler: H, serializer: S)
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        H: RequestHandler<Req, Resp>,
        S: Serializer<Req, Resp>,
    {
        let name = serializer.request_name().to_string();
        let tag = type_tag(&name);

        let phantom = PhantomHandler {
            handler,
            serializer,
            _types: PhantomData,
        };

        let registered = RegisteredHandler {
            name: name.clone(),
            handler: Arc::new(phantom),
        };

        if let Some(previous) = self.handlers.insert(tag, registered) {
            warn!(
                request_name = %name,
                previous_name = %previous.name,
                "Replaced an existing request handler."
            );
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Returns if a handler is registered for the given request name.
    pub fn contains(&self, request_name: &str) -> bool {
        self.handlers.contains_key(&type_tag(request_name))
    }

    pub(crate) fn get(&self, tag: u64) -> Option<&RegisteredHandler> {
        self.handlers.get(&tag)
    }
}

/// A handler with its request and response types erased.
pub(crate) trait OpaqueHandler: Send + Sync {
    /// Decodes the payload, runs the handler and encodes the reply.
    fn try_handle(&self, payload: &[u8]) -> Result<Vec<u8>, Status>;
}

struct PhantomHandler<H, S, Req, Resp> {
    handler: H,
    serializer: S,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<H, S, Req, Resp> OpaqueHandler for PhantomHandler<H, S, Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    H: RequestHandler<Req, Resp>,
    S: Serializer<Req, Resp>,
{
    fn try_handle(&self, payload: &[u8]) -> Result<Vec<u8>, Status> {
        let request = self.serializer.request_from_bytes(payload)?;

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handler.handle_request(request)
        }));

        let response = match result {
            Ok(Ok(response)) => response,
            // Whatever code the handler picked, the request reached it and may
            // have had side effects.
            Ok(Err(status)) if status.code != ErrorCode::HandlerError => {
                return Err(Status::handler(status.message))
            },
            Ok(Err(status)) => return Err(status),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    request_name = %self.serializer.request_name(),
                    reason = %reason,
                    "Request handler panicked."
                );
                return Err(Status::handler(format!("Handler panicked: {reason}")));
            },
        };

        let buffer = self.serializer.response_to_bytes(&response)?;
        if buffer.len() > MAX_FRAME_SIZE {
            warn!(
                request_name = %self.serializer.request_name(),
                len = buffer.len(),
                "Reply exceeds the maximum frame size."
            );
            return Err(Status::handler(format!(
                "Reply of {} bytes exceeds the maximum frame size of {MAX_FRAME_SIZE} bytes.",
                buffer.len(),
            )));
        }

        Ok(buffer)
    }
}
