use std::marker::PhantomData;

use rkyv::de::deserializers::SharedDeserializeMap;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, CheckBytes, Deserialize, Serialize};

use crate::{Status, SCRATCH_SPACE};

/// Converts a request type and its response type to and from bytes.
///
/// Implementations must be deterministic and symmetric, decoding the
/// encoded form of a value must produce an equal value.
///
/// The request name is used to derive the type tag which routes a request
/// to its handler, the client and server must agree on it.
pub trait Serializer<Req, Resp>: Send + Sync + 'static {
    /// The unique name of the request type.
    fn request_name(&self) -> &str;

    fn request_to_bytes(&self, request: &Req) -> Result<Vec<u8>, Status>;

    fn request_from_bytes(&self, bytes: &[u8]) -> Result<Req, Status>;

    fn response_to_bytes(&self, response: &Resp) -> Result<Vec<u8>, Status>;

    fn response_from_bytes(&self, bytes: &[u8]) -> Result<Resp, Status>;
}

/// A [Serializer] for any request and response types which can be archived
/// with rkyv.
///
/// The request name defaults to the type name of the request.
pub struct RkyvSerializer<Req, Resp> {
    name: Option<&'static str>,
    _types: PhantomData<fn() -> (Req, Resp)>,
}

impl<Req, Resp> RkyvSerializer<Req, Resp> {
    pub fn new() -> Self {
        Self {
            name: None,
            _types: PhantomData,
        }
    }

    /// Overrides the request name.
    ///
    /// This is needed when the client and server are built from crates which
    /// name the request type differently.
    pub fn with_name(name: &'static str) -> Self {
        Self {
            name: Some(name),
            _types: PhantomData,
        }
    }
}

impl<Req, Resp> Default for RkyvSerializer<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> Clone for RkyvSerializer<Req, Resp> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req, Resp> Copy for RkyvSerializer<Req, Resp> {}

impl<Req, Resp> Serializer<Req, Resp> for RkyvSerializer<Req, Resp>
where
    Req: Archive + Serialize<AllocSerializer<SCRATCH_SPACE>> + 'static,
    Req::Archived: for<'a> CheckBytes<DefaultValidator<'a>>
        + Deserialize<Req, SharedDeserializeMap>,
    Resp: Archive + Serialize<AllocSerializer<SCRATCH_SPACE>> + 'static,
    Resp::Archived: for<'a> CheckBytes<DefaultValidator<'a>>
        + Deserialize<Resp, SharedDeserializeMap>,
{
    fn request_name(&self) -> &str {
        self.name.unwrap_or_else(std::any::type_name::<Req>)
    }

    fn request_to_bytes(&self, request: &Req) -> Result<Vec<u8>, Status> {
        to_bytes(request)
    }

    fn request_from_bytes(&self, bytes: &[u8]) -> Result<Req, Status> {
        from_bytes(bytes)
    }

    fn response_to_bytes(&self, response: &Resp) -> Result<Vec<u8>, Status> {
        to_bytes(response)
    }

    fn response_from_bytes(&self, bytes: &[u8]) -> Result<Resp, Status> {
        from_bytes(bytes)
    }
}

fn to_bytes<T>(value: &T) -> Result<Vec<u8>, Status>
where
    T: Serialize<AllocSerializer<SCRATCH_SPACE>>,
{
    rkyv::to_bytes::<_, SCRATCH_SPACE>(value)
        .map(|buffer| buffer.into_vec())
        .map_err(|_| Status::invalid())
}

fn from_bytes<T>(bytes: &[u8]) -> Result<T, Status>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, SharedDeserializeMap>,
{
    // Archived data must be read from an aligned buffer.
    let mut aligned = AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<T>(&aligned).map_err(|_| Status::invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Serialize, Deserialize, Archive, PartialEq, Eq, Debug)]
    #[archive(check_bytes)]
    pub struct Ping {
        timestamp: u64,
        from: String,
    }

    #[test]
    fn test_round_trip() {
        let serializer = RkyvSerializer::<Ping, Ping>::new();
        let ping = Ping {
            timestamp: 1_700_000_000_000,
            from: "node-1".to_string(),
        };

        let bytes = serializer.request_to_bytes(&ping).expect("Encode");
        assert_eq!(serializer.request_from_bytes(&bytes).expect("Decode"), ping);

        let bytes = serializer.response_to_bytes(&ping).expect("Encode");
        assert_eq!(serializer.response_from_bytes(&bytes).expect("Decode"), ping);
    }

    #[test]
    fn test_deterministic() {
        let serializer = RkyvSerializer::<String, u64>::new();
        let first = serializer.request_to_bytes(&"hello".to_string()).unwrap();
        let second = serializer.request_to_bytes(&"hello".to_string()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unaligned_input() {
        let serializer = RkyvSerializer::<String, u64>::new();
        let bytes = serializer.response_to_bytes(&42).unwrap();

        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        assert_eq!(serializer.response_from_bytes(&shifted[1..]), Ok(42));
    }

    #[test]
    fn test_invalid_payload() {
        let serializer = RkyvSerializer::<Ping, Ping>::new();
        assert_eq!(
            serializer.request_from_bytes(&[1, 2, 3]),
            Err(Status::invalid())
        );
    }

    #[test]
    fn test_request_names() {
        let serializer = RkyvSerializer::<Ping, Ping>::new();
        assert!(serializer.request_name().ends_with("Ping"));

        let serializer = RkyvSerializer::<Ping, Ping>::with_name("ping");
        assert_eq!(serializer.request_name(), "ping");
    }
}
