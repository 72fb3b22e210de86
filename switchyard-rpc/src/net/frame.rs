use std::io;
use std::io::ErrorKind;
use std::mem;

use bytes::Bytes;
use rkyv::AlignedVec;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::Status;

static HEADER_TERMINATOR: &[u8] = b"\r\n";

pub const KIND_SIZE: usize = 1;
pub const TOKEN_SIZE: usize = mem::size_of::<u64>();
pub const TAG_SIZE: usize = mem::size_of::<u64>();
pub const DATA_LEN_SIZE: usize = mem::size_of::<u32>();
pub const CHECKSUM_SIZE: usize = mem::size_of::<u32>();
pub const LEN_SIZE: usize =
    KIND_SIZE + TOKEN_SIZE + TAG_SIZE + DATA_LEN_SIZE + CHECKSUM_SIZE;
pub const HEADER_SIZE: usize = LEN_SIZE + 2;
/// The largest payload a single frame may carry.
pub const MAX_FRAME_SIZE: usize = 64 << 20;

const TOKEN_OFFSET: usize = KIND_SIZE;
const TAG_OFFSET: usize = TOKEN_OFFSET + TOKEN_SIZE;
const LEN_OFFSET: usize = TAG_OFFSET + TAG_SIZE;
const CHECKSUM_OFFSET: usize = LEN_OFFSET + DATA_LEN_SIZE;

/// Produces the wire type tag for a given request name.
///
/// The tag is stable across processes and builds.
pub fn type_tag(name: &str) -> u64 {
    crc32fast::hash(name.as_bytes()) as u64
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Response = 1,
    Error = 2,
}

impl FrameKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed frame header: {0}")]
    /// The stream no longer lines up with frame boundaries.
    Malformed(&'static str),

    #[error("Frame payload of {len} bytes exceeds the 64 MiB frame limit")]
    TooLarge { len: usize },

    #[error("Checksum mismatch for frame with token {token}")]
    /// The frame payload was corrupted.
    ///
    /// The stream is still aligned so the connection can keep being used.
    Checksum { kind: FrameKind, token: u64, tag: u64 },
}

impl FrameError {
    /// Returns if the connection can continue reading frames after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Checksum { .. })
    }
}

#[derive(Clone, PartialEq, Eq)]
/// A single unit of traffic on a connection.
pub struct Frame {
    pub kind: FrameKind,
    /// The correlation token pairing a request with its reply.
    pub token: u64,
    /// The request type tag, see [type_tag].
    pub tag: u64,
    pub payload: Bytes,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("token", &self.token)
            .field("tag", &self.tag)
            .field("len", &self.payload.len())
            .finish()
    }
}

impl Frame {
    pub fn request(token: u64, tag: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Request,
            token,
            tag,
            payload: payload.into(),
        }
    }

    pub fn response(token: u64, tag: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Response,
            token,
            tag,
            payload: payload.into(),
        }
    }

    /// Creates an error frame, if the status cannot be serialized the payload
    /// is left empty and the peer falls back to a generic status.
    pub fn error(token: u64, tag: u64, status: &Status) -> Self {
        let payload = match rkyv::to_bytes::<_, 2048>(status) {
            Ok(buffer) => Bytes::from(buffer.into_vec()),
            Err(error) => {
                warn!(error = ?error, "Failed to serialize error payload, returning default...");
                Bytes::new()
            },
        };

        Self {
            kind: FrameKind::Error,
            token,
            tag,
            payload,
        }
    }

    /// Reads the status out of an error frame.
    pub fn to_status(&self) -> Status {
        if self.payload.is_empty() {
            return Status::handler("The remote peer returned an empty error.");
        }

        let mut aligned = AlignedVec::with_capacity(self.payload.len());
        aligned.extend_from_slice(&self.payload);
        rkyv::from_bytes::<Status>(&aligned).unwrap_or_else(|_| Status::invalid())
    }

    /// Serializes the frame header and payload into a single buffer.
    pub fn encode(&self) -> Vec<u8> {
        let header = serialize_header(
            self.kind,
            self.token,
            self.tag,
            &self.payload,
        );

        let mut buffer = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buffer.extend_from_slice(&header);
        buffer.extend_from_slice(&self.payload);
        buffer
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub kind: FrameKind,
    pub token: u64,
    pub tag: u64,
    pub len: usize,
    pub checksum: u32,
}

/// Parses a frame header.
pub(crate) fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<FrameHeader, FrameError> {
    if &header[LEN_SIZE..] != HEADER_TERMINATOR {
        return Err(FrameError::Malformed("missing header terminator"));
    }

    let kind = FrameKind::from_byte(header[0])
        .ok_or(FrameError::Malformed("unknown frame kind"))?;
    let token = read_u64(&header[TOKEN_OFFSET..TAG_OFFSET]);
    let tag = read_u64(&header[TAG_OFFSET..LEN_OFFSET]);
    let len = read_u32(&header[LEN_OFFSET..CHECKSUM_OFFSET]) as usize;
    let checksum = read_u32(&header[CHECKSUM_OFFSET..LEN_SIZE]);

    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge { len });
    }

    Ok(FrameHeader {
        kind,
        token,
        tag,
        len,
        checksum,
    })
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(buf);
    u64::from_le_bytes(bytes)
}

fn read_u32(buf: &[u8]) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(buf);
    u32::from_le_bytes(bytes)
}

fn serialize_header(
    kind: FrameKind,
    token: u64,
    tag: u64,
    payload: &[u8],
) -> [u8; HEADER_SIZE] {
    let mut header = [0; HEADER_SIZE];
    header[0] = kind as u8;
    header[TOKEN_OFFSET..TAG_OFFSET].copy_from_slice(&token.to_le_bytes());
    header[TAG_OFFSET..LEN_OFFSET].copy_from_slice(&tag.to_le_bytes());
    header[LEN_OFFSET..CHECKSUM_OFFSET]
        .copy_from_slice(&(payload.len() as u32).to_le_bytes());
    header[CHECKSUM_OFFSET..LEN_SIZE]
        .copy_from_slice(&crc32fast::hash(payload).to_le_bytes());
    header[LEN_SIZE..].copy_from_slice(HEADER_TERMINATOR);
    header
}

/// Reads the next frame from the stream.
///
/// Returns `Ok(None)` when the stream closes cleanly on a frame boundary.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }

            return Err(FrameError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "Connection closed part way through a frame header.",
            )));
        }
        filled += n;
    }

    let header = parse_header(&header)?;

    let mut payload = vec![0; header.len];
    reader.read_exact(&mut payload).await?;

    if crc32fast::hash(&payload) != header.checksum {
        return Err(FrameError::Checksum {
            kind: header.kind,
            token: header.token,
            tag: header.tag,
        });
    }

    Ok(Some(Frame {
        kind: header.kind,
        token: header.token,
        tag: header.tag,
        payload: Bytes::from(payload),
    }))
}
