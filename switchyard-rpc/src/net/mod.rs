mod client;
mod frame;
mod server;
mod status;

pub use client::{ClientConnectError, ClientConnection};
pub use frame::{type_tag, Frame, FrameError, FrameKind, HEADER_SIZE, MAX_FRAME_SIZE};
pub(crate) use server::start_rpc_server;
pub use status::{ArchivedErrorCode, ArchivedStatus, ErrorCode, Status};
