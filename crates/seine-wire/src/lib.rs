//! Binary wire protocol for the Seine search platform.
//!
//! Every connection to a search server carries framed messages: a 16-byte
//! big-endian header (`sequence`, `status`, `command`, `length`) followed by
//! `length` payload bytes. Payloads are built from four XDR-style primitives
//! (i32, i64, f64, and length-prefixed opaque data padded to a 4-byte
//! boundary); [`message`] composes them into the structured records exchanged
//! with servers.
//!
//! The protocol revision is fixed: there is no version negotiation, so the
//! numeric command and status tables in [`proto`] are the single source of
//! truth for both sides.

mod codec;
mod frame;

pub mod message;
pub mod proto;

use thiserror::Error;

pub use codec::{WireReader, WireWriter, MAX_OPAQUE};
pub use frame::{read_frame, write_frame, Frame, FrameHeader, HEADER_LEN, MAX_PAYLOAD};
pub use proto::Status;

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The peer sent bytes that cannot be a valid message: a buffer underflow,
    /// a count field above its documented maximum, or invalid UTF-8 where a
    /// string was expected. Always fatal to the connection that produced it.
    #[error("malformed message: {0}")]
    Malformed(String),
}
