//! Client-side block streaming.
//!
//! A [`BlockInStream`] gives byte-addressable, seekable access to one block.
//! Underneath it, a [`PacketReader`] pulls bounded packets from a data-server
//! channel with flow control and cancellation. [`FileInStream`] chains the
//! block streams of a multi-block file for sequential reads.

mod block_in_stream;
mod file_in_stream;
mod packet_reader;

pub use block_in_stream::BlockInStream;
pub use file_in_stream::{BlockInStreamProvider, FileInStream};
pub use packet_reader::{PacketReader, PacketReaderFactory, RemotePacketReaderFactory};

use crate::transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the streaming path.
///
/// Clonable because the packet reader stores the first error it observes and
/// rethrows it on every subsequent read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Operation on a stream that was already closed. Programmer error.
    #[error("stream already closed")]
    Closed,

    /// The server cancelled the read.
    #[error("read cancelled by data server")]
    Cancelled,

    /// The channel dropped while the stream was in flight.
    #[error("connection reset by data server")]
    ConnectionReset,

    /// The server answered with an error status.
    #[error("data server error: {0}")]
    Server(String),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Seek target outside the block.
    #[error("seek position {pos} out of range for block of length {length}")]
    InvalidSeek { pos: u64, length: u64 },
}

impl From<TransportError> for StreamError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionReset => StreamError::ConnectionReset,
            other => StreamError::Transport(other.to_string()),
        }
    }
}
