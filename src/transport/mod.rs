//! Channel abstraction between the streaming client and the data server.
//!
//! The RPC transport itself is out of scope; this module defines the seam
//! the packet reader drives — a full-duplex channel with autoread toggling —
//! plus the pool channels are borrowed from and the server-side contract a
//! data server implements. [`loopback`] provides the in-process transport
//! used by tests and single-process deployments; frames cross it through the
//! real wire codec in both directions.

mod loopback;

pub use loopback::{LoopbackChannel, LoopbackTransport};

use crate::protocol::{Frame, ProtocolError, ReadResponse};
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised at the transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The channel is closed; writes and reads can no longer proceed.
    #[error("channel closed")]
    Closed,

    /// The peer hung up while a stream was in flight.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// A frame failed to encode or decode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Callbacks a packet reader registers on its channel.
///
/// Invoked from the channel's pump task. Implementations must be quick and
/// must not call back into the registry; they only touch their owning packet
/// queue.
pub trait InboundHandler: Send + Sync {
    /// One read response arrived.
    fn on_response(&self, response: ReadResponse);

    /// The channel failed; no further responses will arrive.
    fn on_failure(&self, error: TransportError);

    /// The channel closed spontaneously (peer hang-up without an error
    /// frame).
    fn on_closed(&self);
}

/// A full-duplex packet channel.
///
/// Each channel carries at most one active packet reader at a time. Any
/// error on the channel closes the channel.
#[async_trait]
pub trait PacketChannel: Send + Sync {
    /// Write one frame to the peer. A failed write closes the channel.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Toggle inbound draining. With autoread off the channel stops
    /// delivering frames and the peer's send window eventually fills.
    fn set_autoread(&self, enabled: bool);

    /// Register the handler inbound frames are delivered to.
    fn attach(&self, handler: Arc<dyn InboundHandler>);

    /// Remove the current handler; subsequent inbound frames are dropped.
    fn detach(&self);

    /// Close the channel. Idempotent.
    fn close(&self);

    /// Whether the channel can still be used.
    fn is_open(&self) -> bool;
}

/// Source of channels to the data server.
///
/// Dependency-injected wherever streams are opened so tests can supply an
/// in-memory transport; never a process-wide singleton.
#[async_trait]
pub trait ChannelPool: Send + Sync {
    /// Borrow an open channel, dialling a new one if none is idle.
    async fn acquire(&self) -> Result<Arc<dyn PacketChannel>, TransportError>;

    /// Return a channel to the pool. Closed channels are discarded.
    fn release(&self, channel: Arc<dyn PacketChannel>);
}

/// Server half of a connection: the data server's view of one channel.
#[async_trait]
pub trait FrameServer: Send + Sync {
    /// Serve one connection until the inbound side is exhausted.
    async fn serve(&self, inbound: FrameReceiver, outbound: FrameSender);
}

/// Decoded-frame receiver over a byte-chunk channel.
pub struct FrameReceiver {
    rx: mpsc::Receiver<bytes::Bytes>,
    buf: BytesMut,
}

impl FrameReceiver {
    pub(crate) fn new(rx: mpsc::Receiver<bytes::Bytes>) -> Self {
        Self {
            rx,
            buf: BytesMut::new(),
        }
    }

    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` once the peer has hung up cleanly; trailing bytes
    /// that do not form a whole frame surface as a connection reset.
    pub async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            match self.rx.recv().await {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None if self.buf.is_empty() => return Ok(None),
                None => return Err(TransportError::ConnectionReset),
            }
        }
    }
}

/// Encoding frame sender over a byte-chunk channel.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<bytes::Bytes>,
}

impl FrameSender {
    pub(crate) fn new(tx: mpsc::Sender<bytes::Bytes>) -> Self {
        Self { tx }
    }

    /// Encode and send one frame, waiting for window space.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        self.tx
            .send(buf.freeze())
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReadRequest;

    #[tokio::test]
    async fn test_frame_sender_receiver_round_trip() {
        let (tx, rx) = mpsc::channel(4);
        let sender = FrameSender::new(tx);
        let mut receiver = FrameReceiver::new(rx);

        let frame = Frame::Read(ReadRequest {
            block_id: 3,
            offset: 0,
            length: 10,
            lock_id: 1,
            session_id: 2,
        });
        sender.send(frame.clone()).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_receiver_reports_clean_hangup() {
        let (tx, rx) = mpsc::channel::<bytes::Bytes>(4);
        let mut receiver = FrameReceiver::new(rx);
        drop(tx);
        assert!(receiver.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receiver_reports_reset_on_trailing_bytes() {
        let (tx, rx) = mpsc::channel::<bytes::Bytes>(4);
        let mut receiver = FrameReceiver::new(rx);
        tx.send(bytes::Bytes::from_static(&[0, 0])).await.unwrap();
        drop(tx);
        assert!(matches!(
            receiver.recv().await,
            Err(TransportError::ConnectionReset)
        ));
    }
}
