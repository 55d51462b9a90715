//! Packet reader over a data-server channel.
//!
//! Protocol, from the reader's side:
//!
//! 1. Send a read request for `[offset, offset + length)` of a block.
//! 2. The server streams packets; an empty payload marks end of stream.
//! 3. Packets buffer in a bounded queue. At the high water mark the reader
//!    pauses the channel (autoread off); consuming back down to the low
//!    water mark resumes it.
//! 4. Closing an unexhausted reader sends a cancel request and drains the
//!    remaining packets so the channel can go back to the pool healthy. The
//!    server may ignore the cancel if the full response is already under
//!    way.
//! 5. Any channel error closes the channel.

use super::StreamError;
use crate::config::{BlockId, StreamSettings, UNTRACKED_ID};
use crate::protocol::{Frame, ReadRequest, ReadResponse, Status};
use crate::transport::{ChannelPool, InboundHandler, PacketChannel, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Pull interface over one streamed block region.
#[async_trait]
pub trait PacketReader: Send {
    /// Next packet, or `None` once the stream is exhausted.
    async fn read_packet(&mut self) -> Result<Option<Bytes>, StreamError>;

    /// Offset of the next byte this reader will deliver.
    fn pos(&self) -> u64;

    /// Stop reading, cancelling the in-flight request if the stream was not
    /// exhausted. Idempotent.
    async fn close(&mut self);
}

/// Creates packet readers for block regions.
///
/// The seam between the positional stream and the transport: production code
/// wires a [`RemotePacketReaderFactory`]; tests substitute scripted packet
/// sources.
#[async_trait]
pub trait PacketReaderFactory: Send + Sync {
    /// Open a reader covering `[offset, offset + len)`.
    async fn create(&self, offset: u64, len: u64) -> Result<Box<dyn PacketReader>, StreamError>;
}

/// Event handed from the channel pump to the consumer.
enum QueueEvent {
    Data(Bytes),
    Eof,
}

struct QueueInner {
    events: VecDeque<QueueEvent>,
    error: Option<StreamError>,
    paused: bool,
    closed: bool,
}

/// Bounded hand-off between the channel's pump task and the reader.
struct PacketQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    high_water: usize,
    low_water: usize,
    channel: Mutex<Option<Weak<dyn PacketChannel>>>,
}

impl PacketQueue {
    fn new(high_water: usize, low_water: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                events: VecDeque::new(),
                error: None,
                paused: false,
                closed: false,
            }),
            notify: Notify::new(),
            high_water,
            low_water,
            channel: Mutex::new(None),
        })
    }

    fn bind_channel(&self, channel: Weak<dyn PacketChannel>) {
        *self.channel.lock().unwrap() = Some(channel);
    }

    fn with_channel(&self, f: impl FnOnce(&dyn PacketChannel)) {
        let channel = self.channel.lock().unwrap().clone();
        if let Some(channel) = channel.and_then(|weak| weak.upgrade()) {
            f(channel.as_ref());
        }
    }

    fn record_error(&self, error: StreamError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.error.is_none() {
            inner.error = Some(error);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Stop accepting ingress; buffered packets are released.
    fn mark_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.events.clear();
        drop(inner);
        self.notify.notify_one();
    }

    /// Await the next event, delivering buffered packets before any recorded
    /// error.
    async fn next(&self) -> Result<Option<Bytes>, StreamError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(event) = inner.events.pop_front() {
                    let resume = inner.paused && inner.events.len() <= self.low_water;
                    if resume {
                        inner.paused = false;
                    }
                    drop(inner);
                    if resume {
                        self.with_channel(|c| c.set_autoread(true));
                    }
                    return match event {
                        QueueEvent::Data(bytes) => Ok(Some(bytes)),
                        QueueEvent::Eof => Ok(None),
                    };
                }
                if let Some(error) = &inner.error {
                    return Err(error.clone());
                }
            }
            notified.await;
        }
    }
}

impl InboundHandler for PacketQueue {
    fn on_response(&self, response: ReadResponse) {
        match response.status {
            Status::Success => {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    return;
                }
                if response.payload.is_empty() {
                    inner.events.push_back(QueueEvent::Eof);
                } else {
                    inner.events.push_back(QueueEvent::Data(response.payload));
                }
                let pause = !inner.paused && inner.events.len() >= self.high_water;
                if pause {
                    inner.paused = true;
                }
                drop(inner);
                if pause {
                    self.with_channel(|c| c.set_autoread(false));
                }
                self.notify.notify_one();
            }
            Status::Cancelled => {
                self.record_error(StreamError::Cancelled);
            }
            Status::Error(message) => {
                self.record_error(StreamError::Server(message));
                self.with_channel(|c| c.close());
            }
        }
    }

    fn on_failure(&self, error: TransportError) {
        self.record_error(error.into());
        self.with_channel(|c| c.close());
    }

    fn on_closed(&self) {
        self.record_error(StreamError::ConnectionReset);
    }
}

/// Transport-backed packet reader.
pub struct RemotePacketReader {
    pool: Arc<dyn ChannelPool>,
    channel: Option<Arc<dyn PacketChannel>>,
    queue: Arc<PacketQueue>,
    block_id: BlockId,
    pos: u64,
    done: bool,
    closed: bool,
}

impl RemotePacketReader {
    async fn connect(
        pool: Arc<dyn ChannelPool>,
        request: ReadRequest,
        settings: &StreamSettings,
    ) -> Result<Self, StreamError> {
        let channel = pool.acquire().await?;
        let queue = PacketQueue::new(settings.packet_high_water, settings.packet_low_water);
        queue.bind_channel(Arc::downgrade(&channel));
        channel.attach(queue.clone());

        let block_id = request.block_id;
        let offset = request.offset.max(0) as u64;
        if let Err(e) = channel.send(Frame::Read(request)).await {
            channel.detach();
            channel.close();
            return Err(e.into());
        }

        Ok(Self {
            pool,
            channel: Some(channel),
            queue,
            block_id,
            pos: offset,
            done: false,
            closed: false,
        })
    }
}

#[async_trait]
impl PacketReader for RemotePacketReader {
    async fn read_packet(&mut self) -> Result<Option<Bytes>, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        if self.done {
            return Ok(None);
        }
        match self.queue.next().await {
            Ok(Some(packet)) => {
                self.pos += packet.len() as u64;
                Ok(Some(packet))
            }
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let Some(channel) = self.channel.take() else {
            return;
        };

        if !self.done && channel.is_open() {
            // Resume first: draining with autoread off would never finish.
            channel.set_autoread(true);
            match channel.send(Frame::Cancel { block_id: self.block_id }).await {
                Ok(()) => loop {
                    match self.queue.next().await {
                        Ok(Some(_)) => continue,
                        Ok(None) | Err(StreamError::Cancelled) => break,
                        Err(e) => {
                            warn!(block_id = self.block_id, error = %e,
                                "failed to drain packet reader, closing channel");
                            channel.close();
                            break;
                        }
                    }
                },
                Err(e) => {
                    debug!(block_id = self.block_id, error = %e,
                        "failed to send cancel, closing channel");
                    channel.close();
                }
            }
        }

        self.queue.mark_closed();
        channel.detach();
        self.pool.release(channel);
    }
}

/// Factory wiring [`RemotePacketReader`]s to a channel pool.
pub struct RemotePacketReaderFactory {
    pool: Arc<dyn ChannelPool>,
    block_id: BlockId,
    lock_id: i64,
    session_id: i64,
    settings: StreamSettings,
}

impl RemotePacketReaderFactory {
    /// Factory for a tracked block read bound to a session.
    pub fn for_block(
        pool: Arc<dyn ChannelPool>,
        block_id: BlockId,
        lock_id: i64,
        session_id: u64,
        settings: StreamSettings,
    ) -> Self {
        Self {
            pool,
            block_id,
            lock_id,
            session_id: session_id as i64,
            settings,
        }
    }

    /// Factory for a generic file read (untracked sentinels on the wire).
    pub fn for_file(pool: Arc<dyn ChannelPool>, file_id: u64, settings: StreamSettings) -> Self {
        Self {
            pool,
            block_id: file_id,
            lock_id: UNTRACKED_ID,
            session_id: UNTRACKED_ID,
            settings,
        }
    }
}

#[async_trait]
impl PacketReaderFactory for RemotePacketReaderFactory {
    async fn create(&self, offset: u64, len: u64) -> Result<Box<dyn PacketReader>, StreamError> {
        let request = ReadRequest {
            block_id: self.block_id,
            offset: offset as i64,
            length: len as i64,
            lock_id: self.lock_id,
            session_id: self.session_id,
        };
        let reader = RemotePacketReader::connect(self.pool.clone(), request, &self.settings).await?;
        Ok(Box::new(reader))
    }
}
