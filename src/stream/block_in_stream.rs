//! Positional input stream over one block.

use super::packet_reader::{PacketReader, PacketReaderFactory};
use super::StreamError;
use crate::config::BlockId;
use bytes::{Buf, Bytes};

/// Byte-addressable, seekable read access to one block.
///
/// The packet reader underneath is created lazily for `[pos, length)` on the
/// first read and torn down by `seek`/`skip`, so repositioning issues a
/// fresh request instead of discarding bytes one packet at a time.
///
/// Reaching end of stream closes the stream; reading a closed stream is a
/// programmer error and fails with [`StreamError::Closed`].
pub struct BlockInStream {
    block_id: BlockId,
    length: u64,
    pos: u64,
    current: Option<Bytes>,
    reader: Option<Box<dyn PacketReader>>,
    factory: Box<dyn PacketReaderFactory>,
    closed: bool,
    eof: bool,
    touched: bool,
}

impl BlockInStream {
    /// Create a stream over a block of `length` bytes.
    pub fn new(block_id: BlockId, length: u64, factory: Box<dyn PacketReaderFactory>) -> Self {
        Self {
            block_id,
            length,
            pos: 0,
            current: None,
            reader: None,
            factory,
            closed: false,
            eof: false,
            touched: false,
        }
    }

    /// Read one byte, or `None` at end of stream.
    pub async fn read_byte(&mut self) -> Result<Option<u8>, StreamError> {
        self.check_open()?;
        self.ensure_packet().await?;
        if self.eof {
            self.close().await;
            return Ok(None);
        }
        match self.current.as_mut() {
            Some(packet) if !packet.is_empty() => {
                let byte = packet[0];
                packet.advance(1);
                self.pos += 1;
                self.touched = true;
                Ok(Some(byte))
            }
            // ensure_packet leaves either a non-empty packet or eof set.
            _ => {
                self.eof = true;
                self.close().await;
                Ok(None)
            }
        }
    }

    /// Read into `buf`, returning the number of bytes copied.
    ///
    /// Returns 0 for an empty `buf` or at end of stream. At most the current
    /// packet's remaining bytes are copied; a single call never waits for a
    /// second packet.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.check_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        self.ensure_packet().await?;
        if self.eof {
            self.close().await;
            return Ok(0);
        }
        match self.current.as_mut() {
            Some(packet) if !packet.is_empty() => {
                let n = buf.len().min(packet.len());
                buf[..n].copy_from_slice(&packet[..n]);
                packet.advance(n);
                self.pos += n as u64;
                self.touched = true;
                Ok(n)
            }
            _ => {
                self.eof = true;
                self.close().await;
                Ok(0)
            }
        }
    }

    /// Reposition the stream to `pos`.
    ///
    /// A no-op when already there; otherwise tears down the current packet
    /// reader (cancelling its in-flight request) so the next read starts a
    /// fresh one at the new offset. Seeking to the end of the block is
    /// accepted; the next read reports end of stream.
    pub async fn seek(&mut self, pos: u64) -> Result<(), StreamError> {
        self.check_open()?;
        if pos > self.length {
            return Err(StreamError::InvalidSeek {
                pos,
                length: self.length,
            });
        }
        if pos == self.pos {
            return Ok(());
        }
        if pos < self.pos {
            self.eof = false;
        }
        self.close_packet_reader().await;
        self.pos = pos;
        Ok(())
    }

    /// Skip forward up to `n` bytes, returning how many were skipped.
    pub async fn skip(&mut self, n: u64) -> Result<u64, StreamError> {
        self.check_open()?;
        if n == 0 {
            return Ok(0);
        }
        let to_skip = self.remaining().min(n);
        self.pos += to_skip;
        self.close_packet_reader().await;
        Ok(to_skip)
    }

    /// Bytes left before end of stream.
    pub fn remaining(&self) -> u64 {
        if self.eof {
            0
        } else {
            self.length - self.pos
        }
    }

    /// Current position relative to the start of the block.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Length of the block in bytes.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether the block is zero-length.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The block this stream reads.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Whether at least one byte was delivered through this stream.
    ///
    /// The layer above uses this to decide whether the block counts as
    /// accessed; zero-length reads never set it.
    pub fn was_read(&self) -> bool {
        self.touched
    }

    /// Whether the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the stream, releasing the current packet and reader. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.close_packet_reader().await;
    }

    /// Make sure a current packet exists, or mark end of stream.
    async fn ensure_packet(&mut self) -> Result<(), StreamError> {
        if self.eof {
            return Ok(());
        }
        if self.reader.is_none() {
            let reader = self.factory.create(self.pos, self.length - self.pos).await?;
            self.reader = Some(reader);
        }
        if matches!(&self.current, Some(packet) if packet.is_empty()) {
            self.current = None;
        }
        if self.current.is_none() {
            let packet = match self.reader.as_mut() {
                Some(reader) => match reader.read_packet().await {
                    Ok(packet) => packet,
                    // A server-side cancel reads as end of stream here.
                    Err(StreamError::Cancelled) => None,
                    Err(e) => {
                        self.close().await;
                        return Err(e);
                    }
                },
                None => None,
            };
            match packet {
                Some(p) if !p.is_empty() => self.current = Some(p),
                _ => self.eof = true,
            }
        }
        Ok(())
    }

    async fn close_packet_reader(&mut self) {
        self.current = None;
        if let Some(mut reader) = self.reader.take() {
            reader.close().await;
        }
    }

    fn check_open(&self) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Packet source yielding an increasing-bytes block in fixed-size
    /// packets, tracking how many readers were created and closed.
    struct CountingFactory {
        block: Vec<u8>,
        packet_size: usize,
        created: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    struct ScriptedReader {
        packets: Vec<Bytes>,
        index: usize,
        pos: u64,
        closed_flag: Arc<AtomicUsize>,
        closed: bool,
    }

    #[async_trait]
    impl PacketReader for ScriptedReader {
        async fn read_packet(&mut self) -> Result<Option<Bytes>, StreamError> {
            if self.index >= self.packets.len() {
                return Ok(None);
            }
            let packet = self.packets[self.index].clone();
            self.index += 1;
            self.pos += packet.len() as u64;
            Ok(Some(packet))
        }

        fn pos(&self) -> u64 {
            self.pos
        }

        async fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.closed_flag.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl PacketReaderFactory for CountingFactory {
        async fn create(
            &self,
            offset: u64,
            len: u64,
        ) -> Result<Box<dyn PacketReader>, StreamError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let end = (offset + len).min(self.block.len() as u64) as usize;
            let region = &self.block[offset as usize..end];
            let packets = region
                .chunks(self.packet_size)
                .map(Bytes::copy_from_slice)
                .collect();
            Ok(Box::new(ScriptedReader {
                packets,
                index: 0,
                pos: offset,
                closed_flag: self.closed.clone(),
                closed: false,
            }))
        }
    }

    fn increasing(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    fn stream_over(len: usize, packet_size: usize) -> (BlockInStream, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let factory = CountingFactory {
            block: increasing(len),
            packet_size,
            created: created.clone(),
            closed: closed.clone(),
        };
        (
            BlockInStream::new(1, len as u64, Box::new(factory)),
            created,
            closed,
        )
    }

    #[tokio::test]
    async fn test_sequential_byte_reads() {
        let (mut stream, _, _) = stream_over(10, 4);
        for i in 0..10u8 {
            assert_eq!(stream.read_byte().await.unwrap(), Some(i));
        }
        assert_eq!(stream.read_byte().await.unwrap(), None);
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_zero_length_block_is_immediately_eof() {
        let (mut stream, _, _) = stream_over(0, 4);
        assert_eq!(stream.read_byte().await.unwrap(), None);
        assert!(stream.is_closed());
        assert!(!stream.was_read());
    }

    #[tokio::test]
    async fn test_slice_read_stops_at_packet_boundary() {
        let (mut stream, _, _) = stream_over(10, 4);
        let mut buf = [0u8; 10];
        // First packet holds 4 bytes; one call never crosses into the next.
        assert_eq!(stream.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], &[0, 1, 2, 3]);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], &[4, 5, 6, 7]);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], &[8, 9]);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_buffer_read_has_no_side_effects() {
        let (mut stream, created, _) = stream_over(10, 4);
        let mut buf = [];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(created.load(Ordering::SeqCst), 0, "no reader constructed");
        assert!(!stream.was_read());
    }

    #[tokio::test]
    async fn test_seek_tears_down_reader_and_reads_fresh() {
        let (mut stream, created, closed) = stream_over(100, 7);

        assert_eq!(stream.read_byte().await.unwrap(), Some(0));
        stream.seek(33).await.unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(stream.read_byte().await.unwrap(), Some(33));
        stream.seek(49).await.unwrap();
        assert_eq!(stream.read_byte().await.unwrap(), Some(49));
        stream.seek(24).await.unwrap();
        assert_eq!(stream.read_byte().await.unwrap(), Some(24));
        assert_eq!(created.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_seek_to_current_position_is_noop() {
        let (mut stream, created, _) = stream_over(10, 4);
        assert_eq!(stream.read_byte().await.unwrap(), Some(0));
        stream.seek(1).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1, "reader kept");
        assert_eq!(stream.read_byte().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_seek_past_length_is_rejected() {
        let (mut stream, _, _) = stream_over(10, 4);
        assert_eq!(
            stream.seek(11).await.unwrap_err(),
            StreamError::InvalidSeek { pos: 11, length: 10 }
        );
    }

    #[tokio::test]
    async fn test_seek_to_end_reads_eof() {
        let (mut stream, _, _) = stream_over(10, 4);
        stream.seek(10).await.unwrap();
        assert_eq!(stream.read_byte().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_skip_advances_and_caps_at_remaining() {
        let (mut stream, _, _) = stream_over(66, 10);
        assert_eq!(stream.skip(33).await.unwrap(), 33);
        assert_eq!(stream.read_byte().await.unwrap(), Some(33));
        // The read above advanced to 34, so this skip lands on byte 56.
        assert_eq!(stream.skip(22).await.unwrap(), 22);
        assert_eq!(stream.read_byte().await.unwrap(), Some(56));
        assert_eq!(stream.skip(1000).await.unwrap(), 9);
        assert_eq!(stream.read_byte().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_skip_zero_returns_zero() {
        let (mut stream, created, _) = stream_over(10, 4);
        assert_eq!(stream.skip(0).await.unwrap(), 0);
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_seek_equals_skip_from_start() {
        let (mut a, _, _) = stream_over(99, 7);
        a.seek(42).await.unwrap();
        let expected = a.read_byte().await.unwrap();

        let (mut b, _, _) = stream_over(99, 7);
        assert_eq!(b.skip(42).await.unwrap(), 42);
        assert_eq!(b.read_byte().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_remaining_tracks_position_and_eof() {
        let (mut stream, _, _) = stream_over(10, 4);
        assert_eq!(stream.remaining(), 10);
        stream.read_byte().await.unwrap();
        assert_eq!(stream.remaining(), 9);
        stream.skip(9).await.unwrap();
        assert_eq!(stream.remaining(), 0);
    }

    #[tokio::test]
    async fn test_touched_only_after_first_delivered_byte() {
        let (mut stream, _, _) = stream_over(10, 4);
        assert!(!stream.was_read());
        stream.seek(5).await.unwrap();
        assert!(!stream.was_read());
        stream.read_byte().await.unwrap();
        assert!(stream.was_read());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_read_after_close_fails() {
        let (mut stream, _, closed) = stream_over(10, 4);
        stream.read_byte().await.unwrap();
        stream.close().await;
        stream.close().await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(stream.read_byte().await.unwrap_err(), StreamError::Closed);
        assert_eq!(stream.seek(0).await.unwrap_err(), StreamError::Closed);
    }

    #[tokio::test]
    async fn test_read_error_closes_stream_before_propagating() {
        struct FailingFactory;
        struct FailingReader;

        #[async_trait]
        impl PacketReader for FailingReader {
            async fn read_packet(&mut self) -> Result<Option<Bytes>, StreamError> {
                Err(StreamError::Server("boom".into()))
            }
            fn pos(&self) -> u64 {
                0
            }
            async fn close(&mut self) {}
        }

        #[async_trait]
        impl PacketReaderFactory for FailingFactory {
            async fn create(
                &self,
                _offset: u64,
                _len: u64,
            ) -> Result<Box<dyn PacketReader>, StreamError> {
                Ok(Box::new(FailingReader))
            }
        }

        let mut stream = BlockInStream::new(1, 10, Box::new(FailingFactory));
        assert_eq!(
            stream.read_byte().await.unwrap_err(),
            StreamError::Server("boom".into())
        );
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_cancelled_converts_to_eof() {
        struct CancelledFactory {
            cancel_hit: Arc<AtomicBool>,
        }
        struct CancelledReader {
            cancel_hit: Arc<AtomicBool>,
        }

        #[async_trait]
        impl PacketReader for CancelledReader {
            async fn read_packet(&mut self) -> Result<Option<Bytes>, StreamError> {
                self.cancel_hit.store(true, Ordering::SeqCst);
                Err(StreamError::Cancelled)
            }
            fn pos(&self) -> u64 {
                0
            }
            async fn close(&mut self) {}
        }

        #[async_trait]
        impl PacketReaderFactory for CancelledFactory {
            async fn create(
                &self,
                _offset: u64,
                _len: u64,
            ) -> Result<Box<dyn PacketReader>, StreamError> {
                Ok(Box::new(CancelledReader {
                    cancel_hit: self.cancel_hit.clone(),
                }))
            }
        }

        let cancel_hit = Arc::new(AtomicBool::new(false));
        let mut stream = BlockInStream::new(
            1,
            10,
            Box::new(CancelledFactory {
                cancel_hit: cancel_hit.clone(),
            }),
        );
        assert_eq!(stream.read_byte().await.unwrap(), None);
        assert!(cancel_hit.load(Ordering::SeqCst));
        assert!(stream.is_closed());
    }
}
