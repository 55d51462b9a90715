//! Sequential stream over a multi-block file.

use super::block_in_stream::BlockInStream;
use super::StreamError;
use async_trait::async_trait;

/// Opens the per-block streams of one file.
///
/// The filesystem namespace itself lives elsewhere; whoever knows the file's
/// block list implements this and hands it to [`FileInStream`].
#[async_trait]
pub trait BlockInStreamProvider: Send + Sync {
    /// Number of blocks in the file.
    fn block_count(&self) -> usize;

    /// Open the stream for block `index`.
    async fn open_block(&self, index: usize) -> Result<BlockInStream, StreamError>;
}

/// Reads a file's blocks back to back.
///
/// Block streams open lazily and close as each block is exhausted. Only
/// forward sequential access; per-block seeking stays on [`BlockInStream`].
pub struct FileInStream {
    provider: Box<dyn BlockInStreamProvider>,
    current: Option<BlockInStream>,
    index: usize,
    closed: bool,
}

impl FileInStream {
    /// Create a stream over the blocks served by `provider`.
    pub fn new(provider: Box<dyn BlockInStreamProvider>) -> Self {
        Self {
            provider,
            current: None,
            index: 0,
            closed: false,
        }
    }

    /// Read one byte, or `None` at end of file.
    pub async fn read_byte(&mut self) -> Result<Option<u8>, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        loop {
            if self.current.is_none() {
                if self.index >= self.provider.block_count() {
                    return Ok(None);
                }
                self.current = Some(self.provider.open_block(self.index).await?);
            }
            if let Some(stream) = self.current.as_mut() {
                match stream.read_byte().await? {
                    Some(byte) => return Ok(Some(byte)),
                    None => {
                        // Exhausted block streams close themselves.
                        self.current = None;
                        self.index += 1;
                    }
                }
            }
        }
    }

    /// Read into `buf`, returning 0 at end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.current.is_none() {
                if self.index >= self.provider.block_count() {
                    return Ok(0);
                }
                self.current = Some(self.provider.open_block(self.index).await?);
            }
            if let Some(stream) = self.current.as_mut() {
                let n = stream.read(buf).await?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
                self.index += 1;
            }
        }
    }

    /// Close the stream and the current block stream. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut stream) = self.current.take() {
            stream.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::packet_reader::{PacketReader, PacketReaderFactory};
    use bytes::Bytes;

    struct VecFactory {
        data: Vec<u8>,
    }

    struct VecReader {
        data: Vec<u8>,
        offset: u64,
        sent: bool,
    }

    #[async_trait]
    impl PacketReader for VecReader {
        async fn read_packet(&mut self) -> Result<Option<Bytes>, StreamError> {
            if self.sent {
                return Ok(None);
            }
            self.sent = true;
            if self.data.is_empty() {
                return Ok(None);
            }
            Ok(Some(Bytes::from(self.data.clone())))
        }

        fn pos(&self) -> u64 {
            self.offset
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl PacketReaderFactory for VecFactory {
        async fn create(
            &self,
            offset: u64,
            len: u64,
        ) -> Result<Box<dyn PacketReader>, StreamError> {
            let end = (offset + len).min(self.data.len() as u64) as usize;
            Ok(Box::new(VecReader {
                data: self.data[offset as usize..end].to_vec(),
                offset,
                sent: false,
            }))
        }
    }

    /// Ten blocks of ten bytes, byte value `10 * i + j`.
    struct TenBlocks;

    #[async_trait]
    impl BlockInStreamProvider for TenBlocks {
        fn block_count(&self) -> usize {
            10
        }

        async fn open_block(&self, index: usize) -> Result<BlockInStream, StreamError> {
            let data: Vec<u8> = (0..10).map(|j| (10 * index + j) as u8).collect();
            Ok(BlockInStream::new(
                index as u64,
                10,
                Box::new(VecFactory { data }),
            ))
        }
    }

    #[tokio::test]
    async fn test_reads_across_block_boundaries() {
        let mut stream = FileInStream::new(Box::new(TenBlocks));
        for n in 0..100u8 {
            assert_eq!(stream.read_byte().await.unwrap(), Some(n));
        }
        assert_eq!(stream.read_byte().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_slice_reads_cover_whole_file() {
        let mut stream = FileInStream::new(Box::new(TenBlocks));
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        let expected: Vec<u8> = (0..100u8).collect();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_empty_file_is_immediate_eof() {
        struct NoBlocks;
        #[async_trait]
        impl BlockInStreamProvider for NoBlocks {
            fn block_count(&self) -> usize {
                0
            }
            async fn open_block(&self, _index: usize) -> Result<BlockInStream, StreamError> {
                unreachable!("no blocks to open")
            }
        }

        let mut stream = FileInStream::new(Box::new(NoBlocks));
        assert_eq!(stream.read_byte().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut stream = FileInStream::new(Box::new(TenBlocks));
        stream.read_byte().await.unwrap();
        stream.close().await;
        stream.close().await;
        assert!(stream.read_byte().await.is_err());
    }
}
