//! Block reader streaming from the UFS, optionally teeing into the local
//! store for promotion.

use super::meta::UfsBlockMeta;
use crate::store::{BlockStore, TempBlockWriter};
use crate::ufs::{UfsInput, UnderFileSystem};
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Position marker meaning "unknown": a read was interrupted mid-flight, so
/// the next read must re-seek instead of trusting the cursor.
const POS_UNKNOWN: u64 = u64::MAX;

/// Streams one block's bytes out of the UFS.
///
/// Reads are positional; the reader re-seeks its UFS input whenever the
/// requested offset moved, which is what lets a client seek or skip and keep
/// using the same worker-side reader.
///
/// When created at offset 0 without `no_cache`, every delivered byte is also
/// appended to a temp block in the local store. Once the temp copy covers
/// the whole block, `commit_pending` flips on the shared meta; the registry
/// observes it during cleanup and the block is committed afterwards. Any
/// cache-write failure abandons the promotion; the UFS read continues
/// unaffected.
pub struct UfsBlockReader {
    meta: Arc<UfsBlockMeta>,
    inner: Mutex<ReaderInner>,
    closed: AtomicBool,
}

struct ReaderInner {
    input: Option<Box<dyn UfsInput>>,
    /// Block-relative position of the UFS input, or [`POS_UNKNOWN`].
    input_pos: u64,
    temp: Option<TempTee>,
}

struct TempTee {
    writer: Box<dyn TempBlockWriter>,
    /// Bytes of the block the temp copy already holds.
    pos: u64,
}

impl UfsBlockReader {
    /// Open a reader over `meta` positioned at block-relative `offset`.
    ///
    /// Promotion starts only for a read that begins at offset 0 with caching
    /// allowed. A failed temp allocation degrades to pass-through.
    pub async fn create(
        meta: Arc<UfsBlockMeta>,
        offset: u64,
        no_cache: bool,
        ufs: Arc<dyn UnderFileSystem>,
        store: Arc<dyn BlockStore>,
    ) -> io::Result<Arc<Self>> {
        let mut input = ufs.open(meta.ufs_path()).await?;
        input.seek(meta.offset_in_ufs() + offset).await?;

        let temp = if !no_cache && offset == 0 {
            match store
                .allocate_temp_block(meta.session_id(), meta.block_id(), meta.length())
                .await
            {
                Ok(writer) => Some(TempTee { writer, pos: 0 }),
                Err(e) => {
                    warn!(
                        block_id = meta.block_id(),
                        session_id = meta.session_id(),
                        error = %e,
                        "temp block allocation failed, reading without promotion"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Arc::new(Self {
            meta,
            inner: Mutex::new(ReaderInner {
                input: Some(input),
                input_pos: offset,
                temp,
            }),
            closed: AtomicBool::new(false),
        }))
    }

    /// Read up to `max_len` bytes at block-relative `offset`.
    ///
    /// Returns an empty buffer at or past the end of the block.
    pub async fn read_chunk(&self, offset: u64, max_len: usize) -> io::Result<Bytes> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "UFS block reader closed",
            ));
        }
        let mut inner = self.inner.lock().await;
        let length = self.meta.length();
        if offset >= length {
            return Ok(Bytes::new());
        }
        let len = max_len.min((length - offset) as usize);

        let seek_needed = offset != inner.input_pos;
        // Cursor is unknown until the read completes; a dropped read future
        // must not leave a stale position behind.
        inner.input_pos = POS_UNKNOWN;
        let input = inner.input.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "UFS block reader closed")
        })?;
        if seek_needed {
            input.seek(self.meta.offset_in_ufs() + offset).await?;
        }

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = input.read(&mut buf[filled..]).await?;
            if n == 0 {
                // Backing file is shorter than the block metadata claims.
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        inner.input_pos = offset + filled as u64;

        self.tee(&mut inner, offset, &buf).await;
        Ok(Bytes::from(buf))
    }

    /// Read at `offset` into `buf`, returning the byte count.
    pub async fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let chunk = self.read_chunk(offset, buf.len()).await?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    /// The meta this reader serves.
    pub fn meta(&self) -> &Arc<UfsBlockMeta> {
        &self.meta
    }

    /// Whether the reader was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the UFS input and the temp writer, without committing.
    /// Idempotent.
    pub async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        inner.input = None;
        if let Some(mut tee) = inner.temp.take() {
            if let Err(e) = tee.writer.close().await {
                warn!(
                    block_id = self.meta.block_id(),
                    error = %e,
                    "failed to close temp block writer"
                );
            }
        }
        Ok(())
    }

    /// Feed freshly read bytes to the temp writer.
    ///
    /// The promotion copy must stay gapless: a chunk starting beyond the
    /// writer's position abandons promotion, overlap with already written
    /// bytes is skipped.
    async fn tee(&self, inner: &mut ReaderInner, offset: u64, data: &[u8]) {
        let Some(tee) = inner.temp.as_mut() else {
            return;
        };
        if offset > tee.pos {
            debug!(
                block_id = self.meta.block_id(),
                "non-sequential read, abandoning block promotion"
            );
            inner.temp = None;
            return;
        }
        let skip = (tee.pos - offset) as usize;
        if skip >= data.len() {
            return;
        }
        match tee.writer.append(&data[skip..]).await {
            Ok(()) => {
                tee.pos += (data.len() - skip) as u64;
                if tee.pos == self.meta.length() {
                    self.meta.set_commit_pending(true);
                    debug!(
                        block_id = self.meta.block_id(),
                        session_id = self.meta.session_id(),
                        "block fully materialised, commit pending"
                    );
                }
            }
            Err(e) => {
                warn!(
                    block_id = self.meta.block_id(),
                    error = %e,
                    "temp block write failed, abandoning block promotion"
                );
                inner.temp = None;
            }
        }
    }
}
