//! Append-only block writer into the UFS.

use crate::ufs::{CreateOptions, UfsOutput, UnderFileSystem};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Writes one block's bytes into a UFS file, append-only.
///
/// Single-writer contract: one instance per block write, never shared by
/// concurrent appenders. The registry serialises access through its writer
/// slot; the internal lock only makes the handle safe to close from cleanup
/// while a misbehaving client still holds it.
pub struct UfsBlockWriter {
    ufs: Arc<dyn UnderFileSystem>,
    ufs_path: String,
    inner: Mutex<WriterInner>,
}

struct WriterInner {
    output: Option<Box<dyn UfsOutput>>,
    position: u64,
    closed: bool,
}

impl UfsBlockWriter {
    /// Create the backing file and open a writer over it.
    pub async fn create(
        ufs: Arc<dyn UnderFileSystem>,
        ufs_path: impl Into<String>,
        options: &CreateOptions,
    ) -> io::Result<Arc<Self>> {
        let ufs_path = ufs_path.into();
        let output = ufs.create(&ufs_path, options).await?;
        Ok(Arc::new(Self {
            ufs,
            ufs_path,
            inner: Mutex::new(WriterInner {
                output: Some(output),
                position: 0,
                closed: false,
            }),
        }))
    }

    /// Append `data`, returning the bytes written.
    pub async fn append(&self, data: &[u8]) -> io::Result<u64> {
        let mut inner = self.inner.lock().await;
        let output = match (inner.closed, inner.output.as_mut()) {
            (false, Some(output)) => output,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "append to closed UFS block writer",
                ))
            }
        };
        output.write_all(data).await?;
        inner.position += data.len() as u64;
        Ok(data.len() as u64)
    }

    /// Drain a network buffer straight into the UFS output.
    pub async fn transfer_from(&self, data: Bytes) -> io::Result<u64> {
        self.append(&data).await
    }

    /// Bytes written so far.
    pub async fn position(&self) -> u64 {
        self.inner.lock().await.position
    }

    /// Whether the writer has been closed or cancelled.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Abort the write: close the output and best-effort delete the file.
    ///
    /// A client retry that recreates the file can race this delete and lose
    /// its rewrite; closing that window needs an atomic cancel in the
    /// backing store, which this contract does not require.
    pub async fn cancel(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        let close_result = match inner.output.take() {
            Some(mut output) => output.close().await,
            None => Ok(()),
        };
        drop(inner);

        if let Err(e) = self.ufs.delete(&self.ufs_path).await {
            warn!(path = %self.ufs_path, error = %e, "failed to delete cancelled UFS file");
        }
        close_result
    }

    /// Flush and close the writer. Idempotent.
    pub async fn close(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        match inner.output.take() {
            Some(mut output) => output.close().await,
            None => Ok(()),
        }
    }
}
