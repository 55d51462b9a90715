//! Under-file-system abstraction.
//!
//! The UFS is the persistent backing store beneath the cache tier: an object
//! store, a distributed filesystem, or a plain local directory. The worker
//! only needs byte-level open/read/seek on the read path and create/append/
//! delete on the write path, so the contract stays deliberately small and is
//! dependency-injected wherever blocks are streamed.

mod local;

pub use local::LocalUfs;

use async_trait::async_trait;
use std::io;

/// Options for creating a file in the UFS.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Create missing parent directories.
    pub create_parent: bool,
}

impl CreateOptions {
    /// Create options that also create missing parents.
    pub fn with_create_parent(mut self, create_parent: bool) -> Self {
        self.create_parent = create_parent;
        self
    }
}

/// Read handle on one UFS file.
#[async_trait]
pub trait UfsInput: Send {
    /// Position the handle at `pos` bytes from the start of the file.
    async fn seek(&mut self, pos: u64) -> io::Result<()>;

    /// Read up to `buf.len()` bytes at the current position.
    ///
    /// Returns 0 only at end of file.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write handle on one UFS file.
#[async_trait]
pub trait UfsOutput: Send {
    /// Append all of `buf` at the current end of the file.
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Flush and close the handle.
    async fn close(&mut self) -> io::Result<()>;
}

/// The under file system contract.
#[async_trait]
pub trait UnderFileSystem: Send + Sync {
    /// Open `path` for reading.
    async fn open(&self, path: &str) -> io::Result<Box<dyn UfsInput>>;

    /// Create `path` for writing, truncating any existing file.
    async fn create(&self, path: &str, options: &CreateOptions)
        -> io::Result<Box<dyn UfsOutput>>;

    /// Delete the file at `path`.
    async fn delete(&self, path: &str) -> io::Result<()>;

    /// Whether a file exists at `path`.
    async fn exists(&self, path: &str) -> io::Result<bool>;
}
