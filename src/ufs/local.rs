//! Local-filesystem UFS backend.

use super::{CreateOptions, UfsInput, UfsOutput, UnderFileSystem};
use async_trait::async_trait;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// UFS backend over a local directory tree.
///
/// Relative paths resolve against the configured root; absolute paths are
/// used as given. Tests mount this on a temporary directory.
#[derive(Debug, Clone)]
pub struct LocalUfs {
    root: PathBuf,
}

impl LocalUfs {
    /// Create a local UFS rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

struct LocalInput {
    file: File,
}

#[async_trait]
impl UfsInput for LocalInput {
    async fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(pos)).await?;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf).await
    }
}

struct LocalOutput {
    file: Option<File>,
}

#[async_trait]
impl UfsOutput for LocalOutput {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(buf).await,
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "write to closed UFS output",
            )),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl UnderFileSystem for LocalUfs {
    async fn open(&self, path: &str) -> io::Result<Box<dyn UfsInput>> {
        let file = File::open(self.resolve(path)).await?;
        Ok(Box::new(LocalInput { file }))
    }

    async fn create(
        &self,
        path: &str,
        options: &CreateOptions,
    ) -> io::Result<Box<dyn UfsOutput>> {
        let resolved = self.resolve(path);
        if options.create_parent {
            if let Some(parent) = resolved.parent() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(resolved)
            .await?;
        Ok(Box::new(LocalOutput { file: Some(file) }))
    }

    async fn delete(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path)).await
    }

    async fn exists(&self, path: &str) -> io::Result<bool> {
        match fs::metadata(self.resolve(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_file(ufs: &LocalUfs, path: &str, data: &[u8]) {
        let mut out = ufs
            .create(path, &CreateOptions::default().with_create_parent(true))
            .await
            .unwrap();
        out.write_all(data).await.unwrap();
        out.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_then_open_round_trip() {
        let dir = TempDir::new().unwrap();
        let ufs = LocalUfs::new(dir.path());
        write_file(&ufs, "a/b/file", b"hello world").await;

        let mut input = ufs.open("a/b/file").await.unwrap();
        let mut buf = vec![0u8; 11];
        let mut read = 0;
        while read < buf.len() {
            let n = input.read(&mut buf[read..]).await.unwrap();
            assert!(n > 0);
            read += n;
        }
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn test_seek_positions_reads() {
        let dir = TempDir::new().unwrap();
        let ufs = LocalUfs::new(dir.path());
        write_file(&ufs, "f", b"0123456789").await;

        let mut input = ufs.open("f").await.unwrap();
        input.seek(6).await.unwrap();
        let mut buf = [0u8; 4];
        let n = input.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"6789");
    }

    #[tokio::test]
    async fn test_read_past_end_returns_zero() {
        let dir = TempDir::new().unwrap();
        let ufs = LocalUfs::new(dir.path());
        write_file(&ufs, "f", b"xy").await;

        let mut input = ufs.open("f").await.unwrap();
        input.seek(2).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(input.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let dir = TempDir::new().unwrap();
        let ufs = LocalUfs::new(dir.path());
        write_file(&ufs, "f", b"data").await;

        assert!(ufs.exists("f").await.unwrap());
        ufs.delete("f").await.unwrap();
        assert!(!ufs.exists("f").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let ufs = LocalUfs::new(dir.path());
        assert!(ufs.open("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let ufs = LocalUfs::new(dir.path());
        let mut out = ufs.create("f", &CreateOptions::default()).await.unwrap();
        out.write_all(b"x").await.unwrap();
        out.close().await.unwrap();
        assert!(out.write_all(b"y").await.is_err());
    }
}
