//! Worker-side data server.
//!
//! Sits between the transport and the registry:
//!
//! ```text
//! client stream ──frames──► DataServer ──► registry ──► UFS reader ──► UFS
//!                                │                        │
//!                                └──── memory tier ◄──tee─┘
//! ```
//!
//! The control-plane calls (`open_ufs_block`, `close_ufs_block`,
//! `cleanup_session`) stand in for the worker's RPC surface, which lives
//! elsewhere; in-process callers and tests invoke them directly. The data
//! plane is [`FrameServer::serve`]: one connection, one active read at a
//! time, with cancel frames picked up between packet sends.

use super::catalog::BlockCatalog;
use super::registry::{RegistryError, UfsBlockRegistry};
use super::ufs_reader::UfsBlockReader;
use crate::config::{BlockId, OpenUfsBlockOptions, ReadType, SessionId, StreamSettings};
use crate::protocol::{Frame, ReadRequest, ReadResponse};
use crate::store::BlockStore;
use crate::transport::{FrameReceiver, FrameSender, FrameServer, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Serves block read streams out of the memory tier or the UFS.
pub struct DataServer {
    registry: Arc<UfsBlockRegistry>,
    store: Arc<dyn BlockStore>,
    catalog: Arc<BlockCatalog>,
    settings: StreamSettings,
}

impl DataServer {
    /// Create a data server over the given registry, store, and catalog.
    pub fn new(
        registry: Arc<UfsBlockRegistry>,
        store: Arc<dyn BlockStore>,
        catalog: Arc<BlockCatalog>,
        settings: StreamSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            catalog,
            settings,
        })
    }

    /// The registry backing this server.
    pub fn registry(&self) -> &Arc<UfsBlockRegistry> {
        &self.registry
    }

    /// Acquire UFS read access to `block_id` for `session_id`.
    ///
    /// Resolves the block in the catalog and admits the session against the
    /// per-block concurrency cap (`max_concurrency` overrides the configured
    /// default for this call).
    pub fn open_ufs_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        read_type: ReadType,
        max_concurrency: Option<u32>,
    ) -> Result<(), RegistryError> {
        let descriptor = self
            .catalog
            .get(block_id)
            .ok_or(RegistryError::BlockDoesNotExist {
                session_id,
                block_id,
            })?;
        let options = OpenUfsBlockOptions::new(
            descriptor.ufs_path,
            descriptor.offset_in_ufs,
            descriptor.length,
        )
        .with_mount_id(descriptor.mount_id)
        .with_max_ufs_read_concurrency(
            max_concurrency.unwrap_or(self.settings.max_ufs_read_concurrency),
        )
        .with_no_cache(read_type.is_no_cache());
        self.registry.acquire_access(session_id, block_id, &options)
    }

    /// Close the session's hold on `block_id`, committing the block into the
    /// memory tier when the read fully materialised it.
    pub async fn close_ufs_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<(), RegistryError> {
        let commit = self.registry.cleanup(session_id, block_id).await?;
        if commit {
            if let Err(e) = self.store.commit_block(session_id, block_id).await {
                warn!(session_id, block_id, error = %e, "failed to commit promoted block");
            }
        }
        self.registry.release_access(session_id, block_id);
        Ok(())
    }

    /// Tear down everything the session holds: registry entries first, then
    /// the store's temp blocks.
    pub async fn cleanup_session(&self, session_id: SessionId) {
        self.registry.cleanup_session(session_id).await;
        if let Err(e) = self.store.cleanup_session(session_id).await {
            warn!(session_id, error = %e, "failed to clean up session temp blocks");
        }
    }

    /// Pick the byte source for one read request.
    async fn resolve_source(&self, request: &ReadRequest) -> Result<ReadSource, String> {
        if request.is_untracked() {
            // Generic file reads belong to the namespace layer, which is not
            // part of this worker.
            return Err(format!(
                "untracked file read for id {} is not served here",
                request.block_id
            ));
        }
        let session_id = request.session_id as SessionId;
        let block_id = request.block_id;

        match self.registry.block_meta(session_id, block_id) {
            Ok(meta) => {
                let reader = self
                    .registry
                    .get_block_reader(
                        session_id,
                        block_id,
                        request.offset.max(0) as u64,
                        meta.no_cache(),
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(ReadSource::Ufs(reader))
            }
            Err(RegistryError::BlockDoesNotExist { .. }) => {
                if self.store.contains_block(block_id).await {
                    Ok(ReadSource::Memory {
                        store: self.store.clone(),
                        block_id,
                    })
                } else {
                    Err(format!(
                        "block {block_id} is neither registered for session {session_id} \
                         nor cached in memory"
                    ))
                }
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Stream one read request, interleaving with inbound frames so a cancel
    /// is honoured mid-stream.
    async fn stream_block(
        &self,
        request: &ReadRequest,
        inbound: &mut FrameReceiver,
        outbound: &FrameSender,
    ) -> Result<(), TransportError> {
        let block_id = request.block_id;
        let source = match self.resolve_source(request).await {
            Ok(source) => source,
            Err(message) => {
                debug!(block_id, message, "rejecting read request");
                return outbound
                    .send(Frame::Response(ReadResponse::error(block_id, message)))
                    .await;
            }
        };

        let mut offset = request.offset.max(0) as u64;
        let mut remaining = request.length.max(0) as u64;
        let packet_size = self.settings.remote_read_buffer_size.max(1);

        loop {
            if remaining == 0 {
                return outbound.send(Frame::Response(ReadResponse::eof(block_id))).await;
            }
            let len = packet_size.min(remaining as usize);

            tokio::select! {
                biased;

                frame = inbound.recv() => match frame {
                    Ok(Some(Frame::Cancel { block_id: cancelled })) if cancelled == block_id => {
                        debug!(block_id, "read cancelled by client");
                        return outbound
                            .send(Frame::Response(ReadResponse::cancelled(block_id)))
                            .await;
                    }
                    Ok(Some(other)) => {
                        warn!(block_id, frame = ?other, "unexpected frame during active read");
                        continue;
                    }
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        debug!(block_id, error = %e, "inbound side failed mid-read");
                        return Ok(());
                    }
                },

                chunk = source.read_chunk(offset, len) => match chunk {
                    Ok(chunk) if chunk.is_empty() => {
                        return outbound
                            .send(Frame::Response(ReadResponse::eof(block_id)))
                            .await;
                    }
                    Ok(chunk) => {
                        let n = chunk.len() as u64;
                        outbound
                            .send(Frame::Response(ReadResponse::success(block_id, chunk)))
                            .await?;
                        offset += n;
                        remaining -= n;
                    }
                    Err(e) => {
                        warn!(block_id, error = %e, "block read failed");
                        return outbound
                            .send(Frame::Response(ReadResponse::error(block_id, e.to_string())))
                            .await;
                    }
                },
            }
        }
    }
}

/// Where a read request's bytes come from.
enum ReadSource {
    Ufs(Arc<UfsBlockReader>),
    Memory {
        store: Arc<dyn BlockStore>,
        block_id: BlockId,
    },
}

impl ReadSource {
    async fn read_chunk(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        match self {
            ReadSource::Ufs(reader) => reader.read_chunk(offset, len).await,
            ReadSource::Memory { store, block_id } => store
                .read_committed(*block_id, offset, len as u64)
                .await
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("block {block_id} evicted from memory tier mid-read"),
                    )
                }),
        }
    }
}

#[async_trait]
impl FrameServer for DataServer {
    async fn serve(&self, mut inbound: FrameReceiver, outbound: FrameSender) {
        loop {
            let frame = match inbound.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    debug!(error = %e, "connection dropped");
                    return;
                }
            };
            match frame {
                Frame::Read(request) => {
                    if let Err(e) = self.stream_block(&request, &mut inbound, &outbound).await {
                        debug!(block_id = request.block_id, error = %e,
                            "client stopped reading, dropping connection");
                        return;
                    }
                }
                // A cancel with no active read raced stream completion; the
                // full response is already under way, so it is ignored.
                Frame::Cancel { block_id } => {
                    debug!(block_id, "ignoring stale cancel");
                }
                Frame::Response(_) => {
                    warn!("response frame from client, dropping connection");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlockStore;
    use crate::ufs::{CreateOptions, LocalUfs, UfsOutput, UnderFileSystem};
    use crate::worker::catalog::UfsBlockDescriptor;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: TempDir,
        server: Arc<DataServer>,
        store: Arc<MemoryBlockStore>,
    }

    async fn fixture(block_len: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let ufs = Arc::new(LocalUfs::new(dir.path()));
        let data: Vec<u8> = (0..block_len).map(|i| (i % 256) as u8).collect();
        let mut out = ufs.create("file", &CreateOptions::default()).await.unwrap();
        out.write_all(&data).await.unwrap();
        out.close().await.unwrap();

        let store = Arc::new(MemoryBlockStore::new());
        let registry = Arc::new(UfsBlockRegistry::new(store.clone(), ufs));
        let catalog = Arc::new(BlockCatalog::new());
        catalog.register(10, UfsBlockDescriptor::new("file", 0, block_len as u64));

        let server = DataServer::new(
            registry,
            store.clone(),
            catalog,
            StreamSettings::default().with_remote_read_buffer_size(16),
        );
        Fixture {
            _dir: dir,
            server,
            store,
        }
    }

    /// Drive one request through `serve` and collect the responses.
    async fn run_request(server: Arc<DataServer>, request: ReadRequest) -> Vec<ReadResponse> {
        let (client_tx, server_rx) = mpsc::channel(64);
        let (server_tx, mut client_rx) = mpsc::channel(64);

        let handle = tokio::spawn(async move {
            server
                .serve(FrameReceiver::new(server_rx), FrameSender::new(server_tx))
                .await;
        });

        let sender = FrameSender::new(client_tx);
        sender.send(Frame::Read(request)).await.unwrap();

        let mut buf = bytes::BytesMut::new();
        let mut responses = Vec::new();
        'collect: while let Some(chunk) = client_rx.recv().await {
            buf.extend_from_slice(&chunk);
            while let Some(frame) = Frame::decode(&mut buf).unwrap() {
                match frame {
                    Frame::Response(resp) => {
                        let terminal = resp.is_eof()
                            || !matches!(resp.status, crate::protocol::Status::Success);
                        responses.push(resp);
                        if terminal {
                            break 'collect;
                        }
                    }
                    other => panic!("unexpected frame from server: {other:?}"),
                }
            }
        }
        drop(sender);
        handle.await.unwrap();
        responses
    }

    fn tracked_request(session_id: u64, len: i64) -> ReadRequest {
        ReadRequest {
            block_id: 10,
            offset: 0,
            length: len,
            lock_id: 1,
            session_id: session_id as i64,
        }
    }

    #[tokio::test]
    async fn test_tracked_read_streams_packets_then_eof() {
        let f = fixture(40).await;
        f.server
            .open_ufs_block(1, 10, ReadType::NoCache, None)
            .unwrap();

        let responses = run_request(f.server.clone(), tracked_request(1, 40)).await;
        // 40 bytes in 16-byte packets: 16 + 16 + 8, then the eof marker.
        assert_eq!(responses.len(), 4);
        assert!(responses[3].is_eof());
        let bytes: Vec<u8> = responses[..3]
            .iter()
            .flat_map(|r| r.payload.iter().copied())
            .collect();
        let expected: Vec<u8> = (0..40).map(|i| (i % 256) as u8).collect();
        assert_eq!(bytes, expected);
    }

    #[tokio::test]
    async fn test_unregistered_block_is_an_error() {
        let f = fixture(40).await;
        let responses = run_request(f.server.clone(), tracked_request(1, 40)).await;
        assert_eq!(responses.len(), 1);
        assert!(matches!(
            responses[0].status,
            crate::protocol::Status::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_untracked_request_is_an_error() {
        let f = fixture(40).await;
        let responses = run_request(
            f.server.clone(),
            ReadRequest {
                block_id: 10,
                offset: 0,
                length: 40,
                lock_id: -1,
                session_id: -1,
            },
        )
        .await;
        assert_eq!(responses.len(), 1);
        assert!(matches!(
            responses[0].status,
            crate::protocol::Status::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_committed_block_served_from_memory_without_token() {
        let f = fixture(40).await;

        // Promote via a tracked full read first.
        f.server
            .open_ufs_block(1, 10, ReadType::CachePromote, None)
            .unwrap();
        run_request(f.server.clone(), tracked_request(1, 40)).await;
        f.server.close_ufs_block(1, 10).await.unwrap();
        assert!(f.store.contains_block(10).await);

        // Session 2 never opened the block; the memory tier serves it.
        let responses = run_request(f.server.clone(), tracked_request(2, 40)).await;
        let bytes: Vec<u8> = responses
            .iter()
            .flat_map(|r| r.payload.iter().copied())
            .collect();
        let expected: Vec<u8> = (0..40).map(|i| (i % 256) as u8).collect();
        assert_eq!(bytes, expected);
    }

    #[tokio::test]
    async fn test_close_ufs_block_commits_and_releases() {
        let f = fixture(20).await;
        f.server
            .open_ufs_block(1, 10, ReadType::CachePromote, None)
            .unwrap();
        run_request(f.server.clone(), tracked_request(1, 20)).await;

        f.server.close_ufs_block(1, 10).await.unwrap();
        assert!(f.store.contains_block(10).await);
        assert!(f.server.registry().is_empty());
        // Second close is harmless: cleanup is idempotent, release silent.
        f.server.close_ufs_block(1, 10).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_cache_read_does_not_commit() {
        let f = fixture(20).await;
        f.server
            .open_ufs_block(1, 10, ReadType::NoCache, None)
            .unwrap();
        run_request(f.server.clone(), tracked_request(1, 20)).await;
        f.server.close_ufs_block(1, 10).await.unwrap();
        assert!(!f.store.contains_block(10).await);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_answers_cancelled() {
        let f = fixture(1000).await;
        f.server
            .open_ufs_block(1, 10, ReadType::NoCache, None)
            .unwrap();

        let (client_tx, server_rx) = mpsc::channel(64);
        // A tiny window so the server blocks quickly on a slow client.
        let (server_tx, mut client_rx) = mpsc::channel(1);
        let server = f.server.clone();
        let handle = tokio::spawn(async move {
            server
                .serve(FrameReceiver::new(server_rx), FrameSender::new(server_tx))
                .await;
        });

        let sender = FrameSender::new(client_tx);
        sender.send(Frame::Read(tracked_request(1, 1000))).await.unwrap();
        // Let a packet or two queue up, then cancel without draining.
        let first = client_rx.recv().await.unwrap();
        assert!(!first.is_empty());
        sender.send(Frame::Cancel { block_id: 10 }).await.unwrap();

        // Drain until the cancelled response arrives.
        let mut buf = bytes::BytesMut::new();
        buf.extend_from_slice(&first);
        let mut saw_cancelled = false;
        'outer: loop {
            while let Some(frame) = Frame::decode(&mut buf).unwrap() {
                if let Frame::Response(resp) = frame {
                    if resp.status == crate::protocol::Status::Cancelled {
                        saw_cancelled = true;
                        break 'outer;
                    }
                }
            }
            match client_rx.recv().await {
                Some(chunk) => buf.extend_from_slice(&chunk),
                None => break,
            }
        }
        assert!(saw_cancelled);

        drop(sender);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_session_aborts_temp_blocks() {
        let f = fixture(100).await;
        f.server
            .open_ufs_block(1, 10, ReadType::CachePromote, None)
            .unwrap();
        // Partial read: temp block allocated but not full.
        let reader = f
            .server
            .registry()
            .get_block_reader(1, 10, 0, false)
            .await
            .unwrap();
        reader.read_chunk(0, 10).await.unwrap();
        assert_eq!(f.store.temp_count(), 1);

        f.server.cleanup_session(1).await;
        assert_eq!(f.store.temp_count(), 0);
        assert!(f.server.registry().is_empty());
        assert!(!f.store.contains_block(10).await);
    }
}
