//! Access registry for UFS blocks under delegated reads and writes.
//!
//! Usage pattern, per `(session, block)`:
//!
//! ```text
//! acquire_access(session, block, options)
//! cleanup(session, block)          -> commit decision
//! release_access(session, block)
//! ```
//!
//! If the client is lost before releasing, the external session cleaner
//! drives [`UfsBlockRegistry::cleanup_session`] and the same teardown runs
//! for every block the session still holds.

use super::meta::UfsBlockMeta;
use super::ufs_reader::UfsBlockReader;
use super::ufs_writer::UfsBlockWriter;
use crate::config::{BlockId, OpenUfsBlockOptions, SessionId};
use crate::store::BlockStore;
use crate::ufs::{CreateOptions, UnderFileSystem};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;

/// Errors raised by the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The `(session, block)` pair already holds access.
    #[error("UFS block {block_id} already acquired by session {session_id}")]
    BlockAlreadyExists {
        session_id: SessionId,
        block_id: BlockId,
    },

    /// The per-block concurrency cap is exhausted.
    #[error("no access token available for UFS block {block_id}: {active} sessions active")]
    AccessTokenUnavailable { block_id: BlockId, active: usize },

    /// No entry exists for the `(session, block)` pair.
    #[error("UFS block {block_id} does not exist for session {session_id}")]
    BlockDoesNotExist {
        session_id: SessionId,
        block_id: BlockId,
    },

    /// Reader or writer I/O during construction or cleanup.
    #[error("UFS block I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for RegistryError {
    fn from(err: io::Error) -> Self {
        RegistryError::Io(err.to_string())
    }
}

/// One `(session, block)` entry: the meta plus lazily populated reader and
/// writer slots.
///
/// A well-behaved client never opens two readers or writers on the same
/// pair. The slot locks exist so a misbehaving client degrades to a leaked
/// reader instead of a crashed worker: when two getters race, the last set
/// wins and the loser's reader stays open until session cleanup.
struct BlockEntry {
    meta: Arc<UfsBlockMeta>,
    reader: Mutex<Option<Arc<UfsBlockReader>>>,
    writer: Mutex<Option<Arc<UfsBlockWriter>>>,
}

impl BlockEntry {
    fn new(meta: UfsBlockMeta) -> Arc<Self> {
        Arc::new(Self {
            meta: Arc::new(meta),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        })
    }

    /// The attached reader, if any and not yet closed. A closed reader is
    /// forgotten here and never returned again.
    fn block_reader(&self) -> Option<Arc<UfsBlockReader>> {
        let mut slot = self.reader.lock().unwrap();
        if slot.as_ref().is_some_and(|r| r.is_closed()) {
            *slot = None;
        }
        slot.clone()
    }

    fn set_block_reader(&self, reader: Arc<UfsBlockReader>) {
        *self.reader.lock().unwrap() = Some(reader);
    }

    fn block_writer(&self) -> Option<Arc<UfsBlockWriter>> {
        self.writer.lock().unwrap().clone()
    }

    fn set_block_writer(&self, writer: Arc<UfsBlockWriter>) {
        *self.writer.lock().unwrap() = Some(writer);
    }

    /// Close whichever of the reader and writer slots are populated.
    async fn close_reader_and_writer(&self) -> io::Result<()> {
        let reader = self.reader.lock().unwrap().take();
        if let Some(reader) = reader {
            reader.close().await?;
        }
        let writer = self.writer.lock().unwrap().take();
        if let Some(writer) = writer {
            writer.close().await?;
        }
        Ok(())
    }
}

type Key = (SessionId, BlockId);

#[derive(Default)]
struct RegistryState {
    blocks: HashMap<Key, Arc<BlockEntry>>,
    blocks_by_session: HashMap<SessionId, HashSet<BlockId>>,
    sessions_by_block: HashMap<BlockId, HashSet<SessionId>>,
}

/// Tracks which sessions hold UFS read/write access to which blocks.
///
/// One mutex guards the three maps, held only for map reads and writes.
/// Everything that does I/O — reader and writer construction, closing during
/// cleanup — happens outside it, so a slow backing store never blocks
/// acquires for other sessions.
pub struct UfsBlockRegistry {
    state: Mutex<RegistryState>,
    store: Arc<dyn BlockStore>,
    ufs: Arc<dyn UnderFileSystem>,
}

impl UfsBlockRegistry {
    /// Create a registry over the given local store and UFS.
    pub fn new(store: Arc<dyn BlockStore>, ufs: Arc<dyn UnderFileSystem>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            store,
            ufs,
        }
    }

    /// Atomically admit `(session, block)`, subject to the per-block
    /// concurrency cap carried by `options`.
    pub fn acquire_access(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        options: &OpenUfsBlockOptions,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock().unwrap();
        if state.blocks.contains_key(&(session_id, block_id)) {
            return Err(RegistryError::BlockAlreadyExists {
                session_id,
                block_id,
            });
        }
        if let Some(sessions) = state.sessions_by_block.get(&block_id) {
            if sessions.len() >= options.max_ufs_read_concurrency as usize {
                return Err(RegistryError::AccessTokenUnavailable {
                    block_id,
                    active: sessions.len(),
                });
            }
        }

        let meta = UfsBlockMeta::new(session_id, block_id, options);
        state.blocks.insert((session_id, block_id), BlockEntry::new(meta));
        state
            .sessions_by_block
            .entry(block_id)
            .or_default()
            .insert(session_id);
        state
            .blocks_by_session
            .entry(session_id)
            .or_default()
            .insert(block_id);
        Ok(())
    }

    /// The meta for `(session, block)`.
    pub fn block_meta(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<Arc<UfsBlockMeta>, RegistryError> {
        Ok(self.entry(session_id, block_id)?.meta.clone())
    }

    /// The reader for `(session, block)`, constructing one over the block's
    /// meta at `offset` if none is attached.
    ///
    /// Construction happens outside the registry mutex; concurrent getters
    /// for the same pair violate the client contract and may both construct,
    /// in which case the last one attached wins.
    pub async fn get_block_reader(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        offset: u64,
        no_cache: bool,
    ) -> Result<Arc<UfsBlockReader>, RegistryError> {
        let entry = self.entry(session_id, block_id)?;
        if let Some(reader) = entry.block_reader() {
            return Ok(reader);
        }
        let reader = UfsBlockReader::create(
            entry.meta.clone(),
            offset,
            no_cache,
            self.ufs.clone(),
            self.store.clone(),
        )
        .await?;
        entry.set_block_reader(reader.clone());
        Ok(reader)
    }

    /// The writer for `(session, block)`, constructing one over the block's
    /// UFS path if none is attached.
    pub async fn get_block_writer(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<Arc<UfsBlockWriter>, RegistryError> {
        let entry = self.entry(session_id, block_id)?;
        if let Some(writer) = entry.block_writer() {
            return Ok(writer);
        }
        let writer = UfsBlockWriter::create(
            self.ufs.clone(),
            entry.meta.ufs_path(),
            &CreateOptions::default().with_create_parent(true),
        )
        .await?;
        entry.set_block_writer(writer.clone());
        Ok(writer)
    }

    /// Close the reader and writer of `(session, block)` and report whether
    /// the block should be committed to the local store.
    ///
    /// Returns `false` for absent pairs. Idempotent.
    pub async fn cleanup(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<bool, RegistryError> {
        let entry = {
            let state = self.state.lock().unwrap();
            match state.blocks.get(&(session_id, block_id)) {
                Some(entry) => entry.clone(),
                None => return Ok(false),
            }
        };
        entry.close_reader_and_writer().await?;
        Ok(entry.meta.commit_pending())
    }

    /// Remove `(session, block)` from the registry. Silent on absent pairs.
    pub fn release_access(&self, session_id: SessionId, block_id: BlockId) {
        let mut state = self.state.lock().unwrap();
        state.blocks.remove(&(session_id, block_id));
        if let Some(blocks) = state.blocks_by_session.get_mut(&session_id) {
            blocks.remove(&block_id);
            if blocks.is_empty() {
                state.blocks_by_session.remove(&session_id);
            }
        }
        if let Some(sessions) = state.sessions_by_block.get_mut(&block_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                state.sessions_by_block.remove(&block_id);
            }
        }
    }

    /// Clean up and release every block the session still holds.
    ///
    /// Per-block failures are logged and skipped so one bad block cannot
    /// strand the rest of the session.
    pub async fn cleanup_session(&self, session_id: SessionId) {
        let block_ids: Vec<BlockId> = {
            let state = self.state.lock().unwrap();
            match state.blocks_by_session.get(&session_id) {
                Some(blocks) => blocks.iter().copied().collect(),
                None => return,
            }
        };

        for block_id in block_ids {
            // The local store's own session cleaner aborts any temp block;
            // no commit decision is taken on this path.
            if let Err(e) = self.cleanup(session_id, block_id).await {
                warn!(session_id, block_id, error = %e, "failed to clean up UFS block");
            }
            self.release_access(session_id, block_id);
        }
    }

    /// Number of sessions currently holding `block_id`.
    pub fn session_count(&self, block_id: BlockId) -> usize {
        self.state
            .lock()
            .unwrap()
            .sessions_by_block
            .get(&block_id)
            .map_or(0, |sessions| sessions.len())
    }

    /// Whether the registry holds no entries at all.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.blocks.is_empty()
            && state.blocks_by_session.is_empty()
            && state.sessions_by_block.is_empty()
    }

    fn entry(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<Arc<BlockEntry>, RegistryError> {
        self.state
            .lock()
            .unwrap()
            .blocks
            .get(&(session_id, block_id))
            .cloned()
            .ok_or(RegistryError::BlockDoesNotExist {
                session_id,
                block_id,
            })
    }
}
