//! Local block store contract.
//!
//! The worker's in-memory tier is an external collaborator: the UFS
//! streaming subsystem only allocates temp blocks while promoting, commits
//! or aborts them, and reads committed blocks back when serving the cached
//! path. Eviction and placement stay entirely on the store's side of the
//! contract.

mod memory;

pub use memory::MemoryBlockStore;

use crate::config::{BlockId, SessionId};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors surfaced by the local block store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A temp block already exists for this `(session, block)` pair.
    #[error("temp block already allocated for block {block_id} in session {session_id}")]
    TempExists {
        session_id: SessionId,
        block_id: BlockId,
    },

    /// Not enough free space to reserve the requested bytes.
    #[error("store out of space: requested {requested} bytes, {available} available")]
    NoSpace { requested: u64, available: u64 },

    /// No temp block exists for this `(session, block)` pair.
    #[error("no temp block for block {block_id} in session {session_id}")]
    TempNotFound {
        session_id: SessionId,
        block_id: BlockId,
    },
}

/// Writer for one temp block being promoted into the store.
///
/// Appended bytes become visible to `commit_block` immediately; closing the
/// writer does not commit.
#[async_trait]
pub trait TempBlockWriter: Send {
    /// Append `data` at the current end of the temp block.
    async fn append(&mut self, data: &[u8]) -> Result<(), StoreError>;

    /// Bytes appended so far.
    fn position(&self) -> u64;

    /// Release the writer without committing. Idempotent.
    async fn close(&mut self) -> Result<(), StoreError>;
}

/// The in-memory tier, by contract.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Reserve space and open a temp block writer for `(session, block)`.
    async fn allocate_temp_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        bytes: u64,
    ) -> Result<Box<dyn TempBlockWriter>, StoreError>;

    /// Promote the temp block for `(session, block)` into the committed set.
    ///
    /// Committing a block another session already committed succeeds and
    /// discards this session's temp copy.
    async fn commit_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<(), StoreError>;

    /// Discard the temp block for `(session, block)`, if any.
    async fn abort_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<(), StoreError>;

    /// Discard every temp block belonging to `session_id`.
    async fn cleanup_session(&self, session_id: SessionId) -> Result<(), StoreError>;

    /// Whether `block_id` is committed in the store.
    async fn contains_block(&self, block_id: BlockId) -> bool;

    /// Read `len` bytes of a committed block starting at `offset`.
    ///
    /// Returns `None` when the block is not committed. Reads past the end of
    /// the block are truncated.
    async fn read_committed(
        &self,
        block_id: BlockId,
        offset: u64,
        len: u64,
    ) -> Option<Bytes>;
}
