//! Metadata for one UFS block held by one session.

use crate::config::{BlockId, OpenUfsBlockOptions, SessionId};
use std::sync::atomic::{AtomicBool, Ordering};

/// Immutable description of a session's hold on a UFS block, plus the one
/// mutable bit the reader and registry communicate through.
///
/// Shared between the registry entry and the UFS block reader: the reader
/// flips `commit_pending` once it has materialised the whole block into the
/// local store, and the registry observes it during cleanup to decide
/// whether to commit.
#[derive(Debug)]
pub struct UfsBlockMeta {
    session_id: SessionId,
    block_id: BlockId,
    ufs_path: String,
    offset_in_ufs: u64,
    length: u64,
    mount_id: u64,
    no_cache: bool,
    commit_pending: AtomicBool,
}

impl UfsBlockMeta {
    /// Build the meta for `(session, block)` from acquire-time options.
    pub fn new(session_id: SessionId, block_id: BlockId, options: &OpenUfsBlockOptions) -> Self {
        Self {
            session_id,
            block_id,
            ufs_path: options.ufs_path.clone(),
            offset_in_ufs: options.offset_in_ufs,
            length: options.block_size,
            mount_id: options.mount_id,
            no_cache: options.no_cache,
            commit_pending: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn ufs_path(&self) -> &str {
        &self.ufs_path
    }

    pub fn offset_in_ufs(&self) -> u64 {
        self.offset_in_ufs
    }

    /// Length of the block in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn mount_id(&self) -> u64 {
        self.mount_id
    }

    /// Whether this hold was opened with caching disabled.
    pub fn no_cache(&self) -> bool {
        self.no_cache
    }

    /// Whether the block is fully materialised locally and should be
    /// committed on cleanup.
    pub fn commit_pending(&self) -> bool {
        self.commit_pending.load(Ordering::SeqCst)
    }

    pub fn set_commit_pending(&self, pending: bool) {
        self.commit_pending.store(pending, Ordering::SeqCst);
    }
}
