//! In-memory block store.

use super::{BlockStore, StoreError, TempBlockWriter};
use crate::config::{BlockId, SessionId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Capacity-bounded in-memory tier.
///
/// Holds committed blocks keyed by block id and temp areas keyed by
/// `(session, block)`. Reservation accounting covers both, so allocation
/// fails fast with [`StoreError::NoSpace`] instead of over-committing.
#[derive(Debug, Clone)]
pub struct MemoryBlockStore {
    inner: Arc<Mutex<StoreInner>>,
    capacity: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    committed: HashMap<BlockId, Bytes>,
    temp: HashMap<(SessionId, BlockId), TempBlock>,
    committed_bytes: u64,
    reserved_bytes: u64,
}

#[derive(Debug)]
struct TempBlock {
    data: Vec<u8>,
    reserved: u64,
}

impl MemoryBlockStore {
    /// Create a store with no capacity bound.
    pub fn new() -> Self {
        Self::with_capacity(u64::MAX)
    }

    /// Create a store bounded to `capacity` bytes across committed and
    /// reserved temp blocks.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            capacity,
        }
    }

    /// Byte-weighted share of `blocks` committed in this store, as a
    /// percentage. An empty set is vacuously fully in memory.
    ///
    /// `blocks` pairs each block id with its length in bytes.
    pub fn in_memory_percentage(&self, blocks: &[(BlockId, u64)]) -> u32 {
        let total: u64 = blocks.iter().map(|(_, len)| len).sum();
        if total == 0 {
            return 100;
        }
        let inner = self.inner.lock().unwrap();
        let cached: u64 = blocks
            .iter()
            .filter(|(id, _)| inner.committed.contains_key(id))
            .map(|(_, len)| len)
            .sum();
        (cached * 100 / total) as u32
    }

    /// Number of committed blocks.
    pub fn committed_count(&self) -> usize {
        self.inner.lock().unwrap().committed.len()
    }

    /// Number of live temp blocks.
    pub fn temp_count(&self) -> usize {
        self.inner.lock().unwrap().temp.len()
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryTempWriter {
    inner: Arc<Mutex<StoreInner>>,
    session_id: SessionId,
    block_id: BlockId,
    position: u64,
    closed: bool,
}

#[async_trait]
impl TempBlockWriter for MemoryTempWriter {
    async fn append(&mut self, data: &[u8]) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::TempNotFound {
                session_id: self.session_id,
                block_id: self.block_id,
            });
        }
        let mut inner = self.inner.lock().unwrap();
        let temp = inner
            .temp
            .get_mut(&(self.session_id, self.block_id))
            .ok_or(StoreError::TempNotFound {
                session_id: self.session_id,
                block_id: self.block_id,
            })?;
        temp.data.extend_from_slice(data);
        self.position += data.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn allocate_temp_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
        bytes: u64,
    ) -> Result<Box<dyn TempBlockWriter>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.temp.contains_key(&(session_id, block_id)) {
            return Err(StoreError::TempExists {
                session_id,
                block_id,
            });
        }
        let used = inner.committed_bytes + inner.reserved_bytes;
        let available = self.capacity.saturating_sub(used);
        if bytes > available {
            return Err(StoreError::NoSpace {
                requested: bytes,
                available,
            });
        }
        inner.reserved_bytes += bytes;
        inner.temp.insert(
            (session_id, block_id),
            TempBlock {
                data: Vec::with_capacity(bytes.min(1 << 20) as usize),
                reserved: bytes,
            },
        );
        Ok(Box::new(MemoryTempWriter {
            inner: self.inner.clone(),
            session_id,
            block_id,
            position: 0,
            closed: false,
        }))
    }

    async fn commit_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let temp = inner
            .temp
            .remove(&(session_id, block_id))
            .ok_or(StoreError::TempNotFound {
                session_id,
                block_id,
            })?;
        inner.reserved_bytes -= temp.reserved;
        if inner.committed.contains_key(&block_id) {
            // Another session promoted this block first; keep theirs.
            debug!(block_id, session_id, "block already committed, dropping temp copy");
            return Ok(());
        }
        inner.committed_bytes += temp.data.len() as u64;
        inner.committed.insert(block_id, Bytes::from(temp.data));
        debug!(block_id, session_id, "block committed to memory tier");
        Ok(())
    }

    async fn abort_block(
        &self,
        session_id: SessionId,
        block_id: BlockId,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(temp) = inner.temp.remove(&(session_id, block_id)) {
            inner.reserved_bytes -= temp.reserved;
        }
        Ok(())
    }

    async fn cleanup_session(&self, session_id: SessionId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<(SessionId, BlockId)> = inner
            .temp
            .keys()
            .filter(|(s, _)| *s == session_id)
            .copied()
            .collect();
        for key in keys {
            if let Some(temp) = inner.temp.remove(&key) {
                inner.reserved_bytes -= temp.reserved;
            }
        }
        Ok(())
    }

    async fn contains_block(&self, block_id: BlockId) -> bool {
        self.inner.lock().unwrap().committed.contains_key(&block_id)
    }

    async fn read_committed(
        &self,
        block_id: BlockId,
        offset: u64,
        len: u64,
    ) -> Option<Bytes> {
        let inner = self.inner.lock().unwrap();
        let data = inner.committed.get(&block_id)?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len as usize).min(data.len());
        Some(data.slice(start..end))
    }
}
