//! Block descriptors known to this worker.

use crate::config::BlockId;
use std::collections::HashMap;
use std::sync::Mutex;

/// Where a block's persistent bytes live in the UFS.
#[derive(Debug, Clone)]
pub struct UfsBlockDescriptor {
    /// Path of the backing file.
    pub ufs_path: String,
    /// Offset of the block within the backing file.
    pub offset_in_ufs: u64,
    /// Block length in bytes.
    pub length: u64,
    /// Mount point the path belongs to.
    pub mount_id: u64,
}

impl UfsBlockDescriptor {
    /// Describe a block backed by `ufs_path`.
    pub fn new(ufs_path: impl Into<String>, offset_in_ufs: u64, length: u64) -> Self {
        Self {
            ufs_path: ufs_path.into(),
            offset_in_ufs,
            length,
            mount_id: 0,
        }
    }

    /// Set the mount id.
    pub fn with_mount_id(mut self, mount_id: u64) -> Self {
        self.mount_id = mount_id;
        self
    }
}

/// Registry of block locations, fed by whoever owns the file namespace.
///
/// The metadata service that assigns blocks to UFS files is out of scope;
/// the worker only needs this lookup when a session opens a UFS block.
#[derive(Debug, Default)]
pub struct BlockCatalog {
    blocks: Mutex<HashMap<BlockId, UfsBlockDescriptor>>,
}

impl BlockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the descriptor for `block_id`.
    pub fn register(&self, block_id: BlockId, descriptor: UfsBlockDescriptor) {
        self.blocks.lock().unwrap().insert(block_id, descriptor);
    }

    /// Look up the descriptor for `block_id`.
    pub fn get(&self, block_id: BlockId) -> Option<UfsBlockDescriptor> {
        self.blocks.lock().unwrap().get(&block_id).cloned()
    }

    /// Forget `block_id`.
    pub fn remove(&self, block_id: BlockId) {
        self.blocks.lock().unwrap().remove(&block_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_get_remove() {
        let catalog = BlockCatalog::new();
        assert!(catalog.get(1).is_none());

        catalog.register(1, UfsBlockDescriptor::new("/f", 0, 10).with_mount_id(2));
        let desc = catalog.get(1).unwrap();
        assert_eq!(desc.ufs_path, "/f");
        assert_eq!(desc.length, 10);
        assert_eq!(desc.mount_id, 2);

        catalog.remove(1);
        assert!(catalog.get(1).is_none());
    }
}
