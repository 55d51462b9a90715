//! Configuration types for the block streaming subsystem.
//!
//! Settings are grouped by concern and built with chained `with_*` methods.
//! There is no configuration-file loading here; callers construct settings
//! programmatically and hand them to the components that need them.

/// Identifies a block in the cluster namespace.
pub type BlockId = u64;

/// Identifies a client's lease on the worker.
pub type SessionId = u64;

/// Sentinel lock/session value marking an untracked (generic file) request.
pub const UNTRACKED_ID: i64 = -1;

/// Default packet payload size for remote reads (8 KiB).
pub const DEFAULT_REMOTE_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Default maximum number of sessions reading one block from the UFS.
pub const DEFAULT_MAX_UFS_READ_CONCURRENCY: u32 = 2;

/// Default packet-queue high water mark (packets buffered before pausing).
pub const DEFAULT_PACKET_HIGH_WATER: usize = 8;

/// Default packet-queue low water mark (packets buffered before resuming).
pub const DEFAULT_PACKET_LOW_WATER: usize = 2;

/// How a client wants a block read to interact with the in-memory tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadType {
    /// Read through to the UFS without promoting the block.
    NoCache,
    /// Read from the UFS and promote the block into the memory tier.
    CachePromote,
}

impl ReadType {
    /// Whether this read type forbids caching on the worker.
    pub fn is_no_cache(&self) -> bool {
        matches!(self, ReadType::NoCache)
    }
}

/// Tunables for the packet streaming path.
///
/// # Example
///
/// ```
/// use tierstream::config::StreamSettings;
///
/// let settings = StreamSettings::default()
///     .with_remote_read_buffer_size(100)
///     .with_max_ufs_read_concurrency(4);
/// assert_eq!(settings.remote_read_buffer_size, 100);
/// ```
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Packet payload size in bytes for remote reads.
    pub remote_read_buffer_size: usize,
    /// Default cap on concurrent UFS readers per block.
    pub max_ufs_read_concurrency: u32,
    /// Buffered packets at which the reader pauses the channel.
    pub packet_high_water: usize,
    /// Buffered packets at which the reader resumes the channel.
    pub packet_low_water: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            remote_read_buffer_size: DEFAULT_REMOTE_READ_BUFFER_SIZE,
            max_ufs_read_concurrency: DEFAULT_MAX_UFS_READ_CONCURRENCY,
            packet_high_water: DEFAULT_PACKET_HIGH_WATER,
            packet_low_water: DEFAULT_PACKET_LOW_WATER,
        }
    }
}

impl StreamSettings {
    /// Set the packet payload size in bytes.
    pub fn with_remote_read_buffer_size(mut self, bytes: usize) -> Self {
        self.remote_read_buffer_size = bytes;
        self
    }

    /// Set the default per-block UFS read concurrency cap.
    pub fn with_max_ufs_read_concurrency(mut self, limit: u32) -> Self {
        self.max_ufs_read_concurrency = limit;
        self
    }

    /// Set the packet-queue watermarks. `low` must be below `high`.
    pub fn with_watermarks(mut self, high: usize, low: usize) -> Self {
        assert!(low < high, "low water mark must be below high water mark");
        self.packet_high_water = high;
        self.packet_low_water = low;
        self
    }
}

/// Options supplied when a session acquires access to a UFS block.
///
/// The concurrency bound is evaluated against the value carried by each
/// individual acquire call; the registry does not remember past caps.
#[derive(Debug, Clone)]
pub struct OpenUfsBlockOptions {
    /// Path of the file backing this block in the UFS.
    pub ufs_path: String,
    /// Byte offset of the block within the backing file.
    pub offset_in_ufs: u64,
    /// Length of the block in bytes.
    pub block_size: u64,
    /// Mount point the path belongs to.
    pub mount_id: u64,
    /// Cap on concurrent UFS readers for this block.
    pub max_ufs_read_concurrency: u32,
    /// Do not promote the block into the memory tier during this read.
    pub no_cache: bool,
}

impl OpenUfsBlockOptions {
    /// Create options for a block backed by `ufs_path`.
    pub fn new(ufs_path: impl Into<String>, offset_in_ufs: u64, block_size: u64) -> Self {
        Self {
            ufs_path: ufs_path.into(),
            offset_in_ufs,
            block_size,
            mount_id: 0,
            max_ufs_read_concurrency: DEFAULT_MAX_UFS_READ_CONCURRENCY,
            no_cache: false,
        }
    }

    /// Set the mount id.
    pub fn with_mount_id(mut self, mount_id: u64) -> Self {
        self.mount_id = mount_id;
        self
    }

    /// Set the per-block concurrency cap for this acquire.
    pub fn with_max_ufs_read_concurrency(mut self, limit: u32) -> Self {
        self.max_ufs_read_concurrency = limit;
        self
    }

    /// Mark this read as pass-through (no promotion).
    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }
}
