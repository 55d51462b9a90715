//! Tierstream - UFS block streaming for a tiered cache worker.
//!
//! This library implements the read path between a cache worker and its
//! under file system (UFS): clients stream block bytes out of the backing
//! store through the worker, which optionally promotes the block into its
//! in-memory tier along the way.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐      ┌──────────────────────────────────┐
//! │            client            │      │              worker              │
//! │                              │      │                                  │
//! │ FileInStream                 │      │ DataServer                       │
//! │   └─ BlockInStream           │frames│   └─ UfsBlockRegistry            │
//! │        └─ PacketReader ──────┼──────┼─────── └─ UfsBlockReader ─► UFS  │
//! │             (flow control)   │      │               └─ tee ─► BlockStore│
//! └──────────────────────────────┘      └──────────────────────────────────┘
//! ```
//!
//! A read request travels from a [`stream::BlockInStream`] through its
//! packet reader onto a pooled channel; the worker's
//! [`worker::DataServer`] admits the session in the
//! [`worker::UfsBlockRegistry`] (bounded per-block concurrency), streams
//! packets back from the UFS, and tees the bytes into the local
//! [`store::BlockStore`]. Once the whole block is materialised, cleanup
//! commits it and later reads hit memory instead of the UFS.

pub mod config;
pub mod protocol;
pub mod store;
pub mod stream;
pub mod transport;
pub mod ufs;
pub mod worker;

/// Version of the tierstream library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
