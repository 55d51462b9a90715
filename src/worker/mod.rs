//! Worker-side UFS block serving.
//!
//! The registry tracks which sessions hold UFS access to which blocks, the
//! UFS reader streams block bytes out of the backing store (teeing them into
//! the local tier for promotion), the writer covers the delegated write
//! path, and the data server wires it all to the transport.

mod catalog;
mod meta;
mod registry;
mod server;
mod ufs_reader;
mod ufs_writer;

pub use catalog::{BlockCatalog, UfsBlockDescriptor};
pub use meta::UfsBlockMeta;
pub use registry::{RegistryError, UfsBlockRegistry};
pub use server::DataServer;
pub use ufs_reader::UfsBlockReader;
pub use ufs_writer::UfsBlockWriter;
