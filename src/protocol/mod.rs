//! Wire protocol for block read streaming.
//!
//! Three message kinds, all correlated by block id: a read request, a cancel
//! request, and a read response carrying one packet of payload. Frames are
//! length-prefixed and typed; see [`frame`] for the exact layout.

mod frame;

pub use frame::{Frame, FrameCodec, ProtocolError, ReadRequest, ReadResponse, Status};
