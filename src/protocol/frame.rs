//! Frame layout and incremental codec.
//!
//! ```text
//! frame := u32 len | u8 type | body            (len = body length + 1)
//! type  := 0x01 ReadRequest | 0x02 CancelRequest | 0x10 ReadResponse
//!
//! ReadRequest   := u64 block_id | i64 offset | i64 length
//!                | i64 lock_id  | i64 session_id
//! CancelRequest := u64 block_id
//! ReadResponse  := u64 block_id | u16 status | u32 payload_len | bytes
//! ```
//!
//! All integers are big endian. A `Success` response with an empty payload
//! signifies end of stream. An `Error` response carries its UTF-8 message as
//! the payload. Lock and session ids of −1 mark an untracked request for a
//! generic file rather than a registered block.

use crate::config::{BlockId, UNTRACKED_ID};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const TYPE_READ_REQUEST: u8 = 0x01;
const TYPE_CANCEL_REQUEST: u8 = 0x02;
const TYPE_READ_RESPONSE: u8 = 0x10;

const STATUS_SUCCESS: u16 = 0;
const STATUS_CANCELLED: u16 = 1;
const STATUS_ERROR: u16 = 2;

const READ_REQUEST_BODY_LEN: usize = 8 + 8 * 4;
const CANCEL_REQUEST_BODY_LEN: usize = 8;
const RESPONSE_HEADER_LEN: usize = 8 + 2 + 4;

/// Largest frame body the decoder will accept. Anything bigger is treated as
/// a corrupt length prefix rather than buffered indefinitely.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame type byte is not one of the known discriminators.
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    /// The status field of a response is not a known status code.
    #[error("unknown response status {0}")]
    UnknownStatus(u16),

    /// The frame body is shorter than its fixed-size layout requires.
    #[error("truncated frame body: expected at least {expected} bytes, got {actual}")]
    TruncatedBody { expected: usize, actual: usize },

    /// The length prefix exceeds the maximum accepted frame size.
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),

    /// Underlying I/O failure while framing.
    #[error("framing I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Request to stream `length` bytes of a block starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub block_id: BlockId,
    pub offset: i64,
    pub length: i64,
    pub lock_id: i64,
    pub session_id: i64,
}

impl ReadRequest {
    /// Whether this request targets a generic file rather than a tracked
    /// block (lock and session ids carry the −1 sentinel).
    pub fn is_untracked(&self) -> bool {
        self.lock_id == UNTRACKED_ID && self.session_id == UNTRACKED_ID
    }
}

/// Terminal status of a read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Success,
    Cancelled,
    Error(String),
}

/// One streamed packet of a read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub block_id: BlockId,
    pub status: Status,
    pub payload: Bytes,
}

impl ReadResponse {
    /// Build a successful data packet.
    pub fn success(block_id: BlockId, payload: Bytes) -> Self {
        Self {
            block_id,
            status: Status::Success,
            payload,
        }
    }

    /// Build the end-of-stream marker: a successful response with no payload.
    pub fn eof(block_id: BlockId) -> Self {
        Self::success(block_id, Bytes::new())
    }

    /// Build a cancelled response.
    pub fn cancelled(block_id: BlockId) -> Self {
        Self {
            block_id,
            status: Status::Cancelled,
            payload: Bytes::new(),
        }
    }

    /// Build an error response carrying `message`.
    pub fn error(block_id: BlockId, message: impl Into<String>) -> Self {
        Self {
            block_id,
            status: Status::Error(message.into()),
            payload: Bytes::new(),
        }
    }

    /// Whether this response marks the natural end of the stream.
    pub fn is_eof(&self) -> bool {
        self.status == Status::Success && self.payload.is_empty()
    }
}

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Read(ReadRequest),
    Cancel { block_id: BlockId },
    Response(ReadResponse),
}

impl Frame {
    /// Encode this frame, including the length prefix, into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Read(req) => {
                dst.put_u32((READ_REQUEST_BODY_LEN + 1) as u32);
                dst.put_u8(TYPE_READ_REQUEST);
                dst.put_u64(req.block_id);
                dst.put_i64(req.offset);
                dst.put_i64(req.length);
                dst.put_i64(req.lock_id);
                dst.put_i64(req.session_id);
            }
            Frame::Cancel { block_id } => {
                dst.put_u32((CANCEL_REQUEST_BODY_LEN + 1) as u32);
                dst.put_u8(TYPE_CANCEL_REQUEST);
                dst.put_u64(*block_id);
            }
            Frame::Response(resp) => {
                let (status, payload): (u16, &[u8]) = match &resp.status {
                    Status::Success => (STATUS_SUCCESS, &resp.payload),
                    Status::Cancelled => (STATUS_CANCELLED, &resp.payload),
                    Status::Error(msg) => (STATUS_ERROR, msg.as_bytes()),
                };
                dst.put_u32((RESPONSE_HEADER_LEN + payload.len() + 1) as u32);
                dst.put_u8(TYPE_READ_RESPONSE);
                dst.put_u64(resp.block_id);
                dst.put_u16(status);
                dst.put_u32(payload.len() as u32);
                dst.put_slice(payload);
            }
        }
    }

    /// Decode one frame from `src`, consuming its bytes.
    ///
    /// Returns `None` when `src` does not yet hold a complete frame; the
    /// buffer is left untouched in that case so the caller can append more
    /// bytes and retry.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(frame_len));
        }
        if src.len() < 4 + frame_len {
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(frame_len);
        let frame_type = body.get_u8();
        let frame = match frame_type {
            TYPE_READ_REQUEST => {
                check_body(&body, READ_REQUEST_BODY_LEN)?;
                Frame::Read(ReadRequest {
                    block_id: body.get_u64(),
                    offset: body.get_i64(),
                    length: body.get_i64(),
                    lock_id: body.get_i64(),
                    session_id: body.get_i64(),
                })
            }
            TYPE_CANCEL_REQUEST => {
                check_body(&body, CANCEL_REQUEST_BODY_LEN)?;
                Frame::Cancel {
                    block_id: body.get_u64(),
                }
            }
            TYPE_READ_RESPONSE => {
                check_body(&body, RESPONSE_HEADER_LEN)?;
                let block_id = body.get_u64();
                let status_code = body.get_u16();
                let payload_len = body.get_u32() as usize;
                check_body(&body, payload_len)?;
                let payload = body.split_to(payload_len).freeze();
                let (status, payload) = match status_code {
                    STATUS_SUCCESS => (Status::Success, payload),
                    STATUS_CANCELLED => (Status::Cancelled, Bytes::new()),
                    STATUS_ERROR => (
                        Status::Error(String::from_utf8_lossy(&payload).into_owned()),
                        Bytes::new(),
                    ),
                    other => return Err(ProtocolError::UnknownStatus(other)),
                };
                Frame::Response(ReadResponse {
                    block_id,
                    status,
                    payload,
                })
            }
            other => return Err(ProtocolError::UnknownFrameType(other)),
        };
        Ok(Some(frame))
    }
}

fn check_body(body: &BytesMut, expected: usize) -> Result<(), ProtocolError> {
    if body.len() < expected {
        return Err(ProtocolError::TruncatedBody {
            expected,
            actual: body.len(),
        });
    }
    Ok(())
}

/// Stateless codec adapter so a socket transport can drive frames through
/// `tokio_util::codec::Framed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        Frame::decode(src)
    }
}
