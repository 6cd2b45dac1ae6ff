//! Wire protocol for the silo key-value node.
//!
//! This crate owns everything that touches protocol bytes: the length-prefixed
//! frame header, the data-message sub-header with its TLV fields and bin-ops,
//! reply composition (including batch sub-replies written into shared response
//! blocks), batch row parsing, and the record pickle used for replica writes
//! and flash storage.
//!
//! All multi-byte integers are big-endian on the wire. Parsing swaps them into
//! host order exactly once; parsed structures carry host-order values so
//! downstream code never re-swaps.

pub mod batch;
pub mod frame;
pub mod msg;
pub mod particle;
pub mod pickle;
pub mod reply;
pub mod result;

pub use frame::{FrameType, ProtoHeader, PROTO_HEADER_SIZE, PROTO_SIZE_MAX, PROTO_VERSION};
pub use msg::{Digest, FieldType, MsgHeader, ParsedMsg, MSG_HEADER_SIZE};
pub use particle::{Bin, Particle};
pub use result::ResultCode;

use thiserror::Error;

/// Errors produced while decoding protocol bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unsupported proto version {0}")]
    BadVersion(u8),
    #[error("unknown proto type {0}")]
    BadType(u8),
    #[error("proto body size {0} out of bounds")]
    BadSize(u64),
    #[error("proto body smaller than message header: {0} bytes")]
    ShortBody(usize),
    #[error("incomplete message field")]
    ShortField,
    #[error("message field overruns body")]
    FieldOverrun,
    #[error("incomplete bin op")]
    ShortOp,
    #[error("bin op overruns body")]
    OpOverrun,
    #[error("bad digest length {0}")]
    BadDigest(usize),
    #[error("missing required field {0:?}")]
    MissingField(FieldType),
    #[error("truncated pickle")]
    ShortPickle,
}
