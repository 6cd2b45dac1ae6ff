//! Length-prefixed frame header.
//!
//! Every request and response travels as `version(1) | type(1) | size(6 BE)`
//! followed by `size` body bytes.

use crate::ParseError;

/// Protocol version understood by this node. Version 0 is tolerated only on
/// security frames, for very old clients.
pub const PROTO_VERSION: u8 = 2;

/// Size of the fixed frame header.
pub const PROTO_HEADER_SIZE: usize = 8;

/// Upper bound on a frame body. Anything larger is a protocol violation and
/// the connection carrying it is closed.
pub const PROTO_SIZE_MAX: u64 = 10 * 1024 * 1024;

/// Frame types carried in the header's second byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Info = 1,
    Security = 2,
    Data = 3,
    DataCompressed = 4,
}

impl FrameType {
    pub fn from_wire(raw: u8) -> Result<Self, ParseError> {
        match raw {
            1 => Ok(FrameType::Info),
            2 => Ok(FrameType::Security),
            3 => Ok(FrameType::Data),
            4 => Ok(FrameType::DataCompressed),
            other => Err(ParseError::BadType(other)),
        }
    }
}

/// Host-order view of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoHeader {
    pub version: u8,
    pub frame_type: FrameType,
    pub sz: u64,
}

/// Outcome of a header decode attempt over a possibly-partial buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderDecode {
    /// Header fully parsed; `sz` body bytes follow.
    Complete(ProtoHeader),
    /// Fewer than eight bytes available.
    Incomplete,
    /// The bytes cannot be a valid header; the connection should be dropped.
    Invalid(ParseError),
}

/// Parse a frame header from the front of `buf`.
///
/// Size bounds are enforced here: zero-size and over-cap frames are invalid.
/// The version check admits version 0 only when the type is security.
pub fn parse_frame_header(buf: &[u8]) -> HeaderDecode {
    if buf.len() < PROTO_HEADER_SIZE {
        return HeaderDecode::Incomplete;
    }

    let version = buf[0];
    let raw_type = buf[1];

    if version != PROTO_VERSION && !(version == 0 && raw_type == FrameType::Security as u8) {
        return HeaderDecode::Invalid(ParseError::BadVersion(version));
    }

    let frame_type = match FrameType::from_wire(raw_type) {
        Ok(t) => t,
        Err(e) => return HeaderDecode::Invalid(e),
    };

    let mut sz: u64 = 0;
    for &b in &buf[2..8] {
        sz = (sz << 8) | u64::from(b);
    }

    if sz == 0 || sz > PROTO_SIZE_MAX {
        return HeaderDecode::Invalid(ParseError::BadSize(sz));
    }

    HeaderDecode::Complete(ProtoHeader {
        version,
        frame_type,
        sz,
    })
}

/// Write a frame header into an eight-byte prefix.
pub fn write_frame_header(out: &mut [u8], frame_type: FrameType, sz: u64) {
    out[0] = PROTO_VERSION;
    out[1] = frame_type as u8;
    out[2] = (sz >> 40) as u8;
    out[3] = (sz >> 32) as u8;
    out[4] = (sz >> 24) as u8;
    out[5] = (sz >> 16) as u8;
    out[6] = (sz >> 8) as u8;
    out[7] = sz as u8;
}
