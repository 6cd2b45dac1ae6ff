//! Data-message parsing: sub-header, TLV fields, bin ops.
//!
//! A parsed message keeps the owned body buffer and describes fields and ops
//! as offsets into it, so nothing is copied during the walk. The walk also
//! records which recognized field types were present in a bitmask, saving
//! downstream stages from re-scanning the TLVs.

use std::fmt;
use std::ops::Range;

use bytes::Bytes;

use crate::frame::{write_frame_header, FrameType, PROTO_HEADER_SIZE};
use crate::particle::Bin;
use crate::ParseError;

/// Size of the data-message sub-header.
pub const MSG_HEADER_SIZE: usize = 22;

// info1 bits.
pub const INFO1_READ: u8 = 0x01;
pub const INFO1_GET_ALL: u8 = 0x02;
pub const INFO1_BATCH: u8 = 0x08;
pub const INFO1_XDR: u8 = 0x10;
pub const INFO1_NOBINDATA: u8 = 0x20;

// info2 bits.
pub const INFO2_WRITE: u8 = 0x01;
pub const INFO2_DELETE: u8 = 0x02;
pub const INFO2_GENERATION: u8 = 0x04;

// info3 bits.
pub const INFO3_LAST: u8 = 0x01;
pub const INFO3_COMMIT_MASTER: u8 = 0x02;

// Bin op codes.
pub const OP_READ: u8 = 1;
pub const OP_WRITE: u8 = 2;

/// Fixed-size opaque key identifier; primary hash key for the in-flight table
/// and for partition assignment.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; 20]);

impl Digest {
    pub const SIZE: usize = 20;

    pub fn from_slice(b: &[u8]) -> Result<Digest, ParseError> {
        if b.len() != Self::SIZE {
            return Err(ParseError::BadDigest(b.len()));
        }
        let mut d = [0u8; 20];
        d.copy_from_slice(b);
        Ok(Digest(d))
    }

    /// Partition id: low 12 bits of the leading bytes.
    pub fn partition_id(&self) -> u16 {
        u16::from_le_bytes([self.0[0], self.0[1]]) & 0x0fff
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Recognized TLV field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Namespace = 0,
    Set = 1,
    Key = 2,
    Digest = 4,
    DigestArray = 6,
    Trid = 7,
    ScanOptions = 8,
    IndexName = 21,
    IndexRange = 22,
    IndexType = 26,
    UdfFilename = 30,
    UdfFunction = 31,
    UdfArgList = 32,
    UdfOp = 33,
    QueryBinList = 40,
    Batch = 41,
    BatchWithSet = 42,
}

impl FieldType {
    pub fn from_wire(raw: u8) -> Option<FieldType> {
        Some(match raw {
            0 => FieldType::Namespace,
            1 => FieldType::Set,
            2 => FieldType::Key,
            4 => FieldType::Digest,
            6 => FieldType::DigestArray,
            7 => FieldType::Trid,
            8 => FieldType::ScanOptions,
            21 => FieldType::IndexName,
            22 => FieldType::IndexRange,
            26 => FieldType::IndexType,
            30 => FieldType::UdfFilename,
            31 => FieldType::UdfFunction,
            32 => FieldType::UdfArgList,
            33 => FieldType::UdfOp,
            40 => FieldType::QueryBinList,
            41 => FieldType::Batch,
            42 => FieldType::BatchWithSet,
            _ => return None,
        })
    }

    /// Bit position in the field-presence mask.
    pub fn bit(self) -> u32 {
        1 << match self {
            FieldType::Namespace => 0,
            FieldType::Set => 1,
            FieldType::Key => 2,
            FieldType::Digest => 3,
            FieldType::DigestArray => 4,
            FieldType::Trid => 5,
            FieldType::ScanOptions => 6,
            FieldType::IndexName => 7,
            FieldType::IndexRange => 8,
            FieldType::IndexType => 9,
            FieldType::UdfFilename => 10,
            FieldType::UdfFunction => 11,
            FieldType::UdfArgList => 12,
            FieldType::UdfOp => 13,
            FieldType::QueryBinList => 14,
            FieldType::Batch => 15,
            FieldType::BatchWithSet => 16,
        }
    }
}

/// Host-order data-message sub-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgHeader {
    pub header_sz: u8,
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub unused: u8,
    pub result_code: u8,
    pub generation: u32,
    pub record_ttl: u32,
    pub transaction_ttl: u32,
    pub n_fields: u16,
    pub n_ops: u16,
}

impl MsgHeader {
    pub fn parse(b: &[u8]) -> Result<MsgHeader, ParseError> {
        if b.len() < MSG_HEADER_SIZE {
            return Err(ParseError::ShortBody(b.len()));
        }
        Ok(MsgHeader {
            header_sz: b[0],
            info1: b[1],
            info2: b[2],
            info3: b[3],
            unused: b[4],
            result_code: b[5],
            generation: u32::from_be_bytes([b[6], b[7], b[8], b[9]]),
            record_ttl: u32::from_be_bytes([b[10], b[11], b[12], b[13]]),
            transaction_ttl: u32::from_be_bytes([b[14], b[15], b[16], b[17]]),
            n_fields: u16::from_be_bytes([b[18], b[19]]),
            n_ops: u16::from_be_bytes([b[20], b[21]]),
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(MSG_HEADER_SIZE as u8);
        out.push(self.info1);
        out.push(self.info2);
        out.push(self.info3);
        out.push(self.unused);
        out.push(self.result_code);
        out.extend_from_slice(&self.generation.to_be_bytes());
        out.extend_from_slice(&self.record_ttl.to_be_bytes());
        out.extend_from_slice(&self.transaction_ttl.to_be_bytes());
        out.extend_from_slice(&self.n_fields.to_be_bytes());
        out.extend_from_slice(&self.n_ops.to_be_bytes());
    }
}

/// A field located in the message body.
#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub ftype: FieldType,
    pub value: Range<usize>,
}

/// A bin op located in the message body.
#[derive(Debug, Clone)]
pub struct OpDesc {
    pub op: u8,
    pub particle_type: u8,
    pub name: Range<usize>,
    pub value: Range<usize>,
}

/// A fully walked data message. Field and op payloads borrow from `body`.
#[derive(Debug, Clone)]
pub struct ParsedMsg {
    pub body: Bytes,
    pub header: MsgHeader,
    pub fields: Vec<FieldDesc>,
    pub ops: Vec<OpDesc>,
    pub field_bits: u32,
    /// Offset just past the last op; trailing bytes beyond it were tolerated.
    pub end: usize,
}

impl ParsedMsg {
    /// Walk a whole data body: sub-header at offset zero, then fields, then
    /// ops.
    pub fn parse(body: Bytes) -> Result<ParsedMsg, ParseError> {
        let header = MsgHeader::parse(&body)?;
        Self::parse_parts(body, header, MSG_HEADER_SIZE)
    }

    /// Walk fields and ops starting at `off`, under an already-known header.
    /// Batch rows use this to present their in-place fields and ops as a
    /// normal single-record message.
    pub fn parse_parts(body: Bytes, header: MsgHeader, off: usize) -> Result<ParsedMsg, ParseError> {
        let mut msg = ParsedMsg {
            body,
            header,
            fields: Vec::with_capacity(header.n_fields as usize),
            ops: Vec::with_capacity(header.n_ops as usize),
            field_bits: 0,
            end: off,
        };
        let end = msg.body.len();
        let mut at = off;

        for _ in 0..header.n_fields {
            if at + 5 > end {
                return Err(ParseError::ShortField);
            }
            let b = &msg.body[at..];
            let field_sz = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize;
            if field_sz < 1 || at + 4 + field_sz > end {
                return Err(ParseError::FieldOverrun);
            }
            let raw_type = b[4];
            let value = at + 5..at + 4 + field_sz;
            at += 4 + field_sz;

            match FieldType::from_wire(raw_type) {
                Some(ftype) => {
                    msg.field_bits |= ftype.bit();
                    msg.fields.push(FieldDesc { ftype, value });
                }
                // Unknown field types are tolerated for forward compatibility.
                None => {
                    tracing::debug!(target: "proto", "skipping message field type {raw_type}");
                }
            }
        }

        for _ in 0..header.n_ops {
            if at + 8 > end {
                return Err(ParseError::ShortOp);
            }
            let b = &msg.body[at..];
            let op_sz = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize;
            let name_sz = b[7] as usize;
            if op_sz < 4 + name_sz || at + 4 + op_sz > end {
                return Err(ParseError::OpOverrun);
            }
            let name = at + 8..at + 8 + name_sz;
            let value = at + 8 + name_sz..at + 4 + op_sz;
            msg.ops.push(OpDesc {
                op: b[4],
                particle_type: b[5],
                name,
                value,
            });
            at += 4 + op_sz;
        }

        // Trailing bytes after fields and ops are tolerated, for compatibility
        // with legacy clients.
        msg.end = at;

        Ok(msg)
    }

    pub fn has_field(&self, t: FieldType) -> bool {
        self.field_bits & t.bit() != 0
    }

    pub fn field(&self, t: FieldType) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|f| f.ftype == t)
            .map(|f| &self.body[f.value.clone()])
    }

    pub fn namespace(&self) -> Option<&[u8]> {
        self.field(FieldType::Namespace)
    }

    pub fn set_name(&self) -> Option<&[u8]> {
        self.field(FieldType::Set)
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.field(FieldType::Key)
    }

    pub fn digest(&self) -> Option<Digest> {
        self.field(FieldType::Digest)
            .and_then(|b| Digest::from_slice(b).ok())
    }

    /// Client transaction id, zero when absent.
    pub fn trid(&self) -> u64 {
        match self.field(FieldType::Trid) {
            Some(b) if b.len() == 8 => u64::from_be_bytes(b.try_into().unwrap()),
            _ => 0,
        }
    }

    pub fn op_name(&self, op: &OpDesc) -> &[u8] {
        &self.body[op.name.clone()]
    }

    pub fn op_value(&self, op: &OpDesc) -> &[u8] {
        &self.body[op.value.clone()]
    }

    pub fn is_batch(&self) -> bool {
        self.header.info1 & INFO1_BATCH != 0
    }

    pub fn is_write(&self) -> bool {
        self.header.info2 & INFO2_WRITE != 0
    }

    pub fn is_udf(&self) -> bool {
        self.has_field(FieldType::UdfFilename)
    }

    pub fn is_xdr(&self) -> bool {
        self.header.info1 & INFO1_XDR != 0
    }
}

/// Builder for composing data-message request frames. Used for internal
/// transactions and by tests standing in for a client.
#[derive(Debug, Default, Clone)]
pub struct MsgBuilder {
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub generation: u32,
    pub record_ttl: u32,
    pub transaction_ttl: u32,
    fields: Vec<(u8, Vec<u8>)>,
    ops: Vec<(u8, Bin)>,
}

impl MsgBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, ftype: FieldType, value: impl Into<Vec<u8>>) -> Self {
        self.fields.push((ftype as u8, value.into()));
        self
    }

    /// Raw field with an arbitrary wire type byte.
    pub fn raw_field(mut self, ftype: u8, value: Vec<u8>) -> Self {
        self.fields.push((ftype, value));
        self
    }

    pub fn op(mut self, op: u8, bin: Bin) -> Self {
        self.ops.push((op, bin));
        self
    }

    /// Serialize the message body (sub-header + fields + ops).
    pub fn build_body(&self) -> Vec<u8> {
        let header = MsgHeader {
            header_sz: MSG_HEADER_SIZE as u8,
            info1: self.info1,
            info2: self.info2,
            info3: self.info3,
            unused: 0,
            result_code: 0,
            generation: self.generation,
            record_ttl: self.record_ttl,
            transaction_ttl: self.transaction_ttl,
            n_fields: self.fields.len() as u16,
            n_ops: self.ops.len() as u16,
        };

        let mut out = Vec::with_capacity(MSG_HEADER_SIZE + 64);
        header.write_to(&mut out);

        for (ftype, value) in &self.fields {
            out.extend_from_slice(&((value.len() + 1) as u32).to_be_bytes());
            out.push(*ftype);
            out.extend_from_slice(value);
        }

        for (op, bin) in &self.ops {
            let name = bin.name.as_bytes();
            let op_sz = 4 + name.len() + bin.value.wire_size();
            out.extend_from_slice(&(op_sz as u32).to_be_bytes());
            out.push(*op);
            out.push(bin.value.wire_type());
            out.push(0); // bin version
            out.push(name.len() as u8);
            out.extend_from_slice(name);
            bin.value.write_to(&mut out);
        }

        out
    }

    /// Serialize a complete frame (proto header + body).
    pub fn build_frame(&self) -> Bytes {
        let body = self.build_body();
        let mut out = vec![0u8; PROTO_HEADER_SIZE];
        write_frame_header(&mut out, FrameType::Data, body.len() as u64);
        out.extend_from_slice(&body);
        Bytes::from(out)
    }
}
