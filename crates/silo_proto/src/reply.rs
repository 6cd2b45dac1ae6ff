//! Reply composition.
//!
//! Single-record replies are composed as standalone frames. Batch sub-replies
//! are written directly into a shared response block at a reserved offset, so
//! the writers here operate on caller-provided slices.

use bytes::Bytes;

use crate::frame::{write_frame_header, FrameType, PROTO_HEADER_SIZE};
use crate::msg::{Digest, FieldType, MsgHeader, INFO3_LAST, MSG_HEADER_SIZE, OP_READ};
use crate::particle::Bin;
use crate::result::ResultCode;

/// Compose a complete single-record reply frame.
///
/// `void_time` rides in the record-ttl slot of the sub-header. A nonzero
/// `trid` is echoed back as a transaction-id field.
pub fn make_reply(
    result_code: ResultCode,
    generation: u32,
    void_time: u32,
    bins: &[Bin],
    trid: u64,
) -> Bytes {
    let n_fields = u16::from(trid != 0);
    let header = MsgHeader {
        header_sz: MSG_HEADER_SIZE as u8,
        result_code: result_code as u8,
        generation,
        record_ttl: void_time,
        n_fields,
        n_ops: bins.len() as u16,
        ..Default::default()
    };

    let mut body = Vec::with_capacity(MSG_HEADER_SIZE + 32 * bins.len());
    header.write_to(&mut body);

    if trid != 0 {
        body.extend_from_slice(&9u32.to_be_bytes());
        body.push(FieldType::Trid as u8);
        body.extend_from_slice(&trid.to_be_bytes());
    }

    for bin in bins {
        write_bin_op(&mut body, bin);
    }

    frame(body)
}

/// Compose an error reply with no bins.
pub fn make_error_reply(result_code: ResultCode, trid: u64) -> Bytes {
    make_reply(result_code, 0, 0, &[], trid)
}

/// Compose the batch trailer: a bare sub-header with the last bit set and the
/// batch-wide result code.
pub fn make_trailer(result_code: ResultCode) -> Bytes {
    let header = MsgHeader {
        header_sz: MSG_HEADER_SIZE as u8,
        info3: INFO3_LAST,
        result_code: result_code as u8,
        ..Default::default()
    };
    let mut body = Vec::with_capacity(MSG_HEADER_SIZE);
    header.write_to(&mut body);
    frame(body)
}

fn frame(body: Vec<u8>) -> Bytes {
    let mut out = vec![0u8; PROTO_HEADER_SIZE];
    write_frame_header(&mut out, FrameType::Data, body.len() as u64);
    out.extend_from_slice(&body);
    Bytes::from(out)
}

fn write_bin_op(out: &mut Vec<u8>, bin: &Bin) {
    let name = bin.name.as_bytes();
    let op_sz = 4 + name.len() + bin.value.wire_size();
    out.extend_from_slice(&(op_sz as u32).to_be_bytes());
    out.push(OP_READ);
    out.push(bin.value.wire_type());
    out.push(0);
    out.push(name.len() as u8);
    out.extend_from_slice(name);
    bin.value.write_to(out);
}

/// Size of a batch error sub-reply: a bare sub-header.
pub const BATCH_ERROR_SIZE: usize = MSG_HEADER_SIZE;

/// Size a batch result sub-reply will occupy in a response block.
pub fn batch_result_size(set_name: Option<&[u8]>, bins: &[Bin]) -> usize {
    let mut size = MSG_HEADER_SIZE + 5 + Digest::SIZE;
    if let Some(s) = set_name {
        size += 5 + s.len();
    }
    for bin in bins {
        size += 8 + bin.name.len() + bin.value.wire_size();
    }
    size
}

/// Write a batch result sub-reply into `out`, which must be exactly
/// `batch_result_size` bytes. The row's `batch_index` is carried in the
/// transaction-ttl slot of the sub-header; this overload is wire-visible and
/// relied upon by clients.
pub fn write_batch_result(
    out: &mut [u8],
    batch_index: u32,
    keyd: &Digest,
    result_code: ResultCode,
    generation: u32,
    void_time: u32,
    set_name: Option<&[u8]>,
    bins: &[Bin],
) {
    let n_fields = 1 + u16::from(set_name.is_some());
    let header = MsgHeader {
        header_sz: MSG_HEADER_SIZE as u8,
        result_code: result_code as u8,
        generation,
        record_ttl: void_time,
        transaction_ttl: batch_index,
        n_fields,
        n_ops: bins.len() as u16,
        ..Default::default()
    };

    let mut buf = Vec::with_capacity(out.len());
    header.write_to(&mut buf);

    buf.extend_from_slice(&((Digest::SIZE + 1) as u32).to_be_bytes());
    buf.push(FieldType::Digest as u8);
    buf.extend_from_slice(&keyd.0);

    if let Some(s) = set_name {
        buf.extend_from_slice(&((s.len() + 1) as u32).to_be_bytes());
        buf.push(FieldType::Set as u8);
        buf.extend_from_slice(s);
    }

    for bin in bins {
        write_bin_op(&mut buf, bin);
    }

    debug_assert_eq!(buf.len(), out.len());
    out.copy_from_slice(&buf);
}

/// Write a batch error sub-reply into `out` (`BATCH_ERROR_SIZE` bytes).
pub fn write_batch_error(out: &mut [u8], batch_index: u32, result_code: ResultCode) {
    let header = MsgHeader {
        header_sz: MSG_HEADER_SIZE as u8,
        result_code: result_code as u8,
        transaction_ttl: batch_index,
        ..Default::default()
    };
    let mut buf = Vec::with_capacity(MSG_HEADER_SIZE);
    header.write_to(&mut buf);
    out.copy_from_slice(&buf);
}
