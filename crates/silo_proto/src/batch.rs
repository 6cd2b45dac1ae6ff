//! Batch request row parsing.
//!
//! A batch field carries `count: u32 BE | inline_info: u8 | rows…`. Rows come
//! in two shapes:
//!
//! - full: `index(4 BE) | digest(20) | repeat = 0 | info1(1) | n_fields(2 BE)
//!   | n_ops(2 BE)` followed by fields (namespace first) and ops in place;
//! - repeat: `index(4 BE) | digest(20) | repeat = 1`, reusing the previous
//!   row's namespace, fields, and ops.
//!
//! Rows are walked in place within the received body; a row's fields and ops
//! are surfaced as a normal [`ParsedMsg`] whose descriptors index into the
//! shared buffer, so no per-row allocation of message bytes happens.

use bytes::Bytes;

use crate::msg::{Digest, MsgHeader, ParsedMsg, MSG_HEADER_SIZE};
use crate::ParseError;

/// Bytes occupied by a repeat row.
pub const BATCH_REPEAT_ROW_SIZE: usize = 25;

/// Bytes occupied by a full row's fixed header.
pub const BATCH_FULL_ROW_HEADER_SIZE: usize = 30;

/// Decoded batch-field prefix.
#[derive(Debug, Clone, Copy)]
pub struct BatchHeader {
    /// Declared sub-transaction count.
    pub tran_count: u32,
    /// Nonzero when the client permits inline processing.
    pub allow_inline: u8,
    /// Offset of the first row, relative to the whole message body.
    pub rows_off: usize,
}

/// Decode the count and inline byte at the front of the batch field.
/// `field_off` is the offset of the batch field's value within `body`.
pub fn parse_batch_header(body: &[u8], field_off: usize) -> Result<BatchHeader, ParseError> {
    if field_off + 5 > body.len() {
        return Err(ParseError::ShortField);
    }
    let b = &body[field_off..];
    Ok(BatchHeader {
        tran_count: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        allow_inline: b[4],
        rows_off: field_off + 5,
    })
}

/// One batch row, ready to dispatch as a sub-transaction.
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub index: u32,
    pub keyd: Digest,
    pub repeat: bool,
    pub msg: ParsedMsg,
}

/// Walks rows in place. Stops (returns `None`) at the first malformed or
/// truncated row; the caller compares rows produced against the declared
/// count and accounts for the shortfall.
pub struct BatchRows {
    body: Bytes,
    at: usize,
    parent_ttl: u32,
    prev: Option<ParsedMsg>,
}

impl BatchRows {
    pub fn new(body: Bytes, rows_off: usize, parent_ttl: u32) -> Self {
        BatchRows {
            body,
            at: rows_off,
            parent_ttl,
            prev: None,
        }
    }

    pub fn next_row(&mut self) -> Option<BatchRow> {
        let limit = self.body.len();
        if self.at + BATCH_REPEAT_ROW_SIZE > limit {
            return None;
        }

        let b = &self.body[self.at..];
        let index = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        let keyd = Digest::from_slice(&b[4..24]).ok()?;
        let repeat = b[24] != 0;

        if repeat {
            // Reuses the previous row's namespace and ops; a leading repeat
            // row has nothing to repeat and ends the walk.
            let msg = self.prev.clone()?;
            self.at += BATCH_REPEAT_ROW_SIZE;
            return Some(BatchRow {
                index,
                keyd,
                repeat,
                msg,
            });
        }

        if self.at + BATCH_FULL_ROW_HEADER_SIZE > limit {
            return None;
        }

        let info1 = b[25];
        let mut n_fields = u16::from_be_bytes([b[26], b[27]]);
        let n_ops = u16::from_be_bytes([b[28], b[29]]);

        // Older clients sent zero but always sent the namespace field.
        if n_fields == 0 {
            n_fields = 1;
        }

        let header = MsgHeader {
            header_sz: MSG_HEADER_SIZE as u8,
            info1,
            transaction_ttl: self.parent_ttl,
            n_fields,
            n_ops,
            ..Default::default()
        };

        let row_body_off = self.at + BATCH_FULL_ROW_HEADER_SIZE;
        let msg = ParsedMsg::parse_parts(self.body.clone(), header, row_body_off).ok()?;
        self.at = msg.end;
        self.prev = Some(msg.clone());

        Some(BatchRow {
            index,
            keyd,
            repeat,
            msg,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::FieldType;

    fn digest(last: u8) -> Digest {
        let mut d = [0u8; 20];
        d[19] = last;
        Digest(d)
    }

    /// Hand-build a batch body: count, inline byte, then rows.
    pub fn build_rows(rows: &[(u32, Digest, bool)]) -> (Bytes, usize) {
        let mut out = Vec::new();
        out.extend_from_slice(&(rows.len() as u32).to_be_bytes());
        out.push(1); // allow inline

        for (index, keyd, repeat) in rows {
            out.extend_from_slice(&index.to_be_bytes());
            out.extend_from_slice(&keyd.0);
            out.push(u8::from(*repeat));
            if !*repeat {
                out.push(crate::msg::INFO1_READ | crate::msg::INFO1_GET_ALL);
                out.extend_from_slice(&1u16.to_be_bytes()); // n_fields
                out.extend_from_slice(&0u16.to_be_bytes()); // n_ops
                let ns = b"test";
                out.extend_from_slice(&((ns.len() + 1) as u32).to_be_bytes());
                out.push(FieldType::Namespace as u8);
                out.extend_from_slice(ns);
            }
        }

        (Bytes::from(out), 5)
    }

    #[test]
    fn full_and_repeat_rows() {
        let (body, rows_off) = build_rows(&[
            (0, digest(1), false),
            (1, digest(2), true),
            (2, digest(3), true),
        ]);

        let header = parse_batch_header(&body, 0).unwrap();
        assert_eq!(header.tran_count, 3);
        assert_eq!(header.rows_off, rows_off);

        let mut rows = BatchRows::new(body, rows_off, 500);
        let r0 = rows.next_row().unwrap();
        assert_eq!(r0.index, 0);
        assert_eq!(r0.keyd, digest(1));
        assert!(!r0.repeat);
        assert_eq!(r0.msg.namespace(), Some(&b"test"[..]));
        assert_eq!(r0.msg.header.transaction_ttl, 500);

        let r1 = rows.next_row().unwrap();
        assert!(r1.repeat);
        assert_eq!(r1.keyd, digest(2));
        // Repeat rows reuse the previous row's parsed fields.
        assert_eq!(r1.msg.namespace(), Some(&b"test"[..]));

        let r2 = rows.next_row().unwrap();
        assert_eq!(r2.index, 2);
        assert!(rows.next_row().is_none());
    }

    #[test]
    fn truncated_row_stops_walk() {
        let (body, rows_off) = build_rows(&[(0, digest(1), false), (1, digest(2), false)]);
        // Drop the last few bytes so the second row is short.
        let truncated = body.slice(..body.len() - 4);
        let mut rows = BatchRows::new(truncated, rows_off, 0);
        assert!(rows.next_row().is_some());
        assert!(rows.next_row().is_none());
    }

    #[test]
    fn leading_repeat_row_rejected() {
        let (body, rows_off) = build_rows(&[(0, digest(1), true)]);
        let mut rows = BatchRows::new(body, rows_off, 0);
        assert!(rows.next_row().is_none());
    }
}
