//! Record pickles: the serialized record form used for replica writes,
//! cross-DC shipping, and the flash-backed store.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! generation u32 | void_time u32 | last_update_time u64 |
//! set_len u8 + set | key_len u32 + key | n_bins u16 |
//! per bin: name_len u8 + name | particle_type u8 | value_len u32 + value
//! ```
//!
//! Zero-length set and key mean "absent".

use crate::particle::{Bin, Particle};
use crate::ParseError;

/// A record in its pickled (transportable) form.
#[derive(Debug, Clone, PartialEq)]
pub struct PickledRecord {
    pub generation: u32,
    pub void_time: u32,
    pub last_update_time: u64,
    pub set_name: Option<String>,
    pub key: Option<Vec<u8>>,
    pub bins: Vec<Bin>,
}

pub fn pickle(rec: &PickledRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&rec.generation.to_be_bytes());
    out.extend_from_slice(&rec.void_time.to_be_bytes());
    out.extend_from_slice(&rec.last_update_time.to_be_bytes());

    let set = rec.set_name.as_deref().unwrap_or("");
    out.push(set.len() as u8);
    out.extend_from_slice(set.as_bytes());

    let key = rec.key.as_deref().unwrap_or(&[]);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);

    out.extend_from_slice(&(rec.bins.len() as u16).to_be_bytes());
    for bin in &rec.bins {
        out.push(bin.name.len() as u8);
        out.extend_from_slice(bin.name.as_bytes());
        out.push(bin.value.wire_type());
        let mut value = Vec::with_capacity(bin.value.wire_size());
        bin.value.write_to(&mut value);
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(&value);
    }

    out
}

pub fn unpickle(buf: &[u8]) -> Result<PickledRecord, ParseError> {
    let mut r = Reader { buf, at: 0 };

    let generation = r.u32()?;
    let void_time = r.u32()?;
    let last_update_time = r.u64()?;

    let set_len = r.u8()? as usize;
    let set = r.take(set_len)?;
    let set_name = if set.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(set).into_owned())
    };

    let key_len = r.u32()? as usize;
    let key = r.take(key_len)?;
    let key = if key.is_empty() {
        None
    } else {
        Some(key.to_vec())
    };

    let n_bins = r.u16()? as usize;
    let mut bins = Vec::with_capacity(n_bins);
    for _ in 0..n_bins {
        let name_len = r.u8()? as usize;
        let name = String::from_utf8_lossy(r.take(name_len)?).into_owned();
        let ptype = r.u8()?;
        let value_len = r.u32()? as usize;
        let value = r.take(value_len)?;
        let particle = Particle::from_wire(ptype, value).ok_or(ParseError::ShortPickle)?;
        bins.push(Bin::new(name, particle));
    }

    Ok(PickledRecord {
        generation,
        void_time,
        last_update_time,
        set_name,
        key,
        bins,
    })
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.at + n > self.buf.len() {
            return Err(ParseError::ShortPickle);
        }
        let out = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, ParseError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pickle_round_trip() {
        let rec = PickledRecord {
            generation: 7,
            void_time: 1234,
            last_update_time: 99_000_000,
            set_name: Some("users".into()),
            key: Some(vec![3, 1, 2, 3]),
            bins: vec![
                Bin::new("n", Particle::Integer(-5)),
                Bin::new("s", Particle::String("x".into())),
                Bin::new("b", Particle::Blob(vec![0xde, 0xad])),
            ],
        };
        let buf = pickle(&rec);
        assert_eq!(unpickle(&buf).unwrap(), rec);
    }

    #[test]
    fn absent_set_and_key() {
        let rec = PickledRecord {
            generation: 1,
            void_time: 0,
            last_update_time: 0,
            set_name: None,
            key: None,
            bins: vec![],
        };
        let buf = pickle(&rec);
        let back = unpickle(&buf).unwrap();
        assert_eq!(back.set_name, None);
        assert_eq!(back.key, None);
    }

    #[test]
    fn truncation_is_error() {
        let rec = PickledRecord {
            generation: 1,
            void_time: 0,
            last_update_time: 0,
            set_name: None,
            key: None,
            bins: vec![Bin::new("a", Particle::Integer(1))],
        };
        let buf = pickle(&rec);
        assert_eq!(
            unpickle(&buf[..buf.len() - 2]).unwrap_err(),
            ParseError::ShortPickle
        );
    }
}
