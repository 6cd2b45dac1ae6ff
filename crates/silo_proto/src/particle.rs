//! Bin values and their wire encodings.

/// Wire particle type tags.
pub const PARTICLE_NULL: u8 = 0;
pub const PARTICLE_INTEGER: u8 = 1;
pub const PARTICLE_FLOAT: u8 = 2;
pub const PARTICLE_STRING: u8 = 3;
pub const PARTICLE_BLOB: u8 = 4;

/// A typed bin value.
///
/// Integers and floats travel as eight big-endian bytes; strings and blobs as
/// raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Particle {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
}

impl Particle {
    pub fn wire_type(&self) -> u8 {
        match self {
            Particle::Null => PARTICLE_NULL,
            Particle::Integer(_) => PARTICLE_INTEGER,
            Particle::Float(_) => PARTICLE_FLOAT,
            Particle::String(_) => PARTICLE_STRING,
            Particle::Blob(_) => PARTICLE_BLOB,
        }
    }

    /// Size of the encoded value, excluding any op framing.
    pub fn wire_size(&self) -> usize {
        match self {
            Particle::Null => 0,
            Particle::Integer(_) | Particle::Float(_) => 8,
            Particle::String(s) => s.len(),
            Particle::Blob(b) => b.len(),
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Particle::Null => {}
            Particle::Integer(v) => out.extend_from_slice(&v.to_be_bytes()),
            Particle::Float(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
            Particle::String(s) => out.extend_from_slice(s.as_bytes()),
            Particle::Blob(b) => out.extend_from_slice(b),
        }
    }

    /// Decode a particle from its wire type tag and value bytes.
    pub fn from_wire(ptype: u8, value: &[u8]) -> Option<Particle> {
        match ptype {
            PARTICLE_NULL => Some(Particle::Null),
            PARTICLE_INTEGER => {
                if value.len() != 8 {
                    return None;
                }
                let mut b = [0u8; 8];
                b.copy_from_slice(value);
                Some(Particle::Integer(i64::from_be_bytes(b)))
            }
            PARTICLE_FLOAT => {
                if value.len() != 8 {
                    return None;
                }
                let mut b = [0u8; 8];
                b.copy_from_slice(value);
                Some(Particle::Float(f64::from_bits(u64::from_be_bytes(b))))
            }
            PARTICLE_STRING => String::from_utf8(value.to_vec()).ok().map(Particle::String),
            PARTICLE_BLOB => Some(Particle::Blob(value.to_vec())),
            _ => None,
        }
    }
}

/// A named bin.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    pub name: String,
    pub value: Particle,
}

impl Bin {
    pub fn new(name: impl Into<String>, value: Particle) -> Self {
        Bin {
            name: name.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trip() {
        let p = Particle::Integer(-42);
        let mut buf = Vec::new();
        p.write_to(&mut buf);
        assert_eq!(Particle::from_wire(p.wire_type(), &buf), Some(p));
    }

    #[test]
    fn string_round_trip() {
        let p = Particle::String("hello".into());
        let mut buf = Vec::new();
        p.write_to(&mut buf);
        assert_eq!(buf, b"hello");
        assert_eq!(Particle::from_wire(PARTICLE_STRING, &buf), Some(p));
    }

    #[test]
    fn bad_integer_length_rejected() {
        assert_eq!(Particle::from_wire(PARTICLE_INTEGER, &[1, 2, 3]), None);
    }
}
