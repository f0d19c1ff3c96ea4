//! Bin values and their wire representation
//!
//! Only scalar particle types are encoded by the client. Collection and other
//! server-typed particles travel as opaque [`Value::Raw`] bytes.

use std::collections::HashMap;
use std::fmt;

use super::buffer::CommandBuffer;
use crate::utils::{Error, ProtocolError, Result};

/// Particle type byte carried by every operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ParticleType {
    Null = 0,
    Integer = 1,
    Float = 2,
    String = 3,
    Blob = 4,
    Bool = 17,
    Hll = 18,
    Map = 19,
    List = 20,
    GeoJson = 23,
}

impl ParticleType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ParticleType::Null,
            1 => ParticleType::Integer,
            2 => ParticleType::Float,
            3 => ParticleType::String,
            4 => ParticleType::Blob,
            17 => ParticleType::Bool,
            18 => ParticleType::Hll,
            19 => ParticleType::Map,
            20 => ParticleType::List,
            23 => ParticleType::GeoJson,
            _ => return None,
        })
    }
}

/// A bin value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
    GeoJson(String),
    /// Values accumulated client-side for a bin returned more than once.
    /// Never sent to the server.
    List(Vec<Value>),
    /// A particle the client does not interpret, passed through as bytes.
    Raw { particle_type: u8, bytes: Vec<u8> },
}

impl Value {
    pub fn particle_type(&self) -> u8 {
        match self {
            Value::Nil => ParticleType::Null as u8,
            Value::Bool(_) => ParticleType::Bool as u8,
            Value::Int(_) => ParticleType::Integer as u8,
            Value::Float(_) => ParticleType::Float as u8,
            Value::String(_) => ParticleType::String as u8,
            Value::Blob(_) => ParticleType::Blob as u8,
            Value::GeoJson(_) => ParticleType::GeoJson as u8,
            Value::List(_) => ParticleType::List as u8,
            Value::Raw { particle_type, .. } => *particle_type,
        }
    }

    /// Number of bytes `write_to` will emit.
    pub fn estimate_size(&self) -> Result<usize> {
        match self {
            Value::Nil => Ok(0),
            Value::Bool(_) => Ok(1),
            Value::Int(_) | Value::Float(_) => Ok(8),
            Value::String(s) => Ok(s.len()),
            Value::Blob(b) => Ok(b.len()),
            // flags byte + cell count + json
            Value::GeoJson(s) => Ok(3 + s.len()),
            Value::List(_) => Err(ProtocolError::Serialize(
                "accumulated list values cannot be sent to the server".into(),
            )
            .into()),
            Value::Raw { bytes, .. } => Ok(bytes.len()),
        }
    }

    /// Write the wire representation at the buffer cursor; returns bytes written.
    pub fn write_to(&self, buf: &mut CommandBuffer) -> Result<usize> {
        match self {
            Value::Nil => Ok(0),
            Value::Bool(b) => {
                buf.write_u8(u8::from(*b));
                Ok(1)
            }
            Value::Int(i) => {
                buf.write_i64(*i);
                Ok(8)
            }
            Value::Float(f) => {
                buf.write_u64(f.to_bits());
                Ok(8)
            }
            Value::String(s) => Ok(buf.write_bytes(s.as_bytes())),
            Value::Blob(b) => Ok(buf.write_bytes(b)),
            Value::GeoJson(s) => {
                buf.write_u8(0);
                buf.write_u16(0);
                Ok(3 + buf.write_bytes(s.as_bytes()))
            }
            Value::List(_) => Err(ProtocolError::Serialize(
                "accumulated list values cannot be sent to the server".into(),
            )
            .into()),
            Value::Raw { bytes, .. } => Ok(buf.write_bytes(bytes)),
        }
    }

    /// Decode a particle read off the wire.
    pub fn from_wire(particle_type: u8, bytes: &[u8]) -> Result<Value> {
        match ParticleType::from_u8(particle_type) {
            Some(ParticleType::Null) => Ok(Value::Nil),
            Some(ParticleType::Integer) => Ok(Value::Int(be_int(bytes)?)),
            Some(ParticleType::Float) => {
                if bytes.len() != 8 {
                    return Err(Error::parse(format!("float particle of {} bytes", bytes.len())));
                }
                Ok(Value::Float(f64::from_bits(be_int(bytes)? as u64)))
            }
            Some(ParticleType::String) => Ok(Value::String(String::from_utf8_lossy(bytes).into_owned())),
            Some(ParticleType::Blob) => Ok(Value::Blob(bytes.to_vec())),
            Some(ParticleType::Bool) => Ok(Value::Bool(bytes.first().copied().unwrap_or(0) != 0)),
            Some(ParticleType::GeoJson) => {
                if bytes.len() < 3 {
                    return Err(Error::parse("truncated geojson particle"));
                }
                let ncells = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
                let start = 3 + ncells * 8;
                if start > bytes.len() {
                    return Err(Error::parse("truncated geojson particle"));
                }
                Ok(Value::GeoJson(String::from_utf8_lossy(&bytes[start..]).into_owned()))
            }
            _ => Ok(Value::Raw {
                particle_type,
                bytes: bytes.to_vec(),
            }),
        }
    }

    /// Bytes hashed into the digest for a user key.
    pub(crate) fn key_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Value::Int(i) => Ok(i.to_be_bytes().to_vec()),
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            Value::Blob(b) => Ok(b.clone()),
            other => Err(Error::parameter(format!(
                "value of particle type {} cannot be used as a key",
                other.particle_type()
            ))),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::GeoJson(s) => Some(s),
            _ => None,
        }
    }
}

/// Big-endian signed integer of 1 to 8 bytes.
fn be_int(bytes: &[u8]) -> Result<i64> {
    match bytes.len() {
        0 => Ok(0),
        n if n <= 8 => {
            let mut buf = [0u8; 8];
            // sign-extend
            if bytes[0] & 0x80 != 0 {
                buf = [0xff; 8];
            }
            buf[8 - n..].copy_from_slice(bytes);
            Ok(i64::from_be_bytes(buf))
        }
        n => Err(Error::parse(format!("integer particle of {} bytes", n))),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "<nil>"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::GeoJson(s) => write!(f, "GeoJSON({})", s),
            Value::Blob(b) => write!(f, "{:02x?}", b),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Raw {
                particle_type,
                bytes,
            } => write!(f, "<particle {} ({} bytes)>", particle_type, bytes.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

/// Bins of a record, by name
pub type BinMap = HashMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn written(v: &Value) -> (usize, Vec<u8>) {
        let mut buf = CommandBuffer::with_capacity(64);
        buf.reset_for_test(v.estimate_size().unwrap());
        let n = v.write_to(&mut buf).unwrap();
        (n, buf.written().to_vec())
    }

    #[test]
    fn test_int_wire_round_trip() {
        let (n, bytes) = written(&Value::Int(-42));
        assert_eq!(n, 8);
        assert_eq!(Value::from_wire(1, &bytes).unwrap(), Value::Int(-42));
    }

    #[test]
    fn test_short_int_sign_extension() {
        assert_eq!(Value::from_wire(1, &[0xff]).unwrap(), Value::Int(-1));
        assert_eq!(Value::from_wire(1, &[0x01, 0x00]).unwrap(), Value::Int(256));
    }

    #[test]
    fn test_geojson_round_trip() {
        let v = Value::GeoJson("{\"type\":\"Point\",\"coordinates\":[1,2]}".into());
        let (n, bytes) = written(&v);
        assert_eq!(n, v.estimate_size().unwrap());
        assert_eq!(Value::from_wire(23, &bytes).unwrap(), v);
    }

    #[test]
    fn test_list_is_not_encodable() {
        let v = Value::List(vec![Value::Int(1)]);
        assert!(v.estimate_size().is_err());
    }

    #[test]
    fn test_unknown_particle_is_raw() {
        let v = Value::from_wire(20, &[0x91, 0x01]).unwrap();
        assert_eq!(
            v,
            Value::Raw {
                particle_type: 20,
                bytes: vec![0x91, 0x01]
            }
        );
    }

    #[test]
    fn test_key_bytes_rejects_float() {
        assert!(Value::Float(1.5).key_bytes().is_err());
        assert_eq!(Value::Int(1).key_bytes().unwrap(), vec![0, 0, 0, 0, 0, 0, 0, 1]);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Nil),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            any::<f64>().prop_filter("nan", |f| !f.is_nan()).prop_map(Value::Float),
            ".{0,64}".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..128).prop_map(Value::Blob),
        ]
    }

    proptest! {
        #[test]
        fn prop_write_matches_estimate(v in arb_value()) {
            let (n, bytes) = written(&v);
            prop_assert_eq!(n, v.estimate_size().unwrap());
            prop_assert_eq!(bytes.len(), n);
            prop_assert_eq!(Value::from_wire(v.particle_type(), &bytes).unwrap(), v);
        }
    }
}
