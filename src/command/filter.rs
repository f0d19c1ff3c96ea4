//! Filter expressions, secondary index filters and query statements
//!
//! Filter expressions are produced by an external expression builder and
//! carried here as already-packed bytes. Secondary index filters are narrow
//! descriptors: bin name, value type and a begin/end range.

use std::fmt;

use super::buffer::{check_bin_name, CommandBuffer};
use super::value::{ParticleType, Value};
use crate::utils::{Error, Result};

/// Packed server-side filter expression
#[derive(Clone, PartialEq, Eq)]
pub struct Expression {
    packed: Vec<u8>,
}

impl Expression {
    /// Wrap bytes produced by an expression builder.
    pub fn from_packed(packed: Vec<u8>) -> Self {
        Self { packed }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.packed
    }

    pub fn len(&self) -> usize {
        self.packed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packed.is_empty()
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expression({} bytes)", self.packed.len())
    }
}

/// Data type of an indexed bin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    Numeric,
    String,
    Geo2DSphere,
}

impl IndexType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::Numeric => "NUMERIC",
            IndexType::String => "STRING",
            IndexType::Geo2DSphere => "GEO2DSPHERE",
        }
    }
}

/// Where the indexed values live inside the bin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IndexCollectionType {
    Default = 0,
    List = 1,
    MapKeys = 2,
    MapValues = 3,
}

impl IndexCollectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexCollectionType::Default => "DEFAULT",
            IndexCollectionType::List => "LIST",
            IndexCollectionType::MapKeys => "MAPKEYS",
            IndexCollectionType::MapValues => "MAPVALUES",
        }
    }
}

/// Secondary index filter descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    bin_name: String,
    collection_type: IndexCollectionType,
    particle_type: u8,
    begin: Value,
    end: Value,
}

impl Filter {
    /// Equality on an integer or string bin.
    pub fn equal(bin_name: impl Into<String>, value: impl Into<Value>) -> Result<Self> {
        let value = value.into();
        let particle_type = match &value {
            Value::Int(_) => ParticleType::Integer as u8,
            Value::String(_) => ParticleType::String as u8,
            other => {
                return Err(Error::parameter(format!(
                    "equality filter does not support particle type {}",
                    other.particle_type()
                )))
            }
        };
        Ok(Self {
            bin_name: bin_name.into(),
            collection_type: IndexCollectionType::Default,
            particle_type,
            begin: value.clone(),
            end: value,
        })
    }

    /// Inclusive integer range.
    pub fn range(bin_name: impl Into<String>, begin: i64, end: i64) -> Self {
        Self {
            bin_name: bin_name.into(),
            collection_type: IndexCollectionType::Default,
            particle_type: ParticleType::Integer as u8,
            begin: Value::Int(begin),
            end: Value::Int(end),
        }
    }

    /// Target list elements, map keys or map values instead of the bin itself.
    pub fn with_collection_type(mut self, collection_type: IndexCollectionType) -> Self {
        self.collection_type = collection_type;
        self
    }

    pub fn bin_name(&self) -> &str {
        &self.bin_name
    }

    pub fn collection_type(&self) -> IndexCollectionType {
        self.collection_type
    }

    pub fn begin(&self) -> &Value {
        &self.begin
    }

    pub fn end(&self) -> &Value {
        &self.end
    }

    /// Encoded size: name length, name, particle type, two length-prefixed values.
    pub fn estimate_size(&self) -> Result<usize> {
        Ok(self.bin_name.len() + 10 + self.begin.estimate_size()? + self.end.estimate_size()?)
    }

    pub fn write_to(&self, buf: &mut CommandBuffer) -> Result<usize> {
        let start = buf.offset();
        buf.write_u8(self.bin_name.len() as u8);
        buf.write_bytes(self.bin_name.as_bytes());
        buf.write_u8(self.particle_type);
        buf.write_u32(self.begin.estimate_size()? as u32);
        self.begin.write_to(buf)?;
        buf.write_u32(self.end.estimate_size()? as u32);
        self.end.write_to(buf)?;
        Ok(buf.offset() - start)
    }

    /// Decode a filter written by `write_to`; returns the filter and bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Filter, usize)> {
        let truncated = || Error::parse("truncated index filter");
        let name_len = *bytes.first().ok_or_else(truncated)? as usize;
        let mut pos = 1;
        let name = bytes.get(pos..pos + name_len).ok_or_else(truncated)?;
        pos += name_len;
        let particle_type = *bytes.get(pos).ok_or_else(truncated)?;
        pos += 1;
        let read_value = |pos: &mut usize| -> Result<Value> {
            let len_bytes = bytes.get(*pos..*pos + 4).ok_or_else(truncated)?;
            let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
                as usize;
            *pos += 4;
            let v = bytes.get(*pos..*pos + len).ok_or_else(truncated)?;
            *pos += len;
            Value::from_wire(particle_type, v)
        };
        let begin = read_value(&mut pos)?;
        let end = read_value(&mut pos)?;
        Ok((
            Filter {
                bin_name: String::from_utf8_lossy(name).into_owned(),
                collection_type: IndexCollectionType::Default,
                particle_type,
                begin,
                end,
            },
            pos,
        ))
    }

    /// Whether a bin value falls inside this filter.
    pub fn matches(&self, value: &Value) -> bool {
        match (value, &self.begin, &self.end) {
            (Value::Int(v), Value::Int(b), Value::Int(e)) => b <= v && v <= e,
            (Value::String(v), Value::String(b), _) => v == b,
            _ => false,
        }
    }
}

/// Query target and projection
#[derive(Debug, Clone, Default)]
pub struct Statement {
    pub namespace: String,
    pub set_name: String,
    pub index_name: String,
    /// Bins to return; all bins when empty
    pub bin_names: Vec<String>,
    /// Secondary index filter; without one the query runs as a partition scan
    pub filter: Option<Filter>,
}

impl Statement {
    pub fn new(namespace: impl Into<String>, set_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            set_name: set_name.into(),
            ..Default::default()
        }
    }

    pub fn with_bins(mut self, bins: &[&str]) -> Self {
        self.bin_names = bins.iter().map(|b| b.to_string()).collect();
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_index_name(mut self, index_name: impl Into<String>) -> Self {
        self.index_name = index_name.into();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::parameter("statement namespace is empty"));
        }
        for bin in &self.bin_names {
            check_bin_name(bin)?;
        }
        if let Some(filter) = &self.filter {
            check_bin_name(filter.bin_name())?;
        }
        Ok(())
    }
}
