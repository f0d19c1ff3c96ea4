//! Bins and record operations

use super::value::Value;

/// Operation code byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationType {
    Read = 1,
    Write = 2,
    CdtRead = 3,
    CdtModify = 4,
    Add = 5,
    ExpRead = 7,
    ExpModify = 8,
    Append = 9,
    Prepend = 10,
    Touch = 11,
    BitRead = 12,
    BitModify = 13,
    Delete = 14,
    HllRead = 15,
    HllModify = 16,
}

impl OperationType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use OperationType::*;
        Some(match v {
            1 => Read,
            2 => Write,
            3 => CdtRead,
            4 => CdtModify,
            5 => Add,
            7 => ExpRead,
            8 => ExpModify,
            9 => Append,
            10 => Prepend,
            11 => Touch,
            12 => BitRead,
            13 => BitModify,
            14 => Delete,
            15 => HllRead,
            16 => HllModify,
            _ => return None,
        })
    }

    /// Whether the operation only reads.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            OperationType::Read
                | OperationType::CdtRead
                | OperationType::ExpRead
                | OperationType::BitRead
                | OperationType::HllRead
        )
    }
}

/// Named bin value
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    pub name: String,
    pub value: Value,
}

impl Bin {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One step of an `operate` command
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    op: OperationType,
    bin_name: Option<String>,
    value: Value,
    header_only: bool,
}

impl Operation {
    /// Generic constructor; server-typed operations pass their payload as
    /// `Value::Raw`.
    pub fn new(op: OperationType, bin_name: Option<String>, value: Value) -> Self {
        Self {
            op,
            bin_name,
            value,
            header_only: false,
        }
    }

    /// Read all bins.
    pub fn get() -> Self {
        Self::new(OperationType::Read, None, Value::Nil)
    }

    /// Read generation and expiration only.
    pub fn get_header() -> Self {
        Self {
            header_only: true,
            ..Self::get()
        }
    }

    pub fn get_bin(name: impl Into<String>) -> Self {
        Self::new(OperationType::Read, Some(name.into()), Value::Nil)
    }

    pub fn put(bin: Bin) -> Self {
        Self::new(OperationType::Write, Some(bin.name), bin.value)
    }

    pub fn add(bin: Bin) -> Self {
        Self::new(OperationType::Add, Some(bin.name), bin.value)
    }

    pub fn append(bin: Bin) -> Self {
        Self::new(OperationType::Append, Some(bin.name), bin.value)
    }

    pub fn prepend(bin: Bin) -> Self {
        Self::new(OperationType::Prepend, Some(bin.name), bin.value)
    }

    pub fn touch() -> Self {
        Self::new(OperationType::Touch, None, Value::Nil)
    }

    pub fn delete() -> Self {
        Self::new(OperationType::Delete, None, Value::Nil)
    }

    pub fn op_type(&self) -> OperationType {
        self.op
    }

    pub fn bin_name(&self) -> Option<&str> {
        self.bin_name.as_deref()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_header_only(&self) -> bool {
        self.header_only
    }
}
