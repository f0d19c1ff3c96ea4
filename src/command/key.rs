//! Record keys and digests

use std::fmt;

use ripemd::{Digest, Ripemd160};

use super::value::Value;
use crate::cluster::partition::PARTITIONS;
use crate::utils::{Error, Result};

/// Size of a key digest in bytes.
pub const DIGEST_SIZE: usize = 20;

/// Unique record identifier
///
/// The digest is computed once from the set name and user key and drives
/// partition lookup. Keys built from a bare digest carry no user key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key {
    namespace: String,
    set_name: String,
    user_key: Option<KeyValue>,
    digest: [u8; DIGEST_SIZE],
}

/// User key value; only integers, strings and blobs can be keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Int(i64),
    String(String),
    Blob(Vec<u8>),
}

impl KeyValue {
    pub fn to_value(&self) -> Value {
        match self {
            KeyValue::Int(i) => Value::Int(*i),
            KeyValue::String(s) => Value::String(s.clone()),
            KeyValue::Blob(b) => Value::Blob(b.clone()),
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int(i) => Ok(KeyValue::Int(i)),
            Value::String(s) => Ok(KeyValue::String(s)),
            Value::Blob(b) => Ok(KeyValue::Blob(b)),
            other => Err(Error::parameter(format!(
                "unsupported key type: particle {}",
                other.particle_type()
            ))),
        }
    }
}

impl Key {
    /// Build a key and compute its digest.
    pub fn new(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        user_key: impl Into<Value>,
    ) -> Result<Self> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Err(Error::parameter("key namespace is empty"));
        }
        let set_name = set_name.into();
        let value = user_key.into();
        let digest = compute_digest(&set_name, &value)?;
        Ok(Self {
            namespace,
            set_name,
            user_key: Some(KeyValue::from_value(value)?),
            digest,
        })
    }

    /// Build a key from a digest already known, e.g. one returned by a scan.
    pub fn from_digest(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        digest: [u8; DIGEST_SIZE],
    ) -> Self {
        Self {
            namespace: namespace.into(),
            set_name: set_name.into(),
            user_key: None,
            digest,
        }
    }

    pub(crate) fn with_user_key(mut self, user_key: Option<Value>) -> Self {
        self.user_key = user_key.and_then(|v| KeyValue::from_value(v).ok());
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    pub fn user_key(&self) -> Option<&KeyValue> {
        self.user_key.as_ref()
    }

    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    /// Partition the key belongs to.
    pub fn partition_id(&self) -> usize {
        partition_id(&self.digest)
    }
}

/// Partition id derived from the low-order bits of a digest.
pub fn partition_id(digest: &[u8; DIGEST_SIZE]) -> usize {
    let v = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (v as usize) & (PARTITIONS - 1)
}

/// RIPEMD-160 over set name, key particle type and key bytes.
pub fn compute_digest(set_name: &str, user_key: &Value) -> Result<[u8; DIGEST_SIZE]> {
    let key_bytes = user_key.key_bytes()?;
    let mut hasher = Ripemd160::new();
    hasher.update(set_name.as_bytes());
    hasher.update([user_key.particle_type()]);
    hasher.update(&key_bytes);
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.namespace, self.set_name)?;
        match &self.user_key {
            Some(k) => write!(f, "{}", k.to_value())?,
            None => write!(f, "<digest>")?,
        }
        write!(f, ":")?;
        for b in &self.digest {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
