//! Record storage shared by every mock node

use std::collections::BTreeMap;

use crate::command::buffer::{
    INFO1_GET_ALL, INFO1_NOBINDATA, INFO2_CREATE_ONLY, INFO2_DELETE, INFO2_GENERATION,
    INFO2_GENERATION_GT, INFO2_RESPOND_ALL_OPS, INFO2_WRITE, INFO3_CREATE_OR_REPLACE,
    INFO3_REPLACE_ONLY, INFO3_UPDATE_ONLY,
};
use crate::command::key::{partition_id, DIGEST_SIZE};
use crate::command::parser::{DecodedMessage, DecodedOperation};
use crate::command::record::server_now;
use crate::command::{OperationType, Value};
use crate::config::{TTL_DONT_EXPIRE, TTL_DONT_UPDATE, TTL_SERVER_DEFAULT};
use crate::utils::ResultCode;

pub(crate) type Digest = [u8; DIGEST_SIZE];

/// Records are ordered by partition, then digest, like a server scan.
pub(crate) type RecordId = (String, usize, Digest);

#[derive(Debug, Clone, Default)]
pub(crate) struct StoredRecord {
    pub set_name: String,
    pub bins: BTreeMap<String, Value>,
    pub generation: u32,
    pub void_time: u32,
}

impl StoredRecord {
    fn expired(&self, now: u32) -> bool {
        self.void_time != 0 && self.void_time <= now
    }
}

/// Result of one single-record request
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub result_code: u8,
    pub generation: u32,
    pub void_time: u32,
    pub bins: Vec<(String, Value)>,
}

impl Outcome {
    fn code(code: ResultCode) -> Self {
        Self {
            result_code: code.code() as u8,
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub(crate) struct Store {
    records: BTreeMap<RecordId, StoredRecord>,
}

pub(crate) fn record_id(namespace: &str, digest: &Digest) -> RecordId {
    (namespace.to_string(), partition_id(digest), *digest)
}

impl Store {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Live record by id.
    pub fn get(&self, id: &RecordId) -> Option<&StoredRecord> {
        self.records.get(id).filter(|r| !r.expired(server_now()))
    }

    /// Live records of one partition after `after`, in digest order.
    pub fn partition(&self, namespace: &str, pid: usize, after: Option<&Digest>) -> Vec<(Digest, StoredRecord)> {
        let now = server_now();
        let start = (namespace.to_string(), pid, after.copied().unwrap_or([0; DIGEST_SIZE]));
        let end = (namespace.to_string(), pid, [0xff; DIGEST_SIZE]);
        self.records
            .range(start..=end)
            .filter(|((_, _, d), _)| after.map(|a| d > a).unwrap_or(true))
            .filter(|(_, r)| !r.expired(now))
            .map(|((_, _, d), r)| (*d, r.clone()))
            .collect()
    }

    /// Apply a single-record request.
    pub fn execute(&mut self, id: RecordId, set_name: &str, msg: &DecodedMessage) -> Outcome {
        let h = &msg.header;
        if h.info2 & INFO2_WRITE != 0 {
            self.write(id, set_name, msg)
        } else {
            self.read(&id, h.info1, &msg.ops)
        }
    }

    fn read(&self, id: &RecordId, info1: u8, ops: &[DecodedOperation]) -> Outcome {
        let Some(record) = self.get(id) else {
            return Outcome::code(ResultCode::KeyNotFoundError);
        };
        let bins = if info1 & INFO1_NOBINDATA != 0 {
            Vec::new()
        } else if info1 & INFO1_GET_ALL != 0 {
            record.bins.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        } else {
            ops.iter()
                .filter_map(|op| record.bins.get(&op.bin_name).map(|v| (op.bin_name.clone(), v.clone())))
                .collect()
        };
        Outcome {
            result_code: 0,
            generation: record.generation,
            void_time: record.void_time,
            bins,
        }
    }

    fn write(&mut self, id: RecordId, set_name: &str, msg: &DecodedMessage) -> Outcome {
        let h = &msg.header;
        let existing = self.get(&id).cloned();
        let exists = existing.is_some();

        if h.info2 & INFO2_DELETE != 0 && msg.ops.is_empty() {
            return match self.records.remove(&id) {
                Some(r) if !r.expired(server_now()) => Outcome::code(ResultCode::Ok),
                _ => Outcome::code(ResultCode::KeyNotFoundError),
            };
        }
        if h.info2 & INFO2_CREATE_ONLY != 0 && exists {
            return Outcome::code(ResultCode::KeyExistsError);
        }
        if h.info3 & (INFO3_UPDATE_ONLY | INFO3_REPLACE_ONLY) != 0 && !exists {
            return Outcome::code(ResultCode::KeyNotFoundError);
        }
        let touch_only = msg.ops.iter().all(|op| op.op == OperationType::Touch as u8);
        if touch_only && !exists {
            return Outcome::code(ResultCode::KeyNotFoundError);
        }
        if let Some(r) = &existing {
            let gen_ok = if h.info2 & INFO2_GENERATION != 0 {
                r.generation == h.generation
            } else if h.info2 & INFO2_GENERATION_GT != 0 {
                h.generation > r.generation
            } else {
                true
            };
            if !gen_ok {
                return Outcome::code(ResultCode::GenerationError);
            }
        }

        let mut record = existing.clone().unwrap_or_default();
        if h.info3 & (INFO3_CREATE_OR_REPLACE | INFO3_REPLACE_ONLY) != 0 {
            record.bins.clear();
        }
        let respond_all = h.info2 & INFO2_RESPOND_ALL_OPS != 0;
        let mut deleted = false;
        let mut results = Vec::new();

        for op in &msg.ops {
            let name = op.bin_name.clone();
            match OperationType::from_u8(op.op) {
                Some(OperationType::Read) => {
                    if let Some(v) = record.bins.get(&name) {
                        results.push((name, v.clone()));
                    }
                    continue;
                }
                Some(OperationType::Write) => {
                    if op.value == Value::Nil {
                        record.bins.remove(&name);
                    } else {
                        record.bins.insert(name.clone(), op.value.clone());
                    }
                }
                Some(OperationType::Add) => {
                    let current = record.bins.get(&name).cloned().unwrap_or(Value::Int(0));
                    match (current, &op.value) {
                        (Value::Int(a), Value::Int(b)) => {
                            record.bins.insert(name.clone(), Value::Int(a.wrapping_add(*b)));
                        }
                        _ => return Outcome::code(ResultCode::BinTypeError),
                    }
                }
                Some(OperationType::Append) | Some(OperationType::Prepend) => {
                    let current = record
                        .bins
                        .get(&name)
                        .cloned()
                        .unwrap_or_else(|| Value::String(String::new()));
                    match (current, &op.value) {
                        (Value::String(a), Value::String(b)) => {
                            let joined = if op.op == OperationType::Append as u8 {
                                a + b
                            } else {
                                b.clone() + &a
                            };
                            record.bins.insert(name.clone(), Value::String(joined));
                        }
                        _ => return Outcome::code(ResultCode::BinTypeError),
                    }
                }
                Some(OperationType::Touch) => {}
                Some(OperationType::Delete) => {
                    record.bins.clear();
                    deleted = true;
                }
                _ => return Outcome::code(ResultCode::ParameterError),
            }
            if respond_all {
                results.push((name, Value::Nil));
            }
        }
        if msg.header.info1 & INFO1_GET_ALL != 0 {
            results.extend(record.bins.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        record.set_name = set_name.to_string();
        record.generation = existing.as_ref().map(|r| r.generation).unwrap_or(0) + 1;
        record.void_time = match h.expiration {
            TTL_DONT_UPDATE => existing.as_ref().map(|r| r.void_time).unwrap_or(0),
            TTL_DONT_EXPIRE | TTL_SERVER_DEFAULT => 0,
            ttl => server_now().saturating_add(ttl),
        };

        let outcome = Outcome {
            result_code: 0,
            generation: record.generation,
            void_time: record.void_time,
            bins: results,
        };
        if deleted || record.bins.is_empty() {
            self.records.remove(&id);
        } else {
            self.records.insert(id, record);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::parser::MessageHeader;

    fn message(info1: u8, info2: u8, expiration: u32, ops: Vec<DecodedOperation>) -> DecodedMessage {
        DecodedMessage {
            header: MessageHeader {
                info1,
                info2,
                info3: 0,
                result_code: 0,
                generation: 0,
                expiration,
                timeout_or_index: 0,
                field_count: 0,
                op_count: ops.len() as u16,
            },
            fields: Vec::new(),
            ops,
        }
    }

    fn op(op: OperationType, name: &str, value: Value) -> DecodedOperation {
        DecodedOperation {
            op: op as u8,
            bin_name: name.to_string(),
            value,
        }
    }

    #[test]
    fn test_write_then_read() {
        let mut store = Store::default();
        let id = record_id("test", &[1; DIGEST_SIZE]);
        let put = message(0, INFO2_WRITE, 0, vec![op(OperationType::Write, "a", Value::Int(1))]);
        assert_eq!(store.execute(id.clone(), "demo", &put).generation, 1);
        let add = message(0, INFO2_WRITE, 0, vec![op(OperationType::Add, "a", Value::Int(4))]);
        assert_eq!(store.execute(id.clone(), "demo", &add).generation, 2);

        let get = message(crate::command::buffer::INFO1_READ | INFO1_GET_ALL, 0, 0, Vec::new());
        let out = store.execute(id, "demo", &get);
        assert_eq!(out.bins, vec![("a".to_string(), Value::Int(5))]);
    }

    #[test]
    fn test_delete_missing_record() {
        let mut store = Store::default();
        let id = record_id("test", &[2; DIGEST_SIZE]);
        let del = message(0, INFO2_WRITE | INFO2_DELETE, 0, Vec::new());
        assert_eq!(
            store.execute(id, "demo", &del).result_code,
            ResultCode::KeyNotFoundError.code() as u8
        );
    }

    #[test]
    fn test_partition_resume() {
        let mut store = Store::default();
        for b in [5u8, 1, 9] {
            let mut digest = [0u8; DIGEST_SIZE];
            digest[19] = b;
            let put = message(0, INFO2_WRITE, 0, vec![op(OperationType::Write, "a", Value::Int(b as i64))]);
            store.execute(record_id("test", &digest), "", &put);
        }
        let all = store.partition("test", 0, None);
        assert_eq!(all.len(), 3);
        let after = store.partition("test", 0, Some(&all[0].0));
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].0, all[1].0);
    }
}
