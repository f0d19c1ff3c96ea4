//! Response parsing
//!
//! Every length taken off the wire is bounds-checked against the received
//! bytes and [`MAX_BUFFER_SIZE`] before it is used.

use super::buffer::{FieldType, MAX_BUFFER_SIZE, MSG_REMAINING_HEADER_SIZE, PROTO_HEADER_SIZE};
use super::key::{Key, DIGEST_SIZE};
use super::record::{ttl_from_void_time, Record};
use super::value::{BinMap, Value};
use crate::utils::{Error, ProtocolError, Result, ResultCode};

/// The 22-byte header that starts every message and every streamed record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub result_code: u8,
    pub generation: u32,
    /// Server void time in requests/responses; the TTL in write requests
    pub expiration: u32,
    /// Server timeout in requests, row index in batch responses
    pub timeout_or_index: u32,
    pub field_count: u16,
    pub op_count: u16,
}

impl MessageHeader {
    pub const SIZE: usize = MSG_REMAINING_HEADER_SIZE as usize;

    pub fn parse(reader: &mut MessageReader<'_>) -> Result<Self> {
        let header_size = reader.read_u8()?;
        if header_size != MSG_REMAINING_HEADER_SIZE {
            return Err(Error::parse(format!("unexpected header size {}", header_size)));
        }
        let info1 = reader.read_u8()?;
        let info2 = reader.read_u8()?;
        let info3 = reader.read_u8()?;
        reader.skip(1)?;
        let result_code = reader.read_u8()?;
        Ok(Self {
            info1,
            info2,
            info3,
            result_code,
            generation: reader.read_u32()?,
            expiration: reader.read_u32()?,
            timeout_or_index: reader.read_u32()?,
            field_count: reader.read_u16()?,
            op_count: reader.read_u16()?,
        })
    }

    pub fn result(&self) -> ResultCode {
        ResultCode::from_code(self.result_code as i32)
    }
}

/// Bounds-checked big-endian cursor over received bytes
pub struct MessageReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > MAX_BUFFER_SIZE {
            return Err(ProtocolError::InvalidSize(n as u64).into());
        }
        if n > self.remaining() {
            return Err(Error::parse(format!(
                "need {} bytes at offset {}, only {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    /// A 4-byte length that must be positive and within bounds.
    fn read_len(&mut self) -> Result<usize> {
        let len = self.read_u32()? as i32;
        if len < 1 {
            return Err(ProtocolError::InvalidSize(len as u64).into());
        }
        let len = len as usize;
        if len > self.remaining() {
            return Err(ProtocolError::InvalidSize(len as u64).into());
        }
        Ok(len)
    }
}

/// Key-related fields of a streamed record
#[derive(Debug, Default)]
pub struct KeyFields {
    pub namespace: String,
    pub set_name: String,
    pub digest: Option<[u8; DIGEST_SIZE]>,
    pub user_key: Option<Value>,
}

impl KeyFields {
    /// Key rebuilt from the fields; `None` when no digest was returned.
    pub fn into_key(self) -> Option<Key> {
        let digest = self.digest?;
        Some(Key::from_digest(self.namespace, self.set_name, digest).with_user_key(self.user_key))
    }
}

/// Read `count` fields, keeping the ones that identify a record.
pub fn parse_key_fields(reader: &mut MessageReader<'_>, count: u16) -> Result<KeyFields> {
    let mut out = KeyFields::default();
    for _ in 0..count {
        let len = reader.read_len()?;
        let field_type = reader.read_u8()?;
        let data = reader.read_bytes(len - 1)?;
        match field_type {
            t if t == FieldType::Namespace as u8 => {
                out.namespace = String::from_utf8_lossy(data).into_owned()
            }
            t if t == FieldType::Table as u8 => {
                out.set_name = String::from_utf8_lossy(data).into_owned()
            }
            t if t == FieldType::DigestRipe as u8 => {
                if data.len() != DIGEST_SIZE {
                    return Err(Error::parse(format!("digest of {} bytes", data.len())));
                }
                let mut digest = [0u8; DIGEST_SIZE];
                digest.copy_from_slice(data);
                out.digest = Some(digest);
            }
            t if t == FieldType::Key as u8 => {
                if let Some((&particle, rest)) = data.split_first() {
                    out.user_key = Some(Value::from_wire(particle, rest)?);
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

/// Read `count` operations into a bin map.
///
/// With `accumulate`, a bin returned more than once collects its values into
/// a list in arrival order; otherwise the last value wins.
pub fn parse_bins(reader: &mut MessageReader<'_>, count: u16, accumulate: bool) -> Result<BinMap> {
    let mut bins = BinMap::with_capacity(count as usize);
    for _ in 0..count {
        let (name, value) = parse_operation(reader)?;
        if !accumulate {
            bins.insert(name, value);
            continue;
        }
        match bins.remove(&name) {
            None => {
                bins.insert(name, value);
            }
            Some(Value::List(mut items)) => {
                items.push(value);
                bins.insert(name, Value::List(items));
            }
            Some(prev) => {
                bins.insert(name, Value::List(vec![prev, value]));
            }
        }
    }
    Ok(bins)
}

fn parse_operation(reader: &mut MessageReader<'_>) -> Result<(String, Value)> {
    let (_, name, value) = parse_raw_operation(reader)?;
    Ok((name, value))
}

/// One operation: (op code, bin name, value)
fn parse_raw_operation(reader: &mut MessageReader<'_>) -> Result<(u8, String, Value)> {
    let size = reader.read_len()?;
    if size < 4 {
        return Err(ProtocolError::InvalidSize(size as u64).into());
    }
    let op = reader.read_u8()?;
    let particle_type = reader.read_u8()?;
    reader.skip(1)?;
    let name_len = reader.read_u8()? as usize;
    if name_len + 4 > size {
        return Err(Error::parse(format!(
            "bin name of {} bytes in operation of {}",
            name_len, size
        )));
    }
    let name = String::from_utf8_lossy(reader.read_bytes(name_len)?).into_owned();
    let value = Value::from_wire(particle_type, reader.read_bytes(size - 4 - name_len)?)?;
    Ok((op, name, value))
}

/// Parse a single-record response body (after the proto header).
///
/// Returns the header and, on success, the record. A non-OK result code is
/// returned in the header and left for the caller to classify.
pub fn parse_record(body: &[u8], accumulate: bool) -> Result<(MessageHeader, Option<Record>)> {
    let mut reader = MessageReader::new(body);
    let header = MessageHeader::parse(&mut reader)?;
    if header.result() != ResultCode::Ok {
        return Ok((header, None));
    }
    parse_key_fields(&mut reader, header.field_count)?;
    let bins = parse_bins(&mut reader, header.op_count, accumulate)?;
    let record = Record::new(
        None,
        bins,
        header.generation,
        ttl_from_void_time(header.expiration),
    );
    Ok((header, Some(record)))
}

/// A request decoded back into its parts
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub header: MessageHeader,
    pub fields: Vec<(u8, Vec<u8>)>,
    pub ops: Vec<DecodedOperation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedOperation {
    pub op: u8,
    pub bin_name: String,
    pub value: Value,
}

impl DecodedMessage {
    pub fn field(&self, field_type: FieldType) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(t, _)| *t == field_type as u8)
            .map(|(_, v)| v.as_slice())
    }

    pub fn field_str(&self, field_type: FieldType) -> Option<String> {
        self.field(field_type)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Key addressed by the message, if it carries a digest.
    pub fn key(&self) -> Result<Option<Key>> {
        let mut fields = KeyFields::default();
        if let Some(ns) = self.field_str(FieldType::Namespace) {
            fields.namespace = ns;
        }
        if let Some(set) = self.field_str(FieldType::Table) {
            fields.set_name = set;
        }
        if let Some(d) = self.field(FieldType::DigestRipe) {
            if d.len() != DIGEST_SIZE {
                return Err(Error::parse(format!("digest of {} bytes", d.len())));
            }
            let mut digest = [0u8; DIGEST_SIZE];
            digest.copy_from_slice(d);
            fields.digest = Some(digest);
        }
        if let Some(k) = self.field(FieldType::Key) {
            if let Some((&particle, rest)) = k.split_first() {
                fields.user_key = Some(Value::from_wire(particle, rest)?);
            }
        }
        Ok(fields.into_key())
    }
}

/// Decode a complete, uncompressed message including its proto header.
pub fn decode_message(message: &[u8]) -> Result<DecodedMessage> {
    if message.len() < PROTO_HEADER_SIZE {
        return Err(Error::parse("truncated message"));
    }
    let mut reader = MessageReader::new(&message[PROTO_HEADER_SIZE..]);
    decode_body(&mut reader)
}

/// Decode one header/fields/operations group at the reader position.
pub fn decode_body(reader: &mut MessageReader<'_>) -> Result<DecodedMessage> {
    let header = MessageHeader::parse(reader)?;
    let mut fields = Vec::with_capacity(header.field_count as usize);
    for _ in 0..header.field_count {
        let len = reader.read_len()?;
        let field_type = reader.read_u8()?;
        fields.push((field_type, reader.read_bytes(len - 1)?.to_vec()));
    }
    let mut ops = Vec::with_capacity(header.op_count as usize);
    for _ in 0..header.op_count {
        let (op, bin_name, value) = parse_raw_operation(reader)?;
        ops.push(DecodedOperation { op, bin_name, value });
    }
    Ok(DecodedMessage {
        header,
        fields,
        ops,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::buffer::{CommandBuffer, INFO2_WRITE};
    use crate::command::operation::{Bin, Operation, OperationType};
    use crate::config::WritePolicy;

    fn encode_put(key: &Key, bins: &[Bin], policy: &WritePolicy) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        buf.begin();
        let fields = buf.estimate_key(key, policy.base.send_key).unwrap();
        for bin in bins {
            buf.estimate_operation_for_bin(&bin.name, &bin.value).unwrap();
        }
        buf.size_buffer(false).unwrap();
        buf.write_header_with_policy(policy, 0, INFO2_WRITE, fields, bins.len());
        buf.write_key(key, policy.base.send_key).unwrap();
        for bin in bins {
            buf.write_operation_for_bin(&bin.name, &bin.value, OperationType::Write)
                .unwrap();
        }
        buf.end().unwrap();
        buf.written().to_vec()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let key = Key::new("test", "demo", "k1").unwrap();
        let bins = vec![
            Bin::new("a", 1i64),
            Bin::new("b", "two"),
            Bin::new("c", vec![3u8, 4]),
            Bin::new("d", 2.5f64),
        ];
        let mut policy = WritePolicy::new(0, 60);
        policy.base.send_key = true;

        let bytes = encode_put(&key, &bins, &policy);
        let decoded = decode_message(&bytes).unwrap();
        let back = decoded.key().unwrap().unwrap();
        assert_eq!(back.namespace(), "test");
        assert_eq!(back.set_name(), "demo");
        assert_eq!(back.digest(), key.digest());
        assert_eq!(back.user_key(), key.user_key());
        assert_eq!(decoded.header.expiration, 60);

        let names: Vec<_> = decoded.ops.iter().map(|o| o.bin_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        for (op, bin) in decoded.ops.iter().zip(&bins) {
            assert_eq!(op.op, OperationType::Write as u8);
            assert_eq!(op.value, bin.value);
        }
    }

    #[test]
    fn test_operate_accumulates_repeated_bins() {
        let ops = [
            Operation::get_bin("x"),
            Operation::get_bin("y"),
            Operation::get_bin("x"),
            Operation::get_bin("x"),
        ];
        let values = [Value::Int(1), Value::Int(9), Value::Int(2), Value::Int(3)];
        let mut buf = CommandBuffer::new();
        buf.begin();
        for (op, v) in ops.iter().zip(&values) {
            buf.estimate_operation_for_bin(op.bin_name().unwrap(), v)
                .unwrap();
        }
        buf.size_buffer(false).unwrap();
        buf.write_header(&Default::default(), 0, 0, 0, ops.len());
        for (op, v) in ops.iter().zip(&values) {
            buf.write_operation_for_bin(op.bin_name().unwrap(), v, op.op_type())
                .unwrap();
        }
        buf.end().unwrap();

        let body = &buf.written()[PROTO_HEADER_SIZE..];
        let (_, record) = parse_record(body, true).unwrap();
        let record = record.unwrap();
        assert_eq!(
            record.bins["x"],
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(record.bins["y"], Value::Int(9));

        let (_, record) = parse_record(body, false).unwrap();
        assert_eq!(record.unwrap().bins["x"], Value::Int(3));
    }

    #[test]
    fn test_error_result_has_no_record() {
        let mut body = vec![0u8; MessageHeader::SIZE];
        body[0] = MSG_REMAINING_HEADER_SIZE;
        body[5] = ResultCode::KeyNotFoundError.code() as u8;
        let (header, record) = parse_record(&body, false).unwrap();
        assert_eq!(header.result(), ResultCode::KeyNotFoundError);
        assert!(record.is_none());
    }

    #[test]
    fn test_oversized_lengths_are_rejected() {
        let mut body = vec![0u8; MessageHeader::SIZE];
        body[0] = MSG_REMAINING_HEADER_SIZE;
        body[21] = 1; // one op
        body.extend_from_slice(&u32::MAX.to_be_bytes());
        body.extend_from_slice(&[1, 1, 0, 1, b'a']);
        assert!(parse_record(&body, false).is_err());

        let mut reader = MessageReader::new(&[0u8; 4]);
        assert!(reader.read_bytes(MAX_BUFFER_SIZE + 1).is_err());
        assert!(reader.read_bytes(5).is_err());
    }

    #[test]
    fn test_truncated_header() {
        assert!(parse_record(&[MSG_REMAINING_HEADER_SIZE, 0, 0], false).is_err());
    }
}
