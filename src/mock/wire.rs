//! Reply encoding for the mock server

use crate::command::buffer::{proto_header, FieldType, AS_MSG_TYPE, MSG_REMAINING_HEADER_SIZE};
use crate::command::Value;

/// Header of one reply group.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ReplyHeader {
    pub info3: u8,
    pub result_code: u8,
    pub generation: u32,
    pub void_time: u32,
    pub index: u32,
}

/// Builds the body of one proto message out of reply groups
#[derive(Default)]
pub(crate) struct ReplyWriter {
    body: Vec<u8>,
}

impl ReplyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(&mut self, header: ReplyHeader, fields: &[(FieldType, &[u8])], bins: &[(&str, &Value)]) {
        let b = &mut self.body;
        b.push(MSG_REMAINING_HEADER_SIZE);
        b.push(0);
        b.push(0);
        b.push(header.info3);
        b.push(0);
        b.push(header.result_code);
        b.extend_from_slice(&header.generation.to_be_bytes());
        b.extend_from_slice(&header.void_time.to_be_bytes());
        b.extend_from_slice(&header.index.to_be_bytes());
        b.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        b.extend_from_slice(&(bins.len() as u16).to_be_bytes());
        for (field_type, data) in fields {
            b.extend_from_slice(&((data.len() + 1) as u32).to_be_bytes());
            b.push(*field_type as u8);
            b.extend_from_slice(data);
        }
        for (name, value) in bins {
            let bytes = value_bytes(value);
            b.extend_from_slice(&((4 + name.len() + bytes.len()) as u32).to_be_bytes());
            b.push(1);
            b.push(value.particle_type());
            b.push(0);
            b.push(name.len() as u8);
            b.extend_from_slice(name.as_bytes());
            b.extend_from_slice(&bytes);
        }
    }

    /// Header-only group carrying just a result code.
    pub fn status(&mut self, info3: u8, result_code: u8) {
        self.group(
            ReplyHeader {
                info3,
                result_code,
                ..Default::default()
            },
            &[],
            &[],
        );
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// The message with its proto header.
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.body.len());
        out.extend_from_slice(&proto_header(self.body.len(), AS_MSG_TYPE));
        out.extend_from_slice(&self.body);
        out
    }
}

/// Wire bytes of a stored value.
pub(crate) fn value_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Nil | Value::List(_) => Vec::new(),
        Value::Bool(b) => vec![u8::from(*b)],
        Value::Int(i) => i.to_be_bytes().to_vec(),
        Value::Float(f) => f.to_bits().to_be_bytes().to_vec(),
        Value::String(s) => s.as_bytes().to_vec(),
        Value::Blob(b) => b.clone(),
        Value::GeoJson(s) => {
            let mut out = vec![0, 0, 0];
            out.extend_from_slice(s.as_bytes());
            out
        }
        Value::Raw { bytes, .. } => bytes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::parser::parse_record;

    #[test]
    fn test_reply_parses_as_record() {
        let mut w = ReplyWriter::new();
        let v = Value::Int(7);
        w.group(
            ReplyHeader {
                generation: 3,
                ..Default::default()
            },
            &[],
            &[("a", &v)],
        );
        let msg = w.finish();
        let (header, record) = parse_record(&msg[8..], false).unwrap();
        assert_eq!(header.generation, 3);
        assert_eq!(record.unwrap().bin("a"), Some(&Value::Int(7)));
    }
}
