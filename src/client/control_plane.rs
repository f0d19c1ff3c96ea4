//! Info protocol
//!
//! Text requests used for cluster introspection and administration. A
//! request is a list of command names, each terminated by a newline, sent as
//! a proto message of the info type. The reply carries one `name\tvalue`
//! line per command.
//!
//! The `ControlPlane` trait is the seam nodes and the validator talk
//! through.

use std::collections::HashMap;

use super::connection::Connection;
use crate::command::buffer::{proto_header, AS_INFO_MESSAGE_TYPE, PROTO_HEADER_SIZE};
use crate::utils::{ProtocolError, Result};

/// Info request/response exchange
pub trait ControlPlane {
    /// Send the named info commands; returns the value of each by name.
    fn request_info(&mut self, names: &[&str]) -> Result<HashMap<String, String>>;
}

impl ControlPlane for Connection {
    fn request_info(&mut self, names: &[&str]) -> Result<HashMap<String, String>> {
        let request = encode_info_request(names);
        self.write(&request)?;
        let (msg_type, len) = self.read_message()?;
        if msg_type != AS_INFO_MESSAGE_TYPE {
            self.close();
            return Err(ProtocolError::InvalidType(msg_type).into());
        }
        Ok(parse_info_response(self.body(len)))
    }
}

/// Build a complete info request message.
pub fn encode_info_request(names: &[&str]) -> Vec<u8> {
    let body_len: usize = names.iter().map(|n| n.len() + 1).sum();
    let mut out = Vec::with_capacity(PROTO_HEADER_SIZE + body_len);
    out.extend_from_slice(&proto_header(body_len, AS_INFO_MESSAGE_TYPE));
    for name in names {
        out.extend_from_slice(name.as_bytes());
        out.push(b'\n');
    }
    out
}

/// Split an info reply into `name -> value`.
pub fn parse_info_response(body: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(body);
    text.split('\n')
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once('\t') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (line.to_string(), String::new()),
        })
        .collect()
}

/// Parse a `k1=v1;k2=v2` info value.
pub fn parse_name_value_list(value: &str, separator: char) -> HashMap<String, String> {
    value
        .split(separator)
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
