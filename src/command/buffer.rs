//! Command buffer: two-pass message builder
//!
//! A command is built by first walking its structure to estimate the total
//! size (`begin` then the `estimate_*` calls), sizing the buffer once
//! (`size_buffer`), then writing the header, fields and operations. `end`
//! checks that exactly the estimated number of bytes was written and fills in
//! the proto header.
//!
//! Message layout, big-endian:
//!
//! ```text
//! [0..8]   proto: version(1) type(1) length(6)
//! [8]      remaining header size (22)
//! [9..12]  info1 info2 info3
//! [12]     unused
//! [13]     result code
//! [14..18] generation
//! [18..22] expiration
//! [22..26] server timeout (ms)
//! [26..28] field count
//! [28..30] operation count
//! fields:  [len(4)][type(1)][data]        len = data + 1
//! ops:     [len(4)][op][particle][0][name len][name][value]   len = 4 + name + value
//! ```

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::key::Key;
use super::operation::{Operation, OperationType};
use super::value::Value;
use super::Expression;
use crate::client::buffer_pool::{BufferPool, MIN_BUFFER_SIZE};
use crate::config::{
    BasePolicy, CommitLevel, GenerationPolicy, ReadModeAP, ReadModeSC, RecordExistsAction,
    WritePolicy,
};
use crate::utils::{ErrorKind, ProtocolError, Result};

pub const CL_MSG_VERSION: u8 = 2;
pub const AS_INFO_MESSAGE_TYPE: u8 = 1;
pub const AS_ADMIN_MESSAGE_TYPE: u8 = 2;
pub const AS_MSG_TYPE: u8 = 3;
pub const AS_MSG_TYPE_COMPRESSED: u8 = 4;

pub const PROTO_HEADER_SIZE: usize = 8;
pub const MSG_REMAINING_HEADER_SIZE: u8 = 22;
pub const MSG_TOTAL_HEADER_SIZE: usize = 30;
pub const FIELD_HEADER_SIZE: usize = 5;
pub const OPERATION_HEADER_SIZE: usize = 8;
/// Longest bin name the server accepts
pub const MAX_BIN_NAME_LEN: usize = 15;

/// Messages at or below this size are never compressed.
pub const COMPRESS_THRESHOLD: usize = 128;
/// Deflate input chunk size.
const COMPRESS_CHUNK: usize = 64 * 1024;
/// Hard ceiling on any size read from or written to the wire.
pub const MAX_BUFFER_SIZE: usize = 120 * 1024 * 1024;

// Read attributes
pub const INFO1_READ: u8 = 1;
pub const INFO1_GET_ALL: u8 = 1 << 1;
pub const INFO1_BATCH: u8 = 1 << 3;
pub const INFO1_NOBINDATA: u8 = 1 << 5;
pub const INFO1_READ_MODE_AP_ALL: u8 = 1 << 6;
pub const INFO1_COMPRESS_RESPONSE: u8 = 1 << 7;

// Write attributes
pub const INFO2_WRITE: u8 = 1;
pub const INFO2_DELETE: u8 = 1 << 1;
pub const INFO2_GENERATION: u8 = 1 << 2;
pub const INFO2_GENERATION_GT: u8 = 1 << 3;
pub const INFO2_DURABLE_DELETE: u8 = 1 << 4;
pub const INFO2_CREATE_ONLY: u8 = 1 << 5;
pub const INFO2_RESPOND_ALL_OPS: u8 = 1 << 7;

// Info attributes
pub const INFO3_LAST: u8 = 1;
pub const INFO3_COMMIT_MASTER: u8 = 1 << 1;
pub const INFO3_PARTITION_DONE: u8 = 1 << 2;
pub const INFO3_UPDATE_ONLY: u8 = 1 << 3;

/// Reject bin names the one-byte length prefix or the server cannot carry.
pub fn check_bin_name(name: &str) -> Result<()> {
    if name.len() > MAX_BIN_NAME_LEN {
        return Err(ErrorKind::BinNameTooLong(name.to_string()).into());
    }
    Ok(())
}
pub const INFO3_CREATE_OR_REPLACE: u8 = 1 << 4;
pub const INFO3_REPLACE_ONLY: u8 = 1 << 5;
pub const INFO3_SC_READ_TYPE: u8 = 1 << 6;
pub const INFO3_SC_READ_RELAX: u8 = 1 << 7;

/// Field type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Namespace = 0,
    Table = 1,
    Key = 2,
    DigestRipe = 4,
    TranId = 7,
    ScanOptions = 8,
    ScanTimeout = 9,
    RecordsPerSecond = 10,
    PidArray = 11,
    DigestArray = 12,
    ScanMaxRecords = 13,
    IndexName = 21,
    IndexRange = 22,
    IndexType = 26,
    UdfPackageName = 30,
    UdfFunction = 31,
    UdfArgList = 32,
    UdfOp = 33,
    QueryBinList = 40,
    BatchIndex = 41,
    BatchIndexWithSet = 42,
    FilterExp = 43,
}

/// Encode a proto header word.
pub fn proto_header(size: usize, msg_type: u8) -> [u8; 8] {
    let proto = (size as u64) | ((CL_MSG_VERSION as u64) << 56) | ((msg_type as u64) << 48);
    proto.to_be_bytes()
}

/// Decode and validate a proto header word into (type, size).
pub fn parse_proto_header(bytes: &[u8]) -> Result<(u8, usize)> {
    if bytes.len() < PROTO_HEADER_SIZE {
        return Err(ProtocolError::Parse("truncated proto header".into()).into());
    }
    let version = bytes[0];
    let msg_type = bytes[1];
    if version != CL_MSG_VERSION {
        return Err(ProtocolError::InvalidVersion(version).into());
    }
    if !matches!(
        msg_type,
        AS_INFO_MESSAGE_TYPE | AS_ADMIN_MESSAGE_TYPE | AS_MSG_TYPE | AS_MSG_TYPE_COMPRESSED
    ) {
        return Err(ProtocolError::InvalidType(msg_type).into());
    }
    let mut size_bytes = [0u8; 8];
    size_bytes[2..].copy_from_slice(&bytes[2..8]);
    let size = u64::from_be_bytes(size_bytes);
    if size > MAX_BUFFER_SIZE as u64 {
        return Err(ProtocolError::InvalidSize(size).into());
    }
    Ok((msg_type, size as usize))
}

/// Reusable message buffer with a write cursor
pub struct CommandBuffer {
    data: Vec<u8>,
    offset: usize,
    estimated: usize,
    compress: bool,
    compressed: Option<Vec<u8>>,
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBuffer {
    /// Buffer taken from the shared pool.
    pub fn new() -> Self {
        Self::with_capacity(MIN_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BufferPool::global().get(capacity),
            offset: 0,
            estimated: 0,
            compress: false,
            compressed: None,
        }
    }

    // ===== Estimation pass =====

    /// Start estimating a new message.
    pub fn begin(&mut self) {
        self.offset = MSG_TOTAL_HEADER_SIZE;
        self.estimated = 0;
        self.compress = false;
        self.compressed = None;
    }

    pub fn estimate(&mut self, bytes: usize) {
        self.offset += bytes;
    }

    pub fn estimate_field(&mut self, data_size: usize) {
        self.offset += data_size + FIELD_HEADER_SIZE;
    }

    pub fn estimate_key(&mut self, key: &Key, send_key: bool) -> Result<usize> {
        let mut fields = 0;
        if !key.namespace().is_empty() {
            self.estimate_field(key.namespace().len());
            fields += 1;
        }
        if !key.set_name().is_empty() {
            self.estimate_field(key.set_name().len());
            fields += 1;
        }
        self.estimate_field(key.digest().len());
        fields += 1;
        if send_key {
            if let Some(user_key) = key.user_key() {
                // particle type byte + value
                self.estimate_field(user_key.to_value().estimate_size()? + 1);
                fields += 1;
            }
        }
        Ok(fields)
    }

    pub fn estimate_operation_for_bin(&mut self, name: &str, value: &Value) -> Result<()> {
        check_bin_name(name)?;
        self.offset += name.len() + OPERATION_HEADER_SIZE + value.estimate_size()?;
        Ok(())
    }

    pub fn estimate_operation_for_bin_name(&mut self, name: &str) -> Result<()> {
        check_bin_name(name)?;
        self.offset += name.len() + OPERATION_HEADER_SIZE;
        Ok(())
    }

    pub fn estimate_operation(&mut self, op: &Operation) -> Result<()> {
        self.offset += OPERATION_HEADER_SIZE;
        if let Some(name) = op.bin_name() {
            check_bin_name(name)?;
            self.offset += name.len();
        }
        self.offset += op.value().estimate_size()?;
        Ok(())
    }

    /// Returns the field data size; zero when there is no expression.
    pub fn estimate_expression(&mut self, exp: Option<&Expression>) -> usize {
        match exp {
            Some(exp) if !exp.is_empty() => {
                self.estimate_field(exp.len());
                exp.len()
            }
            _ => 0,
        }
    }

    /// Fix the message size and prepare for the write pass.
    pub fn size_buffer(&mut self, compress: bool) -> Result<()> {
        let size = self.offset;
        if size > MAX_BUFFER_SIZE {
            return Err(ProtocolError::InvalidSize(size as u64).into());
        }
        self.ensure_len(size);
        self.estimated = size;
        self.compress = compress;
        self.offset = 0;
        Ok(())
    }

    /// Grow the backing storage to at least `len` bytes.
    pub fn ensure_len(&mut self, len: usize) {
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
    }

    // ===== Write pass =====

    /// Header for read-style commands.
    pub fn write_header(
        &mut self,
        policy: &BasePolicy,
        read_attr: u8,
        write_attr: u8,
        field_count: usize,
        op_count: usize,
    ) {
        self.write_header_info3(policy, read_attr, write_attr, 0, field_count, op_count);
    }

    /// Read-style header with extra info3 bits, e.g. partition-done reporting.
    pub fn write_header_info3(
        &mut self,
        policy: &BasePolicy,
        mut read_attr: u8,
        write_attr: u8,
        info3: u8,
        field_count: usize,
        op_count: usize,
    ) {
        let info_attr = info3 | sc_read_bits(policy.read_mode_sc);
        if policy.read_mode_ap == ReadModeAP::All {
            read_attr |= INFO1_READ_MODE_AP_ALL;
        }
        if policy.use_compression {
            read_attr |= INFO1_COMPRESS_RESPONSE;
        }
        self.write_header_fields(read_attr, write_attr, info_attr, 0, 0, field_count, op_count);
    }

    /// Header for write commands: record-exists action, generation and commit level.
    pub fn write_header_with_policy(
        &mut self,
        policy: &WritePolicy,
        mut read_attr: u8,
        mut write_attr: u8,
        field_count: usize,
        op_count: usize,
    ) {
        let mut info_attr = 0u8;
        let mut generation = 0u32;

        match policy.record_exists_action {
            RecordExistsAction::Update => {}
            RecordExistsAction::UpdateOnly => info_attr |= INFO3_UPDATE_ONLY,
            RecordExistsAction::Replace => info_attr |= INFO3_CREATE_OR_REPLACE,
            RecordExistsAction::ReplaceOnly => info_attr |= INFO3_REPLACE_ONLY,
            RecordExistsAction::CreateOnly => write_attr |= INFO2_CREATE_ONLY,
        }

        match policy.generation_policy {
            GenerationPolicy::None => {}
            GenerationPolicy::ExpectGenEqual => {
                generation = policy.generation;
                write_attr |= INFO2_GENERATION;
            }
            GenerationPolicy::ExpectGenGt => {
                generation = policy.generation;
                write_attr |= INFO2_GENERATION_GT;
            }
        }

        if policy.commit_level == CommitLevel::CommitMaster {
            info_attr |= INFO3_COMMIT_MASTER;
        }
        if policy.durable_delete {
            write_attr |= INFO2_DURABLE_DELETE;
        }
        info_attr |= sc_read_bits(policy.base.read_mode_sc);
        if policy.base.read_mode_ap == ReadModeAP::All {
            read_attr |= INFO1_READ_MODE_AP_ALL;
        }
        if policy.base.use_compression {
            read_attr |= INFO1_COMPRESS_RESPONSE;
        }

        self.write_header_fields(
            read_attr,
            write_attr,
            info_attr,
            generation,
            policy.expiration,
            field_count,
            op_count,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn write_header_fields(
        &mut self,
        read_attr: u8,
        write_attr: u8,
        info_attr: u8,
        generation: u32,
        expiration: u32,
        field_count: usize,
        op_count: usize,
    ) {
        self.data[8] = MSG_REMAINING_HEADER_SIZE;
        self.data[9] = read_attr;
        self.data[10] = write_attr;
        self.data[11] = info_attr;
        self.data[12] = 0;
        self.data[13] = 0;
        self.data[14..18].copy_from_slice(&generation.to_be_bytes());
        self.data[18..22].copy_from_slice(&expiration.to_be_bytes());
        // server timeout is filled in per attempt
        self.data[22..26].fill(0);
        self.data[26..28].copy_from_slice(&(field_count as u16).to_be_bytes());
        self.data[28..30].copy_from_slice(&(op_count as u16).to_be_bytes());
        self.offset = MSG_TOTAL_HEADER_SIZE;
    }

    pub fn write_key(&mut self, key: &Key, send_key: bool) -> Result<()> {
        if !key.namespace().is_empty() {
            self.write_field_string(key.namespace(), FieldType::Namespace);
        }
        if !key.set_name().is_empty() {
            self.write_field_string(key.set_name(), FieldType::Table);
        }
        self.write_field_bytes(key.digest(), FieldType::DigestRipe);
        if send_key {
            if let Some(user_key) = key.user_key() {
                self.write_field_value(&user_key.to_value(), FieldType::Key)?;
            }
        }
        Ok(())
    }

    pub fn write_field_header(&mut self, size: usize, field_type: FieldType) {
        self.write_u32((size + 1) as u32);
        self.write_u8(field_type as u8);
    }

    pub fn write_field_string(&mut self, s: &str, field_type: FieldType) {
        self.write_field_header(s.len(), field_type);
        self.write_bytes(s.as_bytes());
    }

    pub fn write_field_bytes(&mut self, b: &[u8], field_type: FieldType) {
        self.write_field_header(b.len(), field_type);
        self.write_bytes(b);
    }

    pub fn write_field_u32(&mut self, v: u32, field_type: FieldType) {
        self.write_field_header(4, field_type);
        self.write_u32(v);
    }

    pub fn write_field_u64(&mut self, v: u64, field_type: FieldType) {
        self.write_field_header(8, field_type);
        self.write_u64(v);
    }

    /// Field holding a particle type byte followed by a value.
    pub fn write_field_value(&mut self, value: &Value, field_type: FieldType) -> Result<()> {
        let size = value.estimate_size()?;
        self.write_field_header(size + 1, field_type);
        self.write_u8(value.particle_type());
        value.write_to(self)?;
        Ok(())
    }

    pub fn write_expression(&mut self, exp: Option<&Expression>) {
        if let Some(exp) = exp {
            if !exp.is_empty() {
                self.write_field_bytes(exp.bytes(), FieldType::FilterExp);
            }
        }
    }

    pub fn write_operation_for_bin(
        &mut self,
        name: &str,
        value: &Value,
        op: OperationType,
    ) -> Result<()> {
        check_bin_name(name)?;
        let value_len = value.estimate_size()?;
        self.write_u32((name.len() + value_len + 4) as u32);
        self.write_u8(op as u8);
        self.write_u8(value.particle_type());
        self.write_u8(0);
        self.write_u8(name.len() as u8);
        self.write_bytes(name.as_bytes());
        let written = value.write_to(self)?;
        if written != value_len {
            return Err(ProtocolError::SizeMismatch {
                estimated: value_len,
                written,
            }
            .into());
        }
        Ok(())
    }

    pub fn write_operation_for_bin_name(&mut self, name: &str, op: OperationType) {
        self.write_u32((name.len() + 4) as u32);
        self.write_u8(op as u8);
        self.write_u8(0);
        self.write_u8(0);
        self.write_u8(name.len() as u8);
        self.write_bytes(name.as_bytes());
    }

    pub fn write_operation(&mut self, op: &Operation) -> Result<()> {
        let name = op.bin_name().unwrap_or("");
        self.write_operation_for_bin(name, op.value(), op.op_type())
    }

    pub fn write_operation_for_type(&mut self, op: OperationType) {
        self.write_u32(4);
        self.write_u8(op as u8);
        self.write_u8(0);
        self.write_u8(0);
        self.write_u8(0);
    }

    /// Finish the message: check the estimate and write the proto header.
    pub fn end(&mut self) -> Result<()> {
        self.end_with_type(AS_MSG_TYPE)
    }

    pub fn end_with_type(&mut self, msg_type: u8) -> Result<()> {
        if self.offset != self.estimated {
            return Err(ProtocolError::SizeMismatch {
                estimated: self.estimated,
                written: self.offset,
            }
            .into());
        }
        let header = proto_header(self.offset - PROTO_HEADER_SIZE, msg_type);
        self.data[..PROTO_HEADER_SIZE].copy_from_slice(&header);
        Ok(())
    }

    /// Stamp the per-attempt server timeout into the header.
    pub fn set_server_timeout(&mut self, timeout_ms: u32) {
        if self.data.len() >= 26 {
            self.data[22..26].copy_from_slice(&timeout_ms.to_be_bytes());
        }
    }

    /// Deflate the finished message if compression was requested and it is
    /// large enough. The uncompressed message stays in the buffer.
    pub fn compress_if_needed(&mut self) -> Result<()> {
        self.compressed = None;
        if !self.compress || self.offset <= COMPRESS_THRESHOLD {
            return Ok(());
        }

        let mut out = Vec::with_capacity(self.offset / 2 + 16);
        out.extend_from_slice(&[0u8; 16]);
        let mut encoder = ZlibEncoder::new(out, Compression::default());
        for chunk in self.data[..self.offset].chunks(COMPRESS_CHUNK) {
            encoder
                .write_all(chunk)
                .map_err(|e| ProtocolError::Serialize(format!("compression failed: {}", e)))?;
        }
        let mut out = encoder
            .finish()
            .map_err(|e| ProtocolError::Serialize(format!("compression failed: {}", e)))?;

        // Only worth sending if it shrank
        if out.len() >= self.offset {
            return Ok(());
        }
        let header = proto_header(out.len() - PROTO_HEADER_SIZE, AS_MSG_TYPE_COMPRESSED);
        out[..8].copy_from_slice(&header);
        out[8..16].copy_from_slice(&(self.offset as u64).to_be_bytes());
        self.compressed = Some(out);
        Ok(())
    }

    /// Bytes to put on the wire.
    pub fn send_bytes(&self) -> &[u8] {
        match &self.compressed {
            Some(c) => c,
            None => &self.data[..self.offset],
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }

    // ===== Raw writers =====

    /// Grow so an overrun of the estimate is caught by `end` instead of panicking.
    #[inline]
    fn room(&mut self, n: usize) {
        let need = self.offset + n;
        if self.data.len() < need {
            self.data.resize(need, 0);
        }
    }

    #[inline]
    pub fn write_u8(&mut self, v: u8) {
        self.room(1);
        self.data[self.offset] = v;
        self.offset += 1;
    }

    #[inline]
    pub fn write_u16(&mut self, v: u16) {
        self.room(2);
        self.data[self.offset..self.offset + 2].copy_from_slice(&v.to_be_bytes());
        self.offset += 2;
    }

    #[inline]
    pub fn write_u16_le(&mut self, v: u16) {
        self.room(2);
        self.data[self.offset..self.offset + 2].copy_from_slice(&v.to_le_bytes());
        self.offset += 2;
    }

    #[inline]
    pub fn write_u32(&mut self, v: u32) {
        self.room(4);
        self.data[self.offset..self.offset + 4].copy_from_slice(&v.to_be_bytes());
        self.offset += 4;
    }

    #[inline]
    pub fn write_u32_at(&mut self, v: u32, pos: usize) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }

    #[inline]
    pub fn write_u64(&mut self, v: u64) {
        self.room(8);
        self.data[self.offset..self.offset + 8].copy_from_slice(&v.to_be_bytes());
        self.offset += 8;
    }

    #[inline]
    pub fn write_i64(&mut self, v: i64) {
        self.write_u64(v as u64);
    }

    #[inline]
    pub fn write_bytes(&mut self, b: &[u8]) -> usize {
        self.room(b.len());
        self.data[self.offset..self.offset + b.len()].copy_from_slice(b);
        self.offset += b.len();
        b.len()
    }

    /// Current cursor position.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.data[..self.offset]
    }

    // ===== Receive side =====

    /// Make room for `len` received bytes and return them for filling.
    pub fn receive_slice(&mut self, len: usize) -> Result<&mut [u8]> {
        if len > MAX_BUFFER_SIZE {
            return Err(ProtocolError::InvalidSize(len as u64).into());
        }
        self.ensure_len(len);
        Ok(&mut self.data[..len])
    }

    /// Whole backing storage, for parsing received bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[cfg(test)]
    pub(crate) fn reset_for_test(&mut self, expected: usize) {
        self.ensure_len(expected);
        self.estimated = expected;
        self.offset = 0;
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        BufferPool::global().put(std::mem::take(&mut self.data));
    }
}

fn sc_read_bits(mode: ReadModeSC) -> u8 {
    match mode {
        ReadModeSC::Session => 0,
        ReadModeSC::Linearize => INFO3_SC_READ_TYPE,
        ReadModeSC::AllowReplica => INFO3_SC_READ_RELAX,
        ReadModeSC::AllowUnavailable => INFO3_SC_READ_TYPE | INFO3_SC_READ_RELAX,
    }
}
