//! Batch reads
//!
//! Keys are grouped by the node that serves them and each group is sent as
//! one batch-index request. Every key reads the same selection, or each key
//! carries its own ([`BatchReadRecord`]). Groups run concurrently, bounded by the batch
//! policy; results land in a shared table indexed by the key's position in
//! the caller's slice.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use super::buffer::{
    check_bin_name, CommandBuffer, FieldType, FIELD_HEADER_SIZE, INFO1_BATCH, INFO1_GET_ALL, INFO1_NOBINDATA,
    INFO1_READ, INFO3_LAST, OPERATION_HEADER_SIZE,
};
use super::executor::{execute, execute_from, Command};
use super::key::{Key, DIGEST_SIZE};
use super::operation::OperationType;
use super::orchestrator::run_bounded;
use super::parser::{parse_bins, parse_key_fields, MessageHeader, MessageReader};
use super::record::{ttl_from_void_time, Record};
use crate::client::connection::Connection;
use crate::cluster::{Cluster, Node, Partition};
use crate::config::{BasePolicy, BatchPolicy, Replica};
use crate::utils::{Error, Result, ResultCode};

/// What each key of a batch reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchRead {
    /// All bins, or the listed ones
    Get(Option<Vec<String>>),
    Header,
    Exists,
}

impl BatchRead {
    fn read_attr(&self) -> u8 {
        match self {
            BatchRead::Get(Some(bins)) if !bins.is_empty() => INFO1_READ,
            BatchRead::Get(_) => INFO1_READ | INFO1_GET_ALL,
            BatchRead::Header | BatchRead::Exists => INFO1_READ | INFO1_NOBINDATA,
        }
    }

    fn bin_names(&self) -> &[String] {
        match self {
            BatchRead::Get(Some(bins)) => bins,
            _ => &[],
        }
    }
}

/// One key of a batch where every key picks its own bins
#[derive(Debug, Clone)]
pub struct BatchReadRecord {
    pub key: Key,
    pub read: BatchRead,
    /// Filled in by the batch; `None` when the key was not found
    pub record: Option<Record>,
}

impl BatchReadRecord {
    pub fn new(key: Key, read: BatchRead) -> Self {
        Self {
            key,
            read,
            record: None,
        }
    }

    /// Read only `bins` of `key`.
    pub fn with_bins(key: Key, bins: &[&str]) -> Self {
        let bins = bins.iter().map(|b| b.to_string()).collect();
        Self::new(key, BatchRead::Get(Some(bins)))
    }
}

/// Outcome of a batch call
#[derive(Debug)]
pub struct BatchResults<T> {
    /// One entry per requested key, in request order
    pub values: Vec<T>,
    /// Chained per-node errors; only set when partial results are allowed
    pub error: Option<Error>,
    /// Rows skipped by the filter expression
    pub filtered_out: usize,
}

impl<T> BatchResults<T> {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Keys of one batch destined for one node
#[derive(Debug, Clone)]
pub struct BatchNode {
    pub node: Arc<Node>,
    /// Positions in the caller's key slice
    pub offsets: Vec<usize>,
}

/// Group `offsets` of `keys` by the node that should serve them.
pub fn split_keys(
    cluster: &Cluster,
    policy: &BasePolicy,
    keys: &[Key],
    offsets: &[usize],
    sequence: usize,
) -> Result<Vec<BatchNode>> {
    let node_count = cluster.nodes().len().max(1);
    let per_node = (offsets.len() / node_count) * 5 / 4;
    let capacity = per_node.max(10);

    let mut groups: Vec<BatchNode> = Vec::with_capacity(node_count);
    for &offset in offsets {
        let mut partition = Partition::for_read(cluster, policy, &keys[offset])?;
        partition.sequence = sequence;
        let node = partition.node_read(cluster)?;
        match groups.iter_mut().find(|g| Arc::ptr_eq(&g.node, &node)) {
            Some(group) => group.offsets.push(offset),
            None => {
                let mut group = BatchNode {
                    node,
                    offsets: Vec::with_capacity(capacity),
                };
                group.offsets.push(offset);
                groups.push(group);
            }
        }
    }
    Ok(groups)
}

/// Result table shared by the sub-commands of one batch
struct BatchShared {
    records: Mutex<Vec<Option<Record>>>,
    filtered_out: AtomicUsize,
}

impl BatchShared {
    fn new(len: usize) -> Self {
        Self {
            records: Mutex::new(vec![None; len]),
            filtered_out: AtomicUsize::new(0),
        }
    }
}

/// One batch-index request against one node
struct BatchCommand<'a> {
    policy: &'a BatchPolicy,
    keys: &'a [Key],
    /// One shared selection, or one per key
    reads: &'a [BatchRead],
    batch: BatchNode,
    shared: &'a BatchShared,
    sequence: usize,
}

impl<'a> BatchCommand<'a> {
    fn new(
        policy: &'a BatchPolicy,
        keys: &'a [Key],
        reads: &'a [BatchRead],
        batch: BatchNode,
        shared: &'a BatchShared,
        sequence: usize,
    ) -> Self {
        Self {
            policy,
            keys,
            reads,
            batch,
            shared,
            sequence,
        }
    }

    fn read_for(&self, offset: usize) -> &BatchRead {
        match self.reads {
            [read] => read,
            reads => &reads[offset],
        }
    }

    /// Whether the key at `prev` is encoded such that `cur` can repeat it.
    fn same_as_previous(&self, prev: Option<usize>, cur: usize) -> bool {
        let Some(prev) = prev else {
            return false;
        };
        let (a, b) = (&self.keys[prev], &self.keys[cur]);
        a.namespace() == b.namespace()
            && (!self.policy.send_set_name || a.set_name() == b.set_name())
            && self.read_for(prev) == self.read_for(cur)
    }

    fn batch_field_size(&self) -> Result<usize> {
        // count + allow_inline
        let mut size = 5;
        let mut prev = None;
        for &offset in &self.batch.offsets {
            size += 4 + DIGEST_SIZE + 1;
            if !self.same_as_previous(prev, offset) {
                let key = &self.keys[offset];
                let bins = self.read_for(offset).bin_names();
                for bin in bins {
                    check_bin_name(bin)?;
                }
                size += 1 + 2 + 2;
                size += FIELD_HEADER_SIZE + key.namespace().len();
                if self.policy.send_set_name {
                    size += FIELD_HEADER_SIZE + key.set_name().len();
                }
                size += bins
                    .iter()
                    .map(|b| OPERATION_HEADER_SIZE + b.len())
                    .sum::<usize>();
            }
            prev = Some(offset);
        }
        Ok(size)
    }

    fn write_batch_field(&self, buf: &mut CommandBuffer, size: usize) {
        let field_type = if self.policy.send_set_name {
            FieldType::BatchIndexWithSet
        } else {
            FieldType::BatchIndex
        };
        buf.write_field_header(size, field_type);
        buf.write_u32(self.batch.offsets.len() as u32);
        buf.write_u8(u8::from(self.policy.allow_inline));

        let mut prev = None;
        for &offset in &self.batch.offsets {
            let key = &self.keys[offset];
            buf.write_u32(offset as u32);
            buf.write_bytes(key.digest());
            if self.same_as_previous(prev, offset) {
                buf.write_u8(1);
            } else {
                let read = self.read_for(offset);
                let bins = read.bin_names();
                buf.write_u8(0);
                buf.write_u8(read.read_attr());
                buf.write_u16(if self.policy.send_set_name { 2 } else { 1 });
                buf.write_u16(bins.len() as u16);
                buf.write_field_string(key.namespace(), FieldType::Namespace);
                if self.policy.send_set_name {
                    buf.write_field_string(key.set_name(), FieldType::Table);
                }
                for bin in bins {
                    buf.write_operation_for_bin_name(bin, OperationType::Read);
                }
            }
            prev = Some(offset);
        }
    }

    /// Parse the records of one proto message. Returns true once the last
    /// group of the stream has been seen.
    fn parse_group(&self, body: &[u8]) -> Result<bool> {
        let mut reader = MessageReader::new(body);
        while !reader.is_empty() {
            let header = MessageHeader::parse(&mut reader)?;
            let code = header.result();
            if header.info3 & INFO3_LAST != 0 {
                if code != ResultCode::Ok {
                    return Err(Error::server(code));
                }
                return Ok(true);
            }

            let index = header.timeout_or_index as usize;
            if index >= self.keys.len() {
                return Err(Error::parse(format!("batch index {} out of range", index)));
            }
            parse_key_fields(&mut reader, header.field_count)?;
            let bins = parse_bins(&mut reader, header.op_count, false)?;

            match code {
                ResultCode::Ok => {
                    let record = Record::new(
                        Some(self.keys[index].clone()),
                        bins,
                        header.generation,
                        ttl_from_void_time(header.expiration),
                    );
                    self.shared.records.lock()[index] = Some(record);
                }
                ResultCode::KeyNotFoundError => {}
                ResultCode::FilteredOut => {
                    self.shared.filtered_out.fetch_add(1, Ordering::Relaxed);
                }
                code => return Err(Error::server(code)),
            }
        }
        Ok(false)
    }
}

impl Command for BatchCommand<'_> {
    fn base_policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn is_read(&self) -> bool {
        true
    }

    fn node(&mut self, _cluster: &Cluster) -> Result<Arc<Node>> {
        Ok(self.batch.node.clone())
    }

    fn prepare_retry(&mut self, _is_client_timeout: bool) {}

    fn write_buffer(&mut self, buf: &mut CommandBuffer) -> Result<()> {
        let base = &self.policy.base;
        let filter = base.filter_expression.as_ref();
        let field_size = self.batch_field_size()?;

        buf.begin();
        let mut fields = 1;
        if buf.estimate_expression(filter) > 0 {
            fields += 1;
        }
        buf.estimate_field(field_size);
        buf.size_buffer(base.use_compression)?;

        buf.write_header(base, INFO1_READ | INFO1_BATCH, 0, fields, 0);
        buf.write_expression(filter);
        self.write_batch_field(buf, field_size);
        buf.end()
    }

    fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        loop {
            let (_, len) = conn.read_message()?;
            match self.parse_group(conn.body(len)) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    // rest of the stream is unread
                    conn.close();
                    return Err(e);
                }
            }
        }
    }

    fn retry_split(
        &mut self,
        cluster: &Cluster,
        deadline: Option<Instant>,
        iteration: usize,
    ) -> Option<Result<()>> {
        if !matches!(self.policy.base.replica, Replica::Sequence | Replica::PreferRack) {
            return None;
        }
        self.sequence += 1;

        let groups = split_keys(
            cluster,
            &self.policy.base,
            self.keys,
            &self.batch.offsets,
            self.sequence,
        )
        .ok()?;
        if groups.len() == 1 && Arc::ptr_eq(&groups[0].node, &self.batch.node) {
            return None;
        }

        debug!(
            "Splitting batch retry for node {} across {} nodes",
            self.batch.node.name(),
            groups.len()
        );
        let mut chain: Option<Error> = None;
        for group in groups {
            let node = group.node.name().to_string();
            let mut sub = BatchCommand::new(
                self.policy,
                self.keys,
                self.reads,
                group,
                self.shared,
                self.sequence,
            );
            if let Err(e) = execute_from(cluster, &mut sub, deadline, iteration) {
                chain = Some(e.with_node(node).chain_onto(chain));
            }
        }
        Some(chain.map_or(Ok(()), Err))
    }

    fn name(&self) -> &'static str {
        "batch"
    }
}

/// Read `keys` across the cluster.
///
/// Without `allow_partial_results` any node failure fails the call. With it,
/// the rows that were read are returned alongside the chained node errors.
pub fn execute_batch(
    cluster: &Cluster,
    policy: &BatchPolicy,
    keys: &[Key],
    read: &BatchRead,
) -> Result<BatchResults<Option<Record>>> {
    run_batch(cluster, policy, keys, std::slice::from_ref(read))
}

/// Read `records`, each with its own bin selection, filling in
/// [`BatchReadRecord::record`]. Returns the chained node errors when partial
/// results are allowed and some node failed.
pub fn execute_batch_complex(
    cluster: &Cluster,
    policy: &BatchPolicy,
    records: &mut [BatchReadRecord],
) -> Result<Option<Error>> {
    let keys: Vec<Key> = records.iter().map(|r| r.key.clone()).collect();
    let reads: Vec<BatchRead> = records.iter().map(|r| r.read.clone()).collect();
    let results = run_batch(cluster, policy, &keys, &reads)?;
    for (record, value) in records.iter_mut().zip(results.values) {
        record.record = value;
    }
    Ok(results.error)
}

fn run_batch(
    cluster: &Cluster,
    policy: &BatchPolicy,
    keys: &[Key],
    reads: &[BatchRead],
) -> Result<BatchResults<Option<Record>>> {
    if keys.is_empty() {
        return Ok(BatchResults {
            values: Vec::new(),
            error: None,
            filtered_out: 0,
        });
    }

    let offsets: Vec<usize> = (0..keys.len()).collect();
    let groups = split_keys(cluster, &policy.base, keys, &offsets, 0)?;
    let shared = BatchShared::new(keys.len());

    let errors = run_bounded("batch", groups, policy.concurrent_nodes, |group| {
        let node = group.node.name().to_string();
        let mut cmd = BatchCommand::new(policy, keys, reads, group, &shared, 0);
        execute(cluster, &mut cmd).map_err(|e| e.with_node(node))
    });

    let mut chain: Option<Error> = None;
    for err in errors.into_iter().filter_map(|r| r.err()) {
        chain = Some(err.chain_onto(chain));
    }
    if let Some(e) = chain.take() {
        if !policy.allow_partial_results {
            return Err(e);
        }
        chain = Some(e);
    }

    Ok(BatchResults {
        values: shared.records.into_inner(),
        error: chain,
        filtered_out: shared.filtered_out.into_inner(),
    })
}

/// Map record rows to existence flags.
pub fn exists_from(results: BatchResults<Option<Record>>) -> BatchResults<bool> {
    BatchResults {
        values: results.values.iter().map(Option::is_some).collect(),
        error: results.error,
        filtered_out: results.filtered_out,
    }
}
