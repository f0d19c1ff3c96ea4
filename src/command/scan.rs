//! Partition scans
//!
//! A scan runs in rounds on a background thread. Each round the tracker
//! assigns the outstanding partitions to nodes, one streaming command per
//! node reads them, and the tracker decides whether anything must be
//! retried. Records flow to the caller through a [`Recordset`].

use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use super::buffer::{
    check_bin_name, CommandBuffer, FieldType, INFO1_NOBINDATA, INFO1_READ, INFO3_LAST,
    INFO3_PARTITION_DONE,
};
use super::executor::{execute_from, Command};
use super::filter::Filter;
use super::key::DIGEST_SIZE;
use super::operation::OperationType;
use super::orchestrator::run_bounded;
use super::parser::{parse_bins, parse_key_fields, MessageHeader, MessageReader};
use super::partition_tracker::{NodePartitions, PartitionFilter, PartitionTracker};
use super::record::{ttl_from_void_time, Record};
use super::recordset::{RecordSender, Recordset, StreamKind};
use crate::client::connection::Connection;
use crate::cluster::{Cluster, Node};
use crate::config::{BasePolicy, ScanPolicy};
use crate::utils::{Error, Result, ResultCode};

/// What a streaming command asks each node for
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub namespace: String,
    pub set_name: String,
    /// Bins to return; all when empty
    pub bin_names: Vec<String>,
    /// Secondary index filter, for queries
    pub filter: Option<Filter>,
    pub index_name: String,
    pub kind: StreamKind,
}

impl StreamRequest {
    pub fn scan(namespace: &str, set_name: &str, bin_names: &[String]) -> Self {
        Self {
            namespace: namespace.to_string(),
            set_name: set_name.to_string(),
            bin_names: bin_names.to_vec(),
            filter: None,
            index_name: String::new(),
            kind: StreamKind::Scan,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            StreamKind::Scan => "scan",
            StreamKind::Query => "query",
        }
    }
}

/// One streaming request against one node
pub(crate) struct StreamCommand<'a> {
    policy: &'a ScanPolicy,
    request: &'a StreamRequest,
    node: Arc<Node>,
    /// Partitions of this round; `None` asks the node for everything it holds
    partitions: Option<NodePartitions>,
    tracker: Option<&'a PartitionTracker>,
    sender: &'a RecordSender,
    task_id: u64,
}

impl<'a> StreamCommand<'a> {
    pub(crate) fn for_partitions(
        policy: &'a ScanPolicy,
        request: &'a StreamRequest,
        partitions: NodePartitions,
        tracker: &'a PartitionTracker,
        sender: &'a RecordSender,
        task_id: u64,
    ) -> Self {
        Self {
            policy,
            request,
            node: partitions.node.clone(),
            partitions: Some(partitions),
            tracker: Some(tracker),
            sender,
            task_id,
        }
    }

    pub(crate) fn for_node(
        policy: &'a ScanPolicy,
        request: &'a StreamRequest,
        node: Arc<Node>,
        sender: &'a RecordSender,
        task_id: u64,
    ) -> Self {
        Self {
            policy,
            request,
            node,
            partitions: None,
            tracker: None,
            sender,
            task_id,
        }
    }

    pub(crate) fn into_partitions(self) -> Option<NodePartitions> {
        self.partitions
    }

    /// Bin names travel as a field for index queries and as read
    /// operations otherwise.
    fn bins_as_field(&self) -> bool {
        self.request.filter.is_some() && !self.request.bin_names.is_empty()
    }

    /// Parse one proto message. Returns true at the end of the stream.
    fn parse_group(&mut self, body: &[u8]) -> Result<bool> {
        let mut reader = MessageReader::new(body);
        while !reader.is_empty() {
            let header = MessageHeader::parse(&mut reader)?;
            let code = header.result();

            if header.info3 & INFO3_LAST != 0 {
                return match code {
                    ResultCode::Ok | ResultCode::KeyNotFoundError => Ok(true),
                    code => Err(Error::server(code)),
                };
            }

            let fields = parse_key_fields(&mut reader, header.field_count)?;
            let bins = parse_bins(&mut reader, header.op_count, false)?;

            if header.info3 & INFO3_PARTITION_DONE != 0 {
                // generation carries the partition id
                if code != ResultCode::Ok {
                    if let (Some(tracker), Some(np)) = (self.tracker, self.partitions.as_mut()) {
                        tracker.partition_unavailable(np, header.generation as usize);
                    }
                }
                continue;
            }
            if code != ResultCode::Ok {
                return Err(Error::server(code));
            }

            let key = fields
                .into_key()
                .ok_or_else(|| Error::parse("record without digest"))?;
            if !self.sender.is_active() {
                return Err(self.request.kind.terminated());
            }
            let record = Record::new(
                Some(key.clone()),
                bins,
                header.generation,
                ttl_from_void_time(header.expiration),
            );
            self.sender.send(record)?;
            if let (Some(tracker), Some(np)) = (self.tracker, self.partitions.as_mut()) {
                tracker.set_digest(np, &key);
            }
        }
        Ok(false)
    }
}

impl Command for StreamCommand<'_> {
    fn base_policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn is_read(&self) -> bool {
        true
    }

    fn node(&mut self, _cluster: &Cluster) -> Result<Arc<Node>> {
        Ok(self.node.clone())
    }

    fn prepare_retry(&mut self, _is_client_timeout: bool) {}

    fn one_shot(&self) -> bool {
        true
    }

    fn write_buffer(&mut self, buf: &mut CommandBuffer) -> Result<()> {
        let base = &self.policy.base;
        let request = self.request;
        let exp = base.filter_expression.as_ref();

        buf.begin();
        let mut fields = 0;
        if !request.namespace.is_empty() {
            buf.estimate_field(request.namespace.len());
            fields += 1;
        }
        if !request.set_name.is_empty() {
            buf.estimate_field(request.set_name.len());
            fields += 1;
        }
        if self.policy.records_per_second > 0 {
            buf.estimate_field(4);
            fields += 1;
        }
        if buf.estimate_expression(exp) > 0 {
            fields += 1;
        }
        // socket timeout and task id
        buf.estimate_field(4);
        buf.estimate_field(8);
        fields += 2;

        let mut filter_size = 0;
        if let Some(filter) = &request.filter {
            if !request.index_name.is_empty() {
                buf.estimate_field(request.index_name.len());
                fields += 1;
            }
            if filter.collection_type() as u8 != 0 {
                buf.estimate_field(1);
                fields += 1;
            }
            filter_size = 1 + filter.estimate_size()?;
            buf.estimate_field(filter_size);
            fields += 1;
        }
        let mut bin_list_size = 0;
        if self.bins_as_field() {
            for bin in &request.bin_names {
                check_bin_name(bin)?;
            }
            bin_list_size = 1 + request.bin_names.iter().map(|b| 1 + b.len()).sum::<usize>();
            buf.estimate_field(bin_list_size);
            fields += 1;
        }

        if let Some(np) = &self.partitions {
            if !np.parts_full.is_empty() {
                buf.estimate_field(np.parts_full.len() * 2);
                fields += 1;
            }
            if !np.parts_partial.is_empty() {
                buf.estimate_field(np.parts_partial.len() * DIGEST_SIZE);
                fields += 1;
            }
            if np.record_max > 0 {
                buf.estimate_field(8);
                fields += 1;
            }
        }

        let mut ops = 0;
        if !self.bins_as_field() {
            for bin in &request.bin_names {
                buf.estimate_operation_for_bin_name(bin)?;
                ops += 1;
            }
        }
        buf.size_buffer(base.use_compression)?;

        let mut read_attr = INFO1_READ;
        if !self.policy.include_bin_data {
            read_attr |= INFO1_NOBINDATA;
        }
        let info3 = if self.partitions.is_some() {
            INFO3_PARTITION_DONE
        } else {
            0
        };
        buf.write_header_info3(base, read_attr, 0, info3, fields, ops);

        if !request.namespace.is_empty() {
            buf.write_field_string(&request.namespace, FieldType::Namespace);
        }
        if !request.set_name.is_empty() {
            buf.write_field_string(&request.set_name, FieldType::Table);
        }
        if self.policy.records_per_second > 0 {
            buf.write_field_u32(self.policy.records_per_second, FieldType::RecordsPerSecond);
        }
        buf.write_expression(exp);
        let socket_ms = base.socket_timeout.as_millis().min(u32::MAX as u128) as u32;
        buf.write_field_u32(socket_ms, FieldType::ScanTimeout);
        buf.write_field_u64(self.task_id, FieldType::TranId);

        if let Some(filter) = &request.filter {
            if !request.index_name.is_empty() {
                buf.write_field_string(&request.index_name, FieldType::IndexName);
            }
            if filter.collection_type() as u8 != 0 {
                buf.write_field_header(1, FieldType::IndexType);
                buf.write_u8(filter.collection_type() as u8);
            }
            buf.write_field_header(filter_size, FieldType::IndexRange);
            buf.write_u8(1);
            filter.write_to(buf)?;
        }
        if self.bins_as_field() {
            buf.write_field_header(bin_list_size, FieldType::QueryBinList);
            buf.write_u8(request.bin_names.len() as u8);
            for bin in &request.bin_names {
                buf.write_u8(bin.len() as u8);
                buf.write_bytes(bin.as_bytes());
            }
        }

        if let Some(np) = &self.partitions {
            if !np.parts_full.is_empty() {
                buf.write_field_header(np.parts_full.len() * 2, FieldType::PidArray);
                for &id in &np.parts_full {
                    buf.write_u16_le(id as u16);
                }
            }
            if !np.parts_partial.is_empty() {
                buf.write_field_header(np.parts_partial.len() * DIGEST_SIZE, FieldType::DigestArray);
                for (_, digest) in &np.parts_partial {
                    buf.write_bytes(digest);
                }
            }
            if np.record_max > 0 {
                buf.write_field_u64(np.record_max, FieldType::ScanMaxRecords);
            }
        }

        if !self.bins_as_field() {
            for bin in &request.bin_names {
                buf.write_operation_for_bin_name(bin, OperationType::Read);
            }
        }
        buf.end()
    }

    fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        loop {
            let (_, len) = conn.read_message()?;
            match self.parse_group(conn.body(len)) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    conn.close();
                    return Err(e);
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        self.request.kind_name()
    }
}

/// Whether a node failure should be retried in a later round.
fn should_retry(e: &Error) -> bool {
    e.is_network()
        || e.is_timeout()
        || matches!(
            e.result_code(),
            ResultCode::PartitionUnavailable
                | ResultCode::InvalidNodeError
                | ResultCode::NoAvailableConnectionsToNode
                | ResultCode::MaxErrorRate
                | ResultCode::MaxRetriesExceeded
                | ResultCode::DeviceOverload
        )
}

/// Drive a partition run to completion, feeding `sender`.
fn run_partitions(
    cluster: &Cluster,
    policy: &ScanPolicy,
    request: &StreamRequest,
    tracker: &mut PartitionTracker,
    sender: &RecordSender,
    task_id: u64,
) -> Result<()> {
    loop {
        let round = tracker.assign(cluster, &request.namespace)?;
        if round.is_empty() {
            return Ok(());
        }

        let tracker_ref: &PartitionTracker = tracker;
        let deadline = tracker_ref.deadline();
        let outcomes = run_bounded(request.kind_name(), round, policy.max_concurrent_nodes, |np| {
            let mut cmd = StreamCommand::for_partitions(policy, request, np, tracker_ref, sender, task_id);
            let result = execute_from(cluster, &mut cmd, deadline, 0);
            let np = cmd.into_partitions();
            (np, result)
        });

        let mut finished = Vec::with_capacity(outcomes.len());
        for (np, result) in outcomes {
            let Some(mut np) = np else { continue };
            if let Err(e) = result {
                if !sender.is_active() {
                    return Err(request.kind.terminated());
                }
                if !should_retry(&e) {
                    return Err(e.with_node(np.node.name()));
                }
                debug!("Node {} failed this round: {}", np.node.name(), e);
                tracker_ref.node_error(&mut np, e);
            }
            finished.push(np);
        }

        if tracker.is_complete(&finished)? {
            return Ok(());
        }
        let sleep = tracker.next_sleep();
        if !sleep.is_zero() {
            thread::sleep(sleep);
        }
    }
}

/// Start a partition scan or query on a background thread.
pub(crate) fn start_partitions(
    cluster: Arc<Cluster>,
    policy: ScanPolicy,
    request: StreamRequest,
    filter: PartitionFilter,
    node_filter: Option<Arc<Node>>,
) -> Result<Recordset> {
    let mut tracker = PartitionTracker::new(&policy.base, policy.max_records, &filter, node_filter)?;
    let task_id = fastrand::u64(..);
    let (recordset, sender) = Recordset::new(policy.record_queue_size, task_id, request.kind);

    let handle = thread::Builder::new()
        .name(format!("shardline-{}-{}", request.kind_name(), task_id))
        .spawn(move || {
            if let Err(e) = run_partitions(&cluster, &policy, &request, &mut tracker, &sender, task_id) {
                if sender.is_active() {
                    warn!("{} {} failed: {}", request.kind_name(), task_id, e);
                    sender.send_error(e);
                }
            }
        })
        .map_err(Error::from)?;
    recordset.set_producer(handle);
    Ok(recordset)
}
