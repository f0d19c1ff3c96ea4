//! Single-record commands

use std::sync::Arc;

use super::buffer::{
    CommandBuffer, INFO1_GET_ALL, INFO1_NOBINDATA, INFO1_READ, INFO2_DELETE,
    INFO2_RESPOND_ALL_OPS, INFO2_WRITE,
};
use super::executor::Command;
use super::key::Key;
use super::operation::{Bin, Operation, OperationType};
use super::parser::parse_record;
use super::record::Record;
use crate::client::connection::Connection;
use crate::cluster::{Cluster, Node, Partition};
use crate::config::{BasePolicy, WritePolicy};
use crate::utils::{Error, Result, ResultCode};

/// What a single-record command does
#[derive(Debug, Clone)]
pub enum SingleOp {
    /// Read all bins, or the listed ones
    Get(Option<Vec<String>>),
    GetHeader,
    Exists,
    /// Write bins with one operation type (write, add, append, prepend)
    Put(Vec<Bin>, OperationType),
    Delete,
    Touch,
    Operate(Vec<Operation>),
}

impl SingleOp {
    fn is_read(&self) -> bool {
        match self {
            SingleOp::Get(_) | SingleOp::GetHeader | SingleOp::Exists => true,
            SingleOp::Operate(ops) => ops.iter().all(|op| op.op_type().is_read()),
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SingleOp::Get(_) => "get",
            SingleOp::GetHeader => "get_header",
            SingleOp::Exists => "exists",
            SingleOp::Put(..) => "put",
            SingleOp::Delete => "delete",
            SingleOp::Touch => "touch",
            SingleOp::Operate(_) => "operate",
        }
    }
}

/// Policy a command runs under; reads only need the base part
enum CommandPolicy<'a> {
    Read(&'a BasePolicy),
    Write(&'a WritePolicy),
}

impl CommandPolicy<'_> {
    fn base(&self) -> &BasePolicy {
        match self {
            CommandPolicy::Read(p) => p,
            CommandPolicy::Write(p) => &p.base,
        }
    }
}

/// One key, one node, one round trip
pub struct SingleCommand<'a> {
    policy: CommandPolicy<'a>,
    key: &'a Key,
    op: SingleOp,
    partition: Partition,
    /// Set by a successful read or operate
    pub record: Option<Record>,
    /// Whether the record was there; meaningful for exists and delete
    pub existed: bool,
}

impl<'a> SingleCommand<'a> {
    pub fn read(cluster: &Cluster, policy: &'a BasePolicy, key: &'a Key, op: SingleOp) -> Result<Self> {
        let partition = Partition::for_read(cluster, policy, key)?;
        Ok(Self::with_partition(CommandPolicy::Read(policy), key, op, partition))
    }

    pub fn write(cluster: &Cluster, policy: &'a WritePolicy, key: &'a Key, op: SingleOp) -> Result<Self> {
        let partition = if op.is_read() {
            Partition::for_read(cluster, &policy.base, key)?
        } else {
            Partition::for_write(cluster, &policy.base, key)?
        };
        Ok(Self::with_partition(CommandPolicy::Write(policy), key, op, partition))
    }

    fn with_partition(policy: CommandPolicy<'a>, key: &'a Key, op: SingleOp, partition: Partition) -> Self {
        Self {
            policy,
            key,
            op,
            partition,
            record: None,
            existed: false,
        }
    }

    fn write_policy(&self) -> Option<&WritePolicy> {
        match self.policy {
            CommandPolicy::Write(p) => Some(p),
            CommandPolicy::Read(_) => None,
        }
    }

    /// Read and write attributes and the operations to send.
    fn attributes(&self) -> (u8, u8, Vec<Operation>) {
        match &self.op {
            SingleOp::Get(None) => (INFO1_READ | INFO1_GET_ALL, 0, Vec::new()),
            SingleOp::Get(Some(bins)) if bins.is_empty() => (INFO1_READ | INFO1_GET_ALL, 0, Vec::new()),
            SingleOp::Get(Some(bins)) => (
                INFO1_READ,
                0,
                bins.iter().map(|b| Operation::get_bin(b.clone())).collect(),
            ),
            SingleOp::GetHeader | SingleOp::Exists => (INFO1_READ | INFO1_NOBINDATA, 0, Vec::new()),
            SingleOp::Put(bins, op_type) => (
                0,
                INFO2_WRITE,
                bins.iter()
                    .map(|b| Operation::new(*op_type, Some(b.name.clone()), b.value.clone()))
                    .collect(),
            ),
            SingleOp::Delete => (0, INFO2_WRITE | INFO2_DELETE, Vec::new()),
            SingleOp::Touch => (0, INFO2_WRITE, vec![Operation::touch()]),
            SingleOp::Operate(ops) => operate_attributes(ops, self.write_policy()),
        }
    }
}

fn operate_attributes(ops: &[Operation], policy: Option<&WritePolicy>) -> (u8, u8, Vec<Operation>) {
    let mut read_attr = 0u8;
    let mut write_attr = 0u8;
    let mut sent = Vec::with_capacity(ops.len());
    for op in ops {
        if op.op_type().is_read() {
            read_attr |= INFO1_READ;
            if op.bin_name().is_none() {
                read_attr |= if op.is_header_only() {
                    INFO1_NOBINDATA
                } else {
                    INFO1_GET_ALL
                };
                // the whole-record read is carried by the attributes
                continue;
            }
        } else {
            write_attr |= INFO2_WRITE;
            if op.op_type() == OperationType::Delete {
                write_attr |= INFO2_DELETE;
            }
        }
        sent.push(op.clone());
    }
    if policy.map(|p| p.respond_per_each_op).unwrap_or(false) && write_attr != 0 {
        write_attr |= INFO2_RESPOND_ALL_OPS;
    }
    (read_attr, write_attr, sent)
}

impl Command for SingleCommand<'_> {
    fn base_policy(&self) -> &BasePolicy {
        self.policy.base()
    }

    fn is_read(&self) -> bool {
        self.op.is_read()
    }

    fn node(&mut self, cluster: &Cluster) -> Result<Arc<Node>> {
        if self.op.is_read() {
            self.partition.node_read(cluster)
        } else {
            self.partition.node_write(cluster)
        }
    }

    fn prepare_retry(&mut self, is_client_timeout: bool) {
        if self.op.is_read() {
            self.partition.prepare_retry_read(is_client_timeout);
        } else {
            self.partition.prepare_retry_write(is_client_timeout);
        }
    }

    fn write_buffer(&mut self, buf: &mut CommandBuffer) -> Result<()> {
        let (read_attr, write_attr, ops) = self.attributes();
        let base = self.policy.base();
        let send_key = base.send_key && write_attr != 0;
        let filter = base.filter_expression.as_ref();

        buf.begin();
        let mut fields = buf.estimate_key(self.key, send_key)?;
        if buf.estimate_expression(filter) > 0 {
            fields += 1;
        }
        for op in &ops {
            buf.estimate_operation(op)?;
        }
        buf.size_buffer(base.use_compression)?;

        match self.write_policy() {
            Some(wp) => buf.write_header_with_policy(wp, read_attr, write_attr, fields, ops.len()),
            None => buf.write_header(base, read_attr, write_attr, fields, ops.len()),
        }
        buf.write_key(self.key, send_key)?;
        buf.write_expression(filter);
        for op in &ops {
            buf.write_operation(op)?;
        }
        buf.end()
    }

    fn parse_result(&mut self, conn: &mut Connection) -> Result<()> {
        let (_, len) = conn.read_message()?;
        let accumulate = matches!(self.op, SingleOp::Operate(_));
        let (header, record) = parse_record(conn.body(len), accumulate)?;

        match header.result() {
            ResultCode::Ok => {
                self.existed = true;
                self.record = record.map(|mut r| {
                    r.key = Some(self.key.clone());
                    r
                });
                Ok(())
            }
            ResultCode::KeyNotFoundError
                if matches!(self.op, SingleOp::Exists | SingleOp::Delete) =>
            {
                self.existed = false;
                Ok(())
            }
            code => Err(Error::server(code)),
        }
    }

    fn name(&self) -> &'static str {
        self.op.name()
    }
}
