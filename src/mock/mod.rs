//! Loopback cluster for hermetic tests
//!
//! Each [`MockCluster`] node listens on its own 127.0.0.1 port and speaks
//! the info and message protocols well enough for tend, single-record,
//! batch and partition scan traffic. All nodes share one record store, so
//! any node can answer for any partition, the way a prole would.
//!
//! Partition `p` is mastered by node `p % n`; the next node holds the prole.
//! When a node is killed its partitions move to the next live node and the
//! partition generation moves on, the way a server cluster rebalances.

mod scenarios;
mod store;
mod wire;

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::cluster::partition::encode_bitmap;
use crate::cluster::{Host, PARTITIONS};
use crate::command::buffer::{
    parse_proto_header, proto_header, FieldType, AS_ADMIN_MESSAGE_TYPE, AS_INFO_MESSAGE_TYPE,
    AS_MSG_TYPE, INFO1_GET_ALL, INFO1_NOBINDATA, INFO3_LAST, PROTO_HEADER_SIZE,
};
use crate::command::key::{partition_id, DIGEST_SIZE};
use crate::command::parser::{decode_message, DecodedMessage, MessageReader};
use crate::command::{Filter, Value};
use crate::config::ClientPolicy;
use crate::utils::ResultCode;

use store::{record_id, Digest, Store, StoredRecord};
use wire::{ReplyHeader, ReplyWriter};

const POLL: Duration = Duration::from_millis(20);

struct Shared {
    namespace: String,
    cluster_name: String,
    store: Mutex<Store>,
    peers_generation: AtomicU32,
    partition_generation: AtomicU32,
    /// Registered UDF packages: file name and content hash
    udfs: Mutex<Vec<(String, String)>>,
    shutdown: AtomicBool,
}

/// One simulated server node
pub(crate) struct MockNode {
    index: usize,
    name: Mutex<String>,
    addr: SocketAddr,
    down: AtomicBool,
    /// Result code every data request fails with; zero when healthy
    fail_code: AtomicU8,
    /// Scan records left before the node dies; negative for unlimited
    record_budget: AtomicI64,
    /// Close the connection on data requests; info keeps working
    drop_data: AtomicBool,
}

impl MockNode {
    fn name(&self) -> String {
        self.name.lock().clone()
    }

    fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    /// Take one record from the budget. Returns false once it is spent,
    /// which takes the node down.
    fn take_record(&self) -> bool {
        if self.record_budget.load(Ordering::Acquire) < 0 {
            return true;
        }
        if self.record_budget.fetch_sub(1, Ordering::AcqRel) <= 0 {
            self.down.store(true, Ordering::Release);
            return false;
        }
        true
    }
}

pub(crate) struct MockCluster {
    shared: Arc<Shared>,
    nodes: Arc<Vec<Arc<MockNode>>>,
    acceptors: Vec<JoinHandle<()>>,
}

impl MockCluster {
    /// Start `count` nodes serving namespace `test`.
    pub fn start(count: usize) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            namespace: "test".to_string(),
            cluster_name: "mock".to_string(),
            store: Mutex::new(Store::default()),
            peers_generation: AtomicU32::new(1),
            partition_generation: AtomicU32::new(1),
            udfs: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });

        let mut listeners = Vec::with_capacity(count);
        let mut nodes = Vec::with_capacity(count);
        for index in 0..count {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            listener.set_nonblocking(true)?;
            nodes.push(Arc::new(MockNode {
                index,
                name: Mutex::new(format!("MOCK{:02}", index + 1)),
                addr: listener.local_addr()?,
                down: AtomicBool::new(false),
                fail_code: AtomicU8::new(0),
                record_budget: AtomicI64::new(-1),
                drop_data: AtomicBool::new(false),
            }));
            listeners.push(listener);
        }
        let nodes = Arc::new(nodes);

        let mut acceptors = Vec::with_capacity(count);
        for (index, listener) in listeners.into_iter().enumerate() {
            let (shared, nodes) = (Arc::clone(&shared), Arc::clone(&nodes));
            let handle = thread::Builder::new()
                .name(format!("mock-node-{}", index))
                .spawn(move || accept_loop(listener, shared, nodes, index))?;
            acceptors.push(handle);
        }
        Ok(Self {
            shared,
            nodes,
            acceptors,
        })
    }

    /// Only the first node; the rest are found through peers.
    pub fn seeds(&self) -> Vec<Host> {
        vec![host_of(&self.nodes[0])]
    }

    pub fn host(&self, index: usize) -> Host {
        host_of(&self.nodes[index])
    }

    pub fn node_name(&self, index: usize) -> String {
        self.nodes[index].name()
    }

    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    /// Client settings with timings suited to loopback tests.
    pub fn client_policy(&self) -> ClientPolicy {
        ClientPolicy {
            timeout: Duration::from_secs(2),
            tend_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    /// Stop answering; connections are closed and refused. The node's
    /// partitions fail over to the next live node.
    pub fn kill(&self, index: usize) {
        self.nodes[index].down.store(true, Ordering::Release);
        self.shared.peers_generation.fetch_add(1, Ordering::AcqRel);
        self.shared.partition_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Serve `records` scan records, then die.
    pub fn kill_after_records(&self, index: usize, records: i64) {
        self.nodes[index].record_budget.store(records, Ordering::Release);
    }

    /// Fail every data request with `code`.
    pub fn fail_with(&self, index: usize, code: ResultCode) {
        self.nodes[index]
            .fail_code
            .store(code.code() as u8, Ordering::Release);
    }

    /// Close every connection that carries a data request. The node stays in
    /// the cluster since info requests are still answered.
    pub fn drop_data_requests(&self, index: usize) {
        self.nodes[index].drop_data.store(true, Ordering::Release);
    }

    /// Live node serving replica `replica` of `partition`.
    pub fn replica_node(&self, partition: usize, replica: usize) -> Option<usize> {
        replica_of(&self.nodes, partition, replica)
    }

    /// Answer `node` with another name from now on.
    pub fn rename(&self, index: usize, name: &str) {
        *self.nodes[index].name.lock() = name.to_string();
    }

    pub fn record_count(&self) -> usize {
        self.shared.store.lock().len()
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        for handle in self.acceptors.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Replica `replica` of partition `p` lives on the `replica`-th live node
/// counting on from `p % n`.
fn replica_of(nodes: &[Arc<MockNode>], p: usize, replica: usize) -> Option<usize> {
    let count = nodes.len();
    (0..count)
        .map(|i| (p + i) % count)
        .filter(|&i| !nodes[i].is_down())
        .nth(replica)
}

fn host_of(node: &MockNode) -> Host {
    Host::new(node.addr.ip().to_string(), node.addr.port())
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, nodes: Arc<Vec<Arc<MockNode>>>, index: usize) {
    while !shared.shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                if nodes[index].is_down() {
                    let _ = stream.shutdown(Shutdown::Both);
                    continue;
                }
                let (shared, nodes) = (Arc::clone(&shared), Arc::clone(&nodes));
                let spawned = thread::Builder::new()
                    .name(format!("mock-conn-{}", index))
                    .spawn(move || {
                        let mut handler = Handler {
                            stream,
                            shared,
                            nodes,
                            index,
                        };
                        if let Err(e) = handler.serve() {
                            debug!("mock node {} connection ended: {}", index, e);
                        }
                        let _ = handler.stream.shutdown(Shutdown::Both);
                    });
                if let Err(e) = spawned {
                    debug!("mock node {} cannot spawn a handler: {}", index, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(2)),
            Err(e) => {
                debug!("mock node {} accept failed: {}", index, e);
                thread::sleep(POLL);
            }
        }
    }
}

struct Handler {
    stream: TcpStream,
    shared: Arc<Shared>,
    nodes: Arc<Vec<Arc<MockNode>>>,
    index: usize,
}

fn stopped(kind: &str) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, kind.to_string())
}

impl Handler {
    fn node(&self) -> &MockNode {
        &self.nodes[self.index]
    }

    fn live(&self) -> io::Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(stopped("shutdown"));
        }
        if self.node().is_down() {
            return Err(stopped("node down"));
        }
        Ok(())
    }

    /// Fill `buf`, polling for shutdown while idle. Returns false on a clean
    /// close before the first byte.
    fn read_full(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            self.live()?;
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn serve(&mut self) -> io::Result<()> {
        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(Some(POLL))?;
        self.stream.set_nodelay(true)?;
        loop {
            let mut proto = [0u8; PROTO_HEADER_SIZE];
            if !self.read_full(&mut proto)? {
                return Ok(());
            }
            let (msg_type, size) =
                parse_proto_header(&proto).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            let mut message = vec![0u8; PROTO_HEADER_SIZE + size];
            message[..PROTO_HEADER_SIZE].copy_from_slice(&proto);
            if !self.read_full(&mut message[PROTO_HEADER_SIZE..])? {
                return Ok(());
            }
            self.live()?;

            match msg_type {
                AS_INFO_MESSAGE_TYPE => self.info(&message[PROTO_HEADER_SIZE..])?,
                AS_ADMIN_MESSAGE_TYPE => {
                    let mut reply = proto_header(16, AS_ADMIN_MESSAGE_TYPE).to_vec();
                    reply.extend_from_slice(&[0u8; 16]);
                    self.stream.write_all(&reply)?;
                }
                AS_MSG_TYPE => self.data(&message)?,
                other => return Err(stopped(&format!("unsupported message type {}", other))),
            }
        }
    }

    // ===== Info =====

    fn info(&mut self, body: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(body).into_owned();
        let mut reply = String::new();
        for name in text.split('\n').filter(|n| !n.is_empty()) {
            reply.push_str(name);
            reply.push('\t');
            reply.push_str(&self.info_value(name));
            reply.push('\n');
        }
        let mut out = proto_header(reply.len(), AS_INFO_MESSAGE_TYPE).to_vec();
        out.extend_from_slice(reply.as_bytes());
        self.stream.write_all(&out)
    }

    fn alive(&self) -> impl Iterator<Item = &Arc<MockNode>> {
        self.nodes.iter().filter(|n| !n.is_down())
    }

    fn info_value(&self, name: &str) -> String {
        let ns = &self.shared.namespace;
        match name {
            "node" => self.node().name(),
            "features" => "pscans;query-show".to_string(),
            "cluster-name" => self.shared.cluster_name.clone(),
            "peers-generation" => self.shared.peers_generation.load(Ordering::Acquire).to_string(),
            "partition-generation" => self
                .shared
                .partition_generation
                .load(Ordering::Acquire)
                .to_string(),
            "replicas" => self.replicas(),
            "racks:" => {
                let names: Vec<String> = self.alive().map(|n| n.name()).collect();
                format!("ns={}:rack_0={};", ns, names.join(","))
            }
            "statistics" => format!(
                "cluster_size={};migrate_partitions_remaining=0",
                self.alive().count()
            ),
            "udf-list" => self
                .shared
                .udfs
                .lock()
                .iter()
                .map(|(file, hash)| format!("filename={},hash={},type=LUA;", file, hash))
                .collect(),
            n if n.starts_with("udf-put:") => self.put_udf(n),
            n if n.starts_with("udf-remove:") => {
                let file = info_param(n, "filename").unwrap_or_default();
                self.shared.udfs.lock().retain(|(f, _)| *f != file);
                "ok".to_string()
            }
            n if n.starts_with("peers-") => self.peers(),
            n if n.starts_with("sindex/") => format!("ns={};load_pct=100;state=RW", ns),
            n if n.starts_with("truncate") || n.starts_with("sindex-") || n.starts_with("udf-") => "ok".to_string(),
            _ => String::new(),
        }
    }

    fn replicas(&self) -> String {
        let replica_count = self.alive().count().clamp(1, 2);
        let maps: Vec<String> = (0..replica_count)
            .map(|r| {
                encode_bitmap(
                    (0..PARTITIONS).filter(|&p| replica_of(&self.nodes, p, r) == Some(self.index)),
                )
            })
            .collect();
        format!("{}:0,{},{};", self.shared.namespace, replica_count, maps.join(","))
    }

    fn put_udf(&self, command: &str) -> String {
        let file = info_param(command, "filename");
        let content = info_param(command, "content");
        let (Some(file), Some(content)) = (file, content) else {
            return "error=1;message=".to_string();
        };
        let hash = hex_digest(content.as_bytes());
        let mut udfs = self.shared.udfs.lock();
        udfs.retain(|(f, _)| *f != file);
        udfs.push((file, hash));
        "ok".to_string()
    }

    fn peers(&self) -> String {
        let others: Vec<String> = self
            .alive()
            .filter(|n| n.index != self.index)
            .map(|n| format!("[{},,[{}:{}]]", n.name(), n.addr.ip(), n.addr.port()))
            .collect();
        format!(
            "{},,[{}]",
            self.shared.peers_generation.load(Ordering::Acquire),
            others.join(",")
        )
    }

    // ===== Data =====

    fn data(&mut self, message: &[u8]) -> io::Result<()> {
        if self.node().drop_data.load(Ordering::Acquire) {
            return Err(stopped("dropping data requests"));
        }
        let code = self.node().fail_code.load(Ordering::Acquire);
        if code != 0 {
            let mut w = ReplyWriter::new();
            w.status(INFO3_LAST, code);
            return self.stream.write_all(&w.finish());
        }
        let msg = decode_message(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let batch = msg
            .field(FieldType::BatchIndex)
            .or_else(|| msg.field(FieldType::BatchIndexWithSet))
            .map(<[u8]>::to_vec);
        if let Some(field) = batch {
            self.batch(&field)
        } else if msg.field(FieldType::DigestRipe).is_some() {
            self.single(&msg)
        } else {
            self.scan(&msg)
        }
    }

    fn single(&mut self, msg: &DecodedMessage) -> io::Result<()> {
        let ns = msg.field_str(FieldType::Namespace).unwrap_or_default();
        let set = msg.field_str(FieldType::Table).unwrap_or_default();
        let digest = to_digest(msg.field(FieldType::DigestRipe).unwrap_or_default())?;
        let outcome = self
            .shared
            .store
            .lock()
            .execute(record_id(&ns, &digest), &set, msg);

        let bins: Vec<(&str, &Value)> = outcome.bins.iter().map(|(k, v)| (k.as_str(), v)).collect();
        let mut w = ReplyWriter::new();
        w.group(
            ReplyHeader {
                result_code: outcome.result_code,
                generation: outcome.generation,
                void_time: outcome.void_time,
                ..Default::default()
            },
            &[],
            &bins,
        );
        self.stream.write_all(&w.finish())
    }

    fn batch(&mut self, field: &[u8]) -> io::Result<()> {
        let rows = parse_batch_field(field).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let mut w = ReplyWriter::new();
        {
            let store = self.shared.store.lock();
            for row in &rows {
                match store.get(&record_id(&row.namespace, &row.digest)) {
                    Some(record) => {
                        let bins = project(record, row.read_attr, &row.bins);
                        let refs: Vec<(&str, &Value)> = bins.iter().map(|(k, v)| (k.as_str(), v)).collect();
                        w.group(
                            ReplyHeader {
                                generation: record.generation,
                                void_time: record.void_time,
                                index: row.index,
                                ..Default::default()
                            },
                            &[],
                            &refs,
                        );
                    }
                    None => w.group(
                        ReplyHeader {
                            result_code: ResultCode::KeyNotFoundError.code() as u8,
                            index: row.index,
                            ..Default::default()
                        },
                        &[],
                        &[],
                    ),
                }
            }
        }
        w.status(INFO3_LAST, 0);
        self.stream.write_all(&w.finish())
    }

    fn scan(&mut self, msg: &DecodedMessage) -> io::Result<()> {
        let ns = msg.field_str(FieldType::Namespace).unwrap_or_default();
        let set = msg.field_str(FieldType::Table).unwrap_or_default();
        let max_records = msg
            .field(FieldType::ScanMaxRecords)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0);
        let filter = match msg.field(FieldType::IndexRange) {
            Some(data) if data.len() > 1 => Some(
                Filter::decode(&data[1..])
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
                    .0,
            ),
            _ => None,
        };
        let mut bin_names: Vec<String> = msg.ops.iter().map(|op| op.bin_name.clone()).collect();
        if let Some(list) = msg.field(FieldType::QueryBinList) {
            bin_names = parse_bin_list(list);
        }
        let read_attr = if msg.header.info1 & INFO1_NOBINDATA != 0 {
            INFO1_NOBINDATA
        } else if bin_names.is_empty() {
            INFO1_GET_ALL
        } else {
            0
        };

        let mut targets: Vec<(usize, Option<Digest>)> = Vec::new();
        if let Some(pids) = msg.field(FieldType::PidArray) {
            targets.extend(pids.chunks_exact(2).map(|c| (u16::from_le_bytes([c[0], c[1]]) as usize, None)));
        }
        if let Some(digests) = msg.field(FieldType::DigestArray) {
            for chunk in digests.chunks_exact(DIGEST_SIZE) {
                let digest = to_digest(chunk)?;
                targets.push((partition_id(&digest), Some(digest)));
            }
        }
        if targets.is_empty() {
            targets = (0..PARTITIONS)
                .filter(|&p| replica_of(&self.nodes, p, 0) == Some(self.index))
                .map(|p| (p, None))
                .collect();
        }
        targets.sort_by_key(|(pid, _)| *pid);

        let mut sent = 0u64;
        'partitions: for (pid, after) in targets {
            let records = self.shared.store.lock().partition(&ns, pid, after.as_ref());
            for (digest, record) in records {
                if !set.is_empty() && record.set_name != set {
                    continue;
                }
                if let Some(f) = &filter {
                    if !record.bins.get(f.bin_name()).map(|v| f.matches(v)).unwrap_or(false) {
                        continue;
                    }
                }
                if max_records > 0 && sent >= max_records {
                    break 'partitions;
                }
                if !self.node().take_record() {
                    return Err(stopped("node killed mid-scan"));
                }
                let bins = project(&record, read_attr, &bin_names);
                let refs: Vec<(&str, &Value)> = bins.iter().map(|(k, v)| (k.as_str(), v)).collect();
                let mut fields: Vec<(FieldType, &[u8])> = vec![(FieldType::Namespace, ns.as_bytes())];
                if !record.set_name.is_empty() {
                    fields.push((FieldType::Table, record.set_name.as_bytes()));
                }
                fields.push((FieldType::DigestRipe, &digest[..]));
                let mut w = ReplyWriter::new();
                w.group(
                    ReplyHeader {
                        generation: record.generation,
                        void_time: record.void_time,
                        ..Default::default()
                    },
                    &fields,
                    &refs,
                );
                self.stream.write_all(&w.finish())?;
                sent += 1;
            }
        }

        let mut w = ReplyWriter::new();
        w.status(INFO3_LAST, 0);
        self.stream.write_all(&w.finish())
    }
}

/// Value of `name=` in an info command's `;` separated parameters.
fn info_param(command: &str, name: &str) -> Option<String> {
    let params = command.split_once(':')?.1;
    params
        .split(';')
        .find_map(|kv| kv.strip_prefix(name)?.strip_prefix('='))
        .map(str::to_string)
}

fn hex_digest(bytes: &[u8]) -> String {
    use ripemd::{Digest as _, Ripemd160};
    Ripemd160::digest(bytes).iter().map(|b| format!("{:02x}", b)).collect()
}

fn to_digest(bytes: &[u8]) -> io::Result<Digest> {
    bytes
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("digest of {} bytes", bytes.len())))
}

/// Bins a read returns for the given attributes.
fn project(record: &StoredRecord, read_attr: u8, bins: &[String]) -> Vec<(String, Value)> {
    if read_attr & INFO1_NOBINDATA != 0 {
        return Vec::new();
    }
    if read_attr & INFO1_GET_ALL != 0 || bins.is_empty() {
        return record.bins.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    }
    bins.iter()
        .filter_map(|b| record.bins.get(b).map(|v| (b.clone(), v.clone())))
        .collect()
}

fn parse_bin_list(data: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut pos = 1;
    while pos < data.len() {
        let len = data[pos] as usize;
        pos += 1;
        if let Some(name) = data.get(pos..pos + len) {
            names.push(String::from_utf8_lossy(name).into_owned());
        }
        pos += len;
    }
    names
}

struct BatchRow {
    index: u32,
    digest: Digest,
    namespace: String,
    read_attr: u8,
    bins: Vec<String>,
}

fn parse_batch_field(field: &[u8]) -> crate::utils::Result<Vec<BatchRow>> {
    let mut r = MessageReader::new(field);
    let count = r.read_u32()? as usize;
    r.skip(1)?;
    let mut rows: Vec<BatchRow> = Vec::with_capacity(count);
    for _ in 0..count {
        let index = r.read_u32()?;
        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(r.read_bytes(DIGEST_SIZE)?);
        if r.read_u8()? == 1 {
            let prev = rows
                .last()
                .ok_or_else(|| crate::utils::Error::parse("batch repeat without a previous key"))?;
            let (namespace, read_attr, bins) = (prev.namespace.clone(), prev.read_attr, prev.bins.clone());
            rows.push(BatchRow {
                index,
                digest,
                namespace,
                read_attr,
                bins,
            });
            continue;
        }
        let read_attr = r.read_u8()?;
        let field_count = r.read_u16()?;
        let op_count = r.read_u16()?;
        let mut namespace = String::new();
        for _ in 0..field_count {
            let len = r.read_u32()? as usize;
            let field_type = r.read_u8()?;
            let data = r.read_bytes(len.saturating_sub(1))?;
            if field_type == FieldType::Namespace as u8 {
                namespace = String::from_utf8_lossy(data).into_owned();
            }
        }
        let mut bins = Vec::with_capacity(op_count as usize);
        for _ in 0..op_count {
            let size = r.read_u32()? as usize;
            r.skip(3)?;
            let name_len = r.read_u8()? as usize;
            bins.push(String::from_utf8_lossy(r.read_bytes(name_len)?).into_owned());
            r.skip(size.saturating_sub(4 + name_len))?;
        }
        rows.push(BatchRow {
            index,
            digest,
            namespace,
            read_attr,
            bins,
        });
    }
    Ok(rows)
}
