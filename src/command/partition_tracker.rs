//! Partition bookkeeping for scans and queries
//!
//! A [`PartitionFilter`] names the partitions a scan covers and remembers,
//! per partition, the digest of the last record delivered. The
//! [`PartitionTracker`] turns that state into per-node assignments each
//! round, collects what each node reported, and decides whether another
//! round is needed. A resumed partition restarts after its last digest, so
//! records are never delivered twice.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::key::{Key, DIGEST_SIZE};
use crate::cluster::{Cluster, Node, PARTITIONS};
use crate::config::BasePolicy;
use crate::utils::{ClusterError, Error, ErrorKind, Result};

/// Progress of one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatus {
    pub id: usize,
    /// Digest of the last record delivered from this partition
    pub digest: Option<[u8; DIGEST_SIZE]>,
    /// Still to be (re)scanned
    pub retry: bool,
    /// Replica offset used when the partition is reassigned
    pub sequence: usize,
}

#[derive(Debug)]
struct FilterState {
    begin: usize,
    count: usize,
    digest: Option<[u8; DIGEST_SIZE]>,
    partitions: Vec<PartitionStatus>,
    done: bool,
    /// Rescan every partition on the next run
    retry: bool,
}

/// The partitions a scan or query covers, with resumable progress
///
/// Clones share state: pass a clone to a scan and keep one to inspect
/// [`is_done`](Self::is_done) or to run the next page.
#[derive(Debug, Clone)]
pub struct PartitionFilter {
    inner: Arc<Mutex<FilterState>>,
}

impl PartitionFilter {
    /// Every partition of the namespace.
    pub fn all() -> Self {
        Self::by_range(0, PARTITIONS)
    }

    pub fn by_id(partition_id: usize) -> Self {
        Self::by_range(partition_id, 1)
    }

    /// `count` partitions starting at `begin`.
    pub fn by_range(begin: usize, count: usize) -> Self {
        Self::new(begin, count, None)
    }

    /// The partition of `key`, starting after `key`'s digest.
    pub fn by_digest(key: &Key) -> Self {
        Self::new(key.partition_id(), 1, Some(*key.digest()))
    }

    fn new(begin: usize, count: usize, digest: Option<[u8; DIGEST_SIZE]>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FilterState {
                begin,
                count,
                digest,
                partitions: Vec::new(),
                done: false,
                retry: true,
            })),
        }
    }

    pub fn begin(&self) -> usize {
        self.inner.lock().begin
    }

    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    /// True once every partition has been read to its end.
    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    /// Snapshot of per-partition progress.
    pub fn partitions(&self) -> Vec<PartitionStatus> {
        self.inner.lock().partitions.clone()
    }
}

/// Partitions of one round assigned to one node
#[derive(Debug)]
pub struct NodePartitions {
    pub node: Arc<Node>,
    /// Partitions read from the start
    pub parts_full: Vec<usize>,
    /// Partitions resumed after a digest
    pub parts_partial: Vec<(usize, [u8; DIGEST_SIZE])>,
    pub record_count: u64,
    /// Record limit for this node; zero for none
    pub record_max: u64,
    pub parts_unavailable: usize,
}

impl NodePartitions {
    fn new(node: Arc<Node>, capacity: usize) -> Self {
        Self {
            node,
            parts_full: Vec::with_capacity(capacity),
            parts_partial: Vec::new(),
            record_count: 0,
            record_max: 0,
            parts_unavailable: 0,
        }
    }

    fn add(&mut self, status: &PartitionStatus) {
        match status.digest {
            Some(digest) => self.parts_partial.push((status.id, digest)),
            None => self.parts_full.push(status.id),
        }
    }

    pub fn part_count(&self) -> usize {
        self.parts_full.len() + self.parts_partial.len()
    }

    pub fn partition_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.parts_full
            .iter()
            .copied()
            .chain(self.parts_partial.iter().map(|(id, _)| *id))
    }
}

/// Round-by-round driver state of one scan or query call
pub struct PartitionTracker {
    filter: PartitionFilter,
    node_filter: Option<Arc<Node>>,
    max_records: u64,
    iteration: usize,
    max_retries: usize,
    sleep: Duration,
    sleep_multiplier: f64,
    deadline: Option<Instant>,
    errors: Mutex<Option<Error>>,
}

impl PartitionTracker {
    /// Prepare `filter` for a new run.
    ///
    /// `node_filter` restricts the run to partitions mastered by one node.
    pub fn new(
        policy: &BasePolicy,
        max_records: u64,
        filter: &PartitionFilter,
        node_filter: Option<Arc<Node>>,
    ) -> Result<Self> {
        {
            let mut state = filter.inner.lock();
            if state.count == 0 || state.begin + state.count > PARTITIONS {
                return Err(Error::parameter(format!(
                    "invalid partition range: begin {}, count {}",
                    state.begin, state.count
                )));
            }
            if state.partitions.is_empty() {
                let digest = state.digest;
                state.partitions = (state.begin..state.begin + state.count)
                    .map(|id| PartitionStatus {
                        id,
                        digest: None,
                        retry: true,
                        sequence: 0,
                    })
                    .collect();
                if let Some(first) = state.partitions.first_mut() {
                    first.digest = digest;
                }
            }
            if state.retry {
                for part in state.partitions.iter_mut() {
                    part.retry = true;
                }
            }
        }

        let deadline = if policy.total_timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + policy.total_timeout)
        };

        Ok(Self {
            filter: filter.clone(),
            node_filter,
            max_records,
            iteration: 1,
            max_retries: policy.max_retries,
            sleep: policy.sleep_between_retries,
            sleep_multiplier: policy.sleep_multiplier,
            deadline,
            errors: Mutex::new(None),
        })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Assign every partition still to be read to the node that serves it.
    ///
    /// An empty list means there is nothing left to read.
    pub fn assign(&mut self, cluster: &Cluster, namespace: &str) -> Result<Vec<NodePartitions>> {
        let map = cluster.partition_map();
        let partitions = map
            .get(namespace)
            .ok_or_else(|| ClusterError::NamespaceNotFound(namespace.to_string()))?;

        let mut state = self.filter.inner.lock();
        let capacity = state.count / cluster.nodes().len().max(1) + 16;
        let mut list: Vec<NodePartitions> = Vec::new();

        for part in state.partitions.iter().filter(|p| p.retry) {
            let node = replica_for(partitions, part.id, part.sequence).ok_or_else(|| {
                Error::from(ClusterError::PartitionUnavailable {
                    namespace: namespace.to_string(),
                    partition: part.id,
                })
            })?;
            if let Some(only) = &self.node_filter {
                if only.name() != node.name() {
                    continue;
                }
            }
            match list.iter_mut().find(|np| Arc::ptr_eq(&np.node, &node)) {
                Some(np) => np.add(part),
                None => {
                    let mut np = NodePartitions::new(node, capacity);
                    np.add(part);
                    list.push(np);
                }
            }
        }

        if self.max_records > 0 && !list.is_empty() {
            let nodes = list.len() as u64;
            if self.max_records >= nodes {
                let per_node = self.max_records / nodes;
                let rem = self.max_records - per_node * nodes;
                for (i, np) in list.iter_mut().enumerate() {
                    np.record_max = per_node + u64::from((i as u64) < rem);
                }
            } else {
                list.truncate(self.max_records as usize);
                for np in list.iter_mut() {
                    np.record_max = 1;
                }
            }
        }

        // assigned partitions are retried again only if this round says so
        for np in &list {
            for id in np.partition_ids() {
                let index = id - state.begin;
                state.partitions[index].retry = false;
            }
        }
        // an interrupted run must rescan everything when the filter is reused
        state.retry = true;

        debug!(
            "Round {} of {}: {} partitions on {} nodes",
            self.iteration,
            namespace,
            list.iter().map(NodePartitions::part_count).sum::<usize>(),
            list.len()
        );
        Ok(list)
    }

    /// Record a delivered record's position.
    pub fn set_digest(&self, np: &mut NodePartitions, key: &Key) {
        let mut state = self.filter.inner.lock();
        if let Some(index) = key.partition_id().checked_sub(state.begin) {
            if let Some(part) = state.partitions.get_mut(index) {
                part.digest = Some(*key.digest());
            }
        }
        np.record_count += 1;
    }

    /// The node could not serve a partition this round.
    pub fn partition_unavailable(&self, np: &mut NodePartitions, partition_id: usize) {
        let mut state = self.filter.inner.lock();
        if let Some(index) = partition_id.checked_sub(state.begin) {
            if let Some(part) = state.partitions.get_mut(index) {
                part.retry = true;
                part.sequence += 1;
            }
        }
        np.parts_unavailable += 1;
    }

    /// The whole node failed; every partition it held is retried.
    pub fn node_error(&self, np: &mut NodePartitions, error: Error) {
        {
            let mut state = self.filter.inner.lock();
            for id in np.partition_ids() {
                let index = id - state.begin;
                let part = &mut state.partitions[index];
                part.retry = true;
                part.sequence += 1;
            }
        }
        np.parts_unavailable = np.part_count();
        let mut errors = self.errors.lock();
        *errors = Some(error.with_node(np.node.name()).chain_onto(errors.take()));
    }

    fn mark_retry(state: &mut FilterState, np: &NodePartitions) {
        for id in np.partition_ids() {
            state.partitions[id - state.begin].retry = true;
        }
    }

    /// Decide after a round whether the run is finished.
    ///
    /// `Ok(false)` means another round is due; the caller should sleep for
    /// [`next_sleep`](Self::next_sleep) first.
    pub fn is_complete(&mut self, round: &[NodePartitions]) -> Result<bool> {
        let record_count: u64 = round.iter().map(|np| np.record_count).sum();
        let parts_unavailable: usize = round.iter().map(|np| np.parts_unavailable).sum();

        if parts_unavailable == 0 {
            let mut state = self.filter.inner.lock();
            if self.max_records == 0 {
                state.done = true;
                state.retry = false;
            } else if self.iteration > 1 {
                // a retried round leaves the other nodes' paging state unknown
                state.retry = true;
                state.done = false;
            } else {
                let mut done = true;
                for np in round {
                    if np.record_max > 0 && np.record_count >= np.record_max {
                        Self::mark_retry(&mut state, np);
                        done = false;
                    }
                }
                state.retry = false;
                state.done = done;
            }
            return Ok(true);
        }

        if self.max_records > 0 && record_count >= self.max_records {
            return Ok(true);
        }

        if self.iteration > self.max_retries {
            let chain = self.errors.lock().take();
            return Err(Error::from(ErrorKind::MaxRetriesExceeded(self.iteration))
                .with_iteration(self.iteration)
                .chain_onto(chain));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() + self.sleep >= deadline {
                let chain = self.errors.lock().take();
                return Err(Error::from(ErrorKind::Timeout)
                    .with_iteration(self.iteration)
                    .chain_onto(chain));
            }
        }

        if self.max_records > 0 {
            self.max_records -= record_count;
        }
        self.iteration += 1;
        Ok(false)
    }

    /// Backoff before the next round.
    pub fn next_sleep(&mut self) -> Duration {
        let sleep = self.sleep;
        if self.sleep_multiplier > 1.0 {
            self.sleep = self.sleep.mul_f64(self.sleep_multiplier);
        }
        sleep
    }
}

/// First active replica of `partition_id`, starting at `sequence`.
fn replica_for(
    partitions: &crate::cluster::Partitions,
    partition_id: usize,
    sequence: usize,
) -> Option<Arc<Node>> {
    let count = partitions.replica_count();
    (0..count)
        .map(|i| (sequence + i) % count)
        .filter_map(|r| partitions.replicas[r][partition_id].as_ref())
        .find(|node| node.is_active())
        .cloned()
}
