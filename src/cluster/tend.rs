//! Cluster view and tend loop
//!
//! The [`Cluster`] owns the node list and the partition map. A background
//! thread re-runs [`Cluster::tend`] every tend interval: it refreshes every node,
//! discovers peers, drops dead nodes and rebuilds the partition map. Readers
//! take cheap `Arc` snapshots of both and never observe a half-built view.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::host::Host;
use super::node::{Node, NodeContext, MAX_REFRESH_FAILURES};
use super::node_validator::NodeValidator;
use super::partition::PartitionMap;
use super::peers::Peers;
use crate::config::ClientPolicy;
use crate::metrics::ClusterStats;
use crate::utils::{ClusterError, Error, Result, ResultCode};

const MAX_TEND_BACKOFF: Duration = Duration::from_secs(5);

/// Client view of the cluster
pub struct Cluster {
    ctx: Arc<NodeContext>,
    seeds: RwLock<Vec<Host>>,
    nodes: RwLock<Arc<Vec<Arc<Node>>>>,
    nodes_by_name: RwLock<HashMap<String, Arc<Node>>>,
    aliases: RwLock<HashMap<Host, Arc<Node>>>,
    partition_map: RwLock<Arc<PartitionMap>>,

    node_index: AtomicUsize,
    replica_index: AtomicUsize,
    tend_count: AtomicU64,
    closed: AtomicBool,

    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
    tend_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    /// Seed the cluster, wait for the view to settle and start tending.
    pub fn connect(policy: ClientPolicy, seeds: Vec<Host>) -> Result<Arc<Self>> {
        policy.validate()?;
        if seeds.is_empty() {
            return Err(Error::parameter("no seed hosts"));
        }
        let ctx = Arc::new(NodeContext::new(policy)?);
        let cluster = Arc::new(Self::with_context(ctx, seeds));

        let result = cluster.wait_till_stabilized();
        if cluster.ctx.policy.fail_if_not_connected && !cluster.is_connected() {
            let cause = result.err();
            cluster.close();
            return Err(Error::from(ClusterError::ClusterEmpty).chain_onto(cause));
        }
        if let Err(e) = result {
            warn!("Cluster is not fully connected: {}", e);
        }

        let handle = Self::spawn_tend_thread(&cluster)?;
        *cluster.tend_thread.lock() = Some(handle);
        info!(
            "Connected to cluster with {} node(s)",
            cluster.nodes().len()
        );
        Ok(cluster)
    }

    fn with_context(ctx: Arc<NodeContext>, seeds: Vec<Host>) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        Self {
            ctx,
            seeds: RwLock::new(seeds),
            nodes: RwLock::new(Arc::new(Vec::new())),
            nodes_by_name: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            partition_map: RwLock::new(Arc::new(PartitionMap::new())),
            node_index: AtomicUsize::new(0),
            replica_index: AtomicUsize::new(0),
            tend_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
            tend_thread: Mutex::new(None),
        }
    }

    /// Cluster with a fixed node list and partition map; never tends.
    #[cfg(test)]
    pub(crate) fn for_test(policy: ClientPolicy, nodes: Vec<Arc<Node>>, map: PartitionMap) -> Self {
        let ctx = Arc::new(NodeContext::new(policy).unwrap());
        let cluster = Self::with_context(ctx, Vec::new());
        cluster.add_nodes(nodes);
        *cluster.partition_map.write() = Arc::new(map);
        cluster
    }

    /// The tend thread only holds a weak reference, so dropping the last
    /// client handle stops it.
    fn spawn_tend_thread(cluster: &Arc<Self>) -> Result<JoinHandle<()>> {
        let weak: Weak<Self> = Arc::downgrade(cluster);
        let shutdown = cluster.shutdown_rx.clone();
        let interval = cluster.ctx.policy.effective_tend_interval();

        thread::Builder::new()
            .name("shardline-tend".into())
            .spawn(move || tend_loop(weak, shutdown, interval))
            .map_err(Error::from)
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn policy(&self) -> &ClientPolicy {
        &self.ctx.policy
    }

    pub fn rack_ids(&self) -> &[i32] {
        &self.ctx.policy.rack_ids
    }

    /// Snapshot of the current node list.
    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        Arc::clone(&self.nodes.read())
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes().iter().map(|n| n.name().to_string()).collect()
    }

    /// Snapshot of the current partition map.
    pub fn partition_map(&self) -> Arc<PartitionMap> {
        Arc::clone(&self.partition_map.read())
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && self.nodes().iter().any(|n| n.is_active())
    }

    pub fn tend_count(&self) -> u64 {
        self.tend_count.load(Ordering::Relaxed)
    }

    pub(crate) fn next_replica_index(&self) -> usize {
        self.replica_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Next active node in round-robin order.
    pub fn random_node(&self) -> Result<Arc<Node>> {
        let nodes = self.nodes();
        for _ in 0..nodes.len() {
            let index = self.node_index.fetch_add(1, Ordering::Relaxed) % nodes.len();
            if nodes[index].is_active() {
                return Ok(Arc::clone(&nodes[index]));
            }
        }
        Err(ClusterError::ClusterEmpty.into())
    }

    pub fn get_node_by_name(&self, name: &str) -> Result<Arc<Node>> {
        self.nodes_by_name
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::InvalidNode(format!("node {} not found", name)).into())
    }

    /// Add hosts to try when the node list runs empty.
    pub fn add_seeds(&self, hosts: Vec<Host>) {
        let mut seeds = self.seeds.write();
        for host in hosts {
            if !seeds.contains(&host) {
                seeds.push(host);
            }
        }
    }

    pub fn seeds(&self) -> Vec<Host> {
        self.seeds.read().clone()
    }

    /// Tend until the node count stops changing or the policy timeout
    /// passes. Authentication and cluster name errors end the wait early.
    pub fn wait_till_stabilized(&self) -> Result<()> {
        let deadline = Instant::now() + self.ctx.policy.timeout;
        let mut last_count: Option<usize> = None;
        let mut last_error: Option<Error> = None;

        loop {
            if let Err(e) = self.tend() {
                let fatal = e.chain().any(|c| {
                    matches!(
                        c.result_code(),
                        ResultCode::NotAuthenticated | ResultCode::ClusterNameMismatch
                    )
                });
                if fatal {
                    return Err(e);
                }
                debug!("Tend failed while stabilizing: {}", e);
                last_error = Some(e);
            }

            let count = self.nodes().len();
            if last_count == Some(count) {
                break;
            }
            last_count = Some(count);
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        match last_error {
            Some(e) if self.nodes().is_empty() => Err(e),
            _ => Ok(()),
        }
    }

    /// One tend iteration.
    pub fn tend(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut nodes = self.nodes();
        let node_count_before = nodes.len();
        if nodes.is_empty() {
            self.seed_nodes()?;
            nodes = self.nodes();
        }

        let peers = Peers::new();
        for node in nodes.iter() {
            node.reset_tend_state();
        }

        thread::scope(|s| {
            for node in nodes.iter() {
                let peers = &peers;
                s.spawn(move || {
                    let _ = node.refresh(peers);
                });
            }
        });

        if needs_peers_refresh(&peers, node_count_before) {
            peers.refresh_count.store(0, Ordering::Relaxed);
            let known = self.nodes_by_name.read().clone();
            thread::scope(|s| {
                for node in nodes.iter() {
                    let (peers, known) = (&peers, &known);
                    s.spawn(move || node.refresh_peers(peers, known));
                }
            });
        }

        let added = if self.ctx.policy.seed_only_cluster {
            Vec::new()
        } else {
            self.validate_peers(&peers)
        };

        let current = self.partition_map();
        let pending: Mutex<Option<PartitionMap>> = Mutex::new(None);
        for node in nodes.iter().filter(|n| n.partition_changed()) {
            node.refresh_partitions(&peers, &pending, &current, false);
        }
        for node in &added {
            node.refresh_partitions(&peers, &pending, &current, true);
        }

        let before = nodes.len();
        if peers.gen_changed() {
            let remove = {
                let guard = pending.lock();
                let map = guard.as_ref().unwrap_or(&*current);
                find_nodes_to_remove(&nodes, peers.refresh_count(), map)
            };
            if !remove.is_empty() {
                self.remove_nodes(&remove);
                pending
                    .lock()
                    .get_or_insert_with(|| (*current).clone())
                    .remove_nodes(&remove);
            }
        }
        if !added.is_empty() {
            self.add_nodes(added);
        }

        if let Some(map) = pending.into_inner() {
            if let Err(e) = map.validate() {
                warn!("Partition map is incomplete: {}", e);
            }
            *self.partition_map.write() = Arc::new(map);
        }

        for node in self.nodes().iter() {
            node.balance_connections();
        }

        let count = self.tend_count.fetch_add(1, Ordering::Relaxed) + 1;
        let window = self.ctx.policy.error_rate_window.max(1) as u64;
        if count % window == 0 {
            for node in self.nodes().iter() {
                node.reset_error_count();
            }
        }

        let after = self.nodes().len();
        if after != before {
            info!("Cluster node count changed from {} to {}", before, after);
        }
        Ok(())
    }

    /// Validate seeds until at least one node answers.
    fn seed_nodes(&self) -> Result<()> {
        let seeds = self.seeds();
        let mut found: Vec<Arc<Node>> = Vec::new();
        let mut errors: Option<Error> = None;

        for seed in &seeds {
            match NodeValidator::validate(&self.ctx, seed) {
                Ok(nv) => {
                    if found.iter().any(|n| n.name() == nv.name) {
                        debug!("Seed {} is already known as node {}", seed, nv.name);
                        continue;
                    }
                    found.push(Node::new(Arc::clone(&self.ctx), nv));
                }
                Err(e) => {
                    warn!("Seed {} failed validation: {}", seed, e);
                    errors = Some(e.chain_onto(errors));
                }
            }
        }

        if found.is_empty() {
            return Err(Error::from(ClusterError::ClusterEmpty).chain_onto(errors));
        }
        self.add_nodes(found);
        Ok(())
    }

    /// Connect to peers reported this tend that are not yet cluster members.
    fn validate_peers(&self, peers: &Peers) -> Vec<Arc<Node>> {
        let mut added = Vec::new();
        for peer in peers.peers() {
            if self.nodes_by_name.read().contains_key(&peer.node_name)
                || peers.node(&peer.node_name).is_some()
            {
                continue;
            }
            for host in &peer.hosts {
                let nv = match NodeValidator::validate(&self.ctx, host) {
                    Ok(nv) => nv,
                    Err(e) => {
                        warn!("Peer {} at {} failed validation: {}", peer.node_name, host, e);
                        continue;
                    }
                };
                if nv.name != peer.node_name {
                    warn!(
                        "Peer node {} at {} answered as {}",
                        peer.node_name, host, nv.name
                    );
                    if self.nodes_by_name.read().contains_key(&nv.name)
                        || peers.node(&nv.name).is_some()
                    {
                        break;
                    }
                }
                let node = Node::new(Arc::clone(&self.ctx), nv);
                peers.add_node(Arc::clone(&node));
                added.push(node);
                break;
            }
        }
        added
    }

    fn add_nodes(&self, added: Vec<Arc<Node>>) {
        let mut list: Vec<Arc<Node>> = self.nodes().as_ref().clone();
        {
            let mut by_name = self.nodes_by_name.write();
            let mut aliases = self.aliases.write();
            for node in added {
                info!("Add node {}", node);
                by_name.insert(node.name().to_string(), Arc::clone(&node));
                for alias in node.aliases() {
                    aliases.insert(alias, Arc::clone(&node));
                }
                list.push(node);
            }
        }
        *self.nodes.write() = Arc::new(list);
    }

    fn remove_nodes(&self, removed: &[Arc<Node>]) {
        {
            let mut by_name = self.nodes_by_name.write();
            let mut aliases = self.aliases.write();
            for node in removed {
                info!("Remove node {}", node);
                by_name.remove(node.name());
                aliases.retain(|_, n| !Arc::ptr_eq(n, node));
                node.close();
            }
        }
        let list: Vec<Arc<Node>> = self
            .nodes()
            .iter()
            .filter(|n| !removed.iter().any(|r| Arc::ptr_eq(r, n)))
            .cloned()
            .collect();
        *self.nodes.write() = Arc::new(list);
    }

    /// Node a host address is known by.
    pub fn node_by_alias(&self, host: &Host) -> Option<Arc<Node>> {
        self.aliases.read().get(host).cloned()
    }

    /// Open up to `count` connections per node.
    pub fn warm_up(&self, count: usize) -> Result<usize> {
        let mut total = 0;
        for node in self.nodes().iter() {
            total += node.warm_up(count)?;
        }
        Ok(total)
    }

    pub fn stats(&self) -> ClusterStats {
        let nodes: Vec<_> = self.nodes().iter().map(|n| n.stats()).collect();
        let open_connections = nodes.iter().map(|n| n.connections_open).sum();
        ClusterStats {
            nodes,
            open_connections,
            tend_count: self.tend_count(),
        }
    }

    /// Stop tending and close every node.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.try_send(());
        if let Some(handle) = self.tend_thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Tend thread panicked during shutdown");
            }
        }
        for node in self.nodes().iter() {
            node.close();
        }
        info!("Cluster closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.close();
    }
}

/// Supervised tend loop: a panicking tend is logged and retried after a
/// growing pause.
fn tend_loop(cluster: Weak<Cluster>, shutdown: Receiver<()>, interval: Duration) {
    let mut backoff = interval;
    let mut wait = interval;
    loop {
        match shutdown.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        let Some(cluster) = cluster.upgrade() else { break };
        if cluster.is_closed() {
            break;
        }

        match catch_unwind(AssertUnwindSafe(|| cluster.tend())) {
            Ok(Ok(())) => {
                backoff = interval;
                wait = interval;
            }
            Ok(Err(e)) => {
                warn!("Tend failed: {}", e);
                wait = interval;
            }
            Err(_) => {
                error!("Tend panicked; retrying in {:?}", backoff);
                wait = backoff;
                backoff = (backoff * 2).min(MAX_TEND_BACKOFF);
            }
        }
    }
    debug!("Tend thread stopped");
}

/// Whether every node must re-read its peer list this iteration.
fn needs_peers_refresh(peers: &Peers, node_count_before: usize) -> bool {
    peers.gen_changed() || peers.peer_count() != node_count_before
}

/// Nodes the last tend showed to be gone.
fn find_nodes_to_remove(
    nodes: &[Arc<Node>],
    refresh_count: usize,
    map: &PartitionMap,
) -> Vec<Arc<Node>> {
    let mut remove = Vec::new();
    for node in nodes {
        if !node.is_active() {
            remove.push(Arc::clone(node));
            continue;
        }
        // every info request failed; give the node a few tends
        if refresh_count == 0 && node.failures() >= MAX_REFRESH_FAILURES {
            remove.push(Arc::clone(node));
            continue;
        }
        if nodes.len() > 1 && refresh_count >= 1 && node.reference_count() == 0 {
            // no peer lists this node
            if node.failures() > 0 || !map.contains_node(node) {
                remove.push(Arc::clone(node));
            }
        }
    }
    remove
}
