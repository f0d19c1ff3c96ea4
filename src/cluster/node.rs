//! Cluster node
//!
//! A node owns a pool of data connections and one separately locked tend
//! connection used only for info and admin requests. `refresh` is the
//! per-tend health check; it flags generation changes for the tend loop to
//! act on.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::connection_pool::ConnectionPool;
use super::host::Host;
use super::node_validator::{NodeValidator, FEATURE_PARTITION_SCAN};
use super::partition::PartitionMap;
use super::peers::{parse_peers, peers_command, Peers};
use crate::client::admin::{self, SessionToken};
use crate::client::connection::Connection;
use crate::client::control_plane::{parse_name_value_list, ControlPlane};
use crate::config::ClientPolicy;
use crate::metrics::{NodeMetrics, NodeMetricsSnapshot};
use crate::utils::{ClusterError, Error, PoolError, Result, ResultCode};

/// Consecutive refresh failures after which a lone node is dropped
pub const MAX_REFRESH_FAILURES: usize = 5;

/// Client policy and credentials shared by the cluster and its nodes
pub struct NodeContext {
    pub policy: ClientPolicy,
    password_hash: RwLock<String>,
}

impl NodeContext {
    pub fn new(policy: ClientPolicy) -> Result<Self> {
        let password_hash = match &policy.password {
            Some(p) if policy.user.is_some() => admin::hash_password(p)?,
            _ => String::new(),
        };
        Ok(Self {
            policy,
            password_hash: RwLock::new(password_hash),
        })
    }

    pub fn password_hash(&self) -> String {
        self.password_hash.read().clone()
    }

    /// Use a new password hash for future logins.
    pub fn set_password_hash(&self, hash: String) {
        *self.password_hash.write() = hash;
    }
}

/// One server of the cluster
pub struct Node {
    name: String,
    host: Host,
    addr: SocketAddr,
    aliases: RwLock<Vec<Host>>,
    features: Vec<String>,
    ctx: Arc<NodeContext>,

    pool: ConnectionPool,
    /// Open data connections, pooled or in use
    connection_count: AtomicUsize,
    /// Data connections currently being opened
    opening_count: AtomicUsize,
    tend_conn: Mutex<Option<Connection>>,
    session: RwLock<Option<SessionToken>>,
    /// Rack id of this node per namespace
    racks: RwLock<Arc<HashMap<String, i32>>>,

    active: AtomicBool,
    failures: AtomicUsize,
    error_count: AtomicUsize,
    peers_generation: AtomicI64,
    partition_generation: AtomicI64,
    peers_count: AtomicUsize,
    reference_count: AtomicUsize,
    partition_changed: AtomicBool,

    metrics: NodeMetrics,
}

impl Node {
    /// Build a node from a successful validation.
    pub fn new(ctx: Arc<NodeContext>, nv: NodeValidator) -> Arc<Self> {
        let node = Self::from_parts(ctx, nv.name, nv.host, nv.addr, nv.features);
        *node.aliases.write() = nv.aliases;
        *node.session.write() = nv.session;
        *node.tend_conn.lock() = Some(nv.conn);
        Arc::new(node)
    }

    fn from_parts(
        ctx: Arc<NodeContext>,
        name: String,
        host: Host,
        addr: SocketAddr,
        features: Vec<String>,
    ) -> Self {
        let pool = ConnectionPool::new(ctx.policy.connection_queue_size);
        Self {
            name,
            host,
            addr,
            aliases: RwLock::new(Vec::new()),
            features,
            ctx,
            pool,
            connection_count: AtomicUsize::new(0),
            opening_count: AtomicUsize::new(0),
            tend_conn: Mutex::new(None),
            session: RwLock::new(None),
            racks: RwLock::new(Arc::new(HashMap::new())),
            active: AtomicBool::new(true),
            failures: AtomicUsize::new(0),
            error_count: AtomicUsize::new(0),
            peers_generation: AtomicI64::new(-1),
            partition_generation: AtomicI64::new(-1),
            peers_count: AtomicUsize::new(0),
            reference_count: AtomicUsize::new(0),
            partition_changed: AtomicBool::new(false),
            metrics: NodeMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn aliases(&self) -> Vec<Host> {
        self.aliases.read().clone()
    }

    pub fn add_alias(&self, alias: Host) {
        let mut aliases = self.aliases.write();
        if !aliases.contains(&alias) {
            aliases.push(alias);
        }
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn supports_partition_scan(&self) -> bool {
        self.features.iter().any(|f| f == FEATURE_PARTITION_SCAN)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn reference_count(&self) -> usize {
        self.reference_count.load(Ordering::Relaxed)
    }

    pub(crate) fn incr_reference_count(&self) {
        self.reference_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn partition_generation(&self) -> i64 {
        self.partition_generation.load(Ordering::Relaxed)
    }

    pub(crate) fn set_partition_generation(&self, generation: i64) {
        self.partition_generation.store(generation, Ordering::Relaxed);
    }

    /// Make the next tend re-read this node's partitions.
    pub(crate) fn force_partition_refresh(&self) {
        self.partition_generation.store(-1, Ordering::Relaxed);
    }

    pub fn partition_changed(&self) -> bool {
        self.partition_changed.load(Ordering::Relaxed)
    }

    /// Whether this node sits on `rack_id` for `namespace`.
    pub fn has_rack(&self, namespace: &str, rack_id: i32) -> bool {
        self.racks.read().get(namespace) == Some(&rack_id)
    }

    pub fn rack(&self, namespace: &str) -> Result<i32> {
        self.racks
            .read()
            .get(namespace)
            .copied()
            .ok_or_else(|| {
                ClusterError::RackNotDefined {
                    namespace: namespace.to_string(),
                    node: self.name.clone(),
                }
                .into()
            })
    }

    // ===== Tend =====

    /// Clear per-iteration tend state.
    pub(crate) fn reset_tend_state(&self) {
        self.reference_count.store(0, Ordering::Relaxed);
        self.partition_changed.store(false, Ordering::Relaxed);
    }

    /// Refresh the node: name, generations and racks.
    pub(crate) fn refresh(&self, peers: &Peers) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        NodeMetrics::incr(&self.metrics.tends_total);

        let mut names = vec!["node", "peers-generation", "partition-generation"];
        if self.ctx.policy.rack_aware {
            names.push("racks:");
        }

        let result = self
            .tend_info(&names)
            .and_then(|info| self.apply_refresh(&info, peers));
        if let Err(e) = result {
            peers.mark_gen_changed();
            self.refresh_failed(&e);
            return Err(e);
        }

        self.failures.store(0, Ordering::Relaxed);
        peers.incr_refresh_count();
        NodeMetrics::incr(&self.metrics.tends_successful);

        if let Err(e) = self.refresh_session_token() {
            warn!("Session token refresh failed on node {}: {}", self, e);
        }
        Ok(())
    }

    fn apply_refresh(&self, info: &HashMap<String, String>, peers: &Peers) -> Result<()> {
        let name = info.get("node").map(String::as_str).unwrap_or("");
        if name.is_empty() {
            return Err(ClusterError::InvalidNode("node name is empty".into()).into());
        }
        if name != self.name {
            // the address now belongs to another node
            self.active.store(false, Ordering::Relaxed);
            return Err(ClusterError::NodeNameMismatch {
                expected: self.name.clone(),
                actual: name.to_string(),
            }
            .into());
        }

        let peers_gen = parse_generation(info, "peers-generation")?;
        if self.peers_generation.load(Ordering::Relaxed) != peers_gen {
            peers.mark_gen_changed();
        }

        let partition_gen = parse_generation(info, "partition-generation")?;
        if self.partition_generation() != partition_gen {
            self.partition_changed.store(true, Ordering::Relaxed);
        }

        if self.ctx.policy.rack_aware {
            let racks = info.get("racks:").map(String::as_str).unwrap_or("");
            match parse_racks(racks, &self.name) {
                Ok(parsed) => *self.racks.write() = Arc::new(parsed),
                Err(e) if e.result_code() == ResultCode::UnsupportedFeature => return Err(e),
                Err(e) => warn!("Rack info of node {} is invalid: {} (`{}`)", self, e, racks),
            }
        }
        Ok(())
    }

    fn refresh_failed(&self, e: &Error) {
        self.peers_generation.store(-1, Ordering::Relaxed);
        self.partition_generation.store(-1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
        NodeMetrics::incr(&self.metrics.tends_failed);
        warn!("Node {} refresh failed: {}", self, e);
    }

    /// Read the peer list. Peers already known get their reference count
    /// bumped; unknown ones are queued for validation.
    pub(crate) fn refresh_peers(&self, peers: &Peers, known: &HashMap<String, Arc<Node>>) {
        if self.failures() > 0 || !self.is_active() {
            return;
        }
        let policy = &self.ctx.policy;
        let command = peers_command(policy.tls_config.is_some(), policy.use_services_alternate);
        let result = self.tend_info(&[command]).and_then(|info| {
            let reply = info
                .get(command)
                .ok_or_else(|| Error::parse(format!("info reply missing `{}`", command)))?;
            parse_peers(reply, &policy.ip_map)
        });
        let (generation, list) = match result {
            Ok(v) => v,
            Err(e) => {
                debug!("Peers refresh of node {} failed: {}", self, e);
                self.refresh_failed(&e);
                return;
            }
        };

        self.peers_count.store(list.len(), Ordering::Relaxed);
        let mut unknown = Vec::new();
        for peer in list {
            match known
                .get(&peer.node_name)
                .cloned()
                .or_else(|| peers.node(&peer.node_name))
            {
                Some(node) => node.incr_reference_count(),
                None => unknown.push(peer),
            }
        }
        peers.append(unknown);
        self.peers_generation
            .store(generation as i64, Ordering::Relaxed);
        peers.incr_refresh_count();
    }

    /// Read the partition ownership of this node into the pending map.
    ///
    /// `pending` starts as `None` and is cloned from `current` by the first
    /// node that has something to apply.
    pub(crate) fn refresh_partitions(
        self: &Arc<Self>,
        peers: &Peers,
        pending: &Mutex<Option<PartitionMap>>,
        current: &PartitionMap,
        freshly_added: bool,
    ) {
        // A node that sees no peers while others do may believe it is a
        // cluster of one; its map must not override the others.
        if !freshly_added
            && (self.failures() > 0
                || !self.is_active()
                || (self.peers_count.load(Ordering::Relaxed) == 0 && peers.refresh_count() > 1))
        {
            return;
        }

        let result = self
            .tend_info(&["partition-generation", "replicas"])
            .and_then(|info| {
                let generation = parse_generation(&info, "partition-generation")?;
                let replicas = info
                    .get("replicas")
                    .ok_or_else(|| Error::parse("info reply missing `replicas`"))?;
                let mut guard = pending.lock();
                let map = guard.get_or_insert_with(|| current.clone());
                map.update_from_replicas(self, replicas)?;
                Ok(generation)
            });

        match result {
            Ok(generation) => {
                if generation != self.partition_generation() {
                    info!(
                        "Node {} partition generation changed from {} to {}",
                        self,
                        self.partition_generation(),
                        generation
                    );
                    self.partition_changed.store(true, Ordering::Relaxed);
                    self.set_partition_generation(generation);
                    NodeMetrics::incr(&self.metrics.partition_map_updates);
                }
            }
            Err(e) => self.refresh_failed(&e),
        }
    }

    fn refresh_session_token(&self) -> Result<()> {
        let policy = &self.ctx.policy;
        if !policy.requires_authentication() {
            return Ok(());
        }
        let expiring = self
            .session
            .read()
            .as_ref()
            .map(|t| t.expires_within(policy.effective_tend_interval()))
            .unwrap_or(false);
        if !expiring {
            return Ok(());
        }

        let mut guard = self.tend_conn.lock();
        let conn = self.ensure_tend_connection(&mut guard)?;
        match admin::login(conn, policy, &self.ctx.password_hash()) {
            Ok(token) => {
                *self.session.write() = token;
                Ok(())
            }
            Err(e) => {
                // new connections log in from scratch until a token is issued
                *self.session.write() = None;
                *guard = None;
                Err(e)
            }
        }
    }

    // ===== Info =====

    fn tend_info(&self, names: &[&str]) -> Result<HashMap<String, String>> {
        self.request_info(names, self.ctx.policy.timeout)
    }

    /// Run info commands on the tend connection.
    pub fn request_info(&self, names: &[&str], timeout: Duration) -> Result<HashMap<String, String>> {
        let mut guard = self.tend_conn.lock();
        let conn = self.ensure_tend_connection(&mut guard)?;
        conn.set_timeout(deadline_after(timeout), timeout);
        match conn.request_info(names) {
            Ok(info) => Ok(info),
            Err(e) => {
                *guard = None;
                Err(e.with_node(self.name.clone()))
            }
        }
    }

    /// Parsed `statistics` of the node.
    pub fn request_stats(&self, timeout: Duration) -> Result<HashMap<String, String>> {
        let info = self.request_info(&["statistics"], timeout)?;
        Ok(info
            .get("statistics")
            .map(|s| parse_name_value_list(s, ';'))
            .unwrap_or_default())
    }

    /// Whether the node is migrating partitions.
    pub fn migration_in_progress(&self, timeout: Duration) -> Result<bool> {
        let stats = self.request_stats(timeout)?;
        Ok(stats
            .get("migrate_partitions_remaining")
            .map(|v| v.trim() != "0")
            .unwrap_or(false))
    }

    /// Poll until migrations finish or `timeout` elapses.
    pub fn wait_until_migration_is_finished(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let poll_timeout = self.ctx.policy.timeout;
        while self.migration_in_progress(poll_timeout)? {
            if Instant::now() >= deadline {
                return Err(Error::from(crate::utils::ErrorKind::Timeout).with_node(self.name.clone()));
            }
            std::thread::sleep(Duration::from_millis(250));
        }
        Ok(())
    }

    fn ensure_tend_connection<'a>(
        &self,
        slot: &'a mut Option<Connection>,
    ) -> Result<&'a mut Connection> {
        if slot.as_ref().map(Connection::is_closed).unwrap_or(true) {
            *slot = Some(self.open_connection()?);
        }
        slot.as_mut()
            .ok_or_else(|| ClusterError::ServerNotAvailable(self.name.clone()).into())
    }

    // ===== Data connections =====

    /// Take a pooled connection or open a new one, bounded by the deadline
    /// and socket timeout of the command.
    pub fn get_connection(&self, deadline: Option<Instant>, socket_timeout: Duration) -> Result<Connection> {
        if !self.is_active() {
            return Err(ClusterError::ServerNotAvailable(self.name.clone()).into());
        }

        while let Some(mut conn) = self.pool.poll() {
            if conn.is_closed() || conn.is_idle() {
                self.discard(conn);
                continue;
            }
            conn.set_timeout(deadline, socket_timeout);
            return Ok(conn);
        }

        let mut conn = self.create_connection()?;
        conn.set_timeout(deadline, socket_timeout);
        Ok(conn)
    }

    /// Open a counted data connection, honoring the pool limits.
    fn create_connection(&self) -> Result<Connection> {
        let policy = &self.ctx.policy;
        let count = self.connection_count.fetch_add(1, Ordering::AcqRel) + 1;
        if policy.limit_connections_to_queue_size && count > policy.connection_queue_size {
            self.connection_count.fetch_sub(1, Ordering::AcqRel);
            NodeMetrics::incr(&self.metrics.connections_pool_exhausted);
            return Err(PoolError::Exhausted(self.name.clone()).into());
        }

        if policy.opening_connection_threshold > 0 {
            let opening = self.opening_count.fetch_add(1, Ordering::AcqRel) + 1;
            if opening > policy.opening_connection_threshold {
                self.opening_count.fetch_sub(1, Ordering::AcqRel);
                self.connection_count.fetch_sub(1, Ordering::AcqRel);
                NodeMetrics::incr(&self.metrics.connections_pool_empty);
                return Err(PoolError::Empty(self.name.clone()).into());
            }
        }

        let result = self.open_connection();
        if policy.opening_connection_threshold > 0 {
            self.opening_count.fetch_sub(1, Ordering::AcqRel);
        }
        if result.is_err() {
            self.connection_count.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    /// Connect and authenticate; not counted against the pool.
    fn open_connection(&self) -> Result<Connection> {
        let policy = &self.ctx.policy;
        NodeMetrics::incr(&self.metrics.connections_attempts);
        let mut conn = match Connection::open(
            self.addr,
            self.host.tls_name.as_deref(),
            policy.tls_config.as_ref(),
            policy.timeout,
            policy.idle_timeout,
        ) {
            Ok(c) => c,
            Err(e) => {
                self.incr_error_count();
                NodeMetrics::incr(&self.metrics.connections_failed);
                return Err(e.with_node(self.name.clone()));
            }
        };

        if let Err(e) = self.authenticate(&mut conn) {
            if e.is_network() {
                self.incr_error_count();
            }
            NodeMetrics::incr(&self.metrics.connections_failed);
            return Err(e.with_node(self.name.clone()));
        }
        NodeMetrics::incr(&self.metrics.connections_successful);
        Ok(conn)
    }

    fn authenticate(&self, conn: &mut Connection) -> Result<()> {
        let policy = &self.ctx.policy;
        if !policy.requires_authentication() {
            return Ok(());
        }
        let token = self.session.read().clone();
        match token {
            Some(token) => admin::authenticate(
                conn,
                policy.user.as_deref().unwrap_or(""),
                &token.token,
                policy.login_timeout,
            ),
            None => {
                if let Some(token) = admin::login(conn, policy, &self.ctx.password_hash())? {
                    *self.session.write() = Some(token);
                }
                Ok(())
            }
        }
    }

    /// Return a connection after a command completed cleanly.
    pub fn put_connection(&self, mut conn: Connection) {
        if !self.is_active() || conn.is_closed() {
            self.discard(conn);
            return;
        }
        conn.refresh();
        if let Err(conn) = self.pool.offer(conn) {
            self.discard(conn);
        }
    }

    /// Close a connection that must not be reused.
    pub fn invalidate_connection(&self, conn: Connection) {
        self.discard(conn);
    }

    fn discard(&self, mut conn: Connection) {
        conn.close();
        self.connection_count.fetch_sub(1, Ordering::AcqRel);
        NodeMetrics::incr(&self.metrics.connections_closed);
    }

    /// Open data connections.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Drop idle pooled connections and top the pool up to the configured
    /// minimum.
    pub(crate) fn balance_connections(&self) {
        for conn in self.pool.drop_idle() {
            self.discard(conn);
        }
        let min = self.ctx.policy.min_connections_per_node;
        let missing = min.saturating_sub(self.connection_count());
        if missing > 0 {
            if let Err(e) = self.fill_pool(missing) {
                debug!("Filling the pool of node {} failed: {}", self, e);
            }
        }
    }

    /// Open up to `count` connections into the pool; returns how many were opened.
    pub fn warm_up(&self, count: usize) -> Result<usize> {
        let target = count.min(self.pool.capacity());
        let missing = target.saturating_sub(self.pool.len());
        self.fill_pool(missing)
    }

    fn fill_pool(&self, count: usize) -> Result<usize> {
        let mut opened = 0;
        for _ in 0..count {
            let conn = match self.create_connection() {
                Ok(c) => c,
                Err(e) if opened > 0 => {
                    debug!("Stopped filling pool of node {}: {}", self, e);
                    break;
                }
                Err(e) => return Err(e),
            };
            if let Err(conn) = self.pool.offer(conn) {
                self.discard(conn);
                break;
            }
            opened += 1;
        }
        Ok(opened)
    }

    // ===== Error rate =====

    pub(crate) fn incr_error_count(&self) {
        if self.ctx.policy.max_error_rate > 0 {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn reset_error_count(&self) {
        self.error_count.store(0, Ordering::Relaxed);
    }

    /// Reject commands while the node is over its error budget.
    pub fn validate_error_count(&self) -> Result<()> {
        let max = self.ctx.policy.max_error_rate;
        if max > 0 && self.error_count.load(Ordering::Relaxed) > max {
            return Err(ClusterError::MaxErrorRate(self.name.clone()).into());
        }
        Ok(())
    }

    // ===== Lifecycle =====

    /// Deactivate and close every connection.
    pub fn close(&self) {
        self.active.store(false, Ordering::Relaxed);
        for conn in self.pool.drain() {
            self.discard(conn);
        }
        *self.tend_conn.lock() = None;
    }

    pub fn stats(&self) -> NodeMetricsSnapshot {
        self.metrics
            .snapshot(&self.name, &self.host.to_string(), self.connection_count())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.host)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({} {})", self.name, self.addr)
    }
}

fn deadline_after(timeout: Duration) -> Option<Instant> {
    (!timeout.is_zero()).then(|| Instant::now() + timeout)
}

fn parse_generation(info: &HashMap<String, String>, name: &str) -> Result<i64> {
    let value = info.get(name).map(|v| v.trim()).unwrap_or("");
    if value.is_empty() {
        return Err(Error::parse(format!("{} is empty", name)));
    }
    value
        .parse()
        .map_err(|_| Error::parse(format!("{} is not a number: {}", name, value)))
}

/// Rack ids of `node_name` per namespace from a `racks:` reply:
/// `ns=<ns>:rack_<id>=<node>,<node>:rack_<id>=...;ns=...`
pub fn parse_racks(reply: &str, node_name: &str) -> Result<HashMap<String, i32>> {
    if reply.trim().to_ascii_uppercase().starts_with("ERROR") {
        return Err(Error::server_msg(
            ResultCode::UnsupportedFeature,
            "rack awareness is enabled but the server does not support it",
        ));
    }

    let mut racks = HashMap::new();
    for entry in reply.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.split(':');
        let namespace = parts
            .next()
            .and_then(|p| p.strip_prefix("ns="))
            .ok_or_else(|| Error::parse(format!("invalid racks entry `{}`", entry)))?;
        for rack in parts {
            let (id, nodes) = rack
                .strip_prefix("rack_")
                .and_then(|r| r.split_once('='))
                .ok_or_else(|| Error::parse(format!("invalid rack `{}`", rack)))?;
            let id: i32 = id
                .parse()
                .map_err(|_| Error::parse(format!("invalid rack id `{}`", id)))?;
            if nodes.split(',').any(|n| n == node_name) {
                racks.insert(namespace.to_string(), id);
            }
        }
    }
    Ok(racks)
}

/// Standalone node for unit tests; never connects anywhere.
#[cfg(test)]
pub(crate) fn test_node(name: &str) -> Arc<Node> {
    test_node_with(name, ClientPolicy::default(), "127.0.0.1:3000".parse().unwrap())
}

#[cfg(test)]
pub(crate) fn test_node_with(name: &str, policy: ClientPolicy, addr: SocketAddr) -> Arc<Node> {
    let ctx = Arc::new(NodeContext::new(policy).unwrap());
    Arc::new(Node::from_parts(
        ctx,
        name.to_string(),
        Host::from(addr),
        addr,
        vec![FEATURE_PARTITION_SCAN.to_string()],
    ))
}

#[cfg(test)]
pub(crate) fn set_test_racks(node: &Node, racks: &[(&str, i32)]) {
    let map = racks.iter().map(|(ns, id)| (ns.to_string(), *id)).collect();
    *node.racks.write() = Arc::new(map);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_parse_racks() {
        let racks = parse_racks("ns=test:rack_1=A,B:rack_2=C;ns=bar:rack_7=C,D;", "C").unwrap();
        assert_eq!(racks.get("test"), Some(&2));
        assert_eq!(racks.get("bar"), Some(&7));

        let none = parse_racks("ns=test:rack_1=A", "Z").unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_parse_racks_errors() {
        let e = parse_racks("ERROR::unknown command", "A").unwrap_err();
        assert_eq!(e.result_code(), ResultCode::UnsupportedFeature);
        assert!(parse_racks("test:rack_1=A", "A").is_err());
        assert!(parse_racks("ns=test:rack_x=A", "A").is_err());
    }

    #[test]
    fn test_has_rack() {
        let node = test_node("A");
        set_test_racks(&node, &[("test", 3)]);
        assert!(node.has_rack("test", 3));
        assert!(!node.has_rack("test", 4));
        assert!(node.rack("other").is_err());
    }

    #[test]
    fn test_error_rate_circuit_breaker() {
        let policy = ClientPolicy {
            max_error_rate: 2,
            ..Default::default()
        };
        let node = test_node_with("A", policy, "127.0.0.1:3000".parse().unwrap());
        node.incr_error_count();
        node.incr_error_count();
        assert!(node.validate_error_count().is_ok());
        node.incr_error_count();
        let e = node.validate_error_count().unwrap_err();
        assert_eq!(e.result_code(), ResultCode::MaxErrorRate);
        node.reset_error_count();
        assert!(node.validate_error_count().is_ok());
    }

    #[test]
    fn test_pool_limit_is_exhausted() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let policy = ClientPolicy {
            connection_queue_size: 1,
            ..Default::default()
        };
        let node = test_node_with("A", policy, listener.local_addr().unwrap());

        let first = node.get_connection(None, Duration::from_secs(1)).unwrap();
        assert_eq!(node.connection_count(), 1);
        let err = node.get_connection(None, Duration::from_secs(1)).err().unwrap();
        assert!(matches!(
            err.kind(),
            crate::utils::ErrorKind::Pool(PoolError::Exhausted(_))
        ));

        node.put_connection(first);
        let again = node.get_connection(None, Duration::from_secs(1)).unwrap();
        assert_eq!(node.connection_count(), 1);
        node.invalidate_connection(again);
        assert_eq!(node.connection_count(), 0);
    }

    #[test]
    fn test_warm_up_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let policy = ClientPolicy {
            connection_queue_size: 4,
            ..Default::default()
        };
        let node = test_node_with("A", policy, listener.local_addr().unwrap());
        assert_eq!(node.warm_up(10).unwrap(), 4);
        assert_eq!(node.connection_count(), 4);

        node.close();
        assert!(!node.is_active());
        assert_eq!(node.connection_count(), 0);
        assert!(node.get_connection(None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_unreachable_node_counts_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let node = test_node_with("A", ClientPolicy::default(), addr);
        assert!(node.get_connection(None, Duration::from_secs(1)).is_err());
        assert_eq!(node.connection_count(), 0);
        assert_eq!(node.stats().connections_failed, 1);
    }
}
