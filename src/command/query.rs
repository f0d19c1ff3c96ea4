//! Secondary index queries
//!
//! A query without an index filter is a partition scan with the
//! statement's projection. A query with a filter goes to every node once;
//! each node answers from its own index, so there is nothing to resume.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use tracing::warn;

use super::executor::execute_from;
use super::filter::Statement;
use super::orchestrator::run_bounded;
use super::partition_tracker::PartitionFilter;
use super::recordset::{RecordSender, Recordset, StreamKind};
use super::scan::{start_partitions, StreamCommand, StreamRequest};
use crate::cluster::{Cluster, Node};
use crate::config::{QueryPolicy, ScanPolicy};
use crate::utils::{ClusterError, Error, Result, ResultCode};

impl StreamRequest {
    pub fn query(statement: &Statement) -> Self {
        Self {
            namespace: statement.namespace.clone(),
            set_name: statement.set_name.clone(),
            bin_names: statement.bin_names.clone(),
            filter: statement.filter.clone(),
            index_name: statement.index_name.clone(),
            kind: StreamKind::Query,
        }
    }
}

/// Start a query.
///
/// With `partitions` set, or without an index filter, the query runs by
/// partition and can be resumed through the filter.
pub(crate) fn start_query(
    cluster: Arc<Cluster>,
    policy: &QueryPolicy,
    statement: &Statement,
    partitions: Option<PartitionFilter>,
) -> Result<Recordset> {
    statement.validate()?;
    let request = StreamRequest::query(statement);

    if statement.filter.is_none() || partitions.is_some() {
        let filter = partitions.unwrap_or_else(PartitionFilter::all);
        return start_partitions(cluster, policy.as_scan_policy(), request, filter, None);
    }

    let nodes: Vec<Arc<Node>> = cluster
        .nodes()
        .iter()
        .filter(|n| n.is_active())
        .cloned()
        .collect();
    if nodes.is_empty() {
        return Err(ClusterError::ClusterEmpty.into());
    }
    spawn_node_query(cluster, policy, request, nodes)
}

/// Run a query on one node only. Without an index filter this covers the
/// partitions the node masters.
pub(crate) fn start_query_node(
    cluster: Arc<Cluster>,
    policy: &QueryPolicy,
    statement: &Statement,
    node: Arc<Node>,
) -> Result<Recordset> {
    statement.validate()?;
    let request = StreamRequest::query(statement);
    if statement.filter.is_none() {
        return start_partitions(
            cluster,
            policy.as_scan_policy(),
            request,
            PartitionFilter::all(),
            Some(node),
        );
    }
    spawn_node_query(cluster, policy, request, vec![node])
}

fn spawn_node_query(
    cluster: Arc<Cluster>,
    policy: &QueryPolicy,
    request: StreamRequest,
    nodes: Vec<Arc<Node>>,
) -> Result<Recordset> {
    let task_id = fastrand::u64(..);
    let (recordset, sender) = Recordset::new(policy.record_queue_size, task_id, StreamKind::Query);
    let scan_policy = policy.as_scan_policy();
    let fail_on_change = policy.fail_on_cluster_change;

    let handle = thread::Builder::new()
        .name(format!("shardline-query-{}", task_id))
        .spawn(move || {
            let result = run_on_nodes(&cluster, &scan_policy, &request, nodes, &sender, task_id, fail_on_change);
            if let Err(e) = result {
                if sender.is_active() {
                    warn!("query {} failed: {}", task_id, e);
                    sender.send_error(e);
                }
            }
        })
        .map_err(Error::from)?;
    recordset.set_producer(handle);
    Ok(recordset)
}

fn node_names(nodes: &[Arc<Node>]) -> BTreeSet<String> {
    nodes.iter().map(|n| n.name().to_string()).collect()
}

fn run_on_nodes(
    cluster: &Cluster,
    policy: &ScanPolicy,
    request: &StreamRequest,
    nodes: Vec<Arc<Node>>,
    sender: &RecordSender,
    task_id: u64,
    fail_on_change: bool,
) -> Result<()> {
    let before = node_names(&cluster.nodes());
    let deadline = if policy.base.total_timeout.is_zero() {
        None
    } else {
        Some(std::time::Instant::now() + policy.base.total_timeout)
    };

    let results = run_bounded("query", nodes, policy.max_concurrent_nodes, |node| {
        let name = node.name().to_string();
        let mut cmd = StreamCommand::for_node(policy, request, node, sender, task_id);
        execute_from(cluster, &mut cmd, deadline, 0).map_err(|e| e.with_node(name))
    });

    let mut chain: Option<Error> = None;
    for e in results.into_iter().filter_map(|r| r.err()) {
        chain = Some(e.chain_onto(chain));
    }
    if let Some(e) = chain {
        return Err(e);
    }

    if fail_on_change && node_names(&cluster.nodes()) != before {
        return Err(Error::server_msg(
            ResultCode::ClusterKeyMismatch,
            "cluster changed while the query ran",
        ));
    }
    Ok(())
}
