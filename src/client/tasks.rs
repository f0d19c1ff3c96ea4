//! Pollers for server-side work started by an info command
//!
//! Index builds and UDF registration return before every node has caught
//! up. A task asks each node in turn and reports done once all of them do.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cluster::Cluster;
use crate::utils::{Error, ErrorKind, Result};

/// Server work that completes asynchronously on every node
pub trait Task {
    /// Whether every node has finished.
    fn is_done(&self) -> Result<bool>;

    /// Poll every `interval` until done. A zero `timeout` waits forever.
    fn wait_till_complete(&self, interval: Duration, timeout: Duration) -> Result<()> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            if self.is_done()? {
                return Ok(());
            }
            if let Some(d) = deadline {
                if Instant::now() + interval > d {
                    return Err(ErrorKind::Timeout.into());
                }
            }
            thread::sleep(interval);
        }
    }
}

/// Send one info command to every node and check each answer.
fn all_nodes_report(cluster: &Cluster, command: &str, check: impl Fn(&str) -> bool) -> Result<bool> {
    let nodes = cluster.nodes();
    if nodes.is_empty() {
        return Err(crate::utils::ClusterError::ClusterEmpty.into());
    }
    let timeout = cluster.policy().timeout;
    for node in nodes.iter() {
        let info = node.request_info(&[command], timeout)?;
        let response = info.get(command).map(String::as_str).unwrap_or("");
        if !check(response) {
            debug!("{} not complete on node {}", command, node.name());
            return Ok(false);
        }
    }
    Ok(true)
}

/// Secondary index build
pub struct IndexTask {
    cluster: Arc<Cluster>,
    namespace: String,
    index_name: String,
}

impl IndexTask {
    pub fn new(cluster: Arc<Cluster>, namespace: &str, index_name: &str) -> Self {
        Self {
            cluster,
            namespace: namespace.to_string(),
            index_name: index_name.to_string(),
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }
}

impl Task for IndexTask {
    fn is_done(&self) -> Result<bool> {
        let command = format!("sindex/{}/{}", self.namespace, self.index_name);
        all_nodes_report(&self.cluster, &command, index_loaded)
    }
}

/// An index is built on a node once it reports `load_pct=100`. A node
/// that does not know the index yet answers with FAIL:201 or FAIL:203.
fn index_loaded(response: &str) -> bool {
    response
        .split(';')
        .find_map(|kv| kv.strip_prefix("load_pct="))
        .and_then(|pct| pct.trim().parse::<u32>().ok())
        .map(|pct| pct >= 100)
        .unwrap_or(false)
}

/// UDF package registration
pub struct UdfTask {
    cluster: Arc<Cluster>,
    package_name: String,
}

impl UdfTask {
    pub fn new(cluster: Arc<Cluster>, package_name: &str) -> Self {
        Self {
            cluster,
            package_name: package_name.to_string(),
        }
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }
}

impl Task for UdfTask {
    fn is_done(&self) -> Result<bool> {
        let name = self.package_name.as_str();
        all_nodes_report(&self.cluster, "udf-list", |response| udf_listed(response, name))
    }
}

/// `udf-list` answers `filename=a.lua,hash=..,type=LUA;filename=b.lua,...`.
fn udf_listed(response: &str, package_name: &str) -> bool {
    response.split(';').any(|entry| {
        entry
            .split(',')
            .any(|kv| kv.strip_prefix("filename=") == Some(package_name))
    })
}

/// Map an info reply of the form `FAIL:<code>[:message]` or `ERROR:...`
/// onto an error, or `None` when the reply is not a failure.
pub(crate) fn info_failure(response: &str) -> Option<Error> {
    let rest = response
        .strip_prefix("FAIL:")
        .or_else(|| response.strip_prefix("ERROR:"))?;
    let mut parts = rest.splitn(2, ':');
    let code = parts.next().and_then(|c| c.trim().parse::<i32>().ok());
    let message = parts.next().unwrap_or(rest).trim().to_string();
    Some(match code {
        Some(code) => Error::server_msg(crate::utils::ResultCode::from_code(code), message),
        None => Error::server_msg(crate::utils::ResultCode::ServerError, message),
    })
}
