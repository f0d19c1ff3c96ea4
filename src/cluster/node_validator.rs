//! Seed and peer validation
//!
//! Before a host joins the cluster view the client connects to it, logs in,
//! and asks for its name, features and cluster name. The connection used for
//! validation becomes the node's tend connection.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::debug;

use super::host::Host;
use super::node::NodeContext;
use crate::client::admin::{self, SessionToken};
use crate::client::connection::Connection;
use crate::client::control_plane::ControlPlane;
use crate::utils::{ClusterError, Error, Result};

/// Feature flag advertising partition scans
pub const FEATURE_PARTITION_SCAN: &str = "pscans";

/// A host that answered as a cluster node
pub struct NodeValidator {
    pub name: String,
    pub host: Host,
    pub addr: SocketAddr,
    pub aliases: Vec<Host>,
    pub features: Vec<String>,
    pub session: Option<SessionToken>,
    pub conn: Connection,
}

impl NodeValidator {
    /// Validate `host`, trying each of its resolved addresses in turn.
    pub fn validate(ctx: &NodeContext, host: &Host) -> Result<Self> {
        let addrs = host.resolve()?;
        let mut last_error: Option<Error> = None;
        for addr in addrs {
            match Self::validate_address(ctx, host, addr) {
                Ok(mut nv) => {
                    let resolved = Host {
                        name: addr.ip().to_string(),
                        tls_name: host.tls_name.clone(),
                        port: addr.port(),
                    };
                    if resolved != *host {
                        nv.aliases.push(resolved);
                    }
                    return Ok(nv);
                }
                Err(e) => {
                    debug!("Validation of {} ({}) failed: {}", host, addr, e);
                    last_error = Some(e.chain_onto(last_error));
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| ClusterError::InvalidNode(format!("{} has no addresses", host)).into()))
    }

    fn validate_address(ctx: &NodeContext, host: &Host, addr: SocketAddr) -> Result<Self> {
        let policy = &ctx.policy;
        let mut conn = Connection::open(
            addr,
            host.tls_name.as_deref(),
            policy.tls_config.as_ref(),
            policy.timeout,
            policy.idle_timeout,
        )?;

        let session = if policy.requires_authentication() {
            admin::login(&mut conn, policy, &ctx.password_hash())?
        } else {
            None
        };

        let mut names = vec!["node", "features"];
        if policy.cluster_name.is_some() {
            names.push("cluster-name");
        }
        let deadline = (!policy.timeout.is_zero()).then(|| Instant::now() + policy.timeout);
        conn.set_timeout(deadline, policy.timeout);
        let info = conn.request_info(&names)?;

        let name = info.get("node").cloned().unwrap_or_default();
        if name.is_empty() {
            return Err(ClusterError::InvalidNode(format!("{} returned no node name", host)).into());
        }

        if let Some(expected) = &policy.cluster_name {
            let actual = info.get("cluster-name").cloned().unwrap_or_default();
            if *expected != actual {
                return Err(Error::from(ClusterError::ClusterNameMismatch {
                    expected: expected.clone(),
                    actual,
                })
                .with_node(name));
            }
        }

        let features = info
            .get("features")
            .map(|f| {
                f.split(';')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            name,
            host: host.clone(),
            addr,
            aliases: vec![host.clone()],
            features,
            session,
            conn,
        })
    }
}
