//! Key routing
//!
//! A [`Partition`] carries the routing state of one command across its
//! retries: the replica policy in effect and the sequence offset that moves
//! reads to the next replica after a failure.

use std::sync::Arc;

use super::tend::Cluster;
use super::node::Node;
use super::partition::Partitions;
use crate::command::Key;
use crate::config::{BasePolicy, ReadModeSC, Replica};
use crate::utils::{ClusterError, Error, Result};

/// Routing state for one key
#[derive(Debug, Clone)]
pub struct Partition {
    pub namespace: String,
    pub partition_id: usize,
    pub replica: Replica,
    pub sequence: usize,
    pub linearize: bool,
}

impl Partition {
    /// Routing for a read of `key`.
    ///
    /// Strong consistency namespaces narrow the replica policy: session reads
    /// go to the master and linearized reads never use rack preference.
    pub fn for_read(cluster: &Cluster, policy: &BasePolicy, key: &Key) -> Result<Self> {
        let map = cluster.partition_map();
        let partitions = map
            .get(key.namespace())
            .ok_or_else(|| ClusterError::NamespaceNotFound(key.namespace().to_string()))?;

        let (replica, linearize) = if partitions.sc_mode {
            match policy.read_mode_sc {
                ReadModeSC::Session => (Replica::Master, false),
                ReadModeSC::Linearize => match policy.replica {
                    Replica::PreferRack => (Replica::Sequence, true),
                    other => (other, true),
                },
                _ => (policy.replica, false),
            }
        } else {
            (policy.replica, false)
        };

        Ok(Self {
            namespace: key.namespace().to_string(),
            partition_id: key.partition_id(),
            replica,
            sequence: 0,
            linearize,
        })
    }

    /// Routing for a write of `key`.
    pub fn for_write(cluster: &Cluster, policy: &BasePolicy, key: &Key) -> Result<Self> {
        let map = cluster.partition_map();
        if map.get(key.namespace()).is_none() {
            return Err(ClusterError::NamespaceNotFound(key.namespace().to_string()).into());
        }
        Ok(Self {
            namespace: key.namespace().to_string(),
            partition_id: key.partition_id(),
            replica: policy.replica,
            sequence: 0,
            linearize: false,
        })
    }

    /// Node to read from under the current replica policy and sequence.
    pub fn node_read(&mut self, cluster: &Cluster) -> Result<Arc<Node>> {
        match self.replica {
            Replica::Master => self.master_node(cluster),
            Replica::MasterProles => self.master_proles_node(cluster),
            Replica::Random => cluster.random_node(),
            Replica::Sequence => self.sequence_node(cluster),
            Replica::PreferRack => self.rack_node(cluster),
        }
    }

    /// Writes always go to the master.
    pub fn node_write(&mut self, cluster: &Cluster) -> Result<Arc<Node>> {
        self.master_node(cluster)
    }

    /// Move to the next replica unless a linearized read merely timed out
    /// on the client side.
    pub fn prepare_retry_read(&mut self, is_client_timeout: bool) {
        if !is_client_timeout || !self.linearize {
            self.sequence += 1;
        }
    }

    pub fn prepare_retry_write(&mut self, is_client_timeout: bool) {
        if !is_client_timeout {
            self.sequence += 1;
        }
    }

    fn with_partitions<T>(
        &self,
        cluster: &Cluster,
        f: impl FnOnce(&Partitions) -> Result<T>,
    ) -> Result<T> {
        let map = cluster.partition_map();
        let partitions = map
            .get(&self.namespace)
            .ok_or_else(|| ClusterError::NamespaceNotFound(self.namespace.clone()))?;
        f(partitions)
    }

    fn unavailable(&self) -> Error {
        ClusterError::PartitionUnavailable {
            namespace: self.namespace.clone(),
            partition: self.partition_id,
        }
        .into()
    }

    fn master_node(&self, cluster: &Cluster) -> Result<Arc<Node>> {
        self.with_partitions(cluster, |p| {
            p.master(self.partition_id)
                .filter(|n| n.is_active())
                .cloned()
                .ok_or_else(|| self.unavailable())
        })
    }

    fn master_proles_node(&self, cluster: &Cluster) -> Result<Arc<Node>> {
        self.with_partitions(cluster, |p| {
            let count = p.replica_count();
            for _ in 0..count {
                let index = cluster.next_replica_index() % count;
                if let Some(node) = active(p, index, self.partition_id) {
                    return Ok(node);
                }
            }
            Err(self.unavailable())
        })
    }

    fn sequence_node(&mut self, cluster: &Cluster) -> Result<Arc<Node>> {
        let map = cluster.partition_map();
        let partitions = map
            .get(&self.namespace)
            .ok_or_else(|| ClusterError::NamespaceNotFound(self.namespace.clone()))?;
        let count = partitions.replica_count();
        for _ in 0..count {
            let index = self.sequence % count;
            if let Some(node) = active(partitions, index, self.partition_id) {
                return Ok(node);
            }
            self.sequence += 1;
        }
        Err(self.unavailable())
    }

    /// First active replica on one of the preferred racks, scanning from
    /// the current sequence; otherwise the first active replica.
    fn rack_node(&mut self, cluster: &Cluster) -> Result<Arc<Node>> {
        let map = cluster.partition_map();
        let partitions = map
            .get(&self.namespace)
            .ok_or_else(|| ClusterError::NamespaceNotFound(self.namespace.clone()))?;
        let count = partitions.replica_count();
        let mut fallback: Option<(usize, Arc<Node>)> = None;

        for &rack_id in cluster.rack_ids() {
            let mut seq = self.sequence;
            for _ in 0..count {
                let index = seq % count;
                if let Some(node) = active(partitions, index, self.partition_id) {
                    if node.has_rack(&self.namespace, rack_id) {
                        self.sequence = seq;
                        return Ok(node);
                    }
                    if fallback.is_none() {
                        fallback = Some((seq, node));
                    }
                }
                seq += 1;
            }
        }

        if fallback.is_none() {
            // no racks configured
            let mut seq = self.sequence;
            for _ in 0..count {
                if let Some(node) = active(partitions, seq % count, self.partition_id) {
                    fallback = Some((seq, node));
                    break;
                }
                seq += 1;
            }
        }

        match fallback {
            Some((seq, node)) => {
                self.sequence = seq;
                Ok(node)
            }
            None => Err(self.unavailable()),
        }
    }
}

fn active(partitions: &Partitions, index: usize, partition_id: usize) -> Option<Arc<Node>> {
    partitions
        .replicas
        .get(index)?
        .get(partition_id)?
        .as_ref()
        .filter(|n| n.is_active())
        .cloned()
}
