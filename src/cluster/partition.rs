//! Partition map
//!
//! Every namespace is split into 4096 partitions. For each namespace the map
//! holds one node array per replica index (`replicas[0]` is the master) and
//! the regime of every partition. The map is rebuilt from the `replicas` info
//! reply of each node and swapped in as a whole by the tend loop.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::node::Node;
use crate::utils::{ClusterError, Error, Result};

/// Number of partitions per namespace.
pub const PARTITIONS: usize = 4096;

const BITMAP_SIZE: usize = PARTITIONS / 8;

/// Partition ownership of one namespace
#[derive(Clone)]
pub struct Partitions {
    /// `[replica index][partition id]`
    pub replicas: Vec<Vec<Option<Arc<Node>>>>,
    /// Strong consistency namespace
    pub sc_mode: bool,
    pub regimes: Vec<u32>,
}

impl Partitions {
    pub fn new(replica_count: usize, sc_mode: bool) -> Self {
        Self {
            replicas: vec![vec![None; PARTITIONS]; replica_count],
            sc_mode,
            regimes: vec![0; PARTITIONS],
        }
    }

    /// Change the number of replica arrays, keeping the existing ones.
    fn resize(&mut self, replica_count: usize) {
        self.replicas
            .resize_with(replica_count, || vec![None; PARTITIONS]);
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn master(&self, partition_id: usize) -> Option<&Arc<Node>> {
        self.replicas.first()?.get(partition_id)?.as_ref()
    }
}

/// One namespace entry of a `replicas` reply, decoded but not yet applied
struct ReplicaUpdate {
    namespace: String,
    regime: u32,
    bitmaps: Vec<Vec<u8>>,
}

/// Namespace to partition ownership
#[derive(Clone, Default)]
pub struct PartitionMap {
    namespaces: HashMap<String, Partitions>,
}

impl PartitionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str) -> Option<&Partitions> {
        self.namespaces.get(namespace)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Apply a node's `replicas` reply.
    ///
    /// The whole reply is decoded before anything is changed, so a malformed
    /// reply leaves the map untouched.
    pub fn update_from_replicas(&mut self, node: &Arc<Node>, reply: &str) -> Result<()> {
        let updates = parse_replicas(reply)?;
        for update in updates {
            self.apply(node, update);
        }
        Ok(())
    }

    fn apply(&mut self, node: &Arc<Node>, update: ReplicaUpdate) {
        let replica_count = update.bitmaps.len();
        let sc_mode = update.regime != 0;
        let partitions = self
            .namespaces
            .entry(update.namespace)
            .or_insert_with(|| Partitions::new(replica_count, sc_mode));
        if partitions.replica_count() != replica_count {
            partitions.resize(replica_count);
        }
        if sc_mode {
            partitions.sc_mode = true;
        }

        for (index, bitmap) in update.bitmaps.iter().enumerate() {
            for partition_id in 0..PARTITIONS {
                if bitmap[partition_id >> 3] & (0x80 >> (partition_id & 7)) == 0 {
                    continue;
                }
                // an older regime than the one already seen is stale
                if update.regime < partitions.regimes[partition_id] {
                    continue;
                }
                partitions.regimes[partition_id] = update.regime;

                let slot = &mut partitions.replicas[index][partition_id];
                if let Some(old) = slot {
                    if !Arc::ptr_eq(old, node) {
                        old.force_partition_refresh();
                    }
                }
                *slot = Some(Arc::clone(node));
            }
        }
    }

    /// Clear every entry that points at one of `nodes`.
    pub fn remove_nodes(&mut self, nodes: &[Arc<Node>]) {
        for partitions in self.namespaces.values_mut() {
            for replica in partitions.replicas.iter_mut() {
                for slot in replica.iter_mut() {
                    let removed = slot
                        .as_ref()
                        .map(|n| nodes.iter().any(|r| Arc::ptr_eq(r, n)))
                        .unwrap_or(false);
                    if removed {
                        *slot = None;
                    }
                }
            }
        }
    }

    /// Whether `node` owns any partition replica.
    pub fn contains_node(&self, node: &Arc<Node>) -> bool {
        self.namespaces.values().any(|p| {
            p.replicas
                .iter()
                .any(|r| r.iter().flatten().any(|n| Arc::ptr_eq(n, node)))
        })
    }

    /// Report namespaces with partitions that have no master.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        for (namespace, partitions) in &self.namespaces {
            let missing = partitions
                .replicas
                .first()
                .map(|masters| masters.iter().filter(|n| n.is_none()).count())
                .unwrap_or(PARTITIONS);
            if missing > 0 {
                problems.push(format!("{}: {} partitions unassigned", namespace, missing));
            }
        }
        if problems.is_empty() {
            return Ok(());
        }
        problems.sort();
        Err(ClusterError::InvalidPartitionMap(problems.join(", ")).into())
    }
}

/// Decode `ns:regime,count,b64,...;ns:...`
fn parse_replicas(reply: &str) -> Result<Vec<ReplicaUpdate>> {
    let mut updates = Vec::new();
    for entry in reply.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (namespace, rest) = entry
            .split_once(':')
            .ok_or_else(|| invalid(format!("missing namespace in `{}`", entry)))?;
        if namespace.is_empty() || namespace.len() > 31 {
            return Err(invalid(format!("invalid namespace `{}`", namespace)));
        }

        let parts: Vec<&str> = rest.split(',').collect();
        if parts.len() < 2 {
            return Err(invalid(format!("truncated entry for `{}`", namespace)));
        }
        let regime: u32 = parts[0]
            .parse()
            .map_err(|_| invalid(format!("invalid regime `{}`", parts[0])))?;
        let count: usize = parts[1]
            .parse()
            .map_err(|_| invalid(format!("invalid replica count `{}`", parts[1])))?;
        if count == 0 || parts.len() != count + 2 {
            return Err(invalid(format!(
                "`{}` declares {} replicas but carries {} bitmaps",
                namespace,
                count,
                parts.len().saturating_sub(2)
            )));
        }

        let mut bitmaps = Vec::with_capacity(count);
        for encoded in &parts[2..] {
            let bitmap = STANDARD
                .decode(encoded)
                .map_err(|e| invalid(format!("bad bitmap for `{}`: {}", namespace, e)))?;
            if bitmap.len() != BITMAP_SIZE {
                return Err(invalid(format!(
                    "bitmap for `{}` has {} bytes",
                    namespace,
                    bitmap.len()
                )));
            }
            bitmaps.push(bitmap);
        }
        updates.push(ReplicaUpdate {
            namespace: namespace.to_string(),
            regime,
            bitmaps,
        });
    }
    Ok(updates)
}

fn invalid(message: String) -> Error {
    ClusterError::InvalidPartitionMap(message).into()
}

/// Encode partition ownership as a `replicas` bitmap.
pub fn encode_bitmap(owned: impl IntoIterator<Item = usize>) -> String {
    let mut bitmap = vec![0u8; BITMAP_SIZE];
    for p in owned {
        if p < PARTITIONS {
            bitmap[p >> 3] |= 0x80 >> (p & 7);
        }
    }
    STANDARD.encode(bitmap)
}

/// Map where partition `p` is mastered by `nodes[p % n]`, with the next node
/// holding the prole copy when there is more than one node.
#[cfg(test)]
pub(crate) fn map_with(namespace: &str, nodes: &[&Arc<Node>]) -> PartitionMap {
    let count = nodes.len();
    let replica_count = count.min(2);
    let mut map = PartitionMap::new();
    for (i, node) in nodes.iter().enumerate() {
        let bitmaps: Vec<String> = (0..replica_count)
            .map(|r| {
                let owner = (i + count - r) % count;
                encode_bitmap((0..PARTITIONS).filter(move |p| p % count == owner))
            })
            .collect();
        let reply = format!("{}:0,{},{};", namespace, replica_count, bitmaps.join(","));
        // replies built here are always well formed
        let _ = map.update_from_replicas(node, &reply);
    }
    map
}
