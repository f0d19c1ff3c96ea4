//! Cluster topology and node management
//!
//! This module provides:
//! - Seed validation and peer discovery
//! - The per-tend node refresh and the supervised tend thread
//! - Partition map maintenance from `replicas` replies
//! - Read and write routing under the replica policies
//! - Per-node connection pools

pub mod connection_pool;
pub mod host;
pub mod node;
pub mod node_validator;
pub mod partition;
pub mod peers;
pub mod router;
pub mod tend;

pub use host::Host;
pub use node::{Node, NodeContext};
pub use partition::{PartitionMap, Partitions, PARTITIONS};
pub use router::Partition;
pub use tend::Cluster;
