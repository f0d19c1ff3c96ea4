//! Metrics collection
//!
//! Per-node counters and latency histograms, and the serializable cluster
//! snapshot built from them.

pub mod node_metrics;

pub use node_metrics::{ClusterStats, NodeMetrics, NodeMetricsSnapshot};
