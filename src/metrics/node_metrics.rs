//! Per-node metrics tracking
//!
//! Tend outcomes, connection churn, pool pressure, partition map updates and
//! command latency for one cluster node.

use std::sync::atomic::{AtomicU64, Ordering};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

/// Metrics for a single node
pub struct NodeMetrics {
    pub tends_total: AtomicU64,
    pub tends_successful: AtomicU64,
    pub tends_failed: AtomicU64,
    pub connections_attempts: AtomicU64,
    pub connections_successful: AtomicU64,
    pub connections_failed: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connections_pool_empty: AtomicU64,
    pub connections_pool_exhausted: AtomicU64,
    pub partition_map_updates: AtomicU64,
    pub commands: AtomicU64,
    pub command_errors: AtomicU64,
    /// Command latency in microseconds
    histogram: Mutex<Option<Histogram<u64>>>,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self {
            tends_total: AtomicU64::new(0),
            tends_successful: AtomicU64::new(0),
            tends_failed: AtomicU64::new(0),
            connections_attempts: AtomicU64::new(0),
            connections_successful: AtomicU64::new(0),
            connections_failed: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connections_pool_empty: AtomicU64::new(0),
            connections_pool_exhausted: AtomicU64::new(0),
            partition_map_updates: AtomicU64::new(0),
            commands: AtomicU64::new(0),
            command_errors: AtomicU64::new(0),
            histogram: Mutex::new(Histogram::new_with_bounds(1, 3_600_000_000, 3).ok()),
        }
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed command
    #[inline]
    pub fn record_command(&self, latency_us: u64) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        if let Some(h) = self.histogram.lock().as_mut() {
            h.saturating_record(latency_us.max(1));
        }
    }

    #[inline]
    pub fn record_error(&self) {
        self.command_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Get latency percentile in microseconds
    pub fn percentile_us(&self, p: f64) -> u64 {
        self.histogram
            .lock()
            .as_ref()
            .map(|h| h.value_at_percentile(p))
            .unwrap_or(0)
    }

    pub fn snapshot(&self, node: &str, address: &str, connections_open: usize) -> NodeMetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let hist = self.histogram.lock();
        let (p50, p99, max) = match hist.as_ref() {
            Some(h) if !h.is_empty() => (
                h.value_at_percentile(50.0),
                h.value_at_percentile(99.0),
                h.max(),
            ),
            _ => (0, 0, 0),
        };
        NodeMetricsSnapshot {
            node: node.to_string(),
            address: address.to_string(),
            connections_open,
            tends_total: load(&self.tends_total),
            tends_successful: load(&self.tends_successful),
            tends_failed: load(&self.tends_failed),
            connections_attempts: load(&self.connections_attempts),
            connections_successful: load(&self.connections_successful),
            connections_failed: load(&self.connections_failed),
            connections_closed: load(&self.connections_closed),
            connections_pool_empty: load(&self.connections_pool_empty),
            connections_pool_exhausted: load(&self.connections_pool_exhausted),
            partition_map_updates: load(&self.partition_map_updates),
            commands: load(&self.commands),
            command_errors: load(&self.command_errors),
            p50_latency_us: p50,
            p99_latency_us: p99,
            max_latency_us: max,
        }
    }
}

/// Point-in-time metrics of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetricsSnapshot {
    pub node: String,
    pub address: String,
    pub connections_open: usize,
    pub tends_total: u64,
    pub tends_successful: u64,
    pub tends_failed: u64,
    pub connections_attempts: u64,
    pub connections_successful: u64,
    pub connections_failed: u64,
    pub connections_closed: u64,
    pub connections_pool_empty: u64,
    pub connections_pool_exhausted: u64,
    pub partition_map_updates: u64,
    pub commands: u64,
    pub command_errors: u64,
    pub p50_latency_us: u64,
    pub p99_latency_us: u64,
    pub max_latency_us: u64,
}

/// Point-in-time metrics of the whole cluster
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub nodes: Vec<NodeMetricsSnapshot>,
    pub open_connections: usize,
    pub tend_count: u64,
}
