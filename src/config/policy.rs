//! Per-call policies
//!
//! Policies are plain configuration bags passed by reference into each
//! operation. The client never mutates a caller's policy.

use std::time::{Duration, Instant};

use clap::ValueEnum;

use crate::command::Expression;

/// Record is assigned the namespace's default TTL.
pub const TTL_SERVER_DEFAULT: u32 = 0;
/// Record never expires.
pub const TTL_DONT_EXPIRE: u32 = u32::MAX;
/// Record keeps its current TTL on update.
pub const TTL_DONT_UPDATE: u32 = u32::MAX - 1;

/// Which replica serves a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Replica {
    /// Always the partition's master
    Master,
    /// Round-robin across master and proles
    MasterProles,
    /// Round-robin across all nodes in the cluster
    Random,
    /// Master first, next replica on each retry
    Sequence,
    /// Nodes on the configured racks first, then sequence order
    PreferRack,
}

/// Read consistency for AP namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadModeAP {
    /// Read from a single replica
    One,
    /// Consult all replicas and return the most recent
    All,
}

/// Read consistency for strong-consistency namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadModeSC {
    Session,
    Linearize,
    AllowReplica,
    AllowUnavailable,
}

/// Behavior when the record already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordExistsAction {
    Update,
    UpdateOnly,
    Replace,
    ReplaceOnly,
    CreateOnly,
}

/// Generation check applied to writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationPolicy {
    None,
    ExpectGenEqual,
    ExpectGenGt,
}

/// Replicas that must commit before a write returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitLevel {
    CommitAll,
    CommitMaster,
}

/// Settings shared by every command
#[derive(Debug, Clone)]
pub struct BasePolicy {
    /// Wall clock limit for the whole operation, retries included. Zero means none.
    pub total_timeout: Duration,
    /// Limit for a single socket read or write. Zero means none.
    pub socket_timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: usize,
    pub sleep_between_retries: Duration,
    /// Each retry sleep is the previous one times this factor
    pub sleep_multiplier: f64,
    pub replica: Replica,
    pub read_mode_ap: ReadModeAP,
    pub read_mode_sc: ReadModeSC,
    /// Send the user key along with the digest
    pub send_key: bool,
    /// Compress requests above the threshold and ask for compressed responses
    pub use_compression: bool,
    /// Abort instead of retrying when a node's connection pool is exhausted
    pub exit_fast_on_exhausted_connection_pool: bool,
    /// Server-side filter applied to the record before the command runs
    pub filter_expression: Option<Expression>,
}

impl Default for BasePolicy {
    fn default() -> Self {
        Self {
            total_timeout: Duration::from_millis(1000),
            socket_timeout: Duration::from_secs(30),
            max_retries: 2,
            sleep_between_retries: Duration::from_millis(1),
            sleep_multiplier: 1.0,
            replica: Replica::Sequence,
            read_mode_ap: ReadModeAP::One,
            read_mode_sc: ReadModeSC::Session,
            send_key: false,
            use_compression: false,
            exit_fast_on_exhausted_connection_pool: false,
            filter_expression: None,
        }
    }
}

impl BasePolicy {
    /// Absolute deadline for an operation started now.
    ///
    /// Without a total timeout every permitted attempt gets one full socket
    /// timeout window.
    pub fn deadline(&self) -> Option<Instant> {
        if !self.total_timeout.is_zero() {
            return Some(Instant::now() + self.total_timeout);
        }
        if !self.socket_timeout.is_zero() {
            let attempts = self.max_retries as u32 + 1;
            return Some(Instant::now() + self.socket_timeout * attempts);
        }
        None
    }

    /// Timeout sent to the server in the message header.
    pub fn server_timeout(&self) -> Duration {
        if !self.total_timeout.is_zero() {
            if !self.socket_timeout.is_zero() && self.socket_timeout < self.total_timeout {
                return self.socket_timeout;
            }
            return self.total_timeout;
        }
        self.socket_timeout
    }
}

/// Settings for write commands
#[derive(Debug, Clone)]
pub struct WritePolicy {
    pub base: BasePolicy,
    pub record_exists_action: RecordExistsAction,
    pub generation_policy: GenerationPolicy,
    pub commit_level: CommitLevel,
    /// Expected generation, used with `generation_policy`
    pub generation: u32,
    /// TTL in seconds, or one of the `TTL_*` constants
    pub expiration: u32,
    /// Return a result for every operation in `operate`
    pub respond_per_each_op: bool,
    /// Leave a tombstone on delete
    pub durable_delete: bool,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy::default(),
            record_exists_action: RecordExistsAction::Update,
            generation_policy: GenerationPolicy::None,
            commit_level: CommitLevel::CommitAll,
            generation: 0,
            expiration: TTL_SERVER_DEFAULT,
            respond_per_each_op: false,
            durable_delete: false,
        }
    }
}

impl WritePolicy {
    pub fn new(generation: u32, expiration: u32) -> Self {
        Self {
            generation,
            expiration,
            ..Default::default()
        }
    }
}

/// Settings for batch commands
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub base: BasePolicy,
    /// Maximum nodes queried in parallel. Zero queries all at once.
    pub concurrent_nodes: usize,
    /// Let the server process the batch inline on its service thread
    pub allow_inline: bool,
    /// Return what succeeded alongside the error instead of failing the call
    pub allow_partial_results: bool,
    /// Send the set name of every key
    pub send_set_name: bool,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy::default(),
            concurrent_nodes: 0,
            allow_inline: true,
            allow_partial_results: false,
            send_set_name: false,
        }
    }
}

/// Settings for scans
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    pub base: BasePolicy,
    /// Approximate record limit across the cluster. Zero means none.
    pub max_records: u64,
    /// Server-side throttle. Zero means none.
    pub records_per_second: u32,
    /// Maximum nodes scanned in parallel. Zero scans all at once.
    pub max_concurrent_nodes: usize,
    pub include_bin_data: bool,
    /// Buffered records between the parser threads and the consumer
    pub record_queue_size: usize,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy {
                total_timeout: Duration::ZERO,
                socket_timeout: Duration::from_secs(30),
                max_retries: 5,
                ..Default::default()
            },
            max_records: 0,
            records_per_second: 0,
            max_concurrent_nodes: 0,
            include_bin_data: true,
            record_queue_size: 50,
        }
    }
}

/// Settings for queries
#[derive(Debug, Clone)]
pub struct QueryPolicy {
    pub base: BasePolicy,
    pub max_records: u64,
    pub records_per_second: u32,
    pub max_concurrent_nodes: usize,
    pub include_bin_data: bool,
    pub record_queue_size: usize,
    /// Abort a secondary index query if the node set changes while it runs
    pub fail_on_cluster_change: bool,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        let scan = ScanPolicy::default();
        Self {
            base: scan.base,
            max_records: 0,
            records_per_second: 0,
            max_concurrent_nodes: 0,
            include_bin_data: true,
            record_queue_size: scan.record_queue_size,
            fail_on_cluster_change: false,
        }
    }
}

impl QueryPolicy {
    /// Scan settings equivalent to this query policy.
    pub(crate) fn as_scan_policy(&self) -> ScanPolicy {
        ScanPolicy {
            base: self.base.clone(),
            max_records: self.max_records,
            records_per_second: self.records_per_second,
            max_concurrent_nodes: self.max_concurrent_nodes,
            include_bin_data: self.include_bin_data,
            record_queue_size: self.record_queue_size,
        }
    }
}

/// Settings for user and role administration
#[derive(Debug, Clone)]
pub struct AdminPolicy {
    pub timeout: Duration,
}

impl Default for AdminPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
        }
    }
}

/// Settings for info requests
#[derive(Debug, Clone)]
pub struct InfoPolicy {
    pub timeout: Duration,
}

impl Default for InfoPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_from_total_timeout() {
        let policy = BasePolicy {
            total_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let before = Instant::now();
        let deadline = policy.deadline().unwrap();
        assert!(deadline >= before + Duration::from_millis(500));
    }

    #[test]
    fn test_deadline_from_socket_timeout() {
        let policy = BasePolicy {
            total_timeout: Duration::ZERO,
            socket_timeout: Duration::from_millis(100),
            max_retries: 3,
            ..Default::default()
        };
        let before = Instant::now();
        let deadline = policy.deadline().unwrap();
        assert!(deadline >= before + Duration::from_millis(400));
        assert!(deadline < before + Duration::from_millis(1000));
    }

    #[test]
    fn test_no_deadline() {
        let policy = BasePolicy {
            total_timeout: Duration::ZERO,
            socket_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(policy.deadline().is_none());
    }

    #[test]
    fn test_server_timeout_is_smaller_of_both() {
        let policy = BasePolicy {
            total_timeout: Duration::from_secs(2),
            socket_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        assert_eq!(policy.server_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn test_scan_defaults() {
        let policy = ScanPolicy::default();
        assert!(policy.base.total_timeout.is_zero());
        assert_eq!(policy.base.max_retries, 5);
        assert!(policy.include_bin_data);
    }
}
