//! Command-line argument parsing
//!
//! Arguments for the `shardline` operator tool, grouped by category.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::policy::Replica;

/// Operator tool for a shardline cluster
#[derive(Parser, Debug, Clone)]
#[command(name = "shardline")]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    // ===== Connection Options =====
    /// Seed host, `host`, `host:port` or `host:tlsname:port` (can be repeated or comma separated)
    #[arg(short = 'H', long = "host", default_value = "127.0.0.1", action = clap::ArgAction::Append)]
    pub hosts: Vec<String>,

    /// Default port for hosts given without one
    #[arg(short = 'p', long = "port", default_value_t = 3000)]
    pub port: u16,

    /// User name
    #[arg(short = 'U', long = "user")]
    pub user: Option<String>,

    /// Password (requires --user)
    #[arg(short = 'P', long = "password")]
    pub password: Option<String>,

    /// Authenticate against an external directory (sends the clear password; requires --tls)
    #[arg(long = "external-auth")]
    pub external_auth: bool,

    /// Expected cluster name
    #[arg(long = "cluster-name")]
    pub cluster_name: Option<String>,

    /// Use alternate access addresses advertised by the nodes
    #[arg(long = "services-alternate")]
    pub services_alternate: bool,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long = "tls")]
    pub tls: bool,

    /// Skip TLS certificate verification (insecure)
    #[arg(long = "tls-skip-verify")]
    pub tls_skip_verify: bool,

    /// CA certificate file for TLS
    #[arg(long = "tls-ca-cert")]
    pub tls_ca_cert: Option<PathBuf>,

    /// Client certificate file for TLS
    #[arg(long = "tls-cert")]
    pub tls_cert: Option<PathBuf>,

    /// Client private key file for TLS
    #[arg(long = "tls-key")]
    pub tls_key: Option<PathBuf>,

    /// Server Name Indication for TLS
    #[arg(long = "tls-sni")]
    pub tls_sni: Option<String>,

    // ===== Timing =====
    /// Connect and info timeout in milliseconds
    #[arg(long = "timeout", default_value_t = 1000)]
    pub timeout_ms: u64,

    /// Total timeout of each command in milliseconds
    #[arg(long = "total-timeout", default_value_t = 1000)]
    pub total_timeout_ms: u64,

    /// Cluster tend interval in milliseconds
    #[arg(long = "tend-interval", default_value_t = 1000)]
    pub tend_interval_ms: u64,

    /// Maximum connections per node
    #[arg(long = "connections", default_value_t = 256)]
    pub connection_queue_size: usize,

    // ===== Routing =====
    /// Replica selection for reads
    #[arg(long = "replica", value_enum, default_value = "sequence")]
    pub replica: Replica,

    /// Preferred rack id (can be repeated; enables rack awareness)
    #[arg(long = "rack-id", action = clap::ArgAction::Append)]
    pub rack_ids: Vec<i32>,

    // ===== Output =====
    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Tool actions
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Send info commands to every node
    Info {
        /// Info command names
        names: Vec<String>,
    },
    /// Print the cluster nodes and statistics as JSON
    Nodes,
    /// Read a record
    Get {
        namespace: String,
        set: String,
        key: String,
        /// Bins to read (all when omitted)
        #[arg(long = "bin")]
        bins: Vec<String>,
    },
    /// Write a record
    Put {
        namespace: String,
        set: String,
        key: String,
        /// Bins as `name=value`; integers are detected automatically
        #[arg(required = true)]
        bins: Vec<String>,
        /// Record TTL in seconds
        #[arg(long = "ttl")]
        ttl: Option<u32>,
    },
    /// Delete a record
    Delete {
        namespace: String,
        set: String,
        key: String,
    },
    /// Scan a namespace or set
    Scan {
        namespace: String,
        set: Option<String>,
        /// Stop after roughly this many records
        #[arg(long = "max-records", default_value_t = 0)]
        max_records: u64,
    },
}

impl CliArgs {
    /// Validate argument combinations
    pub fn validate(&self) -> Result<(), String> {
        if self.password.is_some() && self.user.is_none() {
            return Err("--password requires --user".to_string());
        }
        if self.external_auth && !self.tls {
            return Err("--external-auth requires --tls".to_string());
        }
        if self.tls && !cfg!(feature = "native-tls-backend") {
            return Err("--tls requires the native-tls-backend feature".to_string());
        }
        if self.verbose && self.quiet {
            return Err("--verbose and --quiet are mutually exclusive".to_string());
        }
        Ok(())
    }
}
