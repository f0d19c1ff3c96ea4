//! shardline library
//!
//! Cluster-aware client driver for a partitioned, replicated key-value
//! database: cluster tending, partition routing, the binary message codec,
//! single-record, batch, scan and query commands, and the info and admin
//! protocols.

pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod metrics;
pub mod utils;

#[cfg(test)]
mod mock;

pub use client::{Client, IndexTask, Task, UdfLanguage, UdfMeta, UdfTask};
pub use cluster::{Cluster, Host, Node};
pub use command::{
    BatchRead, BatchReadRecord, Bin, BinMap, Filter, Key, Operation, PartitionFilter, Record,
    Recordset, Statement, Value,
};
pub use config::{
    AdminPolicy, BasePolicy, BatchPolicy, ClientPolicy, InfoPolicy, QueryPolicy, ScanPolicy,
    WritePolicy,
};
pub use utils::{Error, ErrorKind, Result, ResultCode};
