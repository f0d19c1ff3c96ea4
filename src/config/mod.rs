//! Configuration module

pub mod cli;
pub mod client_policy;
pub mod policy;
pub mod tls_config;

pub use cli::{CliArgs, Command};
pub use client_policy::{AuthMode, ClientPolicy, MIN_TEND_INTERVAL};
pub use policy::{
    AdminPolicy, BasePolicy, BatchPolicy, CommitLevel, GenerationPolicy, InfoPolicy, QueryPolicy,
    ReadModeAP, ReadModeSC, RecordExistsAction, Replica, ScanPolicy, WritePolicy,
    TTL_DONT_EXPIRE, TTL_DONT_UPDATE, TTL_SERVER_DEFAULT,
};
pub use tls_config::TlsConfig;
