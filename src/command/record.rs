//! Records returned by read, batch, scan and query commands

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use super::key::Key;
use super::value::{BinMap, Value};
use crate::config::TTL_DONT_EXPIRE;

/// Seconds between the Unix epoch and the server's epoch (2010-01-01 UTC).
pub const CITRUSLEAF_EPOCH: u64 = 1_262_304_000;

/// A record: bins plus metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Key of the record; set for scan/query results and batch rows
    pub key: Option<Key>,
    pub bins: BinMap,
    pub generation: u32,
    /// Remaining time to live in seconds; `TTL_DONT_EXPIRE` for records that never expire
    pub expiration: u32,
}

impl Record {
    pub fn new(key: Option<Key>, bins: BinMap, generation: u32, expiration: u32) -> Self {
        Self {
            key,
            bins,
            generation,
            expiration,
        }
    }

    pub fn bin(&self, name: &str) -> Option<&Value> {
        self.bins.get(name)
    }

    /// Whether the record is kept until explicitly deleted.
    pub fn never_expires(&self) -> bool {
        self.expiration == TTL_DONT_EXPIRE
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(key) = &self.key {
            write!(f, "{} ", key)?;
        }
        write!(f, "gen={} ttl=", self.generation)?;
        if self.never_expires() {
            write!(f, "never")?;
        } else {
            write!(f, "{}", self.expiration)?;
        }
        let mut names: Vec<_> = self.bins.keys().collect();
        names.sort();
        write!(f, " {{")?;
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, self.bins[name.as_str()])?;
        }
        write!(f, "}}")
    }
}

/// Seconds since the server epoch.
pub fn server_now() -> u32 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(CITRUSLEAF_EPOCH);
    unix.saturating_sub(CITRUSLEAF_EPOCH) as u32
}

/// Convert the server's absolute void time into a TTL relative to now.
pub fn ttl_from_void_time(void_time: u32) -> u32 {
    ttl_at(void_time, server_now())
}

fn ttl_at(void_time: u32, now: u32) -> u32 {
    if void_time == 0 {
        return TTL_DONT_EXPIRE;
    }
    if void_time > now {
        void_time - now
    } else {
        // expired but not yet reaped
        1
    }
}
