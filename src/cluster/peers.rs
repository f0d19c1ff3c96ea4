//! Peer discovery
//!
//! Each node reports the other members of the cluster through the
//! `peers-*` info commands:
//!
//! ```text
//! <generation>,<default port>,[[<name>,<tls name>,[<addr>[:<port>],...]],...]
//! ```
//!
//! A tend iteration collects the reports of every node in a shared [`Peers`]
//! accumulator, together with the nodes validated during that iteration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::host::Host;
use super::node::Node;
use crate::utils::{Error, Result};

/// A cluster member as advertised by another node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub node_name: String,
    pub tls_name: Option<String>,
    pub hosts: Vec<Host>,
}

/// Tend-iteration accumulator
#[derive(Default)]
pub struct Peers {
    peers: Mutex<HashMap<String, Peer>>,
    nodes: Mutex<HashMap<String, Arc<Node>>>,
    /// Successful refreshes in the current pass
    pub refresh_count: AtomicUsize,
    /// Some node reported a new peers generation or failed to refresh
    pub gen_changed: AtomicBool,
}

impl Peers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, peers: Vec<Peer>) {
        let mut map = self.peers.lock();
        for peer in peers {
            map.entry(peer.node_name.clone()).or_insert(peer);
        }
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Record a node validated during this iteration.
    pub fn add_node(&self, node: Arc<Node>) {
        self.nodes.lock().insert(node.name().to_string(), node);
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.lock().get(name).cloned()
    }

    /// Nodes validated during this iteration.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.lock().values().cloned().collect()
    }

    pub fn mark_gen_changed(&self) {
        self.gen_changed.store(true, Ordering::Relaxed);
    }

    pub fn gen_changed(&self) -> bool {
        self.gen_changed.load(Ordering::Relaxed)
    }

    pub fn incr_refresh_count(&self) {
        self.refresh_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_count.load(Ordering::Relaxed)
    }
}

/// Name of the info command listing peers.
pub fn peers_command(tls: bool, services_alternate: bool) -> &'static str {
    match (tls, services_alternate) {
        (false, false) => "peers-clear-std",
        (false, true) => "peers-clear-alt",
        (true, false) => "peers-tls-std",
        (true, true) => "peers-tls-alt",
    }
}

/// Parse a peers reply into its generation and peer list.
///
/// Advertised addresses are translated through `ip_map`.
pub fn parse_peers(reply: &str, ip_map: &HashMap<String, String>) -> Result<(u32, Vec<Peer>)> {
    let mut p = PeerParser {
        input: reply.trim().as_bytes(),
        pos: 0,
    };
    let generation = p
        .token()?
        .parse::<u32>()
        .map_err(|_| Error::parse(format!("invalid peers generation in `{}`", reply)))?;
    p.expect(b',')?;
    let default_port = match p.token()? {
        "" => 3000,
        port => port
            .parse::<u16>()
            .map_err(|_| Error::parse(format!("invalid peers default port in `{}`", reply)))?,
    };
    p.expect(b',')?;

    let mut peers = Vec::new();
    p.expect(b'[')?;
    while p.peek() == Some(b'[') {
        p.expect(b'[')?;
        let node_name = p.token()?.to_string();
        p.expect(b',')?;
        let tls_name = match p.token()? {
            "" => None,
            name => Some(name.to_string()),
        };
        p.expect(b',')?;
        p.expect(b'[')?;
        let mut hosts = Vec::new();
        while p.peek() != Some(b']') {
            let (name, port) = p.address(default_port)?;
            let name = ip_map.get(&name).cloned().unwrap_or(name);
            let mut host = Host::new(name, port);
            host.tls_name = tls_name.clone();
            hosts.push(host);
            if p.peek() == Some(b',') {
                p.pos += 1;
            }
        }
        p.expect(b']')?;
        p.expect(b']')?;
        if node_name.is_empty() {
            return Err(Error::parse("peer without a node name"));
        }
        peers.push(Peer {
            node_name,
            tls_name,
            hosts,
        });
        if p.peek() == Some(b',') {
            p.pos += 1;
        }
    }
    p.expect(b']')?;
    Ok((generation, peers))
}

struct PeerParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> PeerParser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        match self.peek() {
            Some(found) if found == c => {
                self.pos += 1;
                Ok(())
            }
            found => Err(Error::parse(format!(
                "peers reply: expected `{}` at {}, found {:?}",
                c as char,
                self.pos,
                found.map(|b| b as char)
            ))),
        }
    }

    /// Run of bytes up to the next delimiter.
    fn token(&mut self) -> Result<&'a str> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b',' | b'[' | b']') {
                break;
            }
            self.pos += 1;
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| Error::parse("peers reply is not utf-8"))
    }

    /// `addr`, `addr:port`, `[v6]` or `[v6]:port`
    fn address(&mut self, default_port: u16) -> Result<(String, u16)> {
        if self.peek() == Some(b'[') {
            return self.bracketed_address(default_port);
        }
        let name = self.token()?;
        if name.is_empty() {
            return Err(Error::parse("empty peer address"));
        }
        match name.rsplit_once(':') {
            Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
            None => Ok((name.to_string(), default_port)),
        }
    }

    fn bracketed_address(&mut self, default_port: u16) -> Result<(String, u16)> {
        self.expect(b'[')?;
        let start = self.pos;
        while self.peek().map(|c| c != b']').unwrap_or(false) {
            self.pos += 1;
        }
        let name = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| Error::parse("peers reply is not utf-8"))?
            .to_string();
        self.expect(b']')?;
        if self.peek() == Some(b':') {
            self.pos += 1;
            let port = self.token()?;
            return Ok((name, parse_port(port)?));
        }
        Ok((name, default_port))
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| Error::parse(format!("invalid peer port `{}`", port)))
}
