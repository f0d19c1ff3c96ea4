//! Seed and peer host addresses

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::utils::{ConnectionError, Error, Result};

/// Host name (or IP), optional TLS name and port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    pub name: String,
    pub tls_name: Option<String>,
    pub port: u16,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            tls_name: None,
            port,
        }
    }

    pub fn with_tls_name(mut self, tls_name: impl Into<String>) -> Self {
        self.tls_name = Some(tls_name.into());
        self
    }

    /// Parse a comma separated list of `host`, `host:port` or
    /// `host:tls_name:port` entries. IPv6 addresses are bracketed.
    pub fn parse_hosts(list: &str, default_port: u16) -> Result<Vec<Host>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Self::parse_one(s, default_port))
            .collect()
    }

    fn parse_one(s: &str, default_port: u16) -> Result<Host> {
        let invalid = || Error::parameter(format!("invalid host `{}`", s));

        let (name, rest) = if let Some(stripped) = s.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(invalid)?;
            (&stripped[..end], &stripped[end + 1..])
        } else {
            match s.find(':') {
                Some(i) => (&s[..i], &s[i..]),
                None => (s, ""),
            }
        };
        if name.is_empty() {
            return Err(invalid());
        }

        let parts: Vec<&str> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.strip_prefix(':').ok_or_else(invalid)?.split(':').collect()
        };
        let parse_port = |p: &str| p.parse::<u16>().map_err(|_| invalid());
        match parts.as_slice() {
            [] => Ok(Host::new(name, default_port)),
            [port] => Ok(Host::new(name, parse_port(port)?)),
            [tls_name, port] => Ok(Host::new(name, parse_port(port)?).with_tls_name(*tls_name)),
            _ => Err(invalid()),
        }
    }

    /// Resolve to socket addresses, in resolver order.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (self.name.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConnectionError::ConnectFailed {
                host: self.name.clone(),
                port: self.port,
                source: e,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectionError::ConnectFailed {
                host: self.name.clone(),
                port: self.port,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "No addresses found"),
            }
            .into());
        }
        Ok(addrs)
    }
}

impl From<SocketAddr> for Host {
    fn from(addr: SocketAddr) -> Self {
        Host::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.contains(':') {
            write!(f, "[{}]:{}", self.name, self.port)
        } else {
            write!(f, "{}:{}", self.name, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hosts() {
        let hosts = Host::parse_hosts("a, b:3100, c:tls-c:4333", 3000).unwrap();
        assert_eq!(hosts[0], Host::new("a", 3000));
        assert_eq!(hosts[1], Host::new("b", 3100));
        assert_eq!(hosts[2], Host::new("c", 4333).with_tls_name("tls-c"));
    }

    #[test]
    fn test_parse_ipv6() {
        let hosts = Host::parse_hosts("[::1]:3000,[fe80::1]", 3001).unwrap();
        assert_eq!(hosts[0].name, "::1");
        assert_eq!(hosts[0].port, 3000);
        assert_eq!(hosts[1].port, 3001);
        assert_eq!(hosts[0].to_string(), "[::1]:3000");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Host::parse_hosts("a:notaport", 3000).is_err());
        assert!(Host::parse_hosts("[::1", 3000).is_err());
        assert!(Host::parse_hosts("a:b:c:1", 3000).is_err());
        assert!(Host::parse_hosts(":3000", 3000).is_err());
    }

    #[test]
    fn test_resolve_localhost() {
        let addrs = Host::new("127.0.0.1", 3000).resolve().unwrap();
        assert_eq!(addrs[0].port(), 3000);
    }
}
