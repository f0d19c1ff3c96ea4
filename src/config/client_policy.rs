//! Client-wide configuration
//!
//! Built programmatically or from command line arguments. Shared read-only by
//! the cluster, its nodes and every command.

use std::collections::HashMap;
use std::time::Duration;

use super::cli::CliArgs;
use super::tls_config::TlsConfig;
use crate::cluster::Host;

/// Smallest tend interval honored by the cluster.
pub const MIN_TEND_INTERVAL: Duration = Duration::from_millis(10);

/// How the client authenticates to the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Server-side user database; the password is hashed before it is sent
    Internal,
    /// External directory; the clear password is sent, so TLS is required
    External,
    /// TLS client certificate; no user or password
    Pki,
}

/// Client-wide policy
#[derive(Debug, Clone)]
pub struct ClientPolicy {
    pub auth_mode: AuthMode,
    pub user: Option<String>,
    pub password: Option<String>,

    /// Expected cluster name; nodes reporting another name are rejected
    pub cluster_name: Option<String>,

    /// Connect timeout and timeout of tend info requests
    pub timeout: Duration,
    /// Pooled connections unused for longer than this are closed
    pub idle_timeout: Duration,
    pub login_timeout: Duration,

    /// Maximum connections per node
    pub connection_queue_size: usize,
    /// Connections opened ahead of demand on every tend
    pub min_connections_per_node: usize,
    /// Refuse to open more than `connection_queue_size` connections per node
    pub limit_connections_to_queue_size: bool,
    /// Maximum connections being opened concurrently per node. Zero means unlimited.
    pub opening_connection_threshold: usize,

    /// Fail client construction if no seed can be reached
    pub fail_if_not_connected: bool,
    pub tend_interval: Duration,

    /// Errors per node per window before the node is short-circuited. Zero disables.
    pub max_error_rate: usize,
    /// Length of the error window, in tend iterations
    pub error_rate_window: usize,

    /// Track rack membership and honor `Replica::PreferRack`
    pub rack_aware: bool,
    /// Preferred racks, in order
    pub rack_ids: Vec<i32>,

    /// Address translation applied to peer-advertised hosts
    pub ip_map: HashMap<String, String>,
    /// Use the alternate access addresses advertised by peers
    pub use_services_alternate: bool,
    /// Only ever talk to the seeds; ignore peers
    pub seed_only_cluster: bool,

    pub tls_config: Option<TlsConfig>,
}

impl Default for ClientPolicy {
    fn default() -> Self {
        Self {
            auth_mode: AuthMode::Internal,
            user: None,
            password: None,
            cluster_name: None,
            timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(55),
            login_timeout: Duration::from_secs(10),
            connection_queue_size: 256,
            min_connections_per_node: 0,
            limit_connections_to_queue_size: true,
            opening_connection_threshold: 0,
            fail_if_not_connected: true,
            tend_interval: Duration::from_secs(1),
            max_error_rate: 100,
            error_rate_window: 1,
            rack_aware: false,
            rack_ids: Vec::new(),
            ip_map: HashMap::new(),
            use_services_alternate: false,
            seed_only_cluster: false,
            tls_config: None,
        }
    }
}

impl ClientPolicy {
    /// Build a client policy and seed list from command line arguments
    pub fn from_cli(args: &CliArgs) -> Result<(Self, Vec<Host>), String> {
        args.validate()?;

        let mut hosts = Vec::new();
        for h in &args.hosts {
            let parsed = Host::parse_hosts(h, args.port).map_err(|e| e.to_string())?;
            hosts.extend(parsed);
        }

        let tls_config = if args.tls {
            Some(TlsConfig {
                skip_verify: args.tls_skip_verify,
                ca_cert: args.tls_ca_cert.clone(),
                client_cert: args.tls_cert.clone(),
                client_key: args.tls_key.clone(),
                sni: args.tls_sni.clone(),
            })
        } else {
            None
        };

        let policy = ClientPolicy {
            user: args.user.clone(),
            password: args.password.clone(),
            auth_mode: if args.external_auth {
                AuthMode::External
            } else {
                AuthMode::Internal
            },
            cluster_name: args.cluster_name.clone(),
            timeout: Duration::from_millis(args.timeout_ms),
            tend_interval: Duration::from_millis(args.tend_interval_ms),
            connection_queue_size: args.connection_queue_size,
            rack_aware: !args.rack_ids.is_empty(),
            rack_ids: args.rack_ids.clone(),
            use_services_alternate: args.services_alternate,
            tls_config,
            ..Default::default()
        };

        Ok((policy, hosts))
    }

    /// Tend interval with the floor applied
    pub fn effective_tend_interval(&self) -> Duration {
        self.tend_interval.max(MIN_TEND_INTERVAL)
    }

    /// Whether connections must log in after connecting
    pub fn requires_authentication(&self) -> bool {
        self.user.is_some() || self.auth_mode == AuthMode::Pki
    }

    /// Check settings that would fail every connection attempt
    pub fn validate(&self) -> crate::utils::Result<()> {
        use crate::utils::Error;

        if self.auth_mode == AuthMode::External && self.tls_config.is_none() {
            return Err(Error::parameter("external authentication requires TLS"));
        }
        if self.auth_mode == AuthMode::Pki {
            let has_cert = self
                .tls_config
                .as_ref()
                .map(|t| t.has_client_cert())
                .unwrap_or(false);
            if !has_cert {
                return Err(Error::parameter(
                    "PKI authentication requires a TLS client certificate",
                ));
            }
        }
        if self.user.is_some() && self.password.is_none() && self.auth_mode != AuthMode::Pki {
            return Err(Error::parameter("user is set but password is missing"));
        }
        if self.connection_queue_size == 0 {
            return Err(Error::parameter("connection_queue_size must be positive"));
        }
        if self.min_connections_per_node > self.connection_queue_size {
            return Err(Error::parameter(
                "min_connections_per_node exceeds connection_queue_size",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tend_interval_floor() {
        let policy = ClientPolicy {
            tend_interval: Duration::from_millis(1),
            ..Default::default()
        };
        assert_eq!(policy.effective_tend_interval(), MIN_TEND_INTERVAL);
    }

    #[test]
    fn test_external_auth_requires_tls() {
        let policy = ClientPolicy {
            auth_mode: AuthMode::External,
            user: Some("admin".into()),
            password: Some("secret".into()),
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_user_requires_password() {
        let policy = ClientPolicy {
            user: Some("admin".into()),
            ..Default::default()
        };
        assert!(policy.validate().is_err());
        assert!(policy.requires_authentication());
    }

    #[test]
    fn test_default_is_valid() {
        assert!(ClientPolicy::default().validate().is_ok());
        assert!(!ClientPolicy::default().requires_authentication());
    }
}
