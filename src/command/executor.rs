//! Command execution with retries
//!
//! [`execute`] drives one logical command through its attempts: pick a node,
//! take a connection, write the request, read the response. Network and
//! timeout failures are retried with backoff until the retry budget or the
//! deadline runs out; every failure is chained onto the returned error.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::buffer::CommandBuffer;
use crate::client::connection::Connection;
use crate::cluster::{Cluster, Node};
use crate::config::BasePolicy;
use crate::utils::{Error, ErrorKind, PoolError, Result};

/// One kind of request against one node at a time
pub trait Command {
    fn base_policy(&self) -> &BasePolicy;

    /// Reads are never in doubt.
    fn is_read(&self) -> bool;

    /// Node for the next attempt.
    fn node(&mut self, cluster: &Cluster) -> Result<Arc<Node>>;

    /// Adjust routing before a retry.
    fn prepare_retry(&mut self, is_client_timeout: bool);

    /// Encode the request into the connection buffer.
    fn write_buffer(&mut self, buf: &mut CommandBuffer) -> Result<()>;

    /// Read and parse the response.
    fn parse_result(&mut self, conn: &mut Connection) -> Result<()>;

    /// Streaming commands must not resume on another connection mid-stream.
    fn one_shot(&self) -> bool {
        false
    }

    /// Redistribute the command before a retry. `Some` means the retry was
    /// carried out by other commands and holds their outcome.
    fn retry_split(
        &mut self,
        _cluster: &Cluster,
        _deadline: Option<Instant>,
        _iteration: usize,
    ) -> Option<Result<()>> {
        None
    }

    fn name(&self) -> &'static str;
}

/// Run a command under its policy's deadline.
pub fn execute(cluster: &Cluster, cmd: &mut dyn Command) -> Result<()> {
    let deadline = cmd.base_policy().deadline();
    execute_from(cluster, cmd, deadline, 0)
}

/// Run a command starting at `iteration` of an existing retry budget.
pub fn execute_from(
    cluster: &Cluster,
    cmd: &mut dyn Command,
    deadline: Option<Instant>,
    mut iteration: usize,
) -> Result<()> {
    let policy = cmd.base_policy().clone();
    let is_read = cmd.is_read();
    let mut sleep = policy.sleep_between_retries;
    let mut chain: Option<Error> = None;
    let mut sent = 0usize;
    let mut is_client_timeout = false;
    let mut pool_empty_grace = true;
    let mut first = true;
    let mut billed = true;

    loop {
        if !first {
            if billed {
                iteration += 1;
            }
            billed = true;
            if iteration > policy.max_retries {
                return Err(Error::from(ErrorKind::MaxRetriesExceeded(iteration))
                    .with_iteration(iteration)
                    .chain_onto(chain)
                    .set_in_doubt(is_read, sent));
            }

            if !sleep.is_zero() {
                if let Some(deadline) = deadline {
                    if Instant::now() + sleep > deadline {
                        break;
                    }
                }
                thread::sleep(sleep);
                sleep = next_sleep(sleep, policy.sleep_multiplier);
            }

            if let Some(result) = cmd.retry_split(cluster, deadline, iteration) {
                return result.map_err(|e| e.chain_onto(chain).set_in_doubt(is_read, sent));
            }
            cmd.prepare_retry(is_client_timeout);
            debug!("Retrying {} (iteration {})", cmd.name(), iteration);
        }
        first = false;

        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            break;
        }

        let node = match cmd.node(cluster) {
            Ok(node) => node,
            Err(e) => {
                is_client_timeout = false;
                chain = Some(e.with_iteration(iteration).chain_onto(chain));
                continue;
            }
        };

        if let Err(e) = node.validate_error_count() {
            is_client_timeout = false;
            chain = Some(e.with_iteration(iteration).chain_onto(chain));
            continue;
        }

        let mut conn = match node.get_connection(deadline, policy.socket_timeout) {
            Ok(conn) => conn,
            Err(e) => {
                match e.kind() {
                    ErrorKind::Pool(PoolError::Exhausted(_))
                        if policy.exit_fast_on_exhausted_connection_pool =>
                    {
                        return Err(e
                            .with_node(node.name())
                            .with_iteration(iteration)
                            .chain_onto(chain)
                            .set_in_doubt(is_read, sent));
                    }
                    ErrorKind::Pool(PoolError::Empty(_)) if pool_empty_grace => {
                        // first empty pool of the command is not billed
                        pool_empty_grace = false;
                        billed = false;
                    }
                    _ => {}
                }
                is_client_timeout = false;
                chain = Some(
                    e.with_node(node.name())
                        .with_iteration(iteration)
                        .chain_onto(chain),
                );
                continue;
            }
        };

        let started = Instant::now();
        if let Err(e) = prepare_request(cmd, &mut conn, deadline, &policy) {
            // a request that cannot be built never will be
            node.invalidate_connection(conn);
            return Err(e
                .with_node(node.name())
                .with_iteration(iteration)
                .chain_onto(chain)
                .set_in_doubt(is_read, sent));
        }

        if let Err(e) = conn.send_buffer() {
            node.invalidate_connection(conn);
            node.metrics().record_error();
            if e.is_network() {
                node.incr_error_count();
            }
            is_client_timeout = e.is_client_timeout();
            chain = Some(
                e.with_node(node.name())
                    .with_iteration(iteration)
                    .chain_onto(chain),
            );
            continue;
        }
        sent += 1;

        match cmd.parse_result(&mut conn) {
            Ok(()) => {
                node.put_connection(conn);
                node.metrics()
                    .record_command(started.elapsed().as_micros() as u64);
                return Ok(());
            }
            Err(e) if e.is_network() || e.is_timeout() => {
                node.invalidate_connection(conn);
                node.metrics().record_error();
                if e.is_network() {
                    node.incr_error_count();
                }
                is_client_timeout = e.is_client_timeout();
                let e = e.with_node(node.name()).with_iteration(iteration);
                if cmd.one_shot() {
                    return Err(e.chain_onto(chain).set_in_doubt(is_read, sent));
                }
                chain = Some(e.chain_onto(chain));
            }
            Err(e) => {
                if e.is_device_overload() {
                    node.incr_error_count();
                }
                if e.keep_connection() {
                    node.put_connection(conn);
                    node.metrics()
                        .record_command(started.elapsed().as_micros() as u64);
                } else {
                    node.invalidate_connection(conn);
                    node.metrics().record_error();
                }
                return Err(e
                    .with_node(node.name())
                    .with_iteration(iteration)
                    .chain_onto(chain)
                    .set_in_doubt(is_read, sent));
            }
        }
    }

    Err(Error::from(ErrorKind::Timeout)
        .with_iteration(iteration)
        .chain_onto(chain)
        .set_in_doubt(is_read, sent))
}

/// Encode the request and stamp the time left into it.
fn prepare_request(
    cmd: &mut dyn Command,
    conn: &mut Connection,
    deadline: Option<Instant>,
    policy: &BasePolicy,
) -> Result<()> {
    cmd.write_buffer(&mut conn.buffer)?;
    if let Some(timeout) = server_timeout(deadline, policy) {
        conn.buffer
            .set_server_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    }
    conn.buffer.compress_if_needed()
}

/// Time left for the server, never below 1ms once a deadline applies.
fn server_timeout(deadline: Option<Instant>, policy: &BasePolicy) -> Option<Duration> {
    let configured = policy.server_timeout();
    let remaining = deadline.map(|d| {
        d.saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1))
    });
    match (remaining, configured.is_zero()) {
        (Some(r), false) => Some(r.min(configured)),
        (Some(r), true) => Some(r),
        (None, false) => Some(configured),
        (None, true) => None,
    }
}

fn next_sleep(sleep: Duration, multiplier: f64) -> Duration {
    if multiplier > 1.0 {
        sleep.mul_f64(multiplier)
    } else {
        sleep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::test_node_with;
    use crate::cluster::PartitionMap;
    use crate::config::ClientPolicy;
    use crate::utils::{ConnectionError, ResultCode};
    use std::net::TcpListener;

    /// Sends a fixed request; every response read fails the configured way.
    struct Scripted {
        policy: BasePolicy,
        node: Arc<Node>,
        attempts: usize,
        fail: fn() -> Error,
        read: bool,
    }

    impl Command for Scripted {
        fn base_policy(&self) -> &BasePolicy {
            &self.policy
        }
        fn is_read(&self) -> bool {
            self.read
        }
        fn node(&mut self, _cluster: &Cluster) -> Result<Arc<Node>> {
            Ok(self.node.clone())
        }
        fn prepare_retry(&mut self, _is_client_timeout: bool) {}
        fn write_buffer(&mut self, buf: &mut CommandBuffer) -> Result<()> {
            buf.begin();
            buf.size_buffer(false)?;
            buf.write_header(&self.policy, 0, 0, 0, 0);
            buf.end()
        }
        fn parse_result(&mut self, _conn: &mut Connection) -> Result<()> {
            self.attempts += 1;
            Err((self.fail)())
        }
        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn setup(policy: BasePolicy, fail: fn() -> Error, read: bool) -> (TcpListener, Cluster, Scripted) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let node = test_node_with("A", ClientPolicy::default(), listener.local_addr().unwrap());
        let cluster = Cluster::for_test(ClientPolicy::default(), vec![node.clone()], PartitionMap::new());
        let scripted = Scripted {
            policy,
            node,
            attempts: 0,
            fail,
            read,
        };
        (listener, cluster, scripted)
    }

    #[test]
    fn test_retry_bound_is_max_retries_plus_one() {
        let policy = BasePolicy {
            max_retries: 3,
            total_timeout: Duration::from_secs(10),
            sleep_between_retries: Duration::from_millis(5),
            sleep_multiplier: 2.0,
            ..Default::default()
        };
        let (_l, cluster, mut scripted) = setup(policy, || ConnectionError::Closed.into(), true);

        let started = Instant::now();
        let err = execute(&cluster, &mut scripted).unwrap_err();
        assert_eq!(scripted.attempts, 4);
        assert_eq!(err.result_code(), ResultCode::MaxRetriesExceeded);
        assert_eq!(err.chain().count(), 5);
        // 5 + 10 + 20
        assert!(started.elapsed() >= Duration::from_millis(35));
    }

    #[test]
    fn test_application_error_is_not_retried() {
        let (_l, cluster, mut scripted) = setup(
            BasePolicy::default(),
            || Error::server(ResultCode::KeyNotFoundError),
            true,
        );
        let err = execute(&cluster, &mut scripted).unwrap_err();
        assert_eq!(scripted.attempts, 1);
        assert!(err.is_key_not_found());
        assert_eq!(err.node(), Some("A"));
        // connection went back to the pool
        assert_eq!(scripted.node.connection_count(), 1);
    }

    #[test]
    fn test_write_timeout_after_send_is_in_doubt() {
        let policy = BasePolicy {
            max_retries: 0,
            ..Default::default()
        };
        let (_l, cluster, mut scripted) = setup(policy, || ConnectionError::Timeout(5).into(), false);
        let err = execute(&cluster, &mut scripted).unwrap_err();
        assert!(err.in_doubt());
        assert_eq!(scripted.node.connection_count(), 0);
    }

    #[test]
    fn test_deadline_stops_retries() {
        let policy = BasePolicy {
            max_retries: 1000,
            total_timeout: Duration::from_millis(50),
            sleep_between_retries: Duration::from_millis(10),
            ..Default::default()
        };
        let (_l, cluster, mut scripted) = setup(policy, || ConnectionError::Closed.into(), true);
        let err = execute(&cluster, &mut scripted).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::Timeout);
        assert!(scripted.attempts < 10);
        assert!(!err.in_doubt());
    }

    #[test]
    fn test_server_timeout_never_below_one_ms() {
        let policy = BasePolicy::default();
        let past = Instant::now();
        thread::sleep(Duration::from_millis(2));
        let t = server_timeout(Some(past), &policy).unwrap();
        assert_eq!(t, Duration::from_millis(1));
    }
}
