//! Per-node connection pool
//!
//! A bounded lock-free queue of idle connections. Connections are taken from
//! the front and returned to the back, so the front holds the ones idle the
//! longest.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::client::connection::Connection;

pub struct ConnectionPool {
    tx: Sender<Connection>,
    rx: Receiver<Connection>,
    capacity: usize,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Take an idle connection, if any.
    pub fn poll(&self) -> Option<Connection> {
        self.rx.try_recv().ok()
    }

    /// Return a connection; hands it back when the pool is full.
    pub fn offer(&self, conn: Connection) -> Result<(), Connection> {
        match self.tx.try_send(conn) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(c)) | Err(TrySendError::Disconnected(c)) => Err(c),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove connections that sat unused past their idle timeout or were
    /// closed. Returns them so the caller can account for them.
    pub fn drop_idle(&self) -> Vec<Connection> {
        let mut dropped = Vec::new();
        for _ in 0..self.len() {
            let Some(conn) = self.poll() else { break };
            if conn.is_idle() || conn.is_closed() {
                dropped.push(conn);
                continue;
            }
            if let Err(conn) = self.offer(conn) {
                dropped.push(conn);
            }
        }
        dropped
    }

    /// Remove every pooled connection.
    pub fn drain(&self) -> Vec<Connection> {
        self.rx.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    fn connect(listener: &TcpListener, idle: Duration) -> Connection {
        Connection::connect(
            listener.local_addr().unwrap(),
            Duration::from_secs(1),
            idle,
        )
        .unwrap()
    }

    #[test]
    fn test_offer_and_poll() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = ConnectionPool::new(1);
        assert!(pool.poll().is_none());

        pool.offer(connect(&listener, Duration::ZERO)).ok().unwrap();
        assert_eq!(pool.len(), 1);
        // full
        let rejected = pool.offer(connect(&listener, Duration::ZERO));
        assert!(rejected.is_err());

        assert!(pool.poll().is_some());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_drop_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = ConnectionPool::new(4);
        pool.offer(connect(&listener, Duration::from_millis(1)))
            .ok()
            .unwrap();
        pool.offer(connect(&listener, Duration::from_secs(60)))
            .ok()
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let dropped = pool.drop_idle();
        assert_eq!(dropped.len(), 1);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.drain().len(), 1);
        assert!(pool.is_empty());
    }
}
