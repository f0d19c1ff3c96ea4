//! Error types for shardline
//!
//! Every failure surfaces as an [`Error`]: an [`ErrorKind`] annotated with the
//! node involved, the retry iteration it happened on and the in-doubt flag.
//! Retries chain errors newest first, so the outermost error is the final
//! failure and [`Error::previous`] walks back through the earlier attempts.

use std::fmt;
use std::io;

use thiserror::Error;

use super::result_code::ResultCode;

/// What went wrong, without retry context
#[derive(Error, Debug)]
pub enum ErrorKind {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Connection pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Server error: {code}{}", .message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default())]
    Server {
        code: ResultCode,
        message: Option<String>,
    },

    #[error("Invalid parameter: {0}")]
    Parameter(String),

    #[error("Bin name too long: {0}")]
    BinNameTooLong(String),

    #[error("Client timeout")]
    Timeout,

    #[error("Max retries exceeded: {0}")]
    MaxRetriesExceeded(usize),

    #[error("Scan terminated")]
    ScanTerminated,

    #[error("Query terminated")]
    QueryTerminated,

    #[error("Recordset closed")]
    RecordsetClosed,
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsFailed(String),

    #[error("Connection closed unexpectedly")]
    Closed,

    #[error("Socket timeout after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid proto version: {0}")]
    InvalidVersion(u8),

    #[error("Invalid proto type: {0}")]
    InvalidType(u8),

    #[error("Invalid size field: {0}")]
    InvalidSize(u64),

    #[error("Size estimate {estimated} does not match {written} bytes written")]
    SizeMismatch { estimated: usize, written: usize },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Decompression failed: {0}")]
    Decompress(String),

    #[error("Serialize error: {0}")]
    Serialize(String),
}

/// Cluster-related errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Cluster is empty")]
    ClusterEmpty,

    #[error("Invalid node: {0}")]
    InvalidNode(String),

    #[error("Invalid partition map: {0}")]
    InvalidPartitionMap(String),

    #[error("Partition {partition} of namespace `{namespace}` has no available node")]
    PartitionUnavailable { namespace: String, partition: usize },

    #[error("Node name mismatch: expected {expected}, got {actual}")]
    NodeNameMismatch { expected: String, actual: String },

    #[error("Cluster name mismatch: expected {expected}, got {actual}")]
    ClusterNameMismatch { expected: String, actual: String },

    #[error("Namespace `{0}` not found in partition map")]
    NamespaceNotFound(String),

    #[error("Max error rate reached for node {0}")]
    MaxErrorRate(String),

    #[error("Rack not defined for namespace `{namespace}` on node {node}")]
    RackNotDefined { namespace: String, node: String },

    #[error("Server is not accepting requests: {0}")]
    ServerNotAvailable(String),
}

/// Connection pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Connection pool is empty for node {0}")]
    Empty(String),

    #[error("Connection pool is exhausted for node {0}")]
    Exhausted(String),
}

/// Error returned by every fallible client operation
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    node: Option<String>,
    iteration: Option<usize>,
    in_doubt: bool,
    previous: Option<Box<Error>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            node: None,
            iteration: None,
            in_doubt: false,
            previous: None,
        }
    }

    /// Server returned a non-OK result code.
    pub fn server(code: ResultCode) -> Self {
        ErrorKind::Server {
            code,
            message: None,
        }
        .into()
    }

    /// Server error with an explanatory message.
    pub fn server_msg(code: ResultCode, message: impl Into<String>) -> Self {
        ErrorKind::Server {
            code,
            message: Some(message.into()),
        }
        .into()
    }

    /// Client-side validation failure; raised before any network attempt.
    pub fn parameter(message: impl Into<String>) -> Self {
        ErrorKind::Parameter(message.into()).into()
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ProtocolError::Parse(message.into()).into()
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Name of the node last involved, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Retry iteration on which the error happened.
    pub fn iteration(&self) -> Option<usize> {
        self.iteration
    }

    /// True when a write may or may not have been applied on the server.
    pub fn in_doubt(&self) -> bool {
        self.in_doubt
    }

    /// The error from the preceding attempt, if this one was chained.
    pub fn previous(&self) -> Option<&Error> {
        self.previous.as_deref()
    }

    /// Iterate over the chain, newest first.
    pub fn chain(&self) -> Chain<'_> {
        Chain { next: Some(self) }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_iteration(mut self, iteration: usize) -> Self {
        self.iteration = Some(iteration);
        self
    }

    /// Put `self` at the head of `previous`.
    pub fn chain_onto(mut self, previous: Option<Error>) -> Self {
        if let Some(prev) = previous {
            match self.previous.take() {
                // self already carries a chain; append the older chain at its tail
                Some(mut own) => {
                    own.append_tail(prev);
                    self.previous = Some(own);
                }
                None => self.previous = Some(Box::new(prev)),
            }
        }
        self
    }

    fn append_tail(&mut self, tail: Error) {
        match self.previous {
            Some(ref mut next) => next.append_tail(tail),
            None => self.previous = Some(Box::new(tail)),
        }
    }

    /// Mark a write as in doubt if the request may have reached the server.
    pub fn set_in_doubt(mut self, is_read: bool, commands_sent: usize) -> Self {
        if !is_read
            && (commands_sent > 1
                || (commands_sent == 1 && (self.is_timeout() || self.result_code().code() <= 0)))
        {
            self.in_doubt = true;
        }
        self
    }

    /// Map this error onto a result code.
    pub fn result_code(&self) -> ResultCode {
        match &self.kind {
            ErrorKind::Connection(ConnectionError::Timeout(_)) => ResultCode::Timeout,
            ErrorKind::Connection(ConnectionError::AuthFailed(_)) => ResultCode::NotAuthenticated,
            ErrorKind::Connection(_) => ResultCode::NetworkError,
            ErrorKind::Protocol(ProtocolError::Serialize(_)) => ResultCode::SerializeError,
            ErrorKind::Protocol(_) => ResultCode::ParseError,
            ErrorKind::Cluster(c) => match c {
                ClusterError::ClusterEmpty | ClusterError::InvalidNode(_) => {
                    ResultCode::InvalidNodeError
                }
                ClusterError::InvalidPartitionMap(_) => ResultCode::InvalidClusterPartitionMap,
                ClusterError::PartitionUnavailable { .. } => ResultCode::PartitionUnavailable,
                ClusterError::NodeNameMismatch { .. } => ResultCode::InvalidNodeError,
                ClusterError::ClusterNameMismatch { .. } => ResultCode::ClusterNameMismatch,
                ClusterError::NamespaceNotFound(_) => ResultCode::InvalidNamespace,
                ClusterError::MaxErrorRate(_) => ResultCode::MaxErrorRate,
                ClusterError::RackNotDefined { .. } => ResultCode::RackNotDefined,
                ClusterError::ServerNotAvailable(_) => ResultCode::ServerNotAvailable,
            },
            ErrorKind::Pool(_) => ResultCode::NoAvailableConnectionsToNode,
            ErrorKind::Server { code, .. } => *code,
            ErrorKind::Parameter(_) => ResultCode::ParameterError,
            ErrorKind::BinNameTooLong(_) => ResultCode::BinNameTooLong,
            ErrorKind::Timeout => ResultCode::Timeout,
            ErrorKind::MaxRetriesExceeded(_) => ResultCode::MaxRetriesExceeded,
            ErrorKind::ScanTerminated => ResultCode::ScanTerminated,
            ErrorKind::QueryTerminated => ResultCode::QueryTerminated,
            ErrorKind::RecordsetClosed => ResultCode::RecordsetClosed,
        }
    }

    /// Connection-level failure other than a timeout.
    pub fn is_network(&self) -> bool {
        matches!(&self.kind, ErrorKind::Connection(c) if !matches!(c, ConnectionError::Timeout(_)))
    }

    /// Client or socket timeout, or a server-side timeout result.
    pub fn is_timeout(&self) -> bool {
        matches!(
            &self.kind,
            ErrorKind::Timeout
                | ErrorKind::Connection(ConnectionError::Timeout(_))
                | ErrorKind::Server {
                    code: ResultCode::Timeout,
                    ..
                }
        )
    }

    /// Timeout raised on the client side (socket or deadline).
    pub fn is_client_timeout(&self) -> bool {
        matches!(
            &self.kind,
            ErrorKind::Timeout | ErrorKind::Connection(ConnectionError::Timeout(_))
        )
    }

    pub fn is_device_overload(&self) -> bool {
        self.result_code() == ResultCode::DeviceOverload
    }

    pub fn is_key_not_found(&self) -> bool {
        self.result_code() == ResultCode::KeyNotFoundError
    }

    pub fn is_filtered_out(&self) -> bool {
        self.result_code() == ResultCode::FilteredOut
    }

    /// Whether a connection that produced this error can be returned to its pool.
    pub fn keep_connection(&self) -> bool {
        match &self.kind {
            ErrorKind::Server { code, .. } => !matches!(
                code,
                ResultCode::Ok
                    | ResultCode::QueryTerminated
                    | ResultCode::ScanTerminated
                    | ResultCode::ParseError
                    | ResultCode::SerializeError
                    | ResultCode::ServerNotAvailable
                    | ResultCode::ScanAbort
                    | ResultCode::QueryAborted
                    | ResultCode::InvalidNodeError
                    | ResultCode::ServerMemError
                    | ResultCode::Timeout
                    | ResultCode::IndexOom
                    | ResultCode::QueryTimeout
            ),
            ErrorKind::Parameter(_) | ErrorKind::BinNameTooLong(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(node) = &self.node {
            write!(f, " [node {}]", node)?;
        }
        if let Some(iteration) = self.iteration {
            write!(f, " [iteration {}]", iteration)?;
        }
        if self.in_doubt {
            write!(f, " [in doubt]")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.previous {
            Some(prev) => Some(prev.as_ref()),
            None => None,
        }
    }
}

/// Iterator over a chained error, newest first
pub struct Chain<'a> {
    next: Option<&'a Error>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a Error;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = cur.previous();
        Some(cur)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<ConnectionError> for Error {
    fn from(e: ConnectionError) -> Self {
        Error::new(e.into())
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::new(e.into())
    }
}

impl From<ClusterError> for Error {
    fn from(e: ClusterError) -> Self {
        Error::new(e.into())
    }
}

impl From<PoolError> for Error {
    fn from(e: PoolError) -> Self {
        Error::new(e.into())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::new(ConnectionError::Io(e).into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_is_newest_first() {
        let first = Error::from(ConnectionError::Closed).with_iteration(0);
        let second = Error::from(ErrorKind::Timeout).with_iteration(1);
        let last = Error::from(ErrorKind::MaxRetriesExceeded(2)).with_iteration(2);

        let chained = last.chain_onto(Some(second.chain_onto(Some(first))));
        let iterations: Vec<_> = chained.chain().map(|e| e.iteration()).collect();
        assert_eq!(iterations, vec![Some(2), Some(1), Some(0)]);
        assert_eq!(chained.result_code(), ResultCode::MaxRetriesExceeded);
    }

    #[test]
    fn test_chain_onto_preserves_existing_tail() {
        let older = Error::server(ResultCode::KeyBusy).with_iteration(0);
        let head = Error::from(ErrorKind::Timeout)
            .with_iteration(2)
            .chain_onto(Some(Error::server(ResultCode::DeviceOverload).with_iteration(1)));
        let chained = head.chain_onto(Some(older));
        let codes: Vec<_> = chained.chain().map(|e| e.result_code()).collect();
        assert_eq!(
            codes,
            vec![
                ResultCode::Timeout,
                ResultCode::DeviceOverload,
                ResultCode::KeyBusy
            ]
        );
    }

    #[test]
    fn test_in_doubt_rules() {
        // reads are never in doubt
        let e = Error::from(ErrorKind::Timeout).set_in_doubt(true, 3);
        assert!(!e.in_doubt());

        // write never sent
        let e = Error::from(ErrorKind::Timeout).set_in_doubt(false, 0);
        assert!(!e.in_doubt());

        // write sent once and timed out
        let e = Error::from(ErrorKind::Timeout).set_in_doubt(false, 1);
        assert!(e.in_doubt());

        // write sent once, definite server answer
        let e = Error::server(ResultCode::GenerationError).set_in_doubt(false, 1);
        assert!(!e.in_doubt());

        // write sent more than once
        let e = Error::server(ResultCode::GenerationError).set_in_doubt(false, 2);
        assert!(e.in_doubt());
    }

    #[test]
    fn test_keep_connection() {
        assert!(Error::server(ResultCode::KeyNotFoundError).keep_connection());
        assert!(!Error::server(ResultCode::ScanAbort).keep_connection());
        assert!(!Error::server(ResultCode::Timeout).keep_connection());
        assert!(!Error::from(ConnectionError::Closed).keep_connection());
        assert!(!Error::parse("bad").keep_connection());
    }

    #[test]
    fn test_classification() {
        assert!(Error::from(ConnectionError::Closed).is_network());
        assert!(!Error::from(ConnectionError::Timeout(5)).is_network());
        assert!(Error::from(ConnectionError::Timeout(5)).is_client_timeout());
        assert!(Error::server(ResultCode::Timeout).is_timeout());
        assert!(!Error::server(ResultCode::Timeout).is_client_timeout());
        assert_eq!(
            Error::from(PoolError::Exhausted("A".into())).result_code(),
            ResultCode::NoAvailableConnectionsToNode
        );
    }

    #[test]
    fn test_display_includes_context() {
        let e = Error::server(ResultCode::KeyNotFoundError)
            .with_node("BB9")
            .with_iteration(1);
        let s = e.to_string();
        assert!(s.contains("Key not found"));
        assert!(s.contains("node BB9"));
        assert!(s.contains("iteration 1"));
    }
}
