//! Utility modules

pub mod error;
pub mod result_code;

pub use error::{
    ClusterError, ConnectionError, Error, ErrorKind, PoolError, ProtocolError, Result,
};
pub use result_code::ResultCode;
