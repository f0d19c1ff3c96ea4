//! Wire commands: encoding, parsing and execution
//!
//! Every request is built into a [`CommandBuffer`] and sent through
//! [`executor::execute`], which owns the retry loop. Single-record, batch
//! and streaming commands differ only in how they route, encode and parse.

pub mod batch;
pub mod buffer;
pub mod executor;
pub mod filter;
pub mod key;
pub mod operation;
pub(crate) mod orchestrator;
pub mod parser;
pub mod partition_tracker;
pub mod query;
pub mod record;
pub mod recordset;
pub mod scan;
pub mod single;
pub mod value;

pub use batch::{BatchRead, BatchReadRecord, BatchResults};
pub use buffer::CommandBuffer;
pub use executor::{execute, Command};
pub use filter::{Expression, Filter, IndexCollectionType, IndexType, Statement};
pub use key::Key;
pub use operation::{Bin, Operation, OperationType};
pub use partition_tracker::{PartitionFilter, PartitionStatus};
pub use record::Record;
pub use recordset::Recordset;
pub use single::{SingleCommand, SingleOp};
pub use value::{BinMap, Value};
