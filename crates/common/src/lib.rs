//! Shared vocabulary of the engine: identifiers, qualified names, the error
//! sum, runtime configuration, the cost triple, and the wire-level query
//! model handed to the binder by external callers.

#[cfg(test)]
mod tests;

pub mod knn;
pub mod names;
pub mod query;

pub use names::{ColumnName, EntityName, IndexName, SchemaName};
pub use query::{
    BooleanPredicate, ComparisonOperator, Connector, DataChangeEvent, Distance, KnnPredicate,
    Projection, ProjectionOp, Query, QuerySource, Record,
};

use serde::{Deserialize, Serialize};
use std::{fmt, io, path::PathBuf, time::Duration};
use thiserror::Error;

/// Identifier for a tuple within an entity. Assigned monotonically by the
/// entity, 0-based, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TupleId(pub u64);

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a page within a page file. 1-based; `0` is reserved and
/// page `1` is always the file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u64);

impl PageId {
    pub const RESERVED: PageId = PageId(0);
    pub const HEADER: PageId = PageId(1);

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing transaction identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Canonical error type shared across the engine. Messages carry the
/// fully-qualified name of the offending object where one exists.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("data corruption: {0}")]
    DataCorruption(String),
    #[error("file locked: {0}")]
    FileLocked(String),
    #[error("schema '{0}' does not exist")]
    SchemaDoesNotExist(String),
    #[error("entity '{0}' does not exist")]
    EntityDoesNotExist(String),
    #[error("column '{0}' does not exist")]
    ColumnDoesNotExist(String),
    #[error("index '{0}' does not exist")]
    IndexDoesNotExist(String),
    #[error("schema '{0}' already exists")]
    SchemaAlreadyExists(String),
    #[error("entity '{0}' already exists")]
    EntityAlreadyExists(String),
    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),
    #[error("{0} is closed")]
    TransactionClosed(TransactionId),
    #[error("{0} is read-only")]
    TransactionReadOnly(TransactionId),
    #[error("{0} is in error state")]
    TransactionInError(TransactionId),
    #[error("write lock could not be obtained: {0}")]
    TransactionWriteLockFailed(String),
    #[error("database object '{0}' is closed")]
    TransactionDboClosed(String),
    #[error("query syntax: {0}")]
    QuerySyntax(String),
    #[error("query bind: {0}")]
    QueryBind(String),
    #[error("query planner: {0}")]
    QueryPlanner(String),
    #[error("unsupported predicate: {0}")]
    UnsupportedPredicate(String),
    #[error("operator setup: {0}")]
    OperatorSetup(String),
    #[error("operator execution: {0}")]
    OperatorExecution(String),
    #[error("predicate not supported by index '{0}'")]
    PredicateNotSupportedByIndex(String),
    #[error("validation: {0}")]
    TxValidation(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("{0} was cancelled")]
    Cancelled(TransactionId),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias carrying a [`DbError`].
pub type DbResult<T> = Result<T, DbError>;

/// Weighted-norm cost triple used by indexes and the planner. `INVALID`
/// disqualifies a candidate plan outright.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cost {
    pub io: f32,
    pub cpu: f32,
    pub memory: f32,
}

impl Cost {
    pub const ZERO: Cost = Cost {
        io: 0.0,
        cpu: 0.0,
        memory: 0.0,
    };
    pub const INVALID: Cost = Cost {
        io: f32::INFINITY,
        cpu: f32::INFINITY,
        memory: f32::INFINITY,
    };

    const WEIGHT_IO: f32 = 1.0;
    const WEIGHT_CPU: f32 = 0.5;
    const WEIGHT_MEMORY: f32 = 0.1;

    pub fn new(io: f32, cpu: f32, memory: f32) -> Cost {
        Cost { io, cpu, memory }
    }

    pub fn total(&self) -> f32 {
        self.io * Self::WEIGHT_IO + self.cpu * Self::WEIGHT_CPU + self.memory * Self::WEIGHT_MEMORY
    }

    pub fn is_invalid(&self) -> bool {
        !self.total().is_finite()
    }
}

impl std::ops::Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost {
            io: self.io + rhs.io,
            cpu: self.cpu + rhs.cpu,
            memory: self.memory + rhs.memory,
        }
    }
}

/// Runtime configuration for the engine.
///
/// # Example
/// ```
/// use common::Config;
/// use std::path::PathBuf;
///
/// let config = Config::builder()
///     .data_dir(PathBuf::from("./warren"))
///     .page_size(8192)
///     .buffer_pool_frames(512)
///     .build();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Root directory holding the catalogue, schemas, and entities.
    #[builder(default = PathBuf::from("./hare_data"))]
    pub data_dir: PathBuf,
    /// Fixed page size in bytes; must be a power of two.
    #[builder(default = 4096)]
    pub page_size: usize,
    /// Frames each buffer pool keeps resident.
    #[builder(default = 256)]
    pub buffer_pool_frames: usize,
    /// Write page files through a write-ahead log instead of directly.
    #[builder(default = false)]
    pub wal: bool,
    /// Deadline for acquiring the advisory file lock on open.
    #[builder(default = Duration::from_secs(5))]
    pub file_lock_timeout: Duration,
    /// Deadline for logical DBO lock acquisition.
    #[builder(default = Duration::from_secs(30))]
    pub lock_timeout: Duration,
    /// Deadline for buffer pool eviction polls.
    #[builder(default = Duration::from_secs(5))]
    pub eviction_timeout: Duration,
    /// Bounded LRU capacity of the plan cache.
    #[builder(default = 100)]
    pub plan_cache_capacity: usize,
    /// Upper bound on workers for the parallel kNN fullscan.
    #[builder(default = 4)]
    pub knn_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{
        BooleanPredicate, Config, Cost, DbError, DbResult, KnnPredicate, PageId, Query, Record,
        TransactionId, TupleId,
    };
    pub use types::{Type, Value};
}
