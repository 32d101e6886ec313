//! tsdbe - the partition lifecycle core of an embedded time-series database
//!
//! Rows are buffered in a writable in-memory partition at the head of a
//! newest-first partition list. Once a memory partition spans the configured
//! partition duration it turns read-only, a new head is created on the next
//! write, and a flush pass later swaps the read-only partition for an immutable
//! disk partition in the same list position (or drops it in in-memory mode).
//! Range queries walk the list from the newest partition and merge results in
//! ascending timestamp order.

pub mod cgroup;
pub mod concurrency;
pub mod disk;
pub mod error;
pub mod list;
pub mod memory;
pub mod partition;
pub mod storage;
pub mod wal;

pub use error::{Result, TsdbeError};
pub use storage::{Storage, StorageBuilder, TimestampPrecision};
pub use wal::WalSyncMode;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a data point, the smallest unit of time series data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Unix timestamp in the storage's configured precision.
    pub timestamp: i64,
    /// The actual value.
    pub value: f64,
}

impl DataPoint {
    /// Creates a new DataPoint.
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataPoint(ts: {}, val: {})", self.timestamp, self.value)
    }
}

/// A row is a data point along with the name of the metric it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    metric: String,
    data_point: DataPoint,
}

impl Row {
    /// Creates a new Row.
    pub fn new(metric: impl Into<String>, data_point: DataPoint) -> Self {
        Self {
            metric: metric.into(),
            data_point,
        }
    }

    /// Gets the metric name.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Gets the data point.
    pub fn data_point(&self) -> DataPoint {
        self.data_point
    }

    /// Shorthand for `self.data_point().timestamp`.
    pub fn timestamp(&self) -> i64 {
        self.data_point.timestamp
    }
}
