//! The partition abstraction shared by memory and disk partitions.

use crate::memory::MemoryPartition;
use crate::{DataPoint, Result, Row};
use std::sync::Arc;

/// A partition is a chunk of time-series data with a timestamp range.
///
/// Partitions act as fully independent databases containing all data points
/// for their time range. The lifecycle is:
/// writable memory -> read-only memory -> sealed -> disk.
///
/// Query code only needs the read side of this trait; writes and flush checks
/// are gated behind [`Partition::as_memory`].
pub trait Partition: Send + Sync {
    /// Inserts the whole batch, or nothing.
    fn insert_rows(&self, rows: &[Row]) -> Result<()>;

    /// Selects the points of `metric` with `start <= timestamp <= end`,
    /// in ascending timestamp order.
    fn select_rows(&self, metric: &str, start: i64, end: i64) -> Result<Vec<DataPoint>>;

    /// Returns every row held by the partition.
    fn select_all(&self) -> Result<Vec<Row>>;

    /// Returns the minimum timestamp in the partition.
    fn min_timestamp(&self) -> i64;

    /// Returns the maximum timestamp in the partition.
    fn max_timestamp(&self) -> i64;

    /// Returns the number of data points in the partition.
    fn size(&self) -> usize;

    /// Returns true once the partition no longer accepts writes.
    fn read_only(&self) -> bool;

    /// Releases resources owned by the partition once it has left the list.
    fn clean(&self) -> Result<()>;

    /// Gives access to memory-only operations, `None` for disk partitions.
    fn as_memory(&self) -> Option<&MemoryPartition> {
        None
    }
}

/// Type alias for a shared partition reference.
pub type SharedPartition = Arc<dyn Partition>;
