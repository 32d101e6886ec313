//! Error types for tsdbe.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tsdbe operations.
pub type Result<T> = std::result::Result<T, TsdbeError>;

/// Main error type for tsdbe operations.
#[derive(Error, Debug)]
pub enum TsdbeError {
    #[error("No rows given")]
    NoRows,

    #[error("Metric name is required")]
    MetricRequired,

    #[error("No data points to build a partition at {path:?}")]
    NoDataPoints { path: PathBuf },

    #[error("Partition with range [{min_timestamp}, {max_timestamp}] not found in the list")]
    PartitionNotFound {
        min_timestamp: i64,
        max_timestamp: i64,
    },

    #[error("Partition was detached from the list while being iterated")]
    PartitionDetached,

    #[error("Invalid partition at {path:?}: {details}")]
    InvalidPartition { path: PathBuf, details: String },

    #[error("Cannot insert rows into read-only partition")]
    ReadOnlyPartition,

    #[error("Cannot insert rows into read-only partition at {path:?}")]
    ReadOnlyDiskPartition { path: PathBuf },

    #[error(
        "Failed to write a data point in {timeout_ms}ms, since it is overloaded with {workers} concurrent writers"
    )]
    WriteTimeout { timeout_ms: u64, workers: usize },

    #[error("Failed to insert rows: {source}")]
    Insert {
        #[source]
        source: Box<TsdbeError>,
    },

    #[error("Failed to generate disk partition for {dir:?}: {source}")]
    Flush {
        dir: PathBuf,
        #[source]
        source: Box<TsdbeError>,
    },

    #[error("Failed to swap in disk partition {dir:?}: {source}")]
    Swap {
        dir: PathBuf,
        #[source]
        source: Box<TsdbeError>,
    },

    #[error("Failed to remove partition: {source}")]
    Remove {
        #[source]
        source: Box<TsdbeError>,
    },

    #[error("Storage already closed")]
    StorageClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    #[error("IO error at path {path:?}: {source}")]
    IoWithPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("WAL error: {operation} failed: {details}")]
    Wal { operation: String, details: String },

    #[error("Channel receive error for {channel}")]
    ChannelReceive { channel: String },
}

impl TsdbeError {
    /// Returns true for errors caused by a lost race on the partition list
    /// rather than by I/O, i.e. errors after which a whole flush pass can be rerun.
    pub fn is_structural(&self) -> bool {
        match self {
            TsdbeError::PartitionNotFound { .. } | TsdbeError::PartitionDetached => true,
            TsdbeError::Swap { source, .. } | TsdbeError::Remove { source } => {
                source.is_structural()
            }
            _ => false,
        }
    }

    /// Returns true if the write was rejected because of backpressure.
    pub fn is_overload(&self) -> bool {
        matches!(self, TsdbeError::WriteTimeout { .. })
    }

    pub(crate) fn io_at(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> TsdbeError {
        let path = path.into();
        move |source| TsdbeError::IoWithPath { path, source }
    }
}

impl From<crossbeam_channel::RecvError> for TsdbeError {
    fn from(_: crossbeam_channel::RecvError) -> Self {
        TsdbeError::ChannelReceive {
            channel: "recv: channel disconnected".to_string(),
        }
    }
}
