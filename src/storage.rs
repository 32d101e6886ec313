//! Main storage implementation for tsdbe.

use crate::concurrency::{InflightBarrier, WriteLimiter};
use crate::disk::DiskPartition;
use crate::list::PartitionList;
use crate::memory::MemoryPartition;
use crate::partition::{Partition, SharedPartition};
use crate::wal::{DiskWal, NopWal, RecoveredWal, Wal, WalReader, WalSyncMode};
use crate::{DataPoint, Result, Row, TsdbeError};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const PARTITION_DIR_PREFIX: &str = "p-";
const WAL_DIR_NAME: &str = "wal";
/// A batch refused by a partition that turned read-only under it is retried
/// against the new head at most this many times in total.
const MAX_WRITE_ATTEMPTS: usize = 3;
const RECOVERY_BATCH_SIZE: usize = 1000;
#[cfg(unix)]
const MIN_OPEN_FILES: libc::rlim_t = 256;

/// Timestamp precision for data points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TimestampPrecision {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimestampPrecision {
    /// Converts a wall-clock duration into timestamp units, saturating at `i64::MAX`.
    pub fn units_in(self, duration: Duration) -> i64 {
        let units = match self {
            TimestampPrecision::Nanoseconds => duration.as_nanos(),
            TimestampPrecision::Microseconds => duration.as_micros(),
            TimestampPrecision::Milliseconds => duration.as_millis(),
            TimestampPrecision::Seconds => u128::from(duration.as_secs()),
        };
        i64::try_from(units).unwrap_or(i64::MAX)
    }
}

/// Storage provides thread-safe capabilities for insertion and retrieval from time-series storage.
pub trait Storage: Send + Sync {
    /// Inserts the whole batch into the current writable partition, or nothing.
    fn insert_rows(&self, rows: &[Row]) -> Result<()>;

    /// Selects the points of `metric` with `start <= timestamp <= end`, in
    /// ascending timestamp order. Unreadable partitions are logged and skipped.
    fn select_rows(&self, metric: &str, start: i64, end: i64) -> Vec<DataPoint>;

    /// Persists (or, in in-memory mode, drops) every memory partition that is
    /// ready to be persisted.
    fn flush_rows(&self) -> Result<()>;

    /// Blocks until every `insert_rows` call already in progress has returned.
    ///
    /// New writers are not refused and nothing is flushed; see [`Storage::close`].
    fn wait(&self);

    /// Refuses new writes, drains in-flight ones, and persists every memory
    /// partition that holds data.
    fn close(&self) -> Result<()>;
}

/// Builder for creating a Storage instance.
pub struct StorageBuilder {
    data_path: Option<PathBuf>,
    partition_duration: Duration,
    timestamp_precision: TimestampPrecision,
    max_writers: usize,
    write_timeout: Duration,
    wal_enabled: bool,
    wal_buffer_size: usize,
    wal_sync_mode: WalSyncMode,
    wal: Option<Arc<dyn Wal>>,
}

impl Default for StorageBuilder {
    fn default() -> Self {
        Self {
            data_path: None,
            partition_duration: Duration::from_secs(3600), // 1 hour
            timestamp_precision: TimestampPrecision::Milliseconds,
            max_writers: crate::cgroup::default_workers_limit(),
            write_timeout: Duration::from_secs(30),
            wal_enabled: true,
            wal_buffer_size: 4096,
            wal_sync_mode: WalSyncMode::default(),
            wal: None,
        }
    }
}

impl StorageBuilder {
    /// Creates a new StorageBuilder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the data path for persistent storage. Without one the storage
    /// runs in in-memory mode and flushed partitions are dropped.
    pub fn with_data_path(mut self, path: impl AsRef<Path>) -> Self {
        self.data_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the time span a memory partition covers before it turns read-only.
    pub fn with_partition_duration(mut self, duration: Duration) -> Self {
        self.partition_duration = duration;
        self
    }

    /// Sets the unit of row timestamps.
    pub fn with_timestamp_precision(mut self, precision: TimestampPrecision) -> Self {
        self.timestamp_precision = precision;
        self
    }

    /// Sets the maximum number of concurrent writers.
    pub fn with_max_writers(mut self, max_writers: usize) -> Self {
        self.max_writers = max_writers;
        self
    }

    /// Sets how long a writer waits for a free slot before giving up.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Enables or disables the on-disk WAL (persistent mode only).
    pub fn with_wal_enabled(mut self, enabled: bool) -> Self {
        self.wal_enabled = enabled;
        self
    }

    /// Sets the WAL write buffer size.
    pub fn with_wal_buffer_size(mut self, size: usize) -> Self {
        self.wal_buffer_size = size;
        self
    }

    /// Sets the WAL fsync policy.
    pub fn with_wal_sync_mode(mut self, mode: WalSyncMode) -> Self {
        self.wal_sync_mode = mode;
        self
    }

    /// Uses the given WAL instead of building one. No recovery is attempted.
    pub fn with_wal(mut self, wal: Arc<dyn Wal>) -> Self {
        self.wal = Some(wal);
        self
    }

    /// Builds the Storage instance.
    ///
    /// In persistent mode this loads every complete partition under the data
    /// path and replays leftover WAL segments before returning.
    pub fn build(self) -> Result<Arc<dyn Storage>> {
        Ok(Arc::new(self.open()?))
    }

    fn open(self) -> Result<StorageImpl> {
        let partition_duration = self.timestamp_precision.units_in(self.partition_duration);
        if partition_duration <= 0 {
            return Err(TsdbeError::InvalidConfiguration(format!(
                "invalid partition duration given: {:?} at {:?} precision",
                self.partition_duration, self.timestamp_precision
            )));
        }
        if self.max_writers == 0 {
            return Err(TsdbeError::InvalidConfiguration(
                "max writers must be positive".to_string(),
            ));
        }

        if let Some(ref data_path) = self.data_path {
            fs::create_dir_all(data_path).map_err(TsdbeError::io_at(data_path))?;
            check_open_file_limit();
        }

        let wal_dir = self.data_path.as_ref().map(|p| p.join(WAL_DIR_NAME));
        let (wal, recovered): (Arc<dyn Wal>, RecoveredWal) = match (self.wal, &wal_dir) {
            (Some(wal), _) => (wal, RecoveredWal::default()),
            (None, Some(wal_dir)) if self.wal_enabled => {
                // Read leftovers before the new WAL hands out any segment.
                let recovered = WalReader::new(wal_dir).read_all()?;
                let wal: Arc<dyn Wal> = DiskWal::new_with_sync_mode(
                    wal_dir,
                    self.wal_buffer_size,
                    self.wal_sync_mode,
                )?;
                (wal, recovered)
            }
            (None, _) => (Arc::new(NopWal), RecoveredWal::default()),
        };

        let storage = StorageImpl {
            partition_list: PartitionList::new(),
            wal,
            partition_duration,
            data_path: self.data_path,
            write_timeout: self.write_timeout,
            limiter: WriteLimiter::new(self.max_writers),
            inflight: InflightBarrier::new(),
            rotation_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        };

        if let Some(ref data_path) = storage.data_path {
            storage.load_disk_partitions(data_path)?;
        }
        storage.writable_partition()?;
        storage.recover(recovered)?;

        info!(
            data_path = ?storage.data_path,
            partitions = storage.partition_list.size(),
            workers = storage.limiter.capacity(),
            "Storage opened"
        );
        Ok(storage)
    }
}

/// Main storage implementation.
struct StorageImpl {
    partition_list: PartitionList,
    wal: Arc<dyn Wal>,
    /// Partition duration in timestamp units.
    partition_duration: i64,
    data_path: Option<PathBuf>,
    write_timeout: Duration,
    limiter: WriteLimiter,
    inflight: InflightBarrier,
    rotation_lock: Mutex<()>,
    closed: AtomicBool,
}

impl StorageImpl {
    fn in_memory_mode(&self) -> bool {
        self.data_path.is_none()
    }

    /// Opens every `p-*` directory under `data_path` and links them so that
    /// the newest ends up closest to the head.
    fn load_disk_partitions(&self, data_path: &Path) -> Result<()> {
        let mut partitions = Vec::new();

        for entry in fs::read_dir(data_path).map_err(TsdbeError::io_at(data_path))? {
            let entry = entry?;
            let path = entry.path();
            let is_partition_dir = path.is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix(PARTITION_DIR_PREFIX))
                    .is_some_and(|token| !token.is_empty());
            if !is_partition_dir {
                continue;
            }

            match DiskPartition::open(&path) {
                Ok(partition) => partitions.push(Arc::new(partition) as SharedPartition),
                Err(TsdbeError::InvalidPartition { path, details }) => {
                    // Left behind by a flush that never wrote its metadata.
                    warn!(path = %path.display(), details, "Skipping incomplete disk partition");
                }
                Err(e) => return Err(e),
            }
        }

        partitions.sort_by_key(|p| p.min_timestamp());
        let count = partitions.len();
        for partition in partitions {
            self.partition_list.insert(partition);
        }

        if count > 0 {
            info!(count, data_path = %data_path.display(), "Loaded disk partitions");
        }
        Ok(())
    }

    /// Re-logs rows from leftover WAL segments through the write path, then
    /// drops those segments.
    fn recover(&self, recovered: RecoveredWal) -> Result<()> {
        if recovered.segments.is_empty() {
            return Ok(());
        }

        if !recovered.rows.is_empty() {
            info!(rows = recovered.rows.len(), "Recovering rows from WAL");
            for chunk in recovered.rows.chunks(RECOVERY_BATCH_SIZE) {
                self.write_to_head(chunk)?;
            }
            self.wal.flush()?;
        }

        for segment in recovered.segments {
            self.wal.remove_segment(segment)?;
        }
        Ok(())
    }

    /// Returns the head if it is writable, otherwise links a new memory partition as head.
    ///
    /// Rotation is serialized: concurrent writers that all observe an
    /// exhausted head create exactly one new partition.
    fn writable_partition(&self) -> Result<SharedPartition> {
        if let Some(head) = self.partition_list.get_head()
            && !head.read_only()
        {
            return Ok(head);
        }

        let _rotation_guard = self.rotation_lock.lock();
        if let Some(head) = self.partition_list.get_head()
            && !head.read_only()
        {
            return Ok(head);
        }

        let partition: SharedPartition = Arc::new(MemoryPartition::new(
            self.wal.clone(),
            self.partition_duration,
        )?);
        self.partition_list.insert(partition.clone());
        debug!(
            partitions = self.partition_list.size(),
            "Linked new memory partition as head"
        );
        Ok(partition)
    }

    fn write_to_head(&self, rows: &[Row]) -> Result<()> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let partition = self.writable_partition()?;
            match partition.insert_rows(rows) {
                Ok(()) => return Ok(()),
                // The partition turned read-only between selection and the
                // write and applied nothing; the next head will take it.
                Err(TsdbeError::ReadOnlyPartition) if attempts < MAX_WRITE_ATTEMPTS => {
                    debug!(attempts, "Head turned read-only under writer, retrying");
                }
                Err(e) => {
                    return Err(TsdbeError::Insert {
                        source: Box::new(e),
                    });
                }
            }
        }
    }

    /// Walks the list and persists or drops ready memory partitions.
    ///
    /// With `force`, every non-empty memory partition counts as ready.
    fn flush_partitions(&self, force: bool) -> Result<()> {
        for entry in self.partition_list.iter() {
            let partition = match entry {
                Ok(partition) => partition,
                Err(e) => {
                    warn!(error = %e, "Skipping partition detached during flush");
                    continue;
                }
            };
            let Some(memory) = partition.as_memory() else {
                continue;
            };

            if force && memory.size() == 0 {
                // Nothing to persist, at most an empty WAL segment to drop.
                partition.clean()?;
                continue;
            }

            let ready = force || memory.ready_to_be_persisted();
            if !ready {
                continue;
            }
            if !memory.seal() {
                // Another flush pass owns this partition.
                continue;
            }

            match self.data_path {
                None => {
                    self.partition_list
                        .remove(&partition)
                        .map_err(|e| TsdbeError::Remove {
                            source: Box::new(e),
                        })?;
                    debug!(
                        points = memory.size(),
                        min_timestamp = memory.min_timestamp(),
                        max_timestamp = memory.max_timestamp(),
                        "Dropped memory partition"
                    );
                }
                Some(ref data_path) => self.persist(&partition, memory, data_path)?,
            }
        }
        Ok(())
    }

    /// Builds a disk partition from a sealed memory partition and swaps it in
    /// at the memory partition's position.
    fn persist(
        &self,
        partition: &SharedPartition,
        memory: &MemoryPartition,
        data_path: &Path,
    ) -> Result<()> {
        let dir = data_path.join(format!("{}{}", PARTITION_DIR_PREFIX, Uuid::new_v4()));

        let built = memory.select_all().and_then(|rows| {
            DiskPartition::create(&dir, &rows, memory.min_timestamp(), memory.max_timestamp())
        });
        let disk_partition = match built {
            Ok(disk_partition) => disk_partition,
            Err(e) => {
                memory.unseal();
                if dir.exists()
                    && let Err(cleanup) = fs::remove_dir_all(&dir)
                {
                    warn!(dir = %dir.display(), error = %cleanup, "Failed to remove partial disk partition");
                }
                return Err(TsdbeError::Flush {
                    dir,
                    source: Box::new(e),
                });
            }
        };

        let points = disk_partition.size();
        if let Err(e) = self
            .partition_list
            .swap(partition, Arc::new(disk_partition))
        {
            // The directory is left in place; it holds the only persisted copy.
            error!(dir = %dir.display(), error = %e, "Failed to swap in disk partition");
            return Err(TsdbeError::Swap {
                dir,
                source: Box::new(e),
            });
        }

        // The rows live on disk now, the WAL segment can go.
        partition.clean()?;
        info!(dir = %dir.display(), points, "Persisted memory partition");
        Ok(())
    }
}

impl Storage for StorageImpl {
    fn insert_rows(&self, rows: &[Row]) -> Result<()> {
        let _inflight = self.inflight.enter();

        if self.closed.load(Ordering::SeqCst) {
            return Err(TsdbeError::StorageClosed);
        }
        if rows.is_empty() {
            return Err(TsdbeError::NoRows);
        }
        if rows.iter().any(|row| row.metric().is_empty()) {
            return Err(TsdbeError::MetricRequired);
        }

        // Ingestion is CPU bound, more concurrent writers than workers only thrash.
        let _slot = self.limiter.acquire(self.write_timeout)?;
        self.write_to_head(rows)
    }

    fn select_rows(&self, metric: &str, start: i64, end: i64) -> Vec<DataPoint> {
        let mut result = Vec::new();

        for entry in self.partition_list.iter() {
            let partition = match entry {
                Ok(partition) => partition,
                Err(e) => {
                    warn!(error = %e, "Invalid partition found");
                    continue;
                }
            };

            if partition.size() == 0 {
                continue;
            }
            if partition.max_timestamp() < start {
                // Everything older ends even earlier.
                break;
            }
            if partition.min_timestamp() > end {
                continue;
            }

            match partition.select_rows(metric, start, end) {
                Ok(mut points) => {
                    // Older partitions come later; prepend to stay ascending.
                    points.append(&mut result);
                    result = points;
                }
                Err(e) => {
                    warn!(
                        metric,
                        min_timestamp = partition.min_timestamp(),
                        max_timestamp = partition.max_timestamp(),
                        error = %e,
                        "Skipping unreadable partition"
                    );
                }
            }
        }

        result
    }

    fn flush_rows(&self) -> Result<()> {
        self.flush_partitions(false)
    }

    fn wait(&self) {
        self.inflight.wait();
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TsdbeError::StorageClosed);
        }
        self.inflight.wait();

        if !self.in_memory_mode() {
            self.flush_partitions(true)?;
        }
        self.wal.flush()?;

        info!(partitions = self.partition_list.size(), "Storage closed");
        Ok(())
    }
}

#[cfg(unix)]
fn check_open_file_limit() {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct it is given.
    let ok = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } == 0;
    if ok && rlim.rlim_cur < MIN_OPEN_FILES {
        warn!(
            limit = rlim.rlim_cur,
            "Low file descriptor limit, every disk partition keeps its data file mapped; consider raising 'ulimit -n'"
        );
    }
}

#[cfg(not(unix))]
fn check_open_file_limit() {}
