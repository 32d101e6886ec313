//! Memory partition implementation.

use crate::partition::Partition;
use crate::wal::{SegmentId, Wal};
use crate::{DataPoint, Result, Row, TsdbeError};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

/// A memory partition stores data points in heap memory.
///
/// It stays writable until the span between its oldest and newest timestamp
/// reaches the partition duration, or until a flush seals it. Once read-only
/// it refuses every further batch as a whole.
pub struct MemoryPartition {
    /// Number of data points
    num_points: AtomicUsize,
    /// Minimum timestamp, `i64::MAX` while empty
    min_t: AtomicI64,
    /// Maximum timestamp, `i64::MIN` while empty
    max_t: AtomicI64,
    metrics: DashMap<String, Arc<MemoryMetric>>,
    wal: Arc<dyn Wal>,
    wal_segment: SegmentId,
    /// Partition duration in the storage's timestamp unit
    partition_duration: i64,
    /// Writers hold it shared for the whole batch; sealing takes it exclusively.
    write_gate: RwLock<()>,
    sealed: AtomicBool,
}

impl MemoryPartition {
    /// Creates a new memory partition logging into a fresh WAL segment.
    pub fn new(wal: Arc<dyn Wal>, partition_duration: i64) -> Result<Self> {
        if partition_duration <= 0 {
            return Err(TsdbeError::InvalidConfiguration(format!(
                "invalid partition duration given: {partition_duration}"
            )));
        }
        let wal_segment = wal.open_segment()?;

        Ok(Self {
            num_points: AtomicUsize::new(0),
            min_t: AtomicI64::new(i64::MAX),
            max_t: AtomicI64::new(i64::MIN),
            metrics: DashMap::new(),
            wal,
            wal_segment,
            partition_duration,
            write_gate: RwLock::new(()),
            sealed: AtomicBool::new(false),
        })
    }

    /// Returns true once the partition is read-only and holds data worth persisting.
    pub fn ready_to_be_persisted(&self) -> bool {
        self.read_only() && self.size() > 0
    }

    /// Closes the partition to writes, waiting for writers already inside it.
    ///
    /// Returns `false` if it was already sealed, so that two concurrent flush
    /// passes never both claim the same partition.
    pub fn seal(&self) -> bool {
        let _gate = self.write_gate.write();
        !self.sealed.swap(true, Ordering::SeqCst)
    }

    /// Undoes [`MemoryPartition::seal`] after a failed persistence attempt.
    pub fn unseal(&self) {
        self.sealed.store(false, Ordering::SeqCst);
    }

    /// Returns true if the partition has been sealed.
    pub fn sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// The WAL segment backing this partition.
    pub fn wal_segment(&self) -> SegmentId {
        self.wal_segment
    }

    fn get_or_create_metric(&self, name: &str) -> Arc<MemoryMetric> {
        if let Some(metric) = self.metrics.get(name) {
            return metric.clone();
        }
        self.metrics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryMetric::default()))
            .clone()
    }
}

impl Partition for MemoryPartition {
    fn insert_rows(&self, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Err(TsdbeError::NoRows);
        }

        let _gate = self.write_gate.read();
        if self.read_only() {
            return Err(TsdbeError::ReadOnlyPartition);
        }

        // Write to WAL first so recovery never misses an applied row.
        self.wal.append_rows(self.wal_segment, rows)?;

        let mut min_timestamp = i64::MAX;
        let mut max_timestamp = i64::MIN;
        for row in rows {
            let point = row.data_point();
            min_timestamp = min_timestamp.min(point.timestamp);
            max_timestamp = max_timestamp.max(point.timestamp);
            self.get_or_create_metric(row.metric()).insert_point(point);
        }

        self.min_t.fetch_min(min_timestamp, Ordering::SeqCst);
        self.max_t.fetch_max(max_timestamp, Ordering::SeqCst);
        self.num_points.fetch_add(rows.len(), Ordering::SeqCst);

        Ok(())
    }

    fn select_rows(&self, metric: &str, start: i64, end: i64) -> Result<Vec<DataPoint>> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self
            .metrics
            .get(metric)
            .map(|m| m.select_points(start, end))
            .unwrap_or_default())
    }

    fn select_all(&self) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(self.size());
        for entry in self.metrics.iter() {
            let (name, metric) = entry.pair();
            rows.extend(
                metric
                    .points
                    .read()
                    .iter()
                    .map(|point| Row::new(name.as_str(), *point)),
            );
        }
        Ok(rows)
    }

    fn min_timestamp(&self) -> i64 {
        self.min_t.load(Ordering::SeqCst)
    }

    fn max_timestamp(&self) -> i64 {
        self.max_t.load(Ordering::SeqCst)
    }

    fn size(&self) -> usize {
        self.num_points.load(Ordering::SeqCst)
    }

    fn read_only(&self) -> bool {
        if self.sealed() {
            return true;
        }
        if self.size() == 0 {
            return false;
        }
        self.max_timestamp().saturating_sub(self.min_timestamp()) >= self.partition_duration
    }

    fn clean(&self) -> Result<()> {
        // The points go with the last reference; only the WAL segment is ours to drop.
        self.wal.remove_segment(self.wal_segment)
    }

    fn as_memory(&self) -> Option<&MemoryPartition> {
        Some(self)
    }
}

/// The points of one metric, kept sorted by timestamp.
#[derive(Default)]
struct MemoryMetric {
    points: RwLock<Vec<DataPoint>>,
}

impl MemoryMetric {
    fn insert_point(&self, point: DataPoint) {
        let mut points = self.points.write();
        let out_of_order = points
            .last()
            .is_some_and(|last| last.timestamp > point.timestamp);
        if out_of_order {
            // Keep arrival order among equal timestamps.
            let idx = points.partition_point(|p| p.timestamp <= point.timestamp);
            points.insert(idx, point);
        } else {
            points.push(point);
        }
    }

    fn select_points(&self, start: i64, end: i64) -> Vec<DataPoint> {
        let points = self.points.read();
        let from = points.partition_point(|p| p.timestamp < start);
        let to = points.partition_point(|p| p.timestamp <= end);
        if from >= to {
            return Vec::new();
        }
        points[from..to].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::NopWal;

    fn partition(duration: i64) -> MemoryPartition {
        MemoryPartition::new(Arc::new(NopWal), duration).unwrap()
    }

    fn row(metric: &str, timestamp: i64, value: f64) -> Row {
        Row::new(metric, DataPoint::new(timestamp, value))
    }

    #[test]
    fn rejects_non_positive_duration() {
        assert!(matches!(
            MemoryPartition::new(Arc::new(NopWal), 0),
            Err(TsdbeError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn tracks_bounds_and_selects_inclusive_range() {
        let p = partition(1_000);
        assert!(!p.read_only());
        assert_eq!(p.size(), 0);

        p.insert_rows(&[row("cpu", 200, 2.0), row("cpu", 100, 1.0), row("mem", 150, 9.0)])
            .unwrap();

        assert_eq!(p.min_timestamp(), 100);
        assert_eq!(p.max_timestamp(), 200);
        assert_eq!(p.size(), 3);

        let points = p.select_rows("cpu", 100, 200).unwrap();
        assert_eq!(points, vec![DataPoint::new(100, 1.0), DataPoint::new(200, 2.0)]);
        assert!(p.select_rows("cpu", 101, 199).unwrap().is_empty());
        assert!(p.select_rows("cpu", 200, 100).unwrap().is_empty());
        assert!(p.select_rows("disk", 0, 1_000).unwrap().is_empty());
    }

    #[test]
    fn out_of_order_points_are_returned_sorted() {
        let p = partition(1_000);
        for ts in [5, 1, 4, 2, 3] {
            p.insert_rows(&[row("cpu", ts, ts as f64)]).unwrap();
        }
        let timestamps: Vec<i64> = p
            .select_rows("cpu", 0, 10)
            .unwrap()
            .iter()
            .map(|dp| dp.timestamp)
            .collect();
        assert_eq!(timestamps, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn becomes_read_only_once_span_reaches_duration() {
        let p = partition(100);
        p.insert_rows(&[row("cpu", 1_000, 1.0)]).unwrap();
        assert!(!p.read_only());
        assert!(!p.ready_to_be_persisted());

        // The batch that crosses the boundary is still accepted whole.
        p.insert_rows(&[row("cpu", 1_050, 2.0), row("cpu", 1_100, 3.0)])
            .unwrap();
        assert!(p.read_only());
        assert!(p.ready_to_be_persisted());

        let err = p.insert_rows(&[row("cpu", 1_101, 4.0)]).unwrap_err();
        assert!(matches!(err, TsdbeError::ReadOnlyPartition));
        assert_eq!(p.size(), 3);
    }

    #[test]
    fn seal_is_claimed_once_and_blocks_writes() {
        let p = partition(1_000);
        p.insert_rows(&[row("cpu", 1, 1.0)]).unwrap();

        assert!(p.seal());
        assert!(!p.seal());
        assert!(p.read_only());
        assert!(matches!(
            p.insert_rows(&[row("cpu", 2, 2.0)]),
            Err(TsdbeError::ReadOnlyPartition)
        ));

        p.unseal();
        assert!(!p.read_only());
        p.insert_rows(&[row("cpu", 2, 2.0)]).unwrap();
    }

    #[test]
    fn select_all_returns_every_row() {
        let p = partition(1_000);
        p.insert_rows(&[row("cpu", 1, 1.0), row("mem", 2, 2.0), row("cpu", 3, 3.0)])
            .unwrap();

        let mut all = p.select_all().unwrap();
        all.sort_by_key(|r| (r.metric().to_string(), r.timestamp()));
        assert_eq!(
            all,
            vec![row("cpu", 1, 1.0), row("cpu", 3, 3.0), row("mem", 2, 2.0)]
        );
    }

    #[test]
    fn each_partition_logs_into_its_own_segment() {
        let dir = tempfile::TempDir::new().unwrap();
        let wal: Arc<dyn Wal> = crate::wal::DiskWal::new(dir.path(), 64).unwrap();
        let first = MemoryPartition::new(wal.clone(), 1_000).unwrap();
        let second = MemoryPartition::new(wal, 1_000).unwrap();
        assert_ne!(first.wal_segment(), second.wal_segment());

        first.insert_rows(&[row("cpu", 1, 1.0)]).unwrap();
        second.insert_rows(&[row("cpu", 2, 2.0)]).unwrap();
        let first_file = dir.path().join(format!("{:06}.wal", first.wal_segment()));
        let second_file = dir.path().join(format!("{:06}.wal", second.wal_segment()));
        assert!(first_file.exists());

        first.clean().unwrap();
        assert!(!first_file.exists());
        assert!(second_file.exists());
    }

    #[test]
    fn empty_batch_is_rejected() {
        let p = partition(1_000);
        assert!(matches!(p.insert_rows(&[]), Err(TsdbeError::NoRows)));
    }
}
