//! Disk partition implementation.
//!
//! A disk partition is a directory holding two files: `data`, the
//! concatenation of one bincode-encoded, timestamp-sorted point vector per
//! metric, and `meta.json`, which locates each metric inside `data`. The
//! metadata file is written last, so a directory without it is an interrupted
//! flush rather than a partition.

use crate::partition::Partition;
use crate::{DataPoint, Result, Row, TsdbeError};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

pub const DATA_FILE_NAME: &str = "data";
pub const META_FILE_NAME: &str = "meta.json";

/// Metadata for a disk partition.
#[derive(Debug, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub num_data_points: usize,
    pub metrics: HashMap<String, DiskMetric>,
    pub created_at: SystemTime,
}

/// Location and bounds of one metric inside the data file.
#[derive(Debug, Serialize, Deserialize)]
pub struct DiskMetric {
    pub offset: u64,
    pub encoded_size: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub num_data_points: usize,
}

/// A disk partition stores time-series data on disk using a memory-mapped file.
pub struct DiskPartition {
    dir_path: PathBuf,
    meta: PartitionMeta,
    mapped_file: Mmap,
}

impl DiskPartition {
    /// Writes `rows` into a new partition directory at `dir_path` and opens it.
    ///
    /// `min_timestamp`/`max_timestamp` are recorded as the partition bounds
    /// as given. The directory must not exist yet.
    pub fn create(
        dir_path: impl AsRef<Path>,
        rows: &[Row],
        min_timestamp: i64,
        max_timestamp: i64,
    ) -> Result<Self> {
        let dir_path = dir_path.as_ref();
        if rows.is_empty() {
            return Err(TsdbeError::NoDataPoints {
                path: dir_path.to_path_buf(),
            });
        }

        let mut series: BTreeMap<&str, Vec<DataPoint>> = BTreeMap::new();
        for row in rows {
            series.entry(row.metric()).or_default().push(row.data_point());
        }

        fs::create_dir(dir_path).map_err(TsdbeError::io_at(dir_path))?;

        let data_path = dir_path.join(DATA_FILE_NAME);
        let data_file = File::create(&data_path).map_err(TsdbeError::io_at(&data_path))?;
        let mut writer = BufWriter::new(data_file);
        let mut metrics = HashMap::with_capacity(series.len());
        let mut offset = 0u64;

        for (name, mut points) in series {
            points.sort_by_key(|p| p.timestamp);
            let encoded = bincode::serialize(&points)?;
            writer.write_all(&encoded)?;

            metrics.insert(
                name.to_string(),
                DiskMetric {
                    offset,
                    encoded_size: encoded.len() as u64,
                    min_timestamp: points[0].timestamp,
                    max_timestamp: points[points.len() - 1].timestamp,
                    num_data_points: points.len(),
                },
            );
            offset += encoded.len() as u64;
        }

        let data_file = writer
            .into_inner()
            .map_err(|e| TsdbeError::io_at(&data_path)(e.into_error()))?;
        data_file.sync_all()?;

        let meta = PartitionMeta {
            min_timestamp,
            max_timestamp,
            num_data_points: rows.len(),
            metrics,
            created_at: SystemTime::now(),
        };

        // Written last: its presence marks the partition as complete.
        let meta_path = dir_path.join(META_FILE_NAME);
        let meta_file = File::create(&meta_path).map_err(TsdbeError::io_at(&meta_path))?;
        serde_json::to_writer_pretty(&meta_file, &meta)?;
        meta_file.sync_all()?;

        debug!(
            dir = %dir_path.display(),
            points = rows.len(),
            min_timestamp,
            max_timestamp,
            "Created disk partition"
        );

        Self::open(dir_path)
    }

    /// Opens an existing disk partition.
    pub fn open(dir_path: impl AsRef<Path>) -> Result<Self> {
        let dir_path = dir_path.as_ref();

        let meta_path = dir_path.join(META_FILE_NAME);
        if !meta_path.exists() {
            return Err(TsdbeError::InvalidPartition {
                path: dir_path.to_path_buf(),
                details: format!("missing {META_FILE_NAME}"),
            });
        }
        let meta_file = File::open(&meta_path).map_err(TsdbeError::io_at(&meta_path))?;
        let meta: PartitionMeta = serde_json::from_reader(meta_file)?;

        let data_path = dir_path.join(DATA_FILE_NAME);
        let data_file = File::open(&data_path).map_err(TsdbeError::io_at(&data_path))?;
        if data_file.metadata()?.len() == 0 {
            return Err(TsdbeError::InvalidPartition {
                path: dir_path.to_path_buf(),
                details: format!("empty {DATA_FILE_NAME} file"),
            });
        }

        // SAFETY: partition files are never modified after creation.
        let mapped_file =
            unsafe { Mmap::map(&data_file) }.map_err(TsdbeError::io_at(&data_path))?;

        Ok(Self {
            dir_path: dir_path.to_path_buf(),
            meta,
            mapped_file,
        })
    }

    /// Returns the partition directory.
    pub fn dir_path(&self) -> &Path {
        &self.dir_path
    }

    /// Returns the partition metadata.
    pub fn meta(&self) -> &PartitionMeta {
        &self.meta
    }

    fn decode_metric_points(&self, disk_metric: &DiskMetric) -> Result<Vec<DataPoint>> {
        let data = &self.mapped_file[..];
        let start = disk_metric.offset as usize;
        let end = start.saturating_add(disk_metric.encoded_size as usize);
        if end > data.len() || start >= end {
            return Err(TsdbeError::DataCorruption(format!(
                "metric block [{start}, {end}) out of bounds of {} byte data file in {:?}",
                data.len(),
                self.dir_path
            )));
        }

        let points: Vec<DataPoint> = bincode::deserialize(&data[start..end])?;
        if points.len() != disk_metric.num_data_points {
            return Err(TsdbeError::DataCorruption(format!(
                "expected {} points, decoded {} in {:?}",
                disk_metric.num_data_points,
                points.len(),
                self.dir_path
            )));
        }
        Ok(points)
    }
}

impl Partition for DiskPartition {
    fn insert_rows(&self, _rows: &[Row]) -> Result<()> {
        Err(TsdbeError::ReadOnlyDiskPartition {
            path: self.dir_path.clone(),
        })
    }

    fn select_rows(&self, metric: &str, start: i64, end: i64) -> Result<Vec<DataPoint>> {
        let Some(disk_metric) = self.meta.metrics.get(metric) else {
            return Ok(Vec::new());
        };
        if start > end || end < disk_metric.min_timestamp || start > disk_metric.max_timestamp {
            return Ok(Vec::new());
        }

        let points = self.decode_metric_points(disk_metric)?;
        let from = points.partition_point(|p| p.timestamp < start);
        let to = points.partition_point(|p| p.timestamp <= end);
        Ok(points[from..to.max(from)].to_vec())
    }

    fn select_all(&self) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(self.meta.num_data_points);
        for (name, disk_metric) in &self.meta.metrics {
            let points = self.decode_metric_points(disk_metric)?;
            rows.extend(points.into_iter().map(|p| Row::new(name.as_str(), p)));
        }
        Ok(rows)
    }

    fn min_timestamp(&self) -> i64 {
        self.meta.min_timestamp
    }

    fn max_timestamp(&self) -> i64 {
        self.meta.max_timestamp
    }

    fn size(&self) -> usize {
        self.meta.num_data_points
    }

    fn read_only(&self) -> bool {
        true
    }

    fn clean(&self) -> Result<()> {
        fs::remove_dir_all(&self.dir_path).map_err(TsdbeError::io_at(&self.dir_path))
    }
}
