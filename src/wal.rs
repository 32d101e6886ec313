//! Write-ahead log implementation.
//!
//! Every memory partition owns one WAL segment. Rows are appended to the
//! segment before the partition applies them, and the segment is dropped once
//! the partition has been persisted as a disk partition. Whatever segments are
//! left at startup belong to partitions that never reached the disk.

use crate::{Result, Row, TsdbeError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Identifies one WAL segment.
pub type SegmentId = u64;

/// Trait for write-ahead log implementations.
pub trait Wal: Send + Sync {
    /// Allocates a new segment for a freshly created memory partition.
    fn open_segment(&self) -> Result<SegmentId>;

    /// Appends rows to the given segment.
    fn append_rows(&self, segment: SegmentId, rows: &[Row]) -> Result<()>;

    /// Flushes buffered data of every open segment to disk.
    fn flush(&self) -> Result<()>;

    /// Discards a segment whose rows are now persisted elsewhere (or dropped).
    fn remove_segment(&self, segment: SegmentId) -> Result<()>;
}

/// No-op WAL implementation.
pub struct NopWal;

impl Wal for NopWal {
    fn open_segment(&self) -> Result<SegmentId> {
        Ok(0)
    }

    fn append_rows(&self, _segment: SegmentId, _rows: &[Row]) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn remove_segment(&self, _segment: SegmentId) -> Result<()> {
        Ok(())
    }
}

const WAL_SEGMENT_EXTENSION: &str = ".wal";
const MAX_WAL_RECORD_BYTES: usize = 4 * 1024 * 1024;
const MAX_CORRUPTED_RECORDS: usize = 5;

/// Sync policy for WAL durability/performance tradeoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncMode {
    /// Flush and fsync on every append call.
    PerAppend,
    /// Flush every append and fsync at most once per interval.
    Periodic(Duration),
}

impl Default for WalSyncMode {
    fn default() -> Self {
        WalSyncMode::Periodic(Duration::from_secs(1))
    }
}

fn parse_segment_index(name: &OsStr) -> Option<SegmentId> {
    let trimmed = name.to_str()?.strip_suffix(WAL_SEGMENT_EXTENSION)?;
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    trimmed.parse().ok()
}

fn segment_file_name(segment: SegmentId) -> String {
    format!("{:06}{}", segment, WAL_SEGMENT_EXTENSION)
}

/// Lists `(segment, path)` pairs in a WAL directory, oldest first.
fn list_segments(dir: &Path) -> Result<Vec<(SegmentId, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file()
            && let Some(index) = path.file_name().and_then(parse_segment_index)
        {
            segments.push((index, path));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

/// Disk-based WAL implementation.
pub struct DiskWal {
    dir: PathBuf,
    segments: Mutex<HashMap<SegmentId, BufWriter<File>>>,
    buffer_size: usize,
    next_segment: AtomicU64,
    sync_mode: WalSyncMode,
    last_sync: Mutex<Instant>,
}

impl DiskWal {
    /// Creates a new disk WAL.
    pub fn new(dir: impl AsRef<Path>, buffer_size: usize) -> Result<Arc<Self>> {
        Self::new_with_sync_mode(dir, buffer_size, WalSyncMode::default())
    }

    /// Creates a new disk WAL with an explicit sync mode.
    pub fn new_with_sync_mode(
        dir: impl AsRef<Path>,
        buffer_size: usize,
        sync_mode: WalSyncMode,
    ) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(TsdbeError::io_at(&dir))?;

        // Never reuse the index of a leftover segment.
        let next = list_segments(&dir)?
            .last()
            .map(|(index, _)| index + 1)
            .unwrap_or(1);

        Ok(Arc::new(Self {
            dir,
            segments: Mutex::new(HashMap::new()),
            buffer_size,
            next_segment: AtomicU64::new(next),
            sync_mode,
            last_sync: Mutex::new(Instant::now()),
        }))
    }

    /// Returns the directory holding the segment files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn create_writer(&self, segment: SegmentId) -> Result<BufWriter<File>> {
        let path = self.dir.join(segment_file_name(segment));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(TsdbeError::io_at(&path))?;
        debug!(segment, path = %path.display(), "Created WAL segment");
        Ok(BufWriter::with_capacity(self.buffer_size.max(1), file))
    }

    fn maybe_sync(&self, writer: &mut BufWriter<File>) -> Result<()> {
        writer.flush()?;

        let interval = match self.sync_mode {
            WalSyncMode::PerAppend => Duration::ZERO,
            WalSyncMode::Periodic(interval) => interval,
        };
        let mut last_sync = self.last_sync.lock();
        if interval.is_zero() || last_sync.elapsed() >= interval {
            writer.get_ref().sync_data()?;
            *last_sync = Instant::now();
        }
        Ok(())
    }
}

impl Wal for DiskWal {
    fn open_segment(&self) -> Result<SegmentId> {
        // The file is created lazily so that partitions that never see a row
        // leave nothing behind.
        Ok(self.next_segment.fetch_add(1, Ordering::SeqCst))
    }

    fn append_rows(&self, segment: SegmentId, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut segments = self.segments.lock();
        let writer = match segments.entry(segment) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(self.create_writer(segment)?)
            }
        };

        for row in rows {
            let record = bincode::serialize(row)?;
            writer.write_all(&(record.len() as u32).to_le_bytes())?;
            writer.write_all(&record)?;
        }

        self.maybe_sync(writer)
    }

    fn flush(&self) -> Result<()> {
        for writer in self.segments.lock().values_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        *self.last_sync.lock() = Instant::now();
        Ok(())
    }

    fn remove_segment(&self, segment: SegmentId) -> Result<()> {
        // Dropping the writer closes the file before it is unlinked.
        drop(self.segments.lock().remove(&segment));

        let path = self.dir.join(segment_file_name(segment));
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(segment, "Removed WAL segment");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TsdbeError::IoWithPath { path, source: e }),
        }
    }
}

/// Rows recovered from leftover WAL segments.
#[derive(Debug, Default)]
pub struct RecoveredWal {
    /// Recovered rows, in append order across segments.
    pub rows: Vec<Row>,
    /// Segments that were read; they may be removed once the rows are re-logged.
    pub segments: Vec<SegmentId>,
}

/// WAL reader for recovery.
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    /// Creates a new WAL reader.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Reads all WAL segments.
    ///
    /// A truncated trailing record (a crash mid-append) ends its segment
    /// quietly; a segment with too many undecodable records is reported as an
    /// error.
    pub fn read_all(&self) -> Result<RecoveredWal> {
        let mut recovered = RecoveredWal::default();
        if !self.dir.exists() {
            return Ok(recovered);
        }

        for (segment, path) in list_segments(&self.dir)? {
            let rows = self.read_segment(&path)?;
            debug!(segment, rows = rows.len(), "Read WAL segment");
            recovered.rows.extend(rows);
            recovered.segments.push(segment);
        }

        Ok(recovered)
    }

    fn read_segment(&self, path: &Path) -> Result<Vec<Row>> {
        let file = File::open(path).map_err(TsdbeError::io_at(path))?;
        let mut reader = BufReader::new(file);
        let mut rows = Vec::new();
        let mut corrupted = 0usize;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(TsdbeError::io_at(path)(e)),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_WAL_RECORD_BYTES {
                // The framing itself is broken; nothing after this is trustworthy.
                warn!(path = %path.display(), len, "Invalid WAL record length, dropping rest of segment");
                break;
            }

            let mut record = vec![0u8; len];
            if reader.read_exact(&mut record).is_err() {
                warn!(path = %path.display(), "Incomplete trailing WAL record");
                break;
            }

            match bincode::deserialize::<Row>(&record) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping undecodable WAL record");
                    corrupted += 1;
                    if corrupted > MAX_CORRUPTED_RECORDS {
                        return Err(TsdbeError::Wal {
                            operation: "segment_read".to_string(),
                            details: format!("Too many corrupted records in {:?}", path),
                        });
                    }
                }
            }
        }

        Ok(rows)
    }
}
