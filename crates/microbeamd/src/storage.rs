//! Persistent run state on disk.
//!
//! ```text
//! <run_dir>/
//! ├── run.id                 last allocated run number (-1 before the first run)
//! ├── cal.json               LSB per micrometer calibration
//! └── run_007/
//!     ├── run_log.txt        text log of the run
//!     ├── hit_log.csv        one row per hit batch
//!     ├── latch_data.json    latch-up waveforms (when latch monitoring is on)
//!     └── SWAPPED_XY_IN_EVERY_2ND_SCAN_REPETITION
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use microbeam_core::{DacPoint, HitBatch, RunId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const RUN_ID_FILE: &str = "run.id";
pub const RUN_LOG_FILE: &str = "run_log.txt";
pub const HIT_LOG_FILE: &str = "hit_log.csv";
pub const LATCH_DATA_FILE: &str = "latch_data.json";
pub const AXIS_SWAP_MARKER: &str = "SWAPPED_XY_IN_EVERY_2ND_SCAN_REPETITION";

/// Column names of the hit log.
pub const HIT_LOG_HEADER: [&str; 6] = [
    "hw_ts_1us",
    "sys_ts_sec",
    "x_lsb",
    "y_lsb",
    "hits",
    "latch_up",
];

/// Errors reading or writing run files.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Run id file {path} holds {content:?}, expected an integer >= -1")]
    InvalidRunId { path: PathBuf, content: String },

    #[error("Hit log error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Waveform table error: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ============================================================================
// Run Id Counter
// ============================================================================

/// The persisted run counter.
#[derive(Debug)]
pub struct RunIdStore {
    path: PathBuf,
    last: Option<RunId>,
}

impl RunIdStore {
    /// Opens `run.id` in `run_dir`, creating it with `-1` if missing.
    pub fn open(run_dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(run_dir).map_err(io_error(run_dir))?;
        let path = run_dir.join(RUN_ID_FILE);
        if !path.exists() {
            fs::write(&path, "-1").map_err(io_error(&path))?;
            info!(path = %path.display(), "Initialized run id file");
        }

        let content = fs::read_to_string(&path).map_err(io_error(&path))?;
        let last = match content.trim().parse::<i64>() {
            Ok(-1) => None,
            Ok(n) => match u32::try_from(n) {
                Ok(id) => Some(RunId::new(id)),
                Err(_) => {
                    return Err(StorageError::InvalidRunId {
                        path,
                        content: content.trim().to_string(),
                    })
                }
            },
            Err(_) => {
                return Err(StorageError::InvalidRunId {
                    path,
                    content: content.trim().to_string(),
                })
            }
        };

        Ok(Self { path, last })
    }

    /// Most recently allocated id.
    pub fn last(&self) -> Option<RunId> {
        self.last
    }

    /// Allocates the next id. The file is written before the id is returned.
    pub fn allocate(&mut self) -> Result<RunId, StorageError> {
        let next = self.last.map_or(RunId::new(0), |id| id.next());
        fs::write(&self.path, next.to_string()).map_err(io_error(&self.path))?;
        self.last = Some(next);
        Ok(next)
    }
}

// ============================================================================
// Per-Run Files
// ============================================================================

/// Files owned by one run.
pub struct RunFiles {
    dir: PathBuf,
    hit_log: csv::Writer<File>,
}

impl RunFiles {
    /// Creates `run_NNN` and its hit log. Fails if the directory exists.
    pub fn create(run_dir: &Path, run_id: RunId) -> Result<Self, StorageError> {
        let dir = run_dir.join(run_id.dir_name());
        fs::create_dir(&dir).map_err(io_error(&dir))?;

        let hit_log_path = dir.join(HIT_LOG_FILE);
        let mut hit_log = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&hit_log_path)?;
        hit_log.write_record(HIT_LOG_HEADER)?;
        hit_log.flush().map_err(io_error(&hit_log_path))?;

        debug!(dir = %dir.display(), "Created run directory");
        Ok(Self { dir, hit_log })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(RUN_LOG_FILE)
    }

    /// Appends one batch. The last column carries the latch-up number on
    /// the first batch after a latch-up and `-` otherwise.
    pub fn log_hit(&mut self, batch: &HitBatch) -> Result<(), StorageError> {
        let latch = batch
            .latch_up
            .map_or_else(|| "-".to_string(), |n| n.to_string());
        self.hit_log.write_record([
            batch.hw_timestamp_us.to_string(),
            format!("{:.7}", batch.wall_seconds()),
            batch.position.x.to_string(),
            batch.position.y.to_string(),
            batch.count.to_string(),
            latch,
        ])?;
        self.hit_log
            .flush()
            .map_err(io_error(&self.dir.join(HIT_LOG_FILE)))
    }

    /// Touches the marker noting that later repetitions ran column-major.
    pub fn mark_axis_swap(&self) -> Result<(), StorageError> {
        let path = self.dir.join(AXIS_SWAP_MARKER);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error(&path))?;
        Ok(())
    }

    pub fn write_waveforms(&self, table: &WaveformTable) -> Result<(), StorageError> {
        let path = self.dir.join(LATCH_DATA_FILE);
        let file = File::create(&path).map_err(io_error(&path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, table)?;
        writer.flush().map_err(io_error(&path))
    }

    /// Flushes and closes the hit log.
    pub fn finish(mut self) -> Result<(), StorageError> {
        let path = self.dir.join(HIT_LOG_FILE);
        self.hit_log.flush().map_err(io_error(&path))
    }
}

// ============================================================================
// Waveform Table
// ============================================================================

/// One captured latch-up waveform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformRecord {
    /// `<hit_count>_<x>_<y>` at the time of the latch-up
    pub key: String,
    pub samples: Vec<f64>,
}

/// Latch-up waveforms of a run, in capture order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaveformTable {
    records: Vec<WaveformRecord>,
}

impl WaveformTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(hit_count: u64, point: DacPoint) -> String {
        format!("{}_{}_{}", hit_count, point.x, point.y)
    }

    pub fn insert(&mut self, key: String, samples: Vec<f64>) {
        self.records.push(WaveformRecord { key, samples });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[WaveformRecord] {
        &self.records
    }

    /// Reads a table written by [`RunFiles::write_waveforms`].
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let contents = fs::read_to_string(path).map_err(io_error(path))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_run_id_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunIdStore::open(dir.path()).unwrap();
        assert_eq!(store.last(), None);
        assert_eq!(
            fs::read_to_string(dir.path().join(RUN_ID_FILE)).unwrap(),
            "-1"
        );

        assert_eq!(store.allocate().unwrap(), RunId::new(0));
        assert_eq!(store.allocate().unwrap(), RunId::new(1));
        assert_eq!(
            fs::read_to_string(dir.path().join(RUN_ID_FILE)).unwrap(),
            "1"
        );
    }

    #[test]
    fn test_run_id_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(RUN_ID_FILE), "41\n").unwrap();

        let mut store = RunIdStore::open(dir.path()).unwrap();
        assert_eq!(store.last(), Some(RunId::new(41)));
        assert_eq!(store.allocate().unwrap(), RunId::new(42));

        let reopened = RunIdStore::open(dir.path()).unwrap();
        assert_eq!(reopened.last(), Some(RunId::new(42)));
    }

    #[test]
    fn test_run_id_garbage_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(RUN_ID_FILE), "seven").unwrap();
        assert!(matches!(
            RunIdStore::open(dir.path()),
            Err(StorageError::InvalidRunId { .. })
        ));

        fs::write(dir.path().join(RUN_ID_FILE), "-5").unwrap();
        assert!(RunIdStore::open(dir.path()).is_err());
    }

    #[test]
    fn test_hit_log_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = RunFiles::create(dir.path(), RunId::new(3)).unwrap();
        assert!(files.dir().ends_with("run_003"));

        let mut batch = HitBatch {
            hw_timestamp_us: 4_000_123,
            wall_timestamp: Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap(),
            position: DacPoint::new(-100, 20),
            count: 2,
            latch_up: None,
        };
        files.log_hit(&batch).unwrap();
        batch.latch_up = Some(1);
        files.log_hit(&batch).unwrap();
        files.finish().unwrap();

        let log = fs::read_to_string(dir.path().join("run_003").join(HIT_LOG_FILE)).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines[0], "hw_ts_1us,sys_ts_sec,x_lsb,y_lsb,hits,latch_up");
        assert_eq!(lines[1], "4000123,1700000000.2500000,-100,20,2,-");
        assert_eq!(lines[2], "4000123,1700000000.2500000,-100,20,2,1");
    }

    #[test]
    fn test_existing_run_dir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("run_000")).unwrap();
        assert!(matches!(
            RunFiles::create(dir.path(), RunId::new(0)),
            Err(StorageError::Io { .. })
        ));
    }

    #[test]
    fn test_waveform_table_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = RunFiles::create(dir.path(), RunId::new(0)).unwrap();

        let mut table = WaveformTable::new();
        table.insert(WaveformTable::key(12, DacPoint::new(5, -6)), vec![0.5, -1.25]);
        table.insert(WaveformTable::key(12, DacPoint::new(5, -6)), vec![2.0]);
        files.write_waveforms(&table).unwrap();
        files.mark_axis_swap().unwrap();

        let loaded = WaveformTable::load(&files.dir().join(LATCH_DATA_FILE)).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.records()[0].key, "12_5_-6");
        assert_eq!(loaded.records()[0].samples, vec![0.5, -1.25]);
        assert!(files.dir().join(AXIS_SWAP_MARKER).exists());
    }
}
