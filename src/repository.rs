use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::diff::KeyScheme;
use crate::error::StoreError;
use crate::models::{CourseKey, GradeRecord, GradeSnapshot};
use crate::session_store::parent_dir;

/// Durable home of the baseline snapshot. Only the monitor commits, and only after
/// the cycle that produced the snapshot finished notifying.
pub trait SnapshotRepository: Send {
    /// The most recently committed snapshot, or an empty one on first run.
    fn latest(&self) -> Result<GradeSnapshot, StoreError>;

    fn commit(&mut self, snapshot: &GradeSnapshot) -> Result<(), StoreError>;
}

/// Accepts the current `{"grades": [...]}` layout, the older bare array, and
/// records whose keys are raw table headers.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredSnapshot {
    Current {
        grades: Vec<Value>,
        #[serde(default)]
        summary: Vec<String>,
        #[serde(default)]
        captured_at: Option<chrono::DateTime<chrono::Utc>>,
    },
    Bare(Vec<Value>),
}

fn record_from_value(value: Value) -> Option<GradeRecord> {
    if let Ok(record) = serde_json::from_value::<GradeRecord>(value.clone()) {
        return (!record.course.is_empty()).then_some(record);
    }
    let Value::Object(map) = value else {
        return None;
    };
    let (headers, cells): (Vec<String>, Vec<String>) = map
        .into_iter()
        .map(|(k, v)| {
            let cell = match v {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (k, cell)
        })
        .unzip();
    GradeRecord::from_row(&headers, &cells)
}

fn decode(path: &Path, text: &str) -> Result<GradeSnapshot, StoreError> {
    let stored: StoredSnapshot =
        serde_json::from_str(text).map_err(|e| StoreError::malformed(path, e))?;
    let (values, summary, captured_at) = match stored {
        StoredSnapshot::Current {
            grades,
            summary,
            captured_at,
        } => (grades, summary, captured_at),
        StoredSnapshot::Bare(grades) => (grades, Vec::new(), None),
    };

    let total = values.len();
    let records: Vec<GradeRecord> = values.into_iter().filter_map(record_from_value).collect();
    if records.len() != total {
        warn!(
            "Dropped {} stored record(s) without a course name from {}",
            total - records.len(),
            path.display()
        );
    }
    Ok(GradeSnapshot::restore(records, summary, captured_at))
}

/// Policy (a): a single JSON file holding the latest snapshot.
#[derive(Debug, Clone)]
pub struct LatestFileRepository {
    path: PathBuf,
}

impl LatestFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotRepository for LatestFileRepository {
    fn latest(&self) -> Result<GradeSnapshot, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No stored grades at {}, starting empty", self.path.display());
                return Ok(GradeSnapshot::empty());
            }
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        if text.trim().is_empty() {
            return Ok(GradeSnapshot::empty());
        }
        decode(&self.path, &text)
    }

    fn commit(&mut self, snapshot: &GradeSnapshot) -> Result<(), StoreError> {
        let dir = parent_dir(&self.path);
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let json =
            serde_json::to_vec_pretty(snapshot).map_err(|e| StoreError::malformed(&self.path, e))?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
        tmp.write_all(&json)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(&self.path).map_err(|e| StoreError::Persist {
            path: self.path.clone(),
            source: e,
        })?;

        info!("Committed {} grade(s) to {}", snapshot.len(), self.path.display());
        Ok(())
    }
}

/// Policy (b): every committed snapshot appended to a JSON Lines log. The latest
/// view takes, per course, the record from the newest snapshot mentioning it.
#[derive(Debug, Clone)]
pub struct HistoryLogRepository {
    path: PathBuf,
}

impl HistoryLogRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Every committed snapshot, oldest first. A torn final line is skipped.
    pub fn history(&self) -> Result<Vec<GradeSnapshot>, StoreError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<Result<_, _>>()
            .map_err(|e| StoreError::io(&self.path, e))?;
        let last = lines.iter().rposition(|l| !l.trim().is_empty());

        let mut snapshots = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match decode(&self.path, line) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) if Some(index) == last => {
                    warn!("Skipping incomplete last entry of {}: {}", self.path.display(), e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(snapshots)
    }
}

impl SnapshotRepository for HistoryLogRepository {
    fn latest(&self) -> Result<GradeSnapshot, StoreError> {
        let history = self.history()?;
        let Some(newest) = history.last() else {
            return Ok(GradeSnapshot::empty());
        };

        // Merge with the identity the detector will pick, so retaken courses stay apart
        // while older schema eras still fall back to names. The newest wins per key.
        let scheme = KeyScheme::for_records(history.iter().flat_map(|s| s.records().iter()));
        let mut order: Vec<CourseKey> = Vec::new();
        let mut latest: HashMap<CourseKey, GradeRecord> = HashMap::new();
        for snapshot in &history {
            for record in snapshot.records() {
                let key = scheme.key(record);
                if latest.insert(key.clone(), record.clone()).is_none() {
                    order.push(key);
                }
            }
        }

        let records = order
            .into_iter()
            .filter_map(|key| latest.remove(&key))
            .collect();
        Ok(GradeSnapshot::restore(
            records,
            newest.summary().to_vec(),
            newest.captured_at(),
        ))
    }

    fn commit(&mut self, snapshot: &GradeSnapshot) -> Result<(), StoreError> {
        let dir = parent_dir(&self.path);
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let mut line =
            serde_json::to_vec(snapshot).map_err(|e| StoreError::malformed(&self.path, e))?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.write_all(&line)
            .and_then(|()| file.sync_all())
            .map_err(|e| StoreError::io(&self.path, e))?;

        info!("Appended snapshot of {} grade(s) to {}", snapshot.len(), self.path.display());
        Ok(())
    }
}
