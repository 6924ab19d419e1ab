//! Persistence for periodic metrics records.

use std::{
    fs,
    io::{self, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::Builder;
use thiserror::Error;
use tracing::debug;

use crate::pipeline::monitor::StatsSnapshot;

/// Upper bound on `_N` suffixes tried when a file name is already taken.
const MAX_NAME_SUFFIX: u32 = 1000;

/// One timestamped snapshot as persisted by a [`MetricsSink`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRecord {
    pub timestamp: DateTime<Utc>,
    pub metrics: StatsSnapshot,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode metrics record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no free file name for {0}")]
    Exhausted(PathBuf),
}

/// Append-only destination for metrics records.
pub trait MetricsSink: Send + Sync {
    fn write(&self, record: &MetricsRecord) -> Result<(), SinkError>;
}

impl<F> MetricsSink for F
where
    F: Fn(&MetricsRecord) -> Result<(), SinkError> + Send + Sync,
{
    fn write(&self, record: &MetricsRecord) -> Result<(), SinkError> {
        self(record)
    }
}

/// Writes every record to its own pretty-printed JSON file named after the
/// record timestamp, e.g. `metrics_20240131_120000_250.json`.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    /// Create the sink, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| SinkError::Io {
            action: "failed to create results directory",
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MetricsSink for JsonFileSink {
    fn write(&self, record: &MetricsRecord) -> Result<(), SinkError> {
        let stem = format!("metrics_{}", record.timestamp.format("%Y%m%d_%H%M%S_%3f"));
        let path = write_json_unique(&self.dir, &stem, record)?;
        debug!(path = %path.display(), "metrics record saved");
        Ok(())
    }
}

/// Write `value` as pretty JSON to `dir/<stem>.json`, or `<stem>_N.json` when
/// that name is taken. The file is staged under a hidden temporary name and
/// only appears once complete; on failure nothing is left behind.
pub(crate) fn write_json_unique<T>(dir: &Path, stem: &str, value: &T) -> Result<PathBuf, SinkError>
where
    T: Serialize + ?Sized,
{
    let mut staged = Builder::new()
        .prefix(&format!(".{stem}"))
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|source| SinkError::Io {
            action: "failed to stage",
            path: dir.join(stem),
            source,
        })?;

    {
        let mut writer = BufWriter::new(staged.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer
            .write_all(b"\n")
            .and_then(|()| writer.flush())
            .map_err(|source| SinkError::Io {
                action: "failed to write",
                path: dir.join(stem),
                source,
            })?;
    }

    for attempt in 0..=MAX_NAME_SUFFIX {
        let name = if attempt == 0 {
            format!("{stem}.json")
        } else {
            format!("{stem}_{attempt}.json")
        };
        let path = dir.join(name);
        match staged.persist_noclobber(&path) {
            Ok(_) => return Ok(path),
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => staged = err.file,
            Err(err) => {
                return Err(SinkError::Io {
                    action: "failed to persist",
                    path,
                    source: err.error,
                });
            }
        }
    }
    Err(SinkError::Exhausted(dir.join(stem)))
}

/// Keeps records in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<MetricsRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricsRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricsSink for MemorySink {
    fn write(&self, record: &MetricsRecord) -> Result<(), SinkError> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn record(millis: u32) -> MetricsRecord {
        let timestamp = Utc
            .with_ymd_and_hms(2024, 1, 31, 12, 0, 0)
            .unwrap()
            + chrono::TimeDelta::milliseconds(i64::from(millis));
        MetricsRecord {
            timestamp,
            metrics: StatsSnapshot {
                fps: 29.5,
                processing_time: 0.012,
                processing_time_std: 0.001,
                accelerator: None,
                system: None,
            },
        }
    }

    #[test]
    fn json_sink_writes_timestamped_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path().join("results")).unwrap();
        sink.write(&record(250)).unwrap();

        let path = sink.dir().join("metrics_20240131_120000_250.json");
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["timestamp"], "2024-01-31T12:00:00.250Z");
        assert_eq!(json["metrics"]["fps"], 29.5);
        assert!(json["metrics"].get("gpu_load").is_none());
    }

    #[test]
    fn json_sink_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path()).unwrap();
        sink.write(&record(0)).unwrap();
        sink.write(&record(0)).unwrap();
        sink.write(&record(0)).unwrap();

        assert_eq!(
            entries(dir.path()),
            vec![
                "metrics_20240131_120000_000.json",
                "metrics_20240131_120000_000_1.json",
                "metrics_20240131_120000_000_2.json",
            ]
        );
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn failed_encoding_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        // Non-string map keys fail mid-write, after the opening brace.
        let value = std::collections::BTreeMap::from([((1u8, 2u8), 3u8)]);
        let err = write_json_unique(dir.path(), "metrics_broken", &value).unwrap_err();
        assert!(matches!(err, SinkError::Serialize(_)));
        assert!(entries(dir.path()).is_empty());
    }

    #[test]
    fn missing_directory_is_reported_without_partial_output() {
        let root = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(root.path().join("results")).unwrap();
        fs::remove_dir(sink.dir()).unwrap();

        let err = sink.write(&record(0)).unwrap_err();
        assert!(matches!(err, SinkError::Io { .. }));
        assert!(entries(root.path()).is_empty());
    }

    #[test]
    fn memory_sink_clones_share_records() {
        let sink = MemorySink::new();
        let handle = sink.clone();
        sink.write(&record(1)).unwrap();
        sink.write(&record(2)).unwrap();
        assert_eq!(handle.len(), 2);
        assert_eq!(handle.records()[1], record(2));
    }
}
