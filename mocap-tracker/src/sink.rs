//! Per-trial frame file writer.
//!
//! Appends every sample of the tracked marker set to a CSV file with header
//! `frame_number,pos_x,pos_y,pos_z`. The file is created with its header on
//! the first write and only appended to afterwards.

use log::{debug, info, warn};
use mocap_core::protocol::natnet::MarkerBatch;
use mocap_core::{ListenerError, MarkerListener};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

/// Frame file location shared by the sink and the reader
pub type DataPath = Arc<RwLock<Option<PathBuf>>>;

pub const FRAME_FILE_HEADER: [&str; 4] = ["frame_number", "pos_x", "pos_y", "pos_z"];

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("No frame file has been configured")]
    MissingDataSource,
    #[error("Cannot write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    /// An earlier write failed, samples have been lost
    #[error("Frame recording failed earlier: {0}")]
    WriteFailed(String),
}

/// One row as written to disk
#[derive(Serialize)]
struct PersistedRow {
    frame_number: i64,
    pos_x: f32,
    pos_y: f32,
    pos_z: f32,
}

/// Appends marker batches to the current frame file
#[derive(Debug)]
pub struct FrameSink {
    path: DataPath,
    label: Option<String>,
    /// Serializes writers and holds the first unreported failure
    failure: Mutex<Option<String>>,
}

impl FrameSink {
    /// `label` selects the marker set to persist, `None` keeps all sets
    pub fn new(path: DataPath, label: Option<String>) -> Self {
        FrameSink {
            path,
            label,
            failure: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Switch to another trial file and forget earlier failures
    pub fn set_path(&self, path: Option<PathBuf>) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        match &path {
            Some(p) => info!("Recording frames to {}", p.display()),
            None => info!("Frame recording disabled"),
        }
        *self.path.write().unwrap_or_else(PoisonError::into_inner) = path;
        *failure = None;
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// The first write failure since the path was last set
    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Append one row per sample, returns the number of rows written
    pub fn append(&self, batch: &MarkerBatch) -> Result<usize, SinkError> {
        if let Some(label) = &self.label {
            if &batch.set_label != label {
                return Ok(0);
            }
        }

        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.write_batch(batch);
        if let Err(e) = &result {
            if failure.is_none() {
                *failure = Some(e.to_string());
            }
        }
        result
    }

    fn write_batch(&self, batch: &MarkerBatch) -> Result<usize, SinkError> {
        let path = self.path().ok_or(SinkError::MissingDataSource)?;

        let io_error = |source| SinkError::Io {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error)?;
        let is_new = file.metadata().map_err(io_error)?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer.write_record(FRAME_FILE_HEADER)?;
            debug!("Created frame file {}", path.display());
        }
        for sample in &batch.samples {
            writer.serialize(PersistedRow {
                frame_number: sample.frame_number,
                pos_x: sample.x,
                pos_y: sample.y,
                pos_z: sample.z,
            })?;
        }
        writer.flush().map_err(io_error)?;

        Ok(batch.samples.len())
    }

    /// Delete the current frame file, if any
    pub fn discard(&self) -> Result<(), SinkError> {
        let _guard = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.path().ok_or(SinkError::MissingDataSource)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Discarded {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SinkError::Io { path, source }),
        }
    }
}

impl MarkerListener for FrameSink {
    fn on_marker_set(&self, batch: MarkerBatch) -> Result<(), ListenerError> {
        match self.append(&batch) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Frame {} not recorded: {}", batch.frame_number, e);
                Err(ListenerError::new(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mocap_core::RawMarkerSample;
    use std::path::Path;
    use tempfile::TempDir;

    fn create_test_sink(dir: &Path, label: Option<&str>) -> FrameSink {
        let path = Arc::new(RwLock::new(Some(dir.join("trial_1.csv"))));
        FrameSink::new(path, label.map(str::to_string))
    }

    fn batch(frame_number: i64, label: &str, markers: usize) -> MarkerBatch {
        MarkerBatch {
            frame_number,
            set_label: label.to_string(),
            samples: (0..markers)
                .map(|i| RawMarkerSample {
                    frame_number,
                    x: i as f32 * 0.5,
                    y: 0.25,
                    z: -1.5,
                })
                .collect(),
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let sink = create_test_sink(dir.path(), Some("hand"));

        assert_eq!(sink.append(&batch(1, "hand", 2)).unwrap(), 2);
        assert_eq!(sink.append(&batch(2, "hand", 2)).unwrap(), 2);

        let text = fs::read_to_string(dir.path().join("trial_1.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "frame_number,pos_x,pos_y,pos_z",
                "1,0.0,0.25,-1.5",
                "1,0.5,0.25,-1.5",
                "2,0.0,0.25,-1.5",
                "2,0.5,0.25,-1.5",
            ]
        );
    }

    #[test]
    fn test_label_filter() {
        let dir = TempDir::new().unwrap();
        let sink = create_test_sink(dir.path(), Some("hand"));
        assert_eq!(sink.append(&batch(1, "head", 3)).unwrap(), 0);
        assert!(!dir.path().join("trial_1.csv").exists());

        let all = create_test_sink(dir.path(), None);
        assert_eq!(all.append(&batch(1, "head", 3)).unwrap(), 3);
    }

    #[test]
    fn test_missing_path() {
        let sink = FrameSink::new(Arc::new(RwLock::new(None)), None);
        assert!(matches!(
            sink.append(&batch(1, "hand", 1)),
            Err(SinkError::MissingDataSource)
        ));
        assert!(sink.failure().is_some());
    }

    #[test]
    fn test_failure_recorded_and_cleared() {
        let dir = TempDir::new().unwrap();
        let sink = create_test_sink(&dir.path().join("missing"), None);

        let err = sink.on_marker_set(batch(1, "hand", 1)).unwrap_err();
        assert!(err.0.contains("Cannot write"));
        assert!(sink.failure().is_some());

        sink.set_path(Some(dir.path().join("trial_2.csv")));
        assert!(sink.failure().is_none());
        sink.on_marker_set(batch(2, "hand", 1)).unwrap();
        assert!(dir.path().join("trial_2.csv").exists());
    }

    #[test]
    fn test_discard() {
        let dir = TempDir::new().unwrap();
        let sink = create_test_sink(dir.path(), None);
        sink.append(&batch(1, "hand", 1)).unwrap();
        sink.discard().unwrap();
        assert!(!dir.path().join("trial_1.csv").exists());

        // Nothing left to delete is fine
        sink.discard().unwrap();

        // Next write starts a fresh file with a header
        sink.append(&batch(5, "hand", 1)).unwrap();
        let text = fs::read_to_string(dir.path().join("trial_1.csv")).unwrap();
        assert!(text.starts_with("frame_number,"));
    }
}
