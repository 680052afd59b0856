//! Tracker facade: one object that records a trial and answers kinematic
//! queries about it.

use log::info;
use mocap_core::{
    Axis, CentroidFrame, FrameRow, KinematicsEngine, KinematicsError, SessionState,
};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::client::{ClientError, StreamClient};
use crate::config::{ConfigError, TrackerConfig};
use crate::sink::{DataPath, FrameSink, SinkError};
use crate::source::CsvFrameFile;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Kinematics(#[from] KinematicsError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Stream client, frame sink and kinematics engine wired to one frame file.
///
/// Queries read the frame file, so they work on recorded trials as well
/// as while listening. While a write failure is pending every query fails
/// with [`TrackerError::Sink`] until a new data file is set.
pub struct Tracker {
    client: StreamClient,
    sink: Arc<FrameSink>,
    engine: KinematicsEngine<CsvFrameFile>,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Result<Self, TrackerError> {
        config.validate()?;

        let data_path: DataPath = Arc::new(RwLock::new(config.data_file.clone()));
        let sink = Arc::new(FrameSink::new(
            data_path.clone(),
            config.marker_set_label.clone(),
        ));
        let mut client = StreamClient::new(config.client.clone());
        client.set_marker_listener(sink.clone())?;
        let engine = KinematicsEngine::new(CsvFrameFile::new(data_path), config.engine)?;

        Ok(Tracker {
            client,
            sink,
            engine,
        })
    }

    /// Connect to the server and start recording into the data file
    pub fn start_listening(&mut self) -> Result<(), TrackerError> {
        let path = self.sink.path().ok_or(SinkError::MissingDataSource)?;
        self.client.start()?;
        info!("Listening, frames go to {}", path.display());
        Ok(())
    }

    /// Stop both receive loops. Returns within a bounded time.
    pub fn stop_listening(&mut self) {
        self.client.stop();
    }

    pub fn is_listening(&self) -> bool {
        self.client.state() == SessionState::Streaming
    }

    fn check_sink(&self) -> Result<(), TrackerError> {
        match self.sink.failure() {
            Some(failure) => Err(SinkError::WriteFailed(failure).into()),
            None => Ok(()),
        }
    }

    /// Centroid of the most recent frame
    pub fn position(&self) -> Result<CentroidFrame, TrackerError> {
        self.check_sink()?;
        Ok(self.engine.position()?)
    }

    /// Mean velocity over the last `num_frames` frames (0 = window size)
    pub fn velocity(&self, num_frames: i64, axis: Option<Axis>) -> Result<f64, TrackerError> {
        self.check_sink()?;
        Ok(self.engine.velocity(num_frames, axis)?)
    }

    /// Distance travelled over the last `num_frames` frames (0 = window size)
    pub fn distance(&self, num_frames: i64, axis: Option<Axis>) -> Result<f64, TrackerError> {
        self.check_sink()?;
        Ok(self.engine.distance(num_frames, axis)?)
    }

    /// Rescaled rows of the last `num_frames` frames
    pub fn query_frames(&self, num_frames: i64) -> Result<Vec<FrameRow>, TrackerError> {
        self.check_sink()?;
        Ok(self.engine.query_frames(num_frames)?)
    }

    pub fn data_dir(&self) -> Option<PathBuf> {
        self.sink.path()
    }

    /// Point recording and queries at another trial file
    pub fn set_data_dir(&self, path: impl Into<PathBuf>) {
        self.sink.set_path(Some(path.into()));
    }

    /// Delete the current trial file
    pub fn discard_data(&self) -> Result<(), TrackerError> {
        Ok(self.sink.discard()?)
    }

    pub fn client(&self) -> &StreamClient {
        &self.client
    }

    pub fn sink(&self) -> &FrameSink {
        &self.sink
    }

    pub fn marker_count(&self) -> usize {
        self.engine.marker_count()
    }

    pub fn sample_rate(&self) -> f64 {
        self.engine.sample_rate()
    }

    pub fn window_size(&self) -> usize {
        self.engine.window_size()
    }

    pub fn rescale_by(&self) -> f64 {
        self.engine.rescale_by()
    }

    pub fn primary_axis(&self) -> Axis {
        self.engine.primary_axis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mocap_core::{EngineConfig, InputMode};
    use std::fmt::Write as _;
    use std::fs;
    use tempfile::TempDir;

    fn tracker_with_file(dir: &TempDir) -> Tracker {
        let config = TrackerConfig {
            engine: EngineConfig {
                marker_count: 2,
                input_mode: InputMode::Passthrough,
                ..EngineConfig::default()
            },
            data_file: Some(dir.path().join("trial.csv")),
            ..TrackerConfig::default()
        };
        Tracker::new(config).unwrap()
    }

    /// Two markers moving 1 unit per frame along z, centroid x fixed at 1
    fn write_ramp(path: &std::path::Path, frames: i64) {
        let mut text = String::from("frame_number,pos_x,pos_y,pos_z\n");
        for f in 1..=frames {
            writeln!(text, "{f},0,0,{f}").unwrap();
            writeln!(text, "{f},2,0,{f}").unwrap();
        }
        fs::write(path, text).unwrap();
    }

    #[test]
    fn test_queries_on_recorded_file() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker_with_file(&dir);
        write_ramp(&dir.path().join("trial.csv"), 10);

        let p = tracker.position().unwrap();
        assert_eq!(p.frame_number, 10);
        assert_eq!((p.pos_x, p.pos_y, p.pos_z), (1.0, 0.0, 10.0));

        // 5 frames, 4 displacements of 1 unit each
        assert!((tracker.distance(0, None).unwrap() - 4.0).abs() < 1e-9);
        assert!((tracker.velocity(0, Some(Axis::Z)).unwrap() - 120.0).abs() < 1e-9);
        assert_eq!(tracker.query_frames(3).unwrap().len(), 6);
    }

    #[test]
    fn test_start_requires_data_file() {
        let mut tracker = Tracker::new(TrackerConfig::default()).unwrap();
        assert!(matches!(
            tracker.start_listening(),
            Err(TrackerError::Sink(SinkError::MissingDataSource))
        ));
        assert!(!tracker.is_listening());
        assert!(matches!(
            tracker.position(),
            Err(TrackerError::Kinematics(KinematicsError::MissingDataSource))
        ));
    }

    #[test]
    fn test_sink_failure_blocks_queries_until_rotation() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker_with_file(&dir);
        tracker.set_data_dir(dir.path().join("no_such_dir").join("trial.csv"));

        let batch = mocap_core::MarkerBatch {
            frame_number: 1,
            set_label: "hand".to_string(),
            samples: vec![],
        };
        assert!(tracker.sink().append(&batch).is_err());
        assert!(matches!(
            tracker.position(),
            Err(TrackerError::Sink(SinkError::WriteFailed(_)))
        ));

        let next = dir.path().join("trial_2.csv");
        write_ramp(&next, 3);
        tracker.set_data_dir(&next);
        assert_eq!(tracker.data_dir(), Some(next));
        assert_eq!(tracker.position().unwrap().frame_number, 3);
    }

    #[test]
    fn test_discard_data() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker_with_file(&dir);
        write_ramp(&dir.path().join("trial.csv"), 2);
        tracker.discard_data().unwrap();
        assert!(matches!(
            tracker.position(),
            Err(TrackerError::Kinematics(KinematicsError::DataNotFound(_)))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = TrackerConfig::default();
        config.engine.window_size = 0;
        assert!(Tracker::new(config).is_err());
    }
}
