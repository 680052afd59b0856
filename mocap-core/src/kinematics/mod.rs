//! Marker kinematics
//!
//! Turns persisted marker rows into centroid position, velocity and
//! displacement over a sliding window of recent frames.
//!
//! Every query re-reads the [`FrameSource`]: nothing is cached between
//! calls, so a query always reflects the rows written up to that moment.
//!
//! A frame is the run of consecutive rows sharing a frame number. Each frame
//! must hold exactly `marker_count` rows and frame numbers must strictly
//! increase; anything else is reported as [`KinematicsError::Integrity`].
//!
//! # Example
//!
//! ```rust
//! use mocap_core::kinematics::{Axis, EngineConfig, FrameRow, KinematicsEngine};
//!
//! let rows: Vec<FrameRow> = (1..=4)
//!     .map(|f| FrameRow::new(f, 0.0, 0.0, f as f64 / 1000.0))
//!     .collect();
//! let config = EngineConfig {
//!     marker_count: 1,
//!     ..EngineConfig::default()
//! };
//! let engine = KinematicsEngine::new(rows, config).unwrap();
//! let travelled = engine.distance(4, Some(Axis::Z)).unwrap();
//! assert!((travelled - 3.0).abs() < 1e-9);
//! ```

pub mod ring;
pub mod smoothing;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::KinematicsError;
pub use ring::FrameRing;
pub use smoothing::{ButterworthFilter, SmoothingConfig};

// =============================================================================
// Types
// =============================================================================

/// Axis selector for displacement and velocity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    #[default]
    Z,
    /// Euclidean magnitude over all three axes
    All,
}

impl FromStr for Axis {
    type Err = KinematicsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x" => Ok(Axis::X),
            "y" => Ok(Axis::Y),
            "z" => Ok(Axis::Z),
            "all" => Ok(Axis::All),
            other => Err(KinematicsError::InvalidParameter(format!(
                "axis must be one of x, y, z, all; got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
            Axis::Z => write!(f, "z"),
            Axis::All => write!(f, "all"),
        }
    }
}

/// Units of the incoming positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Positions in meters from the tracking system, multiplied by `rescale_by`
    #[default]
    Tracked,
    /// Positions already in output units, used as-is
    Passthrough,
}

/// One persisted marker row
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameRow {
    pub frame_number: i64,
    pub pos_x: f64,
    pub pos_y: f64,
    pub pos_z: f64,
}

impl FrameRow {
    pub fn new(frame_number: i64, pos_x: f64, pos_y: f64, pos_z: f64) -> Self {
        FrameRow {
            frame_number,
            pos_x,
            pos_y,
            pos_z,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.pos_x, self.pos_y, self.pos_z)
    }

    fn scaled(self, factor: f64) -> Self {
        FrameRow {
            pos_x: self.pos_x * factor,
            pos_y: self.pos_y * factor,
            pos_z: self.pos_z * factor,
            ..self
        }
    }
}

/// Mean position of all markers in one frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CentroidFrame {
    pub frame_number: i64,
    pub pos_x: f64,
    pub pos_y: f64,
    pub pos_z: f64,
}

impl CentroidFrame {
    fn from_position(frame_number: i64, p: Vector3<f64>) -> Self {
        CentroidFrame {
            frame_number,
            pos_x: p.x,
            pos_y: p.y,
            pos_z: p.z,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.pos_x, self.pos_y, self.pos_z)
    }
}

/// Change between two consecutive centroids, stamped with the later frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplacementSample {
    pub frame_number: i64,
    pub value: f64,
}

/// Anything that can hand back every persisted row in write order
pub trait FrameSource {
    fn read_rows(&self) -> Result<Vec<FrameRow>, KinematicsError>;
}

impl FrameSource for Vec<FrameRow> {
    fn read_rows(&self) -> Result<Vec<FrameRow>, KinematicsError> {
        Ok(self.clone())
    }
}

impl<T: FrameSource + ?Sized> FrameSource for Arc<T> {
    fn read_rows(&self) -> Result<Vec<FrameRow>, KinematicsError> {
        (**self).read_rows()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Engine parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Markers per frame
    pub marker_count: usize,
    /// Frames per second
    pub sample_rate: f64,
    /// Frames used when a query passes 0
    pub window_size: usize,
    /// Multiplier applied to tracked positions (meters to millimeters)
    pub rescale_by: f64,
    pub primary_axis: Axis,
    pub input_mode: InputMode,
    /// Low-pass applied to centroids before displacement, off by default
    pub smoothing: Option<SmoothingConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            marker_count: 10,
            sample_rate: 120.0,
            window_size: 5,
            rescale_by: 1000.0,
            primary_axis: Axis::Z,
            input_mode: InputMode::Tracked,
            smoothing: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), KinematicsError> {
        if self.marker_count == 0 {
            return Err(KinematicsError::InvalidParameter(
                "marker_count must be greater than 0".into(),
            ));
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(KinematicsError::InvalidParameter(format!(
                "sample_rate must be greater than 0, got {}",
                self.sample_rate
            )));
        }
        if self.window_size == 0 {
            return Err(KinematicsError::InvalidParameter(
                "window_size must be at least 1".into(),
            ));
        }
        if !(self.rescale_by.is_finite() && self.rescale_by > 0.0) {
            return Err(KinematicsError::InvalidParameter(format!(
                "rescale_by must be greater than 0, got {}",
                self.rescale_by
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Windowed kinematics over a [`FrameSource`]
#[derive(Debug, Clone)]
pub struct KinematicsEngine<S> {
    source: S,
    config: EngineConfig,
    filter: Option<ButterworthFilter>,
}

impl<S: FrameSource> KinematicsEngine<S> {
    /// Create an engine, rejecting out-of-range parameters up front.
    pub fn new(source: S, config: EngineConfig) -> Result<Self, KinematicsError> {
        config.validate()?;
        let filter = config
            .smoothing
            .as_ref()
            .map(|s| ButterworthFilter::lowpass(s, config.sample_rate))
            .transpose()?;
        Ok(KinematicsEngine {
            source,
            config,
            filter,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn marker_count(&self) -> usize {
        self.config.marker_count
    }

    pub fn sample_rate(&self) -> f64 {
        self.config.sample_rate
    }

    pub fn window_size(&self) -> usize {
        self.config.window_size
    }

    pub fn rescale_by(&self) -> f64 {
        self.config.rescale_by
    }

    pub fn primary_axis(&self) -> Axis {
        self.config.primary_axis
    }

    fn resolve(&self, num_frames: i64) -> i64 {
        if num_frames == 0 {
            self.config.window_size as i64
        } else {
            num_frames
        }
    }

    /// Rows of the last `num_frames` frames (0 = window size), rescaled.
    ///
    /// The window is every row whose frame number is greater than
    /// `last_frame_number - num_frames`, so gaps in the frame numbering
    /// shrink it rather than reach further back.
    pub fn query_frames(&self, num_frames: i64) -> Result<Vec<FrameRow>, KinematicsError> {
        if num_frames < 0 {
            return Err(KinematicsError::InvalidWindow(format!(
                "num_frames must not be negative, got {}",
                num_frames
            )));
        }
        let n = self.resolve(num_frames);

        let rows = self.source.read_rows()?;
        let last = rows.last().ok_or(KinematicsError::NoFrames)?.frame_number;
        let oldest = last.saturating_sub(n);

        let factor = match self.config.input_mode {
            InputMode::Tracked => Some(self.config.rescale_by),
            InputMode::Passthrough => None,
        };
        Ok(rows
            .into_iter()
            .filter(|r| r.frame_number > oldest)
            .map(|r| match factor {
                Some(f) => r.scaled(f),
                None => r,
            })
            .collect())
    }

    /// Per-frame centroids of the window
    pub fn centroids(&self, num_frames: i64) -> Result<Vec<CentroidFrame>, KinematicsError> {
        let rows = self.query_frames(num_frames)?;
        group_centroids(&rows, self.config.marker_count)
    }

    /// Centroid of the most recent frame
    pub fn position(&self) -> Result<CentroidFrame, KinematicsError> {
        self.centroids(1)?.pop().ok_or(KinematicsError::NoFrames)
    }

    /// Displacement between consecutive centroids of the window.
    ///
    /// Single-axis values keep their sign; [`Axis::All`] gives the unsigned
    /// Euclidean distance.
    pub fn displacements(
        &self,
        num_frames: i64,
        axis: Option<Axis>,
    ) -> Result<Vec<DisplacementSample>, KinematicsError> {
        let axis = axis.unwrap_or(self.config.primary_axis);
        let centroids = self.smoothed(self.centroids(num_frames)?)?;

        Ok(centroids
            .windows(2)
            .map(|pair| {
                let delta = pair[1].position() - pair[0].position();
                DisplacementSample {
                    frame_number: pair[1].frame_number,
                    value: axis_value(&delta, axis),
                }
            })
            .collect())
    }

    /// Displacement per second for each consecutive pair in the window
    pub fn velocities(
        &self,
        num_frames: i64,
        axis: Option<Axis>,
    ) -> Result<Vec<DisplacementSample>, KinematicsError> {
        let n = self.resolve(num_frames);
        if n < 2 {
            return Err(KinematicsError::InvalidWindow(format!(
                "velocity needs a window of at least 2 frames, got {}",
                num_frames
            )));
        }

        let displacements = self.displacements(n, axis)?;
        if displacements.is_empty() {
            return Err(KinematicsError::InsufficientFrames {
                needed: 2,
                available: displacements.len() + 1,
            });
        }

        let frame_period = 1.0 / self.config.sample_rate;
        Ok(displacements
            .into_iter()
            .map(|d| DisplacementSample {
                value: d.value / frame_period,
                ..d
            })
            .collect())
    }

    /// Mean velocity over the window
    pub fn velocity(&self, num_frames: i64, axis: Option<Axis>) -> Result<f64, KinematicsError> {
        let v = self.velocities(num_frames, axis)?;
        Ok(v.iter().map(|s| s.value).sum::<f64>() / v.len() as f64)
    }

    /// Total displacement over the window, 0 for a single frame
    pub fn distance(&self, num_frames: i64, axis: Option<Axis>) -> Result<f64, KinematicsError> {
        Ok(self
            .displacements(num_frames, axis)?
            .iter()
            .map(|d| d.value)
            .sum())
    }

    fn smoothed(&self, centroids: Vec<CentroidFrame>) -> Result<Vec<CentroidFrame>, KinematicsError> {
        let Some(filter) = &self.filter else {
            return Ok(centroids);
        };

        let column = |axis: Axis| {
            let series: Vec<f64> = centroids
                .iter()
                .map(|c| axis_value(&c.position(), axis))
                .collect();
            filter.filtfilt(&series)
        };
        let xs = column(Axis::X)?;
        let ys = column(Axis::Y)?;
        let zs = column(Axis::Z)?;

        Ok(centroids
            .iter()
            .enumerate()
            .map(|(i, c)| {
                CentroidFrame::from_position(c.frame_number, Vector3::new(xs[i], ys[i], zs[i]))
            })
            .collect())
    }
}

fn axis_value(delta: &Vector3<f64>, axis: Axis) -> f64 {
    match axis {
        Axis::X => delta.x,
        Axis::Y => delta.y,
        Axis::Z => delta.z,
        Axis::All => delta.norm(),
    }
}

/// Average each frame's rows, checking the per-frame layout.
pub fn group_centroids(
    rows: &[FrameRow],
    marker_count: usize,
) -> Result<Vec<CentroidFrame>, KinematicsError> {
    let mut centroids: Vec<CentroidFrame> = Vec::new();

    for frame in rows.chunk_by(|a, b| a.frame_number == b.frame_number) {
        let frame_number = frame[0].frame_number;
        if let Some(prev) = centroids.last() {
            if frame_number <= prev.frame_number {
                return Err(KinematicsError::Integrity(format!(
                    "frame {} follows frame {}",
                    frame_number, prev.frame_number
                )));
            }
        }
        if frame.len() != marker_count {
            return Err(KinematicsError::Integrity(format!(
                "frame {} has {} rows, expected {}",
                frame_number,
                frame.len(),
                marker_count
            )));
        }

        let sum = frame
            .iter()
            .fold(Vector3::zeros(), |acc: Vector3<f64>, r| acc + r.position());
        centroids.push(CentroidFrame::from_position(
            frame_number,
            sum / marker_count as f64,
        ));
    }

    Ok(centroids)
}

// =============================================================================
// Tests
// =============================================================================
