//! # Mocap Tracker
//!
//! NatNet stream client that records one marker set per trial and answers
//! position, velocity and distance queries about it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     mocap-tracker                       │
//! │                                                         │
//! │  ┌────────────────┐  ┌────────────────┐                 │
//! │  │ natnet-command │  │ natnet-data    │  receive loops  │
//! │  └───────┬────────┘  └───────┬────────┘                 │
//! │          └─────────┬─────────┘                          │
//! │                    ▼                                    │
//! │  ┌──────────────────────────────────┐                   │
//! │  │ FrameSink (MarkerListener)       │                   │
//! │  └─────────────────┬────────────────┘                   │
//! │                    ▼                                    │
//! │  ┌──────────────────────────────────┐                   │
//! │  │ trial CSV file                   │                   │
//! │  └─────────────────┬────────────────┘                   │
//! │                    ▼                                    │
//! │  ┌──────────────────────────────────┐                   │
//! │  │ KinematicsEngine<CsvFrameFile>   │  Tracker queries  │
//! │  └──────────────────────────────────┘                   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`tracker::Tracker`] - Facade tying the pieces to one frame file
//! - [`client::StreamClient`] - Command/data sockets and receive loops
//! - [`sink::FrameSink`] - Appends the tracked marker set to CSV
//! - [`source::CsvFrameFile`] - Reads the CSV back for the engine
//!
//! ## Example: Querying a Recorded Trial
//!
//! ```rust,no_run
//! use mocap_tracker::config::TrackerConfig;
//! use mocap_tracker::tracker::Tracker;
//!
//! let config = TrackerConfig {
//!     data_file: Some("trial_01.csv".into()),
//!     ..TrackerConfig::default()
//! };
//! let tracker = Tracker::new(config).unwrap();
//! println!("{:?}", tracker.position().unwrap());
//! println!("{} mm/s", tracker.velocity(0, None).unwrap());
//! ```
//!
//! ## Command-Line Interface
//!
//! See [`Cli`] for all available options. Key options:
//!
//! - `-c, --config` - JSON configuration file
//! - `-o, --output` - Frame file for this trial
//! - `-s, --server` - Motive server address
//! - `-v` - Increase verbosity (use multiple times)

use clap::Parser;
use mocap_core::{Axis, InputMode, SmoothingConfig};
use std::net::Ipv4Addr;
use std::path::PathBuf;

pub mod client;
pub mod config;
pub mod network;
pub mod sink;
pub mod source;
pub mod tracker;

use config::{ConfigError, TrackerConfig};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// JSON configuration file; command-line options override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Frame file for this trial (required unless set in the config file)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Address of the Motive server
    #[arg(short, long)]
    pub server: Option<Ipv4Addr>,

    /// Local interface address
    #[arg(short, long)]
    pub local: Option<Ipv4Addr>,

    /// Ask the server for unicast frames instead of joining the multicast group
    #[arg(long, default_value_t = false)]
    pub unicast: bool,

    /// Multicast group carrying frame data
    #[arg(long)]
    pub multicast_group: Option<Ipv4Addr>,

    #[arg(long)]
    pub command_port: Option<u16>,

    #[arg(long)]
    pub data_port: Option<u16>,

    /// Marker set to record
    #[arg(long, conflicts_with = "all_sets")]
    pub label: Option<String>,

    /// Record every marker set
    #[arg(long, default_value_t = false)]
    pub all_sets: bool,

    /// Markers per frame in the recorded set
    #[arg(short, long)]
    pub markers: Option<usize>,

    /// Frames per second of the capture
    #[arg(long)]
    pub sample_rate: Option<f64>,

    /// Frames used by queries
    #[arg(short, long)]
    pub window: Option<usize>,

    /// Axis for velocity and distance: x, y, z or all
    #[arg(short, long)]
    pub axis: Option<Axis>,

    /// Positions are already in output units, skip rescaling
    #[arg(long, default_value_t = false)]
    pub passthrough: bool,

    /// Low-pass filter centroids before computing velocity and distance
    #[arg(long, default_value_t = false)]
    pub smooth: bool,

    /// Seconds to record before exiting
    #[arg(short, long, default_value_t = 10)]
    pub duration: u64,

    /// Milliseconds between logged position and velocity reports
    #[arg(long, default_value_t = 500)]
    pub report_interval: u64,
}

impl Cli {
    /// Configuration file (or defaults) with command-line overrides applied
    pub fn tracker_config(&self) -> Result<TrackerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => TrackerConfig::load(path)?,
            None => TrackerConfig::default(),
        };

        let client = &mut config.client;
        if let Some(server) = self.server {
            client.server_address = server;
        }
        if let Some(local) = self.local {
            client.local_address = local;
        }
        if self.unicast {
            client.use_multicast = false;
        }
        if let Some(group) = self.multicast_group {
            client.multicast_address = group;
        }
        if let Some(port) = self.command_port {
            client.command_port = port;
        }
        if let Some(port) = self.data_port {
            client.data_port = port;
        }

        let engine = &mut config.engine;
        if let Some(markers) = self.markers {
            engine.marker_count = markers;
        }
        if let Some(rate) = self.sample_rate {
            engine.sample_rate = rate;
        }
        if let Some(window) = self.window {
            engine.window_size = window;
        }
        if let Some(axis) = self.axis {
            engine.primary_axis = axis;
        }
        if self.passthrough {
            engine.input_mode = InputMode::Passthrough;
        }
        if self.smooth && engine.smoothing.is_none() {
            engine.smoothing = Some(SmoothingConfig::default());
        }

        if self.all_sets {
            config.marker_set_label = None;
        } else if let Some(label) = &self.label {
            config.marker_set_label = Some(label.clone());
        }
        if let Some(output) = &self.output {
            config.data_file = Some(output.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_arguments() {
        let cli = Cli::parse_from(["mocap-tracker"]);
        assert_eq!(cli.duration, 10);
        assert_eq!(cli.tracker_config().unwrap(), TrackerConfig::default());
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from([
            "mocap-tracker",
            "-s",
            "192.168.1.20",
            "--unicast",
            "-m",
            "4",
            "-a",
            "ALL",
            "--smooth",
            "--all-sets",
            "-o",
            "trial_3.csv",
        ]);
        let config = cli.tracker_config().unwrap();
        assert_eq!(
            config.client.server_address,
            Ipv4Addr::new(192, 168, 1, 20)
        );
        assert!(!config.client.use_multicast);
        assert_eq!(config.engine.marker_count, 4);
        assert_eq!(config.engine.primary_axis, Axis::All);
        assert_eq!(config.engine.smoothing, Some(SmoothingConfig::default()));
        assert_eq!(config.marker_set_label, None);
        assert_eq!(config.data_file, Some(PathBuf::from("trial_3.csv")));
    }

    #[test]
    fn test_command_line_beats_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tracker.json");
        fs::write(
            &path,
            r#"{ "engine": { "windowSize": 8, "markerCount": 6 }, "markerSetLabel": "left" }"#,
        )
        .unwrap();

        let cli = Cli::parse_from([
            "mocap-tracker",
            "-c",
            path.to_str().unwrap(),
            "-w",
            "12",
        ]);
        let config = cli.tracker_config().unwrap();
        assert_eq!(config.engine.window_size, 12);
        assert_eq!(config.engine.marker_count, 6);
        assert_eq!(config.marker_set_label.as_deref(), Some("left"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(Cli::try_parse_from(["mocap-tracker", "-a", "w"]).is_err());
        assert!(Cli::try_parse_from(["mocap-tracker", "--label", "a", "--all-sets"]).is_err());

        let cli = Cli::parse_from(["mocap-tracker", "-w", "0"]);
        assert!(matches!(
            cli.tracker_config(),
            Err(ConfigError::Invalid(_))
        ));
    }
}
