use clap::Parser;
use log::{debug, info, warn};
use miette::{IntoDiagnostic, Result};
use std::thread;
use std::time::{Duration, Instant};

use mocap_tracker::tracker::{Tracker, TrackerError};
use mocap_tracker::{Cli, VERSION};

fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .parse_default_env()
        .init();

    info!("mocap-tracker {} starting", VERSION);

    let config = args.tracker_config().into_diagnostic()?;
    let mut tracker = Tracker::new(config).into_diagnostic()?;
    tracker.start_listening().into_diagnostic()?;

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let interval = Duration::from_millis(args.report_interval.max(1));
    while Instant::now() < deadline {
        thread::sleep(interval);
        report(&tracker);
    }

    tracker.stop_listening();

    let stats = tracker.client().statistics();
    info!(
        "Received {} datagrams, {} frames ({} malformed, {} listener errors)",
        stats.datagrams, stats.frames, stats.malformed, stats.listener_errors
    );
    if let Some(failure) = tracker.sink().failure() {
        warn!("Recording incomplete: {}", failure);
    }
    Ok(())
}

fn report(tracker: &Tracker) {
    match tracker.position() {
        Ok(p) => {
            let velocity = tracker.velocity(0, None);
            match velocity {
                Ok(v) => info!(
                    "Frame {}: ({:.1}, {:.1}, {:.1}) velocity {:.1}/s",
                    p.frame_number, p.pos_x, p.pos_y, p.pos_z, v
                ),
                Err(e) => info!(
                    "Frame {}: ({:.1}, {:.1}, {:.1}) velocity n/a: {}",
                    p.frame_number, p.pos_x, p.pos_y, p.pos_z, e
                ),
            }
        }
        Err(TrackerError::Sink(e)) => warn!("{}", e),
        Err(e) => debug!("No position yet: {}", e),
    }
}
