//! Reads the frame file written by [`FrameSink`](crate::sink::FrameSink).

use log::trace;
use mocap_core::{FrameRow, FrameSource, KinematicsError};
use std::path::PathBuf;
use std::sync::PoisonError;

use crate::sink::{DataPath, FRAME_FILE_HEADER};

/// Frame source over the current trial's CSV file.
///
/// Columns are located by header name, extra columns are ignored. The file
/// is re-read on every query so rows appended by the sink show up at once.
#[derive(Debug, Clone)]
pub struct CsvFrameFile {
    path: DataPath,
}

impl CsvFrameFile {
    pub fn new(path: DataPath) -> Self {
        CsvFrameFile { path }
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn format_error(e: csv::Error) -> KinematicsError {
    if e.is_io_error() {
        match e.into_kind() {
            csv::ErrorKind::Io(io) => KinematicsError::Io(io),
            other => KinematicsError::InvalidFormat(format!("{:?}", other)),
        }
    } else {
        KinematicsError::InvalidFormat(e.to_string())
    }
}

impl FrameSource for CsvFrameFile {
    fn read_rows(&self) -> Result<Vec<FrameRow>, KinematicsError> {
        let path = self.path().ok_or(KinematicsError::MissingDataSource)?;
        if !path.exists() {
            return Err(KinematicsError::DataNotFound(path));
        }

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&path)
            .map_err(format_error)?;

        let headers = reader.headers().map_err(format_error)?;
        if let Some(missing) = FRAME_FILE_HEADER
            .iter()
            .find(|column| !headers.iter().any(|h| h == **column))
        {
            return Err(KinematicsError::InvalidFormat(format!(
                "{} has no '{}' column",
                path.display(),
                missing
            )));
        }

        let rows = reader
            .deserialize::<FrameRow>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(format_error)?;
        trace!("Read {} rows from {}", rows.len(), path.display());
        Ok(rows)
    }
}
