//! ZIP emission: one DEFLATE-compressed entry per tracklog, built fully
//! in memory for the `tracklogs.zip` aggregate.
use std::io::{Cursor, Write};
use std::sync::Arc;

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::core::Tracklog;
use crate::error::{EmitError, FsError};

/// Build the archive. Entry names are the tracklogs' current filenames,
/// entry mtimes are the flight end times, and mode bits are 0444. Bodies
/// are pulled through `body`, so cached tracklogs never touch the device.
pub fn tracklogs_zip(
    tracklogs: &[Tracklog],
    body: impl Fn(&Tracklog) -> Result<Arc<Vec<u8>>, FsError>,
) -> Result<Vec<u8>, FsError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for tracklog in tracklogs {
        let end = tracklog.dt + tracklog.duration;
        let modified = zip_datetime(&end)?;
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(modified)
            .unix_permissions(0o444);
        writer
            .start_file(tracklog.filename.clone(), options)
            .map_err(|error| EmitError::Zip(error.to_string()))?;
        writer
            .write_all(&body(tracklog)?)
            .map_err(|error| EmitError::Zip(error.to_string()))?;
    }
    let cursor = writer
        .finish()
        .map_err(|error| EmitError::Zip(error.to_string()))?;
    Ok(cursor.into_inner())
}

fn zip_datetime(dt: &chrono::DateTime<chrono::Utc>) -> Result<zip::DateTime, EmitError> {
    use chrono::{Datelike, Timelike};
    zip::DateTime::from_date_and_time(
        dt.year() as u16,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
    )
    .map_err(|()| EmitError::Zip(format!("timestamp {dt} out of ZIP range")))
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
