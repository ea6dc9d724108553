//! Archive layout: entry naming, timestamps, permissions, and content
//! round-trip through the ZIP reader.
use std::io::{Cursor, Read};

use chrono::TimeZone;
use zip::ZipArchive;

use super::*;

fn tracklog(filename: &str, hour: u32) -> Tracklog {
    let dt = chrono::Utc.with_ymd_and_hms(2008, 7, 1, hour, 0, 0).unwrap();
    Tracklog {
        count: 2,
        index: 0,
        dt,
        duration: chrono::Duration::seconds(3600),
        id: crate::core::tracklog_id(&dt),
        igc_filename: filename.to_string(),
        filename: filename.to_string(),
    }
}

#[test]
/// Every tracklog becomes one deflated, read-only entry under its
/// current filename, stamped with the flight end time.
fn test_zip_layout() {
    let tracklogs = [
        tracklog("2008-07-01-XBR-42-01.IGC", 9),
        tracklog("2008-07-01-XBR-42-02.IGC", 11),
    ];
    let bytes = tracklogs_zip(&tracklogs, |tracklog| {
        Ok(Arc::new(format!("body of {}", tracklog.filename).into_bytes()))
    })
    .unwrap();

    let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
    assert_eq!(archive.len(), 2);
    let mut entry = archive.by_name("2008-07-01-XBR-42-01.IGC").unwrap();
    assert_eq!(entry.compression(), CompressionMethod::Deflated);
    assert_eq!(entry.unix_mode(), Some(0o444));
    let modified = entry.last_modified();
    assert_eq!(
        (modified.year(), modified.month(), modified.day(), modified.hour()),
        (2008, 7, 1, 10)
    );
    let mut content = String::new();
    entry.read_to_string(&mut content).unwrap();
    assert_eq!(content, "body of 2008-07-01-XBR-42-01.IGC");
}

#[test]
/// A renamed tracklog appears in the archive under its user filename.
fn test_zip_uses_current_filename() {
    let mut renamed = tracklog("2008-07-01-XBR-42-01.IGC", 9);
    renamed.filename = "morning.igc".to_string();
    let bytes =
        tracklogs_zip(&[renamed], |_| Ok(Arc::new(b"igc".to_vec()))).unwrap();
    let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
    assert!(archive.by_name("morning.igc").is_ok());
}

#[test]
/// A body failure aborts the emission instead of truncating silently.
fn test_zip_propagates_body_errors() {
    let result = tracklogs_zip(&[tracklog("x.IGC", 9)], |_| Err(FsError::NotFound));
    assert!(result.is_err());
}

#[test]
/// No tracklogs still yields a readable, empty archive.
fn test_zip_empty() {
    let bytes = tracklogs_zip(&[], |_| Ok(Arc::new(Vec::new()))).unwrap();
    let archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
    assert_eq!(archive.len(), 0);
}
