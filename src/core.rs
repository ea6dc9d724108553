//! Device data model shared by the protocol driver, the cache, and the
//! emitters: identity record, waypoints, routes, tracklog headers, and the
//! naming/coordinate helpers derived from them.
//!
//! Latitude and longitude are carried as signed integer milliminutes
//! (60000 = 1 degree), exactly as the instrument transmits them.
use chrono::{DateTime, Duration, Utc};

/// One degree expressed in milliminutes.
pub const MILLIMINUTES_PER_DEGREE: i32 = 60_000;

/// Wire format of a tracklog's stable identifier and of the datetimes
/// recovered from cache directory entries.
pub const TRACKLOG_ID_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Identity record returned by `PBRSNP,`. Read once per mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snp {
    pub instrument: String,
    pub pilot_name: String,
    pub serial_number: String,
    pub software_version: String,
}

/// Manufacturer tuple selected by the instrument string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Manufacturer {
    /// Single-letter vendor tag.
    pub letter: char,
    /// Three-letter IGC manufacturer code used in derived filenames.
    pub code: &'static str,
    pub vendor: &'static str,
}

/// Resolve the manufacturer tuple for an instrument string.
/// Unknown instruments map to `('X', "XXX", "Unknown")`.
pub fn manufacturer(instrument: &str) -> Manufacturer {
    match instrument {
        "COMPEO" | "COMPEO+" | "COMPETINO" | "COMPETINO+" | "GALILEO" => Manufacturer {
            letter: 'B',
            code: "XBR",
            vendor: "Brauniger",
        },
        "5020" | "5030" | "6020" | "6030" => Manufacturer {
            letter: 'F',
            code: "XFL",
            vendor: "Flytec",
        },
        _ => Manufacturer {
            letter: 'X',
            code: "XXX",
            vendor: "Unknown",
        },
    }
}

/// A waypoint as stored on the instrument. Names keep the device's
/// space padding (6 bytes short, 17 bytes long).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Waypoint {
    /// Signed milliminutes, negative in the southern hemisphere.
    pub lat: i32,
    /// Signed milliminutes, negative in the western hemisphere.
    pub lon: i32,
    pub short_name: String,
    pub long_name: String,
    /// Elevation in meters.
    pub ele: i32,
}

impl Waypoint {
    /// Render both coordinates the way `PBRWPR` transmits them:
    /// `DDMM.mmm,H,DDDMM.mmm,H` with the hemisphere taken from the sign.
    pub fn nmea_coords(&self) -> String {
        let lat_hemi = if self.lat < 0 { 'S' } else { 'N' };
        let (lat_deg, rem) = (self.lat.unsigned_abs() / 60_000, self.lat.unsigned_abs() % 60_000);
        let (lat_min, lat_mmin) = (rem / 1000, rem % 1000);
        let lon_hemi = if self.lon < 0 { 'W' } else { 'E' };
        let (lon_deg, rem) = (self.lon.unsigned_abs() / 60_000, self.lon.unsigned_abs() % 60_000);
        let (lon_min, lon_mmin) = (rem / 1000, rem % 1000);
        format!(
            "{lat_deg:02}{lat_min:02}.{lat_mmin:03},{lat_hemi},{lon_deg:03}{lon_min:02}.{lon_mmin:03},{lon_hemi}"
        )
    }
}

/// True when the value is a representable latitude, exclusive of the poles.
pub fn is_valid_lat(lat: i32) -> bool {
    lat.abs() < 90 * MILLIMINUTES_PER_DEGREE
}

/// True when the value is a representable longitude, exclusive of the
/// antimeridian.
pub fn is_valid_lon(lon: i32) -> bool {
    lon.abs() < 180 * MILLIMINUTES_PER_DEGREE
}

/// Synthesize a short name for an ingested waypoint that does not carry
/// one: first three characters of the long name, uppercased, followed by
/// the elevation in decameters rounded and zero-padded to three digits.
pub fn synthesize_short_name(long_name: &str, ele: i32) -> String {
    let prefix: String = long_name.chars().take(3).collect();
    let decameters = (f64::from(ele) / 10.0).round() as i32;
    format!("{:<3}{:03}", prefix.to_uppercase(), decameters)
}

/// A reference into waypoint space carried by a route. Resolution happens
/// by `long_name` only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routepoint {
    pub short_name: String,
    pub long_name: String,
}

/// An ordered sequence of routepoints. Index 0 is the reserved
/// competition route and cannot be deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub index: u32,
    /// 17-byte padded name as stored on the device.
    pub name: String,
    pub routepoints: Vec<Routepoint>,
}

/// One `PBRTL,` index line: raw header before any naming is derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracklogInfo {
    /// Total number of tracklogs reported by the device.
    pub count: u32,
    /// Device-side download index.
    pub index: u32,
    /// UTC start of the flight.
    pub dt: DateTime<Utc>,
    pub duration: Duration,
}

/// A tracklog header with derived naming attached by the cache layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracklog {
    pub count: u32,
    pub index: u32,
    pub dt: DateTime<Utc>,
    pub duration: Duration,
    /// Stable identifier, `YYYY-MM-DDTHH:MM:SSZ` of the start time.
    pub id: String,
    /// Canonical IGC filename derived from date, manufacturer, serial
    /// number, and sibling-index.
    pub igc_filename: String,
    /// User-chosen filename when renamed, otherwise the canonical one.
    pub filename: String,
}

/// Stable identifier for a tracklog starting at `dt`.
pub fn tracklog_id(dt: &DateTime<Utc>) -> String {
    dt.format(TRACKLOG_ID_FORMAT).to_string()
}

/// Canonical IGC filename: `YYYY-MM-DD-<MFG>-<SERIAL>-NN.IGC`.
/// `serial_number` arrives with leading zeros already stripped;
/// `sibling_index` is the 1-based rank among same-date start times.
pub fn igc_filename(
    dt: &DateTime<Utc>,
    manufacturer_code: &str,
    serial_number: &str,
    sibling_index: u32,
) -> String {
    format!(
        "{}-{}-{}-{:02}.IGC",
        dt.format("%Y-%m-%d"),
        manufacturer_code,
        serial_number,
        sibling_index
    )
}
