//! External waypoint file ingestion: OziExplorer, Compe-GPS (both row
//! shapes), and FormatGEO, plus dispatch to the GPX reader for XML
//! input. Lines that match no known grammar are skipped; the formats
//! are routinely mixed with headers and comments.
//!
//! Byte-oriented regexes are used throughout because Compe-GPS files
//! carry a Latin-1 degree sign that is not valid UTF-8.
use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::core::{self, Waypoint, MILLIMINUTES_PER_DEGREE};
use crate::error::ParseError;
use crate::gpx;

static OZI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?-u)\A\s*\d+\s*,\s*(\S{3})(\d{3})\s*,\s*(-?\d+\.\d+)\s*,\s*(-?\d+\.\d+)\s*,(?:\s*[^,]*\s*,){6}([^,]*)",
    )
    .expect("static regex")
});
static COMPE_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?-u)\AW\s+(\S{3})(.{3})\s+([NS])(\d+\.\d+)\s+([EW])(\d+\.\d+)\s+\S+\s+\S+\s+(-?\d+)\s+(.*)",
    )
    .expect("static regex")
});
static COMPE_DEGREE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?-u)\AW\s+(\S{3})(\d+)\s+A\s+(\d+\.\d+)\xba([NS])\s+(\d+\.\d+)\xba([EW])\s+\S+\s+\S+\s+(-?\d+\.\d+)\s+(.*)",
    )
    .expect("static regex")
});
static FORMATGEO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?-u)\A(\S{3})(\d{3})\s+([NS])\s+(\d\d)\s+(\d\d)\s+(\d\d),(\d\d)\s+([EW])\s+(\d{3})\s+(\d\d)\s+(\d\d),(\d\d)\s+(\d+)\s+(.*)",
    )
    .expect("static regex")
});
static DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)\A\d+\z").expect("static regex"));

/// Parse a waypoint file in any of the supported formats. Input starting
/// with `<` is treated as GPX; everything else goes through the
/// line-oriented parsers.
pub fn parse(data: &[u8]) -> Result<Vec<Waypoint>, ParseError> {
    let sniffed = data.iter().position(|byte| !byte.is_ascii_whitespace());
    if sniffed.map(|index| data[index]) == Some(b'<') {
        return gpx::parse_waypoints(data);
    }
    Ok(parse_lines(data))
}

fn parse_lines(data: &[u8]) -> Vec<Waypoint> {
    data.split(|&byte| byte == b'\n')
        .filter_map(|line| {
            let line = trim_end(line);
            parse_ozi(line)
                .or_else(|| parse_compe_prefix(line))
                .or_else(|| parse_compe_degree(line))
                .or_else(|| parse_formatgeo(line))
        })
        .filter(|waypoint| core::is_valid_lat(waypoint.lat) && core::is_valid_lon(waypoint.lon))
        .collect()
}

fn trim_end(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map_or(0, |index| index + 1);
    &line[..end]
}

fn text(bytes: &[u8]) -> String {
    // Latin-1 bytes map 1:1 onto the first 256 code points.
    bytes.iter().map(|&byte| char::from(byte)).collect()
}

fn milliminutes(degrees: f64) -> i32 {
    (f64::from(MILLIMINUTES_PER_DEGREE) * degrees).round() as i32
}

/// OziExplorer row: id+name token, decimal latitude and longitude, and a
/// description in the tenth field. The three digits of the name token
/// encode the elevation in decameters.
fn parse_ozi(line: &[u8]) -> Option<Waypoint> {
    let captures = OZI_RE.captures(line)?;
    let lat = milliminutes(text(&captures[3]).parse().ok()?);
    let lon = milliminutes(text(&captures[4]).parse().ok()?);
    let prefix = text(&captures[1]);
    let digits = text(&captures[2]);
    Some(Waypoint {
        lat,
        lon,
        short_name: format!("{prefix}{digits}"),
        long_name: format!("{prefix} {}", text(&captures[5])),
        ele: 10 * digits.parse::<i32>().ok()?,
    })
}

/// Compe-GPS `W` record with hemisphere-prefixed decimal degrees. An
/// elevation of -9999 means "unknown" and is recovered from the name
/// digits when they are numeric.
fn parse_compe_prefix(line: &[u8]) -> Option<Waypoint> {
    let captures = COMPE_PREFIX_RE.captures(line)?;
    let mut lat = milliminutes(text(&captures[4]).parse().ok()?);
    if &captures[3] == b"S" {
        lat = -lat;
    }
    let mut lon = milliminutes(text(&captures[6]).parse().ok()?);
    if &captures[5] == b"W" {
        lon = -lon;
    }
    let mut ele = text(&captures[7]).parse::<i32>().ok()?;
    if ele == -9999 {
        ele = if DIGITS_RE.is_match(&captures[2]) {
            10 * text(&captures[2]).parse::<i32>().ok()?
        } else {
            0
        };
    }
    let long_name = format!("{} {}", text(&captures[1]), text(&captures[8]));
    let short_name = core::synthesize_short_name(&long_name, ele);
    Some(Waypoint {
        lat,
        lon,
        short_name,
        long_name,
        ele,
    })
}

/// Compe-GPS `W` record with degree-sign-suffixed decimal degrees.
fn parse_compe_degree(line: &[u8]) -> Option<Waypoint> {
    let captures = COMPE_DEGREE_RE.captures(line)?;
    let mut lat = milliminutes(text(&captures[3]).parse().ok()?);
    if &captures[4] == b"S" {
        lat = -lat;
    }
    let mut lon = milliminutes(text(&captures[5]).parse().ok()?);
    if &captures[6] == b"W" {
        lon = -lon;
    }
    let mut ele = text(&captures[7]).parse::<f64>().ok()? as i32;
    if ele == -9999 {
        ele = 10 * text(&captures[2]).parse::<i32>().ok()?;
    }
    let long_name = text(&captures[8]);
    let short_name = core::synthesize_short_name(&text(&captures[1]), ele);
    Some(Waypoint {
        lat,
        lon,
        short_name,
        long_name,
        ele,
    })
}

/// FormatGEO row: space-separated DMS with centisecond fractions.
fn parse_formatgeo(line: &[u8]) -> Option<Waypoint> {
    let captures = FORMATGEO_RE.captures(line)?;
    let dms = |first: usize| -> Option<f64> {
        let field = |index: usize| text(&captures[index]).parse::<f64>().ok();
        Some(
            field(first)?
                + field(first + 1)? / 60.0
                + field(first + 2)? / 3600.0
                + field(first + 3)? / 360_000.0,
        )
    };
    let mut lat = milliminutes(dms(4)?);
    if &captures[3] == b"S" {
        lat = -lat;
    }
    let mut lon = milliminutes(dms(9)?);
    if &captures[8] == b"W" {
        lon = -lon;
    }
    let ele = text(&captures[13]).parse::<i32>().ok()?;
    let prefix = text(&captures[1]);
    let long_name = format!("{prefix} {}", text(&captures[14]));
    let short_name = core::synthesize_short_name(&prefix, ele);
    Some(Waypoint {
        lat,
        lon,
        short_name,
        long_name,
        ele,
    })
}
