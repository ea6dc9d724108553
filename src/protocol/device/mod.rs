//! Device protocol driver: issues PBR* command sentences, walks the
//! XOFF/payload/XON response state machine, and decodes waypoints,
//! routes, the tracklog index, and parameter memory pages.
//!
//! Every command follows the same shape: send sentence, expect XOFF,
//! consume zero or more payload lines or blocks, expect XON. Any broken
//! expectation flushes the transport and fails the operation; partial
//! results never reach callers.
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use regex::Regex;

use crate::core::{Route, Routepoint, Snp, TracklogInfo, Waypoint};
use crate::error::{FlytecError, ProtocolError};
use crate::infra::codec;
use crate::infra::serial::{RawPort, SerialIo, XOFF, XON};

/// Read deadline for ordinary queries.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
/// Read deadline for commit-style commands (`PBRCONF,`, `PBRRTX`).
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(4);
/// Read deadline for waypoint erasure, the slowest operation.
pub const ERASE_TIMEOUT: Duration = Duration::from_secs(8);

static PBRMEMR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\APBRMEMR,([0-9A-F]+),([0-9A-F]+(?:,[0-9A-F]+)*)\z").expect("static regex")
});
static PBRRTS_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\APBRRTS,(\d+),(\d+),0+,(.*)\z").expect("static regex"));
static PBRRTS_POINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\APBRRTS,(\d+),(\d+),(\d+),([^,]*),(.*)\z").expect("static regex")
});
static PBRSNP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\APBRSNP,([^,]*),([^,]*),([^,]*),([^,]*)\z").expect("static regex")
});
static PBRTL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\APBRTL,(\d+),(\d+),(\d+).(\d+).(\d+),(\d+):(\d+):(\d+),(\d+):(\d+):(\d+)\z")
        .expect("static regex")
});
static PBRWPS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\APBRWPS,(\d{2})(\d{2})\.(\d{3}),([NS]),(\d{3})(\d{2})\.(\d{3}),([EW]),([^,]*),([^,]*),(\d+)\z",
    )
    .expect("static regex")
});

fn unexpected(line: &str) -> FlytecError {
    ProtocolError::UnexpectedLine(line.to_string()).into()
}

/// Low-level driver owning the transport and the cached identity record.
pub struct Flytec<P> {
    io: SerialIo<P>,
    snp: Option<Snp>,
}

impl<P: RawPort> Flytec<P> {
    pub fn new(port: P) -> Self {
        Self {
            io: SerialIo::new(port),
            snp: None,
        }
    }

    /// Send a framed command and consume the XOFF acknowledgement.
    fn send(&mut self, command: &str, timeout: Duration) -> Result<(), FlytecError> {
        let sentence = codec::encode(command)?;
        self.io.write_line(sentence.as_bytes())?;
        let first = self.io.read_line(timeout)?;
        if first != [XOFF] {
            return Err(ProtocolError::MissingXoff.into());
        }
        Ok(())
    }

    fn lines_inner(&mut self, command: &str, timeout: Duration) -> Result<Vec<Vec<u8>>, FlytecError> {
        self.send(command, timeout)?;
        let mut lines = Vec::new();
        loop {
            let line = self.io.read_line(timeout)?;
            if line == [XON] {
                return Ok(lines);
            }
            if line == [XOFF] {
                return Err(ProtocolError::MissingXon.into());
            }
            lines.push(line);
        }
    }

    /// Run a command and collect its raw payload lines. The transport is
    /// flushed on any failure so the next command starts clean.
    fn command_lines(&mut self, command: &str, timeout: Duration) -> Result<Vec<Vec<u8>>, FlytecError> {
        match self.lines_inner(command, timeout) {
            Ok(lines) => Ok(lines),
            Err(err) => {
                let _ = self.io.flush();
                Err(err)
            }
        }
    }

    fn blocks_inner(&mut self, command: &str, timeout: Duration) -> Result<Vec<u8>, FlytecError> {
        self.send(command, timeout)?;
        let mut body = Vec::new();
        loop {
            let block = self.io.read_block(timeout)?;
            if block == [XON] {
                return Ok(body);
            }
            if block == [XOFF] {
                return Err(ProtocolError::MissingXon.into());
            }
            body.extend_from_slice(&block);
        }
    }

    /// Run a command whose payload is binary-opaque, concatenating blocks
    /// up to the XON terminator.
    fn command_blocks(&mut self, command: &str, timeout: Duration) -> Result<Vec<u8>, FlytecError> {
        match self.blocks_inner(command, timeout) {
            Ok(body) => Ok(body),
            Err(err) => {
                let _ = self.io.flush();
                Err(err)
            }
        }
    }

    /// Run an action command that must produce no payload at all.
    fn command_none(&mut self, command: &str, timeout: Duration) -> Result<(), FlytecError> {
        let lines = self.command_lines(command, timeout)?;
        match lines.into_iter().next() {
            None => Ok(()),
            Some(line) => Err(unexpected(&String::from_utf8_lossy(&line))),
        }
    }

    /// Run a query that must answer with exactly one decoded payload.
    fn command_one(&mut self, command: &str, timeout: Duration) -> Result<String, FlytecError> {
        let lines = self.command_lines(command, timeout)?;
        let mut decoded = None;
        for line in lines {
            let payload = codec::decode(&line)?;
            if decoded.is_some() {
                return Err(unexpected(&payload));
            }
            decoded = Some(payload);
        }
        decoded.ok_or_else(|| unexpected(""))
    }

    /// Identity query. The record is cached after the first exchange.
    pub fn pbrsnp(&mut self) -> Result<Snp, FlytecError> {
        if let Some(snp) = &self.snp {
            return Ok(snp.clone());
        }
        let payload = self.command_one("PBRSNP,", DEFAULT_TIMEOUT)?;
        let captures = PBRSNP_RE.captures(&payload).ok_or_else(|| unexpected(&payload))?;
        let snp = Snp {
            instrument: captures[1].to_string(),
            pilot_name: captures[2].to_string(),
            serial_number: captures[3].to_string(),
            software_version: captures[4].to_string(),
        };
        self.snp = Some(snp.clone());
        Ok(snp)
    }

    /// Commit settings and reboot the instrument.
    pub fn pbrconf(&mut self) -> Result<(), FlytecError> {
        self.command_none("PBRCONF,", COMMIT_TIMEOUT)
    }

    /// Random read of one parameter-memory page: up to 8 bytes starting
    /// at `address`. Fails when the device echoes a different address.
    pub fn pbrmemr(&mut self, address: u16) -> Result<Vec<u8>, FlytecError> {
        let payload = self.command_one(&format!("PBRMEMR,{address:04X}"), DEFAULT_TIMEOUT)?;
        let captures = PBRMEMR_RE.captures(&payload).ok_or_else(|| unexpected(&payload))?;
        let echoed = u16::from_str_radix(&captures[1], 16).map_err(|_| unexpected(&payload))?;
        if echoed != address {
            return Err(ProtocolError::AddressMismatch {
                requested: address,
                echoed,
            }
            .into());
        }
        captures[2]
            .split(',')
            .map(|byte| u8::from_str_radix(byte, 16).map_err(|_| unexpected(&payload)))
            .collect()
    }

    /// Enumerate routes. A header line introduces a route; body lines
    /// contribute routepoints until the routepoint index reaches
    /// `count - 1`, at which point the route is emitted.
    pub fn pbrrts(&mut self) -> Result<Vec<Route>, FlytecError> {
        let lines = self.command_lines("PBRRTS,", DEFAULT_TIMEOUT)?;
        let mut routes = Vec::new();
        let mut pending: Option<(u32, String, Vec<Routepoint>)> = None;
        for line in lines {
            let payload = codec::decode(&line)?;
            if let Some(captures) = PBRRTS_HEADER_RE.captures(&payload) {
                let index: u32 = captures[1].parse().map_err(|_| unexpected(&payload))?;
                let count: u32 = captures[2].parse().map_err(|_| unexpected(&payload))?;
                let name = captures[3].to_string();
                if count == 1 {
                    routes.push(Route {
                        index,
                        name,
                        routepoints: Vec::new(),
                    });
                } else {
                    pending = Some((index, name, Vec::new()));
                }
            } else if let Some(captures) = PBRRTS_POINT_RE.captures(&payload) {
                let count: u32 = captures[2].parse().map_err(|_| unexpected(&payload))?;
                let point_index: u32 = captures[3].parse().map_err(|_| unexpected(&payload))?;
                let routepoint = Routepoint {
                    short_name: captures[4].to_string(),
                    long_name: captures[5].to_string(),
                };
                let (index, name, mut points) =
                    pending.take().ok_or_else(|| unexpected(&payload))?;
                points.push(routepoint);
                if point_index == count - 1 {
                    routes.push(Route {
                        index,
                        name,
                        routepoints: points,
                    });
                } else {
                    pending = Some((index, name, points));
                }
            } else {
                return Err(unexpected(&payload));
            }
        }
        Ok(routes)
    }

    /// Delete a route by its padded name.
    pub fn pbrrtx(&mut self, name: &str) -> Result<(), FlytecError> {
        self.command_none(&format!("PBRRTX,{name:<17}"), COMMIT_TIMEOUT)
    }

    /// Tracklog index: one line per stored flight.
    pub fn pbrtl(&mut self) -> Result<Vec<TracklogInfo>, FlytecError> {
        let lines = self.command_lines("PBRTL,", DEFAULT_TIMEOUT)?;
        let mut tracklogs = Vec::new();
        for line in lines {
            let payload = codec::decode(&line)?;
            let captures = PBRTL_RE.captures(&payload).ok_or_else(|| unexpected(&payload))?;
            let field = |i: usize| -> Result<u32, FlytecError> {
                captures[i].parse().map_err(|_| unexpected(&payload))
            };
            let (count, index) = (field(1)?, field(2)?);
            let (day, month, year) = (field(3)?, field(4)?, field(5)?);
            let (hour, minute, second) = (field(6)?, field(7)?, field(8)?);
            let dt = Utc
                .with_ymd_and_hms(2000 + year as i32, month, day, hour, minute, second)
                .single()
                .ok_or_else(|| unexpected(&payload))?;
            let (hours, minutes, seconds) = (field(9)?, field(10)?, field(11)?);
            let duration =
                chrono::Duration::seconds(i64::from(hours * 3600 + minutes * 60 + seconds));
            tracklogs.push(TracklogInfo {
                count,
                index,
                dt,
                duration,
            });
        }
        Ok(tracklogs)
    }

    /// Download the IGC body of the tracklog at device index `index`.
    pub fn pbrtr(&mut self, index: u32) -> Result<Vec<u8>, FlytecError> {
        self.command_blocks(&format!("PBRTR,{index:02}"), DEFAULT_TIMEOUT)
    }

    /// Stream the current session as IGC.
    pub fn pbrigc(&mut self) -> Result<Vec<u8>, FlytecError> {
        self.command_blocks("PBRIGC,", DEFAULT_TIMEOUT)
    }

    /// Create or update a waypoint. The short-name field is left empty;
    /// the instrument derives it.
    pub fn pbrwpr(&mut self, waypoint: &Waypoint) -> Result<(), FlytecError> {
        let long_name: String = waypoint.long_name.chars().take(17).collect();
        let command = format!(
            "PBRWPR,{},,{:<17},{:04}",
            waypoint.nmea_coords(),
            long_name,
            waypoint.ele
        );
        self.command_none(&command, DEFAULT_TIMEOUT)
    }

    /// Enumerate waypoints.
    pub fn pbrwps(&mut self) -> Result<Vec<Waypoint>, FlytecError> {
        let lines = self.command_lines("PBRWPS,", DEFAULT_TIMEOUT)?;
        let mut waypoints = Vec::new();
        for line in lines {
            let payload = codec::decode(&line)?;
            let captures = PBRWPS_RE.captures(&payload).ok_or_else(|| unexpected(&payload))?;
            let field = |i: usize| -> Result<i32, FlytecError> {
                captures[i].parse().map_err(|_| unexpected(&payload))
            };
            let mut lat = 60_000 * field(1)? + 1000 * field(2)? + field(3)?;
            if &captures[4] == "S" {
                lat = -lat;
            }
            let mut lon = 60_000 * field(5)? + 1000 * field(6)? + field(7)?;
            if &captures[8] == "W" {
                lon = -lon;
            }
            waypoints.push(Waypoint {
                lat,
                lon,
                short_name: captures[9].to_string(),
                long_name: captures[10].to_string(),
                ele: field(11)?,
            });
        }
        Ok(waypoints)
    }

    /// Delete one named waypoint, or every waypoint when `long_name` is
    /// `None`.
    pub fn pbrwpx(&mut self, long_name: Option<&str>) -> Result<(), FlytecError> {
        let command = match long_name {
            Some(name) => format!("PBRWPX,{name:<17}"),
            None => "PBRWPX,".to_string(),
        };
        self.command_none(&command, ERASE_TIMEOUT)
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
