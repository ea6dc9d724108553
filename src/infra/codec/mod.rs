//! NMEA-0183 sentence codec: wraps a printable-ASCII payload into
//! `$PAYLOAD*HH\r\n` frames and back, with the XOR-byte checksum the
//! Flytec/Brauniger dialect uses. A separate scrubber sanitizes
//! user-supplied names before they are embedded in a sentence.
use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::error::NmeaError;

/// Maximum payload length in bytes, excluding framing.
pub const MAX_PAYLOAD: usize = 79;

static DECODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\A\$(.{1,79})\*([0-9A-F]{2})\r\n\z").expect("static regex")
});

fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |acc, byte| acc ^ byte)
}

fn is_printable(byte: u8) -> bool {
    (0x20..=0x7e).contains(&byte)
}

/// Frame a payload into a full sentence.
///
/// Fails with `InvalidPayload` when the payload is empty, longer than
/// [`MAX_PAYLOAD`], or contains a byte outside 0x20-0x7E.
pub fn encode(payload: &str) -> Result<String, NmeaError> {
    let bytes = payload.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_PAYLOAD || !bytes.iter().copied().all(is_printable) {
        return Err(NmeaError::InvalidPayload);
    }
    Ok(format!("${}*{:02X}\r\n", payload, checksum(bytes)))
}

/// Deframe a received sentence back into its payload.
///
/// Fails with `Malformed` when the framing grammar does not match and with
/// `BadChecksum` when the XOR over the payload differs from the
/// transmitted byte.
pub fn decode(frame: &[u8]) -> Result<String, NmeaError> {
    let captures = DECODE_RE.captures(frame).ok_or(NmeaError::Malformed)?;
    let payload = captures.get(1).map(|m| m.as_bytes()).unwrap_or_default();
    let transmitted = captures.get(2).map(|m| m.as_bytes()).unwrap_or_default();
    // The regex guarantees two uppercase hex digits.
    let transmitted = u8::from_str_radix(std::str::from_utf8(transmitted).unwrap_or("00"), 16)
        .map_err(|_| NmeaError::Malformed)?;
    if checksum(payload) != transmitted {
        return Err(NmeaError::BadChecksum);
    }
    String::from_utf8(payload.to_vec()).map_err(|_| NmeaError::Malformed)
}

/// Total encoder for user-supplied names: every character outside the
/// printable ASCII range becomes `?`.
pub fn scrub(input: &str) -> String {
    input
        .chars()
        .map(|c| if (' '..='~').contains(&c) { c } else { '?' })
        .collect()
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
