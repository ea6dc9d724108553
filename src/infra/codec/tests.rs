//! Framing round-trips and rejection paths for the NMEA codec.
use super::*;

#[test]
/// The identity query frames to its canonical sentence and back.
fn test_encode_decode_snp() {
    assert_eq!(encode("PBRSNP,").unwrap(), "$PBRSNP,*21\r\n");
    assert_eq!(decode(b"$PBRSNP,*21\r\n").unwrap(), "PBRSNP,");
}

#[test]
/// Round-trip over a spread of printable payloads and lengths.
fn test_round_trip() {
    let payloads = [
        "A",
        "PBRTL,",
        "PBRWPS,4612.345,N,00612.345,E,SHORT ,Long name         ,1234",
        &"x".repeat(MAX_PAYLOAD),
    ];
    for payload in payloads {
        let frame = encode(payload).unwrap();
        assert_eq!(decode(frame.as_bytes()).unwrap(), payload);
    }
}

#[test]
/// Empty, oversized, and non-printable payloads are refused.
fn test_encode_invalid_payload() {
    assert_eq!(encode(""), Err(NmeaError::InvalidPayload));
    assert_eq!(encode(&"x".repeat(MAX_PAYLOAD + 1)), Err(NmeaError::InvalidPayload));
    assert_eq!(encode("PBR\x01SNP"), Err(NmeaError::InvalidPayload));
    assert_eq!(encode("PBR\u{7f}"), Err(NmeaError::InvalidPayload));
    assert_eq!(encode("gruy\u{e8}re"), Err(NmeaError::InvalidPayload));
}

#[test]
/// Frames that do not match the grammar are `Malformed`.
fn test_decode_malformed() {
    assert_eq!(decode(b""), Err(NmeaError::Malformed));
    assert_eq!(decode(b"PBRSNP,*13\r\n"), Err(NmeaError::Malformed));
    assert_eq!(decode(b"$PBRSNP,*13"), Err(NmeaError::Malformed));
    assert_eq!(decode(b"$PBRSNP,*13\n"), Err(NmeaError::Malformed));
    assert_eq!(decode(b"$PBRSNP,*1g\r\n"), Err(NmeaError::Malformed));
    assert_eq!(decode(b"$PBRSNP,*3\r\n"), Err(NmeaError::Malformed));
    assert_eq!(decode(b"$*00\r\n"), Err(NmeaError::Malformed));
}

#[test]
/// Any checksum other than the XOR over the payload is rejected.
fn test_decode_bad_checksum() {
    assert_eq!(decode(b"$PBRSNP,*13\r\n"), Err(NmeaError::BadChecksum));
    assert_eq!(decode(b"$PBRSNP,*00\r\n"), Err(NmeaError::BadChecksum));
    // Lowercase hex digits never match the grammar in the first place.
    assert_eq!(decode(b"$PBRSNP,*2a\r\n"), Err(NmeaError::Malformed));
}

#[test]
/// The checksum is an XOR, so swapping two payload bytes keeps it stable.
fn test_checksum_is_xor() {
    let ab = encode("PBR,AB").unwrap();
    let ba = encode("PBR,BA").unwrap();
    assert_eq!(ab[ab.len() - 4..], ba[ba.len() - 4..]);
}

#[test]
/// The scrubber is total and replaces every non-printable character.
fn test_scrub() {
    assert_eq!(scrub("Plain name"), "Plain name");
    assert_eq!(scrub("tab\there"), "tab?here");
    assert_eq!(scrub("Gen\u{e8}ve"), "Gen?ve");
    assert_eq!(scrub("\u{11}\u{13}"), "??");
    assert_eq!(scrub(""), "");
}
