//! Driver conversations against a scripted port: happy-path decoding for
//! every query plus the state-machine failure modes.
use super::*;
use crate::error::TransportError;
use crate::infra::serial::testutil::ScriptedPort;

/// Frame a payload the way the device would transmit it.
fn framed(payload: &str) -> Vec<u8> {
    codec::encode(payload).unwrap().into_bytes()
}

fn driver_with(script: impl FnOnce(&mut ScriptedPort)) -> Flytec<ScriptedPort> {
    let mut port = ScriptedPort::new();
    script(&mut port);
    Flytec::new(port)
}

#[test]
/// Identity decodes into its four fields and is cached afterwards.
fn test_pbrsnp_parses_and_caches() {
    let mut driver = driver_with(|port| {
        port.push_response(&[&framed("PBRSNP,COMPEO,Tom Payne,000042,1.16")]);
    });
    let snp = driver.pbrsnp().unwrap();
    assert_eq!(snp.instrument, "COMPEO");
    assert_eq!(snp.pilot_name, "Tom Payne");
    assert_eq!(snp.serial_number, "000042");
    assert_eq!(snp.software_version, "1.16");
    // No further reads are queued; a second exchange would time out.
    assert_eq!(driver.pbrsnp().unwrap(), snp);
}

#[test]
/// One PBRWPS sentence decodes into signed milliminutes and padded names.
fn test_pbrwps_decodes_waypoint() {
    let mut driver = driver_with(|port| {
        port.push_response(&[&framed(
            "PBRWPS,4612.345,N,00612.345,E,SHORT ,Long name         ,1234",
        )]);
    });
    let waypoints = driver.pbrwps().unwrap();
    assert_eq!(waypoints.len(), 1);
    let waypoint = &waypoints[0];
    assert_eq!(waypoint.lat, 2_772_345);
    assert_eq!(waypoint.lon, 372_345);
    assert_eq!(waypoint.short_name, "SHORT ");
    assert_eq!(waypoint.long_name, "Long name         ");
    assert_eq!(waypoint.ele, 1234);
}

#[test]
/// Southern and western hemispheres negate the decoded coordinates.
fn test_pbrwps_southern_western() {
    let mut driver = driver_with(|port| {
        port.push_response(&[&framed(
            "PBRWPS,4612.345,S,00612.345,W,SHORT ,Long name         ,0000",
        )]);
    });
    let waypoints = driver.pbrwps().unwrap();
    assert_eq!(waypoints[0].lat, -2_772_345);
    assert_eq!(waypoints[0].lon, -372_345);
}

#[test]
/// Waypoint upload renders hemisphere, padding, and elevation width.
fn test_pbrwpr_sentence_format() {
    let mut driver = driver_with(|port| {
        port.push_response(&[]);
    });
    let waypoint = Waypoint {
        lat: -2_772_345,
        lon: 372_345,
        short_name: String::new(),
        long_name: "Long name".to_string(),
        ele: 123,
    };
    driver.pbrwpr(&waypoint).unwrap();
    let written = driver.io.port.written();
    let expected = codec::encode(
        "PBRWPR,4612.345,S,00612.345,E,,Long name        ,0123",
    )
    .unwrap();
    assert_eq!(written, expected.into_bytes());
}

#[test]
/// A multi-point route is emitted when the last routepoint arrives, and
/// a count-of-one header yields a zero-point route.
fn test_pbrrts_routes() {
    let mut driver = driver_with(|port| {
        port.push_response(&[
            &framed("PBRRTS,0,1,00,Competition Route"),
            &framed("PBRRTS,1,3,00,Alps              "),
            &framed("PBRRTS,1,3,01,START ,Start point      "),
            &framed("PBRRTS,1,3,02,GOAL  ,Goal point       "),
        ]);
    });
    let routes = driver.pbrrts().unwrap();
    assert_eq!(routes.len(), 2);
    assert_eq!(routes[0].index, 0);
    assert_eq!(routes[0].name, "Competition Route");
    assert!(routes[0].routepoints.is_empty());
    assert_eq!(routes[1].index, 1);
    assert_eq!(routes[1].routepoints.len(), 2);
    assert_eq!(routes[1].routepoints[0].short_name, "START ");
    assert_eq!(routes[1].routepoints[1].long_name, "Goal point       ");
}

#[test]
/// A routepoint line without a preceding header is a protocol error.
fn test_pbrrts_orphan_routepoint() {
    let mut driver = driver_with(|port| {
        port.push_response(&[&framed("PBRRTS,1,3,01,START ,Start point      ")]);
    });
    assert!(matches!(
        driver.pbrrts(),
        Err(FlytecError::Protocol(ProtocolError::UnexpectedLine(_)))
    ));
}

#[test]
/// Tracklog index lines decode into UTC datetimes and durations.
fn test_pbrtl_decodes_index() {
    let mut driver = driver_with(|port| {
        port.push_response(&[
            &framed("PBRTL,2,0,01.07.08,10:00:00,01:23:45"),
            &framed("PBRTL,2,1,01.07.08,09:15:30,00:30:00"),
        ]);
    });
    let tracklogs = driver.pbrtl().unwrap();
    assert_eq!(tracklogs.len(), 2);
    assert_eq!(tracklogs[0].count, 2);
    assert_eq!(tracklogs[0].index, 0);
    assert_eq!(tracklogs[0].dt, Utc.with_ymd_and_hms(2008, 7, 1, 10, 0, 0).unwrap());
    assert_eq!(tracklogs[0].duration, chrono::Duration::seconds(5025));
    assert_eq!(tracklogs[1].dt, Utc.with_ymd_and_hms(2008, 7, 1, 9, 15, 30).unwrap());
}

#[test]
/// A memory page echoes its address and decodes hex byte fields.
fn test_pbrmemr_page() {
    let mut driver = driver_with(|port| {
        port.push_response(&[&framed("PBRMEMR,0010,00,01,FF,7F,80,AA,55,10")]);
    });
    let page = driver.pbrmemr(0x10).unwrap();
    assert_eq!(page, vec![0x00, 0x01, 0xff, 0x7f, 0x80, 0xaa, 0x55, 0x10]);
}

#[test]
/// A short page at the tail of the address space is tolerated.
fn test_pbrmemr_short_page() {
    let mut driver = driver_with(|port| {
        port.push_response(&[&framed("PBRMEMR,015C,01,02,03,04")]);
    });
    assert_eq!(driver.pbrmemr(0x15c).unwrap(), vec![1, 2, 3, 4]);
}

#[test]
/// An echoed address that differs from the request is fatal.
fn test_pbrmemr_address_mismatch() {
    let mut driver = driver_with(|port| {
        port.push_response(&[&framed("PBRMEMR,0018,00,01,02,03,04,05,06,07")]);
    });
    assert!(matches!(
        driver.pbrmemr(0x10),
        Err(FlytecError::Protocol(ProtocolError::AddressMismatch {
            requested: 0x10,
            echoed: 0x18,
        }))
    ));
}

#[test]
/// Tracklog bodies concatenate opaque blocks, newlines included.
fn test_pbrtr_concatenates_blocks() {
    let mut driver = driver_with(|port| {
        port.push_read(&[XOFF]);
        port.push_read(b"AFLY042 igc header\r\nB1000004612345N00612345EA\r\n");
        port.push_read(b"B1000054612346N00612346EA\r\n");
        port.push_read(&[XON]);
    });
    let body = driver.pbrtr(7).unwrap();
    assert_eq!(
        body,
        b"AFLY042 igc header\r\nB1000004612345N00612345EA\r\nB1000054612346N00612346EA\r\n"
    );
    let expected = codec::encode("PBRTR,07").unwrap();
    assert_eq!(driver.io.port.written(), expected.into_bytes());
}

#[test]
/// Missing XOFF acknowledgement fails the command and flushes the port.
fn test_missing_xoff_flushes() {
    let mut driver = driver_with(|port| {
        port.push_read(&framed("PBRSNP,COMPEO,Tom,000042,1.16"));
    });
    assert!(matches!(
        driver.pbrsnp(),
        Err(FlytecError::Protocol(ProtocolError::MissingXoff))
    ));
    assert_eq!(driver.io.port.flushes, 1);
}

#[test]
/// A second XOFF in the payload stream means the XON never came.
fn test_missing_xon() {
    let mut driver = driver_with(|port| {
        port.push_read(&[XOFF]);
        port.push_read(&[XOFF]);
    });
    assert!(matches!(
        driver.pbrsnp(),
        Err(FlytecError::Protocol(ProtocolError::MissingXon))
    ));
}

#[test]
/// A payload line failing the command grammar is an unexpected line.
fn test_unexpected_line() {
    let mut driver = driver_with(|port| {
        port.push_response(&[&framed("PBRWPS,garbage")]);
    });
    assert!(matches!(
        driver.pbrwps(),
        Err(FlytecError::Protocol(ProtocolError::UnexpectedLine(_)))
    ));
}

#[test]
/// A read timeout mid-response surfaces as a transport error.
fn test_timeout_mid_response() {
    let mut driver = driver_with(|port| {
        port.push_read(&[XOFF]);
        port.push_error(TransportError::Timeout);
    });
    assert!(matches!(
        driver.pbrwps(),
        Err(FlytecError::Transport(TransportError::Timeout))
    ));
    assert_eq!(driver.io.port.flushes, 1);
}

#[test]
/// Action commands pad their name argument to the fixed field width.
fn test_delete_commands_pad_names() {
    let mut driver = driver_with(|port| {
        port.push_response(&[]);
        port.push_response(&[]);
    });
    driver.pbrrtx("Alps").unwrap();
    driver.pbrwpx(Some("Long name")).unwrap();
    let rtx = codec::encode("PBRRTX,Alps             ").unwrap();
    let wpx = codec::encode("PBRWPX,Long name        ").unwrap();
    assert_eq!(driver.io.port.writes[0], rtx.into_bytes());
    assert_eq!(driver.io.port.writes[1], wpx.into_bytes());
}

#[test]
/// An action command that produces payload is refused.
fn test_action_with_payload_is_error() {
    let mut driver = driver_with(|port| {
        port.push_response(&[&framed("PBRRTX,denied")]);
    });
    assert!(matches!(
        driver.pbrrtx("Alps"),
        Err(FlytecError::Protocol(ProtocolError::UnexpectedLine(_)))
    ));
}
