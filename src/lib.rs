//! `flytecfs` library: expose a Flytec/Brauniger flight instrument as a
//! read/write virtual filesystem. The crate is layered bottom-up:
//! infrastructure (NMEA framing, serial transport), protocol (PBR*
//! driver, serialization proxy), the revision-tracked cache, the
//! GPX/ZIP emitters and waypoint parsers, and the virtual tree with its
//! FUSE adapter.
//==================================================================================
/// Device data model shared across layers: identity, waypoints, routes,
/// tracklog headers, and naming helpers.
pub mod core;
/// Error enums for every failure domain.
pub mod error;
/// Sentence framing and raw serial transport.
pub mod infra;
/// PBR* command driver and the worker-thread serialization proxy.
pub mod protocol;
/// High-level cache: snapshots, revisions, gzip'd bodies, renames.
pub mod cache;
/// GPX emission and ingestion.
pub mod gpx;
/// `tracklogs.zip` emission.
pub mod archive;
/// External waypoint file parsers.
pub mod wpt;
/// Virtual directory tree and FUSE adapter.
pub mod vfs;
//==================================================================================
