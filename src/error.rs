//! Error definitions shared across library modules.
//! Each enum models one failure domain (sentence framing, serial transport,
//! device protocol, proxy plumbing, emission, filesystem semantics).
//!
//! Everything that can travel through the serial proxy is `Clone`: a result
//! stored in the proxy's memo table is handed back to every waiter of the
//! same request.
use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Errors raised while framing or deframing an NMEA-0183 sentence.
pub enum NmeaError {
    /// Payload is empty, longer than 79 bytes, or contains a byte outside
    /// the printable ASCII range 0x20-0x7E.
    #[error("payload is not a valid NMEA sentence body")]
    InvalidPayload,
    /// The frame does not match `$PAYLOAD*HH\r\n`.
    #[error("malformed NMEA frame")]
    Malformed,
    /// The transmitted checksum differs from the XOR over the payload.
    #[error("NMEA checksum mismatch")]
    BadChecksum,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Errors surfaced by the raw serial port and its stream decoders.
pub enum TransportError {
    /// `select(2)` returned no readable descriptor within the deadline.
    #[error("serial read timed out")]
    Timeout,
    /// The descriptor is readable but `read(2)` returned zero bytes.
    #[error("end of file on serial port")]
    Eof,
    /// The port accepted fewer bytes than offered.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    /// Errno bubbled up from the OS.
    #[error("serial port error: {0}")]
    Sys(Errno),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Violations of the PBR* request/response state machine.
pub enum ProtocolError {
    /// A payload line does not match the grammar of the running command.
    #[error("unexpected line: {0:?}")]
    UnexpectedLine(String),
    /// `PBRMEMR` echoed a different address than the one requested.
    #[error("memory read echoed address {echoed:#06x}, requested {requested:#06x}")]
    AddressMismatch { requested: u16, echoed: u16 },
    /// The device never terminated its response with XON.
    #[error("missing XON response terminator")]
    MissingXon,
    /// The device did not acknowledge the command with XOFF.
    #[error("missing XOFF acknowledgement")]
    MissingXoff,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Failures in the serialization proxy itself, as opposed to the device.
pub enum ProxyError {
    /// The worker thread is gone; no further device calls are possible.
    #[error("serial proxy worker exited")]
    Disconnected,
    /// The worker answered with a response variant that does not match the
    /// request. Indicates a dispatch bug, not a device fault.
    #[error("response variant does not match request")]
    UnexpectedResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Umbrella error for every device-bound operation.
pub enum FlytecError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Nmea(#[from] NmeaError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Errors building a read-only artifact (GPX document, ZIP archive).
pub enum EmitError {
    /// A routepoint names a waypoint that is not on the device.
    #[error("waypoint {0:?} is not on the device")]
    UnresolvedWaypoint(String),
    /// `close_tag`/`finish` called with an unbalanced element stack.
    #[error("unbalanced XML element stack")]
    Unbalanced,
    /// The ZIP writer refused the archive.
    #[error("zip emission failed: {0}")]
    Zip(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Errors ingesting an external waypoint file.
pub enum ParseError {
    #[error("malformed GPX input: {0}")]
    Gpx(String),
}

#[derive(Debug, Error)]
/// Filesystem-facing error, carrying everything the FUSE layer must map to
/// an errno.
pub enum FsError {
    /// Path resolution failed.
    #[error("no such entry")]
    NotFound,
    /// The entity exists but refuses the operation (read-only entity,
    /// reserved route, waypoint still referenced by a route).
    #[error("operation not permitted")]
    PermissionDenied,
    /// A regular file was opened with anything but read-only flags.
    #[error("access denied")]
    AccessDenied,
    #[error(transparent)]
    Device(#[from] FlytecError),
    #[error(transparent)]
    Emit(#[from] EmitError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Cache bookkeeping failure that cannot be swallowed (rename
    /// persistence, unlink of cache artifacts).
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Map onto the errno reported through the FUSE reply.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::PermissionDenied => libc::EPERM,
            FsError::AccessDenied => libc::EACCES,
            FsError::Device(_) | FsError::Emit(_) | FsError::Parse(_) | FsError::Io(_) => {
                libc::EIO
            }
        }
    }
}
