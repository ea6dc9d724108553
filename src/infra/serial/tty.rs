//! Production serial port: a raw-mode, non-blocking tty at 57600 8N1 with
//! select-bounded reads.
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use nix::fcntl::{self, OFlag};
use nix::sys::select::{select, FdSet};
use nix::sys::stat::Mode;
use nix::sys::termios::{
    self, cfmakeraw, cfsetispeed, cfsetospeed, BaudRate, FlushArg, SetArg,
};
use nix::sys::time::{TimeVal, TimeValLike};
use nix::unistd;

use super::RawPort;
use crate::error::TransportError;

/// Exclusive handle on the instrument's serial line.
pub struct TtyPort {
    fd: OwnedFd,
}

impl TtyPort {
    /// Open the device path without becoming its controlling terminal,
    /// switch it to raw mode at 57600 baud, and flush both directions.
    pub fn open(path: &Path) -> Result<Self, TransportError> {
        let raw = fcntl::open(
            path,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(TransportError::Sys)?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let mut attrs = termios::tcgetattr(&fd).map_err(TransportError::Sys)?;
        cfmakeraw(&mut attrs);
        cfsetispeed(&mut attrs, BaudRate::B57600).map_err(TransportError::Sys)?;
        cfsetospeed(&mut attrs, BaudRate::B57600).map_err(TransportError::Sys)?;
        termios::tcsetattr(&fd, SetArg::TCSAFLUSH, &attrs).map_err(TransportError::Sys)?;
        Ok(Self { fd })
    }
}

impl RawPort for TtyPort {
    fn read(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut readfds = FdSet::new();
        readfds.insert(self.fd.as_fd());
        let mut deadline = TimeVal::milliseconds(timeout.as_millis() as i64);
        let ready = select(
            self.fd.as_raw_fd() + 1,
            Some(&mut readfds),
            None,
            None,
            Some(&mut deadline),
        )
        .map_err(TransportError::Sys)?;
        if ready == 0 {
            return Err(TransportError::Timeout);
        }
        let mut buffer = vec![0u8; n];
        let count = unistd::read(self.fd.as_raw_fd(), &mut buffer).map_err(TransportError::Sys)?;
        if count == 0 {
            return Err(TransportError::Eof);
        }
        buffer.truncate(count);
        Ok(buffer)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let written = unistd::write(self.fd.as_fd(), data).map_err(TransportError::Sys)?;
        if written != data.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        termios::tcflush(self.fd.as_fd(), FlushArg::TCIOFLUSH).map_err(TransportError::Sys)
    }
}
