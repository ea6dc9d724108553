//! Serial transport: a raw-port abstraction plus the buffered stream
//! decoders that understand the instrument's in-band XON/XOFF markers.
//!
//! The port trait exists so the protocol driver can run against scripted
//! doubles in tests; the production implementation lives in [`tty`].
use std::time::Duration;

use log::debug;

use crate::error::TransportError;

pub mod tty;

#[cfg(test)]
pub(crate) mod testutil;

/// Flow/framing marker bracketing every device response.
pub const XON: u8 = 0x11;
/// Acknowledgement byte sent by the device before any payload.
pub const XOFF: u8 = 0x13;

/// Size of the refill reads issued by the stream decoders.
const REFILL: usize = 1024;

/// Contract for a byte-oriented serial port.
pub trait RawPort {
    /// Block up to `timeout` for at least one byte, returning up to `n`.
    /// Fails `Timeout` when nothing becomes readable and `Eof` when the
    /// descriptor reads zero bytes.
    fn read(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;
    /// Write the whole buffer. Fails `ShortWrite` when the port accepts
    /// fewer bytes than offered.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;
    /// Discard pending input and output.
    fn flush(&mut self) -> Result<(), TransportError>;
}

/// Buffered reader/writer over a [`RawPort`]. A single carry-over buffer
/// persists between calls; both decoders refill it in [`REFILL`]-byte
/// reads as needed.
pub struct SerialIo<P> {
    pub(crate) port: P,
    buffer: Vec<u8>,
}

impl<P: RawPort> SerialIo<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            buffer: Vec::new(),
        }
    }

    fn fill(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if self.buffer.is_empty() {
            self.buffer = self.port.read(REFILL, timeout)?;
        }
        Ok(())
    }

    /// Next `\n`-terminated chunk inclusive of the `\n`, EXCEPT when the
    /// first buffered byte is XON or XOFF, in which case that single byte
    /// is returned on its own.
    pub fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.fill(timeout)?;
        if self.buffer[0] == XON || self.buffer[0] == XOFF {
            let marker = self.buffer.remove(0);
            debug!("<< {}", escape(&[marker]));
            return Ok(vec![marker]);
        }
        let mut result = Vec::new();
        loop {
            match self.buffer.iter().position(|&byte| byte == b'\n') {
                Some(index) => {
                    result.extend(self.buffer.drain(..=index));
                    debug!("<< {}", escape(&result));
                    return Ok(result);
                }
                None => {
                    result.append(&mut self.buffer);
                    self.buffer = self.port.read(REFILL, timeout)?;
                }
            }
        }
    }

    /// Like [`read_line`](Self::read_line) but the chunk ends at the next
    /// XON boundary or at the end of the buffered data. Used for opaque
    /// binary payloads where `\n` may appear inside data.
    pub fn read_block(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.fill(timeout)?;
        if self.buffer[0] == XON || self.buffer[0] == XOFF {
            let marker = self.buffer.remove(0);
            debug!("<< {}", escape(&[marker]));
            return Ok(vec![marker]);
        }
        let result = match self.buffer.iter().position(|&byte| byte == XON) {
            Some(index) => self.buffer.drain(..index).collect(),
            None => std::mem::take(&mut self.buffer),
        };
        debug!("<< {}", escape(&result));
        Ok(result)
    }

    /// Transmit a fully framed sentence.
    pub fn write_line(&mut self, line: &[u8]) -> Result<(), TransportError> {
        debug!(">> {}", escape(line));
        self.port.write(line)
    }

    /// Discard buffered and in-flight bytes in both directions.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        self.buffer.clear();
        self.port.flush()
    }
}

/// Printable rendition of wire traffic for the debug log.
fn escape(bytes: &[u8]) -> String {
    bytes
        .iter()
        .flat_map(|byte| std::ascii::escape_default(*byte))
        .map(char::from)
        .collect()
}
