//! Scripted serial port double used by the transport and driver tests.
use std::collections::VecDeque;
use std::time::Duration;

use super::RawPort;
use crate::error::TransportError;

/// In-memory port replaying a fixed sequence of read results and
/// recording every write. Each queued chunk is served by one `read`
/// call, mirroring how the kernel hands back at most what is pending.
pub struct ScriptedPort {
    pub reads: VecDeque<Result<Vec<u8>, TransportError>>,
    pub writes: Vec<Vec<u8>>,
    pub flushes: usize,
}

impl ScriptedPort {
    pub fn new() -> Self {
        Self {
            reads: VecDeque::new(),
            writes: Vec::new(),
            flushes: 0,
        }
    }

    /// Queue one raw chunk.
    pub fn push_read(&mut self, chunk: &[u8]) {
        self.reads.push_back(Ok(chunk.to_vec()));
    }

    /// Queue a transport failure.
    pub fn push_error(&mut self, error: TransportError) {
        self.reads.push_back(Err(error));
    }

    /// Queue a complete device response: XOFF, the given pre-framed
    /// chunks, then XON. Chunks are delivered one per read.
    pub fn push_response(&mut self, chunks: &[&[u8]]) {
        self.push_read(&[super::XOFF]);
        for chunk in chunks {
            self.push_read(chunk);
        }
        self.push_read(&[super::XON]);
    }

    /// All written bytes, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.writes.concat()
    }
}

impl RawPort for ScriptedPort {
    fn read(&mut self, _n: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.reads.pop_front().unwrap_or(Err(TransportError::Timeout))
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.writes.push(data.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.flushes += 1;
        Ok(())
    }
}
