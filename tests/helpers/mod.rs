//! Test doubles simulating the instrument end of the serial line during
//! integration tests.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flytecfs::error::TransportError;
use flytecfs::infra::codec;
use flytecfs::infra::serial::{RawPort, XOFF, XON};

/// Shared script state: queued read chunks and recorded writes.
#[derive(Default)]
pub struct DeviceScript {
    pub reads: VecDeque<Vec<u8>>,
    pub writes: Vec<Vec<u8>>,
    pub flushes: usize,
}

impl DeviceScript {
    /// Queue a complete sentence response: XOFF, one framed sentence per
    /// payload, then XON. Chunks are served one per read call.
    pub fn respond(&mut self, payloads: &[&str]) {
        self.reads.push_back(vec![XOFF]);
        for payload in payloads {
            self.reads
                .push_back(codec::encode(payload).unwrap().into_bytes());
        }
        self.reads.push_back(vec![XON]);
    }

    /// Queue a binary-opaque response bracketed by XOFF/XON.
    pub fn respond_blocks(&mut self, blocks: &[&[u8]]) {
        self.reads.push_back(vec![XOFF]);
        for block in blocks {
            self.reads.push_back(block.to_vec());
        }
        self.reads.push_back(vec![XON]);
    }

    /// Payloads of every command sentence written so far.
    pub fn commands(&self) -> Vec<String> {
        self.writes
            .iter()
            .map(|frame| codec::decode(frame).expect("host wrote a malformed frame"))
            .collect()
    }
}

/// In-memory serial port backed by a shared [`DeviceScript`]. The script
/// handle stays with the test while the port moves into the driver (and
/// from there into the proxy worker thread).
pub struct ScriptedPort(Arc<Mutex<DeviceScript>>);

impl ScriptedPort {
    pub fn new() -> (Self, Arc<Mutex<DeviceScript>>) {
        let script = Arc::new(Mutex::new(DeviceScript::default()));
        (Self(Arc::clone(&script)), script)
    }
}

impl RawPort for ScriptedPort {
    fn read(&mut self, _n: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.0
            .lock()
            .unwrap()
            .reads
            .pop_front()
            .ok_or(TransportError::Timeout)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.0.lock().unwrap().writes.push(data.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        let mut script = self.0.lock().unwrap();
        script.flushes += 1;
        script.reads.clear();
        Ok(())
    }
}
