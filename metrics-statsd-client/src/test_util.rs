use std::{io, sync::Arc, time::Duration};

use parking_lot::Mutex;

use crate::forwarder::{
    transport::{Connection, Dialer},
    RemoteAddr,
};

#[derive(Default)]
struct Recording {
    payloads: Vec<Vec<u8>>,
    probes: usize,
    dials: usize,
    closes: usize,
    failing_writes: usize,
    failing_dials: usize,
}

/// A dialer whose connections record every payload written to them.
///
/// Writes and dials can be made to fail a given number of times.
#[derive(Clone, Default)]
pub(crate) struct RecordingDialer {
    recording: Arc<Mutex<Recording>>,
}

impl RecordingDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` writes fail, including zero-length probes.
    pub fn fail_writes(&self, n: usize) {
        self.recording.lock().failing_writes = n;
    }

    /// Makes the next `n` dials fail.
    pub fn fail_dials(&self, n: usize) {
        self.recording.lock().failing_dials = n;
    }

    /// Returns every non-empty payload written so far, in order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.recording.lock().payloads.clone()
    }

    /// Returns every written byte, concatenated.
    pub fn bytes(&self) -> Vec<u8> {
        self.recording.lock().payloads.concat()
    }

    pub fn probes(&self) -> usize {
        self.recording.lock().probes
    }

    pub fn dials(&self) -> usize {
        self.recording.lock().dials
    }

    pub fn closes(&self) -> usize {
        self.recording.lock().closes
    }
}

impl Dialer for RecordingDialer {
    fn dial(&self, _: &RemoteAddr, _: Duration) -> io::Result<Box<dyn Connection>> {
        let mut recording = self.recording.lock();
        recording.dials += 1;
        if recording.failing_dials > 0 {
            recording.failing_dials -= 1;
            return Err(io::ErrorKind::ConnectionRefused.into());
        }

        Ok(Box::new(RecordingConnection { recording: Arc::clone(&self.recording) }))
    }
}

struct RecordingConnection {
    recording: Arc<Mutex<Recording>>,
}

impl Connection for RecordingConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut recording = self.recording.lock();
        if recording.failing_writes > 0 {
            recording.failing_writes -= 1;
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        if buf.is_empty() {
            recording.probes += 1;
        } else {
            recording.payloads.push(buf.to_vec());
        }
        Ok(())
    }

    fn set_write_timeout(&mut self, _: Duration) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.recording.lock().closes += 1;
        Ok(())
    }
}
