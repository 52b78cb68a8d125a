//! Scripted transport used in unit tests to emulate a half-duplex RS485 line.

use crate::scheduler::Transport;
use std::collections::VecDeque;
use std::io;

/// Answers each written frame with the next scripted response.
#[derive(Debug, Default)]
pub struct MockTransport {
    /// One entry per expected write, `None` simulates a silent device
    responses: VecDeque<Option<Vec<Vec<u8>>>>,
    /// Chunks waiting to be read, one chunk per `read_available` call
    pending: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    flow_control: Vec<bool>,
    should_error_on_write: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response delivered in one piece.
    pub fn respond(&mut self, bytes: &[u8]) -> &mut Self {
        self.responses.push_back(Some(vec![bytes.to_vec()]));
        self
    }

    /// Queue a response delivered in pieces of `chunk` bytes.
    pub fn respond_chunked(&mut self, bytes: &[u8], chunk: usize) -> &mut Self {
        self.responses
            .push_back(Some(bytes.chunks(chunk).map(<[u8]>::to_vec).collect()));
        self
    }

    /// Queue a write that never gets an answer.
    pub fn stay_silent(&mut self) -> &mut Self {
        self.responses.push_back(None);
        self
    }

    /// Bytes already waiting on the line before the next write.
    pub fn set_noise(&mut self, bytes: &[u8]) {
        self.pending.push_back(bytes.to_vec());
    }

    pub fn set_write_error(&mut self, should_error: bool) {
        self.should_error_on_write = should_error;
    }

    pub fn written_data(&self) -> &[Vec<u8>] {
        &self.written
    }

    pub fn flow_control_changes(&self) -> &[bool] {
        &self.flow_control
    }
}

impl Transport for MockTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.should_error_on_write {
            return Err(io::Error::other("simulated write error"));
        }
        self.written.push(bytes.to_vec());
        if let Some(Some(chunks)) = self.responses.pop_front() {
            self.pending.extend(chunks);
        }
        Ok(())
    }

    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        Ok(self.pending.pop_front().unwrap_or_default())
    }

    fn set_flow_control(&mut self, transmit: bool) -> io::Result<()> {
        self.flow_control.push(transmit);
        Ok(())
    }
}
