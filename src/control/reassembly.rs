//! Splits the control byte stream back into JSON documents.
//!
//! The peer writes self-delimiting documents back to back with no framing,
//! so a single read may carry several documents or part of one.

use crate::protocol::ControlMessage;

/// Size of the reassembly window.
pub const STREAM_CAPACITY: usize = 8192;
/// Largest single read from the control stream.
pub const READ_CHUNK: usize = 4096;

/// Fixed-capacity window of not yet parsed control bytes.
pub struct Reassembler {
    buf: Vec<u8>,
    len: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_capacity(STREAM_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(1)],
            len: 0,
        }
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Free tail of the window, at most [`READ_CHUNK`] bytes long.
    ///
    /// When the window is full the oldest byte is evicted to make room.
    pub fn spare(&mut self) -> &mut [u8] {
        if self.len == self.buf.len() {
            self.buf.copy_within(1.., 0);
            self.len -= 1;
            log::warn!("Control: reassembly window full, oldest byte evicted");
        }
        let end = (self.len + READ_CHUNK).min(self.buf.len());
        &mut self.buf[self.len..end]
    }

    /// Marks `n` bytes of [`spare`](Self::spare) as filled.
    pub fn commit(&mut self, n: usize) {
        self.len = (self.len + n).min(self.buf.len());
    }

    /// Appends `bytes` and returns every document that became complete.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Vec<ControlMessage> {
        let mut messages = Vec::new();
        while !bytes.is_empty() {
            let spare = self.spare();
            let n = spare.len().min(bytes.len());
            spare[..n].copy_from_slice(&bytes[..n]);
            self.commit(n);
            bytes = &bytes[n..];
            messages.extend(self.by_ref());
        }
        messages
    }

    /// Parses the next complete document at the front of the window.
    ///
    /// Documents that are valid JSON but not control messages are skipped.
    /// An incomplete or malformed document stays in the window.
    pub fn next_message(&mut self) -> Option<ControlMessage> {
        loop {
            let value = self.next_value()?;
            match serde_json::from_value::<ControlMessage>(value) {
                Ok(message) => return Some(message),
                Err(e) => log::debug!("Control: ignoring unrecognized document: {}", e),
            }
        }
    }

    fn next_value(&mut self) -> Option<serde_json::Value> {
        let window = &self.buf[..self.len];
        let mut stream = serde_json::Deserializer::from_slice(window).into_iter::<serde_json::Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                self.consume(consumed);
                Some(value)
            }
            None => {
                // Only whitespace left.
                self.len = 0;
                None
            }
            Some(Err(e)) if e.is_eof() => {
                log::trace!("Control: incomplete document ({} bytes pending)", self.len);
                None
            }
            Some(Err(e)) => {
                log::debug!("Control: malformed document: {}", e);
                None
            }
        }
    }

    fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for Reassembler {
    type Item = ControlMessage;

    fn next(&mut self) -> Option<ControlMessage> {
        self.next_message()
    }
}
