//! Line framing over a chunked byte stream

use std::collections::VecDeque;

/// Splits pushed byte chunks into logical lines.
///
/// A line ends at `\n`; one trailing `\r` is stripped. Bytes after the last
/// `\n` stay buffered until the next [`push`](Self::push), so a line split
/// across reads comes out whole. There is no line length cap.
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: Vec<u8>,
    ready: VecDeque<String>,
}

impl LineFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk as received from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        let mut rest = chunk;
        while let Some(pos) = rest
            .iter()
            .position(|&b| b == b'\n')
        {
            self.partial
                .extend_from_slice(&rest[..pos]);
            let mut line = std::mem::take(&mut self.partial);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.ready
                .push_back(decode_line(line));
            rest = &rest[pos + 1..];
        }
        self.partial
            .extend_from_slice(rest);
    }

    /// Pop the next complete line, if any.
    pub fn next_line(&mut self) -> Option<String> {
        self.ready
            .pop_front()
    }

    /// Take every complete line buffered so far.
    pub fn drain_lines(&mut self) -> impl Iterator<Item = String> + '_ {
        self.ready
            .drain(..)
    }

    /// Bytes of an unterminated trailing line.
    pub fn pending_bytes(&self) -> usize {
        self.partial
            .len()
    }

    /// Drop all buffered state (used when a socket is replaced).
    pub fn reset(&mut self) {
        self.partial
            .clear();
        self.ready
            .clear();
    }
}

/// The protocol is ASCII; anything else is decoded lossily rather than failing
/// the whole stream.
fn decode_line(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}
