//! Incremental newline-delimited decoding of the upstream body.
//!
//! Framing is done on raw bytes: `\n` never occurs inside a multi-byte UTF-8
//! sequence, so a character split across two reads simply stays in the buffer
//! until its line is complete. Each complete line is handed out both as the
//! exact upstream bytes (for verbatim forwarding) and as text.

use bytes::{Bytes, BytesMut};

/// One complete line of the upstream body, without its `\n`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    raw: Bytes,
}

impl Line {
    fn new(raw: Bytes) -> Self {
        Self { raw }
    }

    /// The exact bytes received from upstream
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// The line as text; invalid UTF-8 is replaced rather than rejected
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    /// Whether the line holds only whitespace
    pub fn is_blank(&self) -> bool {
        self.raw.iter().all(|b| b.is_ascii_whitespace())
    }
}

/// Accumulates chunks and yields complete lines
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every line it completes.
    ///
    /// The incomplete tail stays buffered for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Line> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(newline + 1);
            line.truncate(newline);
            lines.push(Line::new(line.freeze()));
        }
        lines
    }

    /// Bytes currently held back waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Consume the decoder, returning the unterminated trailing fragment if it
    /// holds anything but whitespace.
    pub fn finish(self) -> Option<Line> {
        let line = Line::new(self.buffer.freeze());
        if line.is_blank() {
            None
        } else {
            Some(line)
        }
    }
}
