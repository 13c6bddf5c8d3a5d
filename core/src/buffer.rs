//! Input buffering and line framing
//!
//! Each connection accumulates raw bytes here until complete protocol lines
//! can be extracted. The buffer keeps only a trailing window of unprocessed
//! input so an endless unterminated stream cannot grow server memory.

/// Maximum accepted protocol line length in bytes, terminator excluded.
pub const MAX_LINE_LEN: usize = 512;

/// Cap on buffered unprocessed input. When exceeded, the oldest bytes are
/// dropped; this is garbage protection, not a framing guarantee.
pub const MAX_INBUF: usize = 8192;

/// Accumulates raw input for one connection and frames it into lines.
///
/// Lines are terminated by CRLF, with a bare LF accepted as a fallback.
/// The terminator is stripped from extracted lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append raw bytes, retaining at most the most recent [`MAX_INBUF`] bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_INBUF {
            let excess = self.buf.len() - MAX_INBUF;
            self.buf.drain(..excess);
            tracing::debug!("input buffer over {} bytes, dropped {} oldest bytes", MAX_INBUF, excess);
        }
    }

    /// Extract the next terminated line from the front of the buffer, or
    /// `None` when no terminator is buffered yet. Oversized lines are still
    /// returned in full; length policy is enforced at dispatch.
    ///
    /// Returns the decoded text together with the line's wire length in
    /// bytes, terminator excluded. The two differ when invalid bytes were
    /// replaced during decoding, so length limits must use the wire length.
    pub fn next_line(&mut self) -> Option<(String, usize)> {
        let nl = self.buf.iter().position(|&b| b == b'\n')?;
        let mut end = nl;
        if end > 0 && self.buf[end - 1] == b'\r' {
            end -= 1;
        }
        let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.drain(..=nl);
        Some((line, end))
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
