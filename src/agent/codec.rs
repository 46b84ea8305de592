//! Line framing for agent stdout and stderr.
//!
//! Agent output is mostly UTF-8 but may carry arbitrary bytes from tool
//! output or binary diffs. [`OutputLineCodec`] therefore never fails on
//! content: invalid sequences are replaced with U+FFFD and over-long lines
//! are dropped. The stream only ends when the pipe does, so the agent never
//! writes into a closed pipe while it is still alive.

use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::warn;

/// Maximum accepted length of one line of agent output: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited, lossy UTF-8 decoder for agent output.
///
/// A line longer than the limit is skipped up to its terminating newline
/// and a warning is logged. Only I/O failures of the underlying reader
/// surface as errors.
#[derive(Debug)]
pub struct OutputLineCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl OutputLineCodec {
    /// Codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Codec accepting lines of at most `max_length` bytes.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for OutputLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for OutputLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        loop {
            let read_to = src.len().min(self.max_length.saturating_add(1));
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|byte| *byte == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    src.advance(self.next_index + offset + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    if src.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = src.split_to(end + 1);
                    return Ok(Some(lossy_line(&line[..end])));
                }
                (false, None) if src.len() > self.max_length => {
                    warn!(limit = self.max_length, "agent output line exceeded limit, skipped");
                    self.next_index = 0;
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if self.discarding || src.is_empty() {
            self.discarding = false;
            src.clear();
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(Some(lossy_line(&rest)))
    }
}

fn lossy_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
