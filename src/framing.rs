//! Line framing for the channel's byte stream.
//!
//! A TCP read can carry half a frame or several frames at once, so inbound
//! bytes are buffered and split on `\n`. A trailing `\r` is stripped and
//! blank lines are skipped. The partial remainder of a read is carried over
//! to the next one.

use crate::error::ParseError;
use bytes::{Buf, BytesMut};

/// Default upper bound for a single frame (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug)]
pub struct LineDecoder {
    buffer: BytesMut,
    max_frame_len: usize,
    /// Bytes before this offset are known to hold no newline.
    next_index: usize,
    /// Set after an overlong line was reported; bytes are skipped until the
    /// next newline.
    discarding: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl LineDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_len,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes held for an incomplete line.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete line, `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<String, ParseError>> {
        loop {
            let Some(offset) = self.buffer[self.next_index..]
                .iter()
                .position(|&b| b == b'\n')
            else {
                self.next_index = self.buffer.len();
                return self.check_overflow();
            };
            let newline_pos = self.next_index + offset;
            self.next_index = 0;

            let mut line = self.buffer.split_to(newline_pos + 1);

            if self.discarding {
                // Tail of an overlong line that was already reported.
                self.discarding = false;
                continue;
            }

            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.len() > self.max_frame_len {
                return Some(Err(ParseError::FrameTooLong {
                    max: self.max_frame_len,
                }));
            }

            if line.is_empty() {
                continue;
            }

            return Some(to_frame(&line));
        }
    }

    /// Flushes whatever is left once the peer closed the stream. A
    /// non-empty unterminated remainder is treated as a final frame.
    pub fn finish(&mut self) -> Option<Result<String, ParseError>> {
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            self.buffer.clear();
            return None;
        }

        let mut rest = self.buffer.split();
        if rest.last() == Some(&b'\r') {
            rest.truncate(rest.len() - 1);
        }
        if rest.is_empty() {
            return None;
        }
        if rest.len() > self.max_frame_len {
            return Some(Err(ParseError::FrameTooLong {
                max: self.max_frame_len,
            }));
        }
        Some(to_frame(&rest))
    }

    fn check_overflow(&mut self) -> Option<Result<String, ParseError>> {
        // A trailing CR may still be completed by its LF
        let pending = match self.buffer.last() {
            Some(b'\r') => self.buffer.len() - 1,
            _ => self.buffer.len(),
        };
        if pending <= self.max_frame_len {
            return None;
        }

        let already_reported = self.discarding;
        self.buffer.advance(self.buffer.len());
        self.next_index = 0;
        self.discarding = true;

        if already_reported {
            None
        } else {
            Some(Err(ParseError::FrameTooLong {
                max: self.max_frame_len,
            }))
        }
    }
}

fn to_frame(line: &[u8]) -> Result<String, ParseError> {
    std::str::from_utf8(line)
        .map(str::to_string)
        .map_err(|_| ParseError::InvalidUtf8)
}
