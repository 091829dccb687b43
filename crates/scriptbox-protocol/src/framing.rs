//! NUL-delimited record framing.
//!
//! Every record on the wire is a JSON document followed by a single `0x00`
//! byte. There is no length prefix: a record may span several reads and a
//! single read may carry several records.

use std::mem;

use serde::Serialize;

use crate::error::ProtocolError;

/// Sentinel byte terminating every record.
pub const DELIMITER: u8 = 0x00;

/// Default upper bound for a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Render a value as a wire record: JSON followed by one delimiter byte.
///
/// JSON string escaping turns any NUL inside the value into `\u0000`, so the
/// delimiter never occurs inside the payload.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(value).map_err(ProtocolError::Encode)?;
    bytes.push(DELIMITER);
    Ok(bytes)
}

/// Incremental decoder accumulating bytes until a delimiter is seen.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_bytes: usize,
    /// Set once the current frame overflowed; bytes are dropped until the
    /// next delimiter.
    overflowed: bool,
}

impl FrameDecoder {
    /// Create a decoder with the default frame limit.
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Create a decoder that rejects frames larger than `max_frame_bytes`.
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_bytes,
            overflowed: false,
        }
    }

    /// Feed a chunk of bytes, returning every frame it completes, in order.
    ///
    /// Bytes after the last delimiter stay buffered for the next call.
    /// Empty frames (two delimiters in a row) are skipped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Vec<u8>, ProtocolError>> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(idx) = rest.iter().position(|&b| b == DELIMITER) {
            self.accumulate(&rest[..idx]);
            if let Some(frame) = self.finish_frame() {
                frames.push(frame);
            }
            rest = &rest[idx + 1..];
        }
        self.accumulate(rest);

        frames
    }

    /// Number of bytes buffered for the frame in progress.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn accumulate(&mut self, bytes: &[u8]) {
        if self.overflowed || bytes.is_empty() {
            return;
        }
        if self.buffer.len() + bytes.len() > self.max_frame_bytes {
            self.overflowed = true;
            self.buffer = Vec::new();
            return;
        }
        self.buffer.extend_from_slice(bytes);
    }

    fn finish_frame(&mut self) -> Option<Result<Vec<u8>, ProtocolError>> {
        if mem::take(&mut self.overflowed) {
            return Some(Err(ProtocolError::FrameTooLarge {
                limit: self.max_frame_bytes,
            }));
        }
        if self.buffer.is_empty() {
            return None;
        }
        Some(Ok(mem::take(&mut self.buffer)))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
