//! Incremental decoder for blank-line delimited event frames.

use std::marker::PhantomData;

use tracing::{debug, warn};

use super::event::StreamEvent;

/// Maximum number of payload characters quoted when a frame is skipped.
const MAX_PREVIEW_LENGTH: usize = 120;

/// Frames larger than this are dropped instead of buffered.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Splits raw network chunks into frames and decodes their payloads.
///
/// The parser does no I/O. Bytes are appended to an internal buffer, every
/// complete frame (terminated by a blank line) is decoded, and a trailing
/// partial frame stays buffered until the next chunk arrives.
#[derive(Debug)]
pub struct FrameParser<E> {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a boundary.
    scanned: usize,
    max_frame_bytes: usize,
    /// Set while dropping the rest of an oversized frame.
    discarding: bool,
    skipped: u64,
    _event: PhantomData<fn() -> E>,
}

impl<E: StreamEvent> FrameParser<E> {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_frame_bytes: max_frame_bytes.max(2),
            discarding: false,
            skipped: 0,
            _event: PhantomData,
        }
    }

    /// Appends a chunk and returns the events of every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<E> {
        // Carriage returns are dropped so CRLF streams split like LF streams.
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = find_boundary(&self.buffer, self.scanned) {
            let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            self.scanned = 0;
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if let Some(event) = self.decode(&frame[..end]) {
                events.push(event);
            }
        }

        // A boundary may straddle the next chunk, so the last byte is rescanned.
        self.scanned = self.buffer.len().saturating_sub(1);
        if self.discarding || self.buffer.len() > self.max_frame_bytes {
            self.drop_oversized();
        }
        events
    }

    /// Decodes whatever is left in the buffer as a final frame.
    ///
    /// Used when the connection closes without a trailing blank line.
    pub fn finish(&mut self) -> Option<E> {
        let frame = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) || frame.is_empty() {
            return None;
        }
        self.decode(&frame)
    }

    /// Number of frames discarded as malformed or oversized.
    pub fn skipped_frames(&self) -> u64 {
        self.skipped
    }

    /// Bytes currently held back waiting for the rest of a frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn drop_oversized(&mut self) {
        if !self.discarding {
            self.discarding = true;
            self.skipped += 1;
            warn!(limit = self.max_frame_bytes, "skipping oversized stream frame");
        }
        let trailing_newline = self.buffer.last() == Some(&b'\n');
        self.buffer.clear();
        if trailing_newline {
            self.buffer.push(b'\n');
        }
        self.scanned = 0;
    }

    fn decode(&mut self, frame: &[u8]) -> Option<E> {
        let text = String::from_utf8_lossy(frame);
        let payload = frame_payload(&text)?;

        match serde_json::from_str::<E>(&payload) {
            Ok(event) if event.is_handshake() => {
                debug!("stream handshake received");
                None
            }
            Ok(event) => Some(event),
            Err(e) => {
                self.skipped += 1;
                warn!(
                    error = %e,
                    payload = %preview(&payload),
                    "skipping malformed stream frame"
                );
                None
            }
        }
    }
}

impl<E: StreamEvent> Default for FrameParser<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the first `\n\n` at or after `from`.
fn find_boundary(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|pair| pair == b"\n\n")
        .map(|i| i + from)
}

/// Joins the `data:` lines of a frame. Returns `None` for frames without data
/// (comments, keep-alive padding).
fn frame_payload(frame: &str) -> Option<String> {
    let mut payload = String::new();
    let mut has_data = false;

    for line in frame.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            payload.push_str(value.strip_prefix(' ').unwrap_or(value));
            has_data = true;
        }
    }

    if has_data && !payload.trim().is_empty() {
        Some(payload)
    } else {
        None
    }
}

fn preview(payload: &str) -> String {
    if payload.chars().count() > MAX_PREVIEW_LENGTH {
        let truncated: String = payload.chars().take(MAX_PREVIEW_LENGTH).collect();
        format!("{}... (truncated)", truncated)
    } else {
        payload.to_string()
    }
}
