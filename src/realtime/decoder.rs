//! Envelope Decoder
//!
//! Turns the raw byte stream into typed [`Event`]s in three stages:
//!
//! - [`FrameGuard`] cuts the bytes at blank lines and only lets through
//!   complete blocks that are valid UTF-8 and within [`MAX_FRAME_BYTES`].
//!   Anything else is dropped and logged; later frames are unaffected.
//! - [`frames`] runs the guarded text through `eventsource-stream`, which
//!   owns the `event:`/`data:` field syntax, and yields one [`Frame`] per
//!   dispatched block.
//! - [`decode_frame`] maps the event tag onto an [`EventKind`] and parses the
//!   data as JSON of the matching shape.
//!
//! Comment lines (keep-alives), `id:` and `retry:` fields never reach the
//! handlers. The server-suggested retry interval is not honoured; reconnect
//! timing is owned by the backoff policy.

use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt, TryStreamExt};
use std::pin::Pin;
use thiserror::Error;

use super::messages::{Event, EventKind, EventPayload, Frame};
use super::transport::{ByteStream, TransportError};

/// Largest frame accepted from the server
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Frames of an open stream, in arrival order
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// Cut a stream body into frames
///
/// Transport errors pass through unchanged; frames that cannot be read are
/// dropped and logged without ending the stream.
pub fn frames(body: ByteStream) -> FrameStream {
    let mut guard = FrameGuard::new();
    body.map_ok(move |chunk| guard.feed(&chunk))
        .eventsource()
        .filter_map(|item| async move {
            match item {
                Ok(event) => Some(Ok(Frame::new(event.event, event.data))),
                Err(EventStreamError::Transport(e)) => Some(Err(e)),
                Err(e) => {
                    tracing::error!(error = ?e, "Dropping unreadable frame");
                    None
                }
            }
        })
        .boxed()
}

/// Splits bytes into complete blocks and drops the unreadable ones
///
/// A block runs up to and including the blank line that ends it. Line
/// endings may be `\n`, `\r\n` or `\r`, split across chunks anywhere.
#[derive(Debug)]
pub struct FrameGuard {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already scanned for line endings
    scanned: usize,
    /// No bytes seen since the last line ending
    line_start: bool,
    /// Dropping the rest of an oversized block
    skipping: bool,
    max_frame_bytes: usize,
}

impl Default for FrameGuard {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }
}

impl FrameGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            line_start: true,
            skipping: false,
            max_frame_bytes,
        }
    }

    /// Feed a chunk of bytes, returning the text of every block it completed
    pub fn feed(&mut self, chunk: &[u8]) -> String {
        self.buffer.extend_from_slice(chunk);

        let mut text = String::new();
        let mut block_start = 0;
        let mut pos = self.scanned;
        while pos < self.buffer.len() {
            let eol = match self.buffer[pos] {
                b'\n' => 1,
                b'\r' => match self.buffer.get(pos + 1) {
                    Some(b'\n') => 2,
                    Some(_) => 1,
                    // Might be the first half of `\r\n`
                    None => break,
                },
                _ => {
                    self.line_start = false;
                    pos += 1;
                    continue;
                }
            };
            pos += eol;
            if self.line_start {
                self.finish_block(block_start, pos, &mut text);
                block_start = pos;
            }
            self.line_start = true;
        }

        self.buffer.drain(..block_start);
        self.scanned = pos - block_start;

        if self.buffer.len() > self.max_frame_bytes {
            tracing::error!(
                pending = self.buffer.len(),
                limit = self.max_frame_bytes,
                "Dropping oversized frame"
            );
            self.buffer.clear();
            self.scanned = 0;
            self.skipping = true;
        }
        text
    }

    fn finish_block(&mut self, start: usize, end: usize, text: &mut String) {
        if self.skipping {
            self.skipping = false;
            return;
        }
        match std::str::from_utf8(&self.buffer[start..end]) {
            Ok(block) => text.push_str(block),
            Err(e) => {
                tracing::error!(error = %e, "Dropping frame with invalid UTF-8");
            }
        }
    }
}

/// A frame whose payload could not be turned into structured data
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed {kind} payload: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode one frame into a typed event
///
/// Unknown tags still decode (as [`EventKind::Other`]) as long as their data
/// is valid JSON.
pub fn decode_frame(frame: &Frame) -> Result<Event, DecodeError> {
    let kind = EventKind::from(frame.event.as_str());
    let data = frame.data.as_str();

    let payload = match &kind {
        EventKind::Connected => serde_json::from_str(data).map(EventPayload::Connected),
        EventKind::RatesUpdated => serde_json::from_str(data).map(EventPayload::RatesUpdated),
        EventKind::AlertTriggered => {
            serde_json::from_str(data).map(EventPayload::AlertTriggered)
        }
        EventKind::Other(_) => serde_json::from_str(data).map(EventPayload::Other),
    };

    match payload {
        Ok(payload) => Ok(Event { kind, payload }),
        Err(source) => Err(DecodeError::Payload { kind, source }),
    }
}
