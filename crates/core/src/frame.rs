// crates/core/src/frame.rs
//! Server-sent-event framing for [`JobEvent`]s.
//!
//! One event is one block:
//!
//! ```text
//! event: message
//! data: {"type":"progress",...}
//!
//! ```
//!
//! Blocks end with a blank line. Lines starting with `:` are comments
//! (keep-alives). [`FrameDecoder`] accepts arbitrary chunk boundaries, so a
//! partial read always resumes at the next block. A block larger than the
//! decoder's limit is reported once and skipped up to its blank line.

use crate::error::FrameError;
use crate::event::JobEvent;

/// SSE event name used for every job event.
pub const EVENT_NAME: &str = "message";

/// Largest block [`FrameDecoder`] buffers before giving up on it.
pub const MAX_BLOCK_BYTES: usize = 1024 * 1024;

/// Serialize an event to the JSON carried in the `data:` field.
pub fn encode_data(event: &JobEvent) -> Result<String, FrameError> {
    Ok(serde_json::to_string(event)?)
}

/// Serialize an event as a complete, terminated block.
pub fn encode_block(event: &JobEvent) -> Result<String, FrameError> {
    Ok(format!("event: {EVENT_NAME}\ndata: {}\n\n", encode_data(event)?))
}

/// One decoded block before its payload is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
}

impl Frame {
    pub fn parse_event(&self) -> Result<JobEvent, FrameError> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Incremental block decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    /// Bytes of field lines taken into the current block.
    block_len: usize,
    /// Dropping lines until the next blank line.
    skipping: bool,
    max_block: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_block(MAX_BLOCK_BYTES)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_block(max_block: usize) -> Self {
        Self {
            buf: Vec::new(),
            event: None,
            data: Vec::new(),
            block_len: 0,
            skipping: false,
            max_block: max_block.max(1),
        }
    }

    /// Append raw bytes read from the connection.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete block, if one is buffered.
    ///
    /// Comment-only blocks are skipped. A block with invalid UTF-8, or one
    /// over the size limit, is reported once and dropped up to its
    /// terminating blank line so the caller can move on to the next one.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if self.skipping {
                if line.is_empty() {
                    self.skipping = false;
                }
                continue;
            }

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    return Some(frame);
                }
                continue;
            }

            self.block_len += line.len();
            if self.block_len > self.max_block {
                self.discard_block();
                return Some(Err(FrameError::Oversized {
                    limit: self.max_block,
                }));
            }

            let Ok(line) = String::from_utf8(line) else {
                self.discard_block();
                return Some(Err(FrameError::InvalidUtf8));
            };
            self.field(&line);
        }

        // No newline left: `buf` holds part of one line.
        if self.block_len + self.buf.len() > self.max_block {
            self.buf.clear();
            if !self.skipping {
                self.discard_block();
                return Some(Err(FrameError::Oversized {
                    limit: self.max_block,
                }));
            }
        }
        None
    }

    /// Bytes buffered but not yet part of a complete line.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    fn field(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<Result<Frame, FrameError>> {
        self.block_len = 0;
        if self.data.is_empty() {
            let had_event = self.event.take().is_some();
            return had_event.then_some(Err(FrameError::MissingData));
        }
        let frame = Frame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        };
        Some(Ok(frame))
    }

    fn discard_block(&mut self) {
        self.event = None;
        self.data.clear();
        self.block_len = 0;
        self.skipping = true;
    }
}
