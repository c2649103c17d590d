//! Incremental `text/event-stream` parser.
//!
//! Feed raw body chunks in, get complete events out. Handles:
//! - Line buffering across chunk boundaries (`\n`, `\r\n`)
//! - `data:` lines joined with `\n`
//! - `event:`, `id:` and `retry:` fields
//! - `:` comment lines (server heartbeats)
//! - Blank-line dispatch; events without data are discarded
//! - Lines longer than [`MAX_LINE_LEN`] are dropped whole

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use bytes::BytesMut;
use tracing::{trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Event type used when the server sends no `event:` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Longest line the parser buffers, excluding the terminator.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

// ============================================================================
// SseEvent
// ============================================================================

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, or `"message"`.
    pub event: String,
    /// Concatenated `data:` lines.
    pub data: String,
    /// Last event id in effect when the event was dispatched.
    pub id: Option<String>,
}

impl SseEvent {
    /// Returns `true` for default-typed events.
    #[inline]
    #[must_use]
    pub fn is_message(&self) -> bool {
        self.event == DEFAULT_EVENT_TYPE
    }
}

// ============================================================================
// SseParser
// ============================================================================

/// Stateful parser for one stream.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    /// Skipping the rest of an oversized line.
    discarding: bool,
    event: Option<String>,
    data: String,
    has_data: bool,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl SseParser {
    /// Creates an empty parser.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last `id:` seen on this stream.
    #[inline]
    #[must_use]
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Last `retry:` hint from the server.
    #[inline]
    #[must_use]
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    /// Consumes a chunk and returns every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n')
            else {
                self.scanned = self.buffer.len();
                if self.scanned > MAX_LINE_LEN {
                    warn!(len = self.scanned, "Discarding oversized SSE line");
                    self.buffer.clear();
                    self.scanned = 0;
                    self.discarding = true;
                }
                break;
            };

            let mut line = self.buffer.split_to(self.scanned + offset + 1);
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }

            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.len() > MAX_LINE_LEN {
                warn!(len = line.len(), "Discarding oversized SSE line");
                continue;
            }

            // Invalid UTF-8 lines are skipped
            let Ok(line) = std::str::from_utf8(&line) else {
                continue;
            };

            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }

        events
    }

    /// Applies one line; returns an event on blank-line dispatch.
    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }

        if line.starts_with(':') {
            trace!("SSE comment");
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_owned()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }

        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if !self.has_data {
            return None;
        }

        self.has_data = false;
        Some(SseEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_owned()),
            data: std::mem::take(&mut self.data),
            id: self.last_event_id.clone(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
