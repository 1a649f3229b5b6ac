//! Lesson streaming relay: newline-delimited JSON records over one HTTP body.
//!
//! ## Wire format
//!
//! ```text
//! {"type":"chunk","content":"{\"introduction\": ..."}\n
//! {"type":"chunk","content":"..."}\n
//! {"type":"done","lesson":{...}}\n          ← or {"type":"error","message":"..."}
//! ```
//!
//! Every server stream ends with exactly one terminal record (`done` or
//! `error`). Readers accept an optional SSE `data: ` prefix on each line,
//! skip blank or unparseable lines, and stop at the first terminal record.
//! Bytes may arrive split anywhere, including inside a UTF-8 sequence.

use std::fmt::Display;

use axum::body::{Body, Bytes};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::lesson::StructuredLesson;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// One relay record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Incremental model output, forwarded as produced.
    Chunk { content: String },
    /// Final structured lesson; terminal.
    Done { lesson: StructuredLesson },
    /// Generation failed; terminal.
    Error { message: String },
}

impl StreamEvent {
    pub fn chunk(content: impl Into<String>) -> Self {
        StreamEvent::Chunk { content: content.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error { message: message.into() }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk { .. })
    }

    /// Encode as a single `\n`-terminated line.
    pub fn to_line(&self) -> String {
        // serialisation only fails if a lesson holds non-serialisable data
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| encode_failure(&e));
        line.push('\n');
        line
    }
}

fn encode_failure(e: &dyn Display) -> String {
    serde_json::json!({ "type": "error", "message": format!("encode failed: {e}") }).to_string()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("stream transport failed: {0}")]
    Transport(String),
    #[error("stream ended without a terminal record")]
    Truncated,
    #[error("generation failed: {0}")]
    Remote(String),
}

impl RelayError {
    /// Transport failures and truncation are worth retrying; a remote
    /// `error` record is a definitive answer.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RelayError::Remote(_))
    }
}

// ── Line framing ──────────────────────────────────────────────────────────────

/// Reassembles `\n`-terminated lines from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every line completed by them (without `\n`/`\r`).
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Whatever is left after the final chunk, if non-blank.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// Strip an optional SSE `data:` prefix; `None` for blank lines, comments and
/// the `[DONE]` sentinel.
pub fn sse_payload(line: &str) -> Option<&str> {
    let line = line.trim();
    let payload = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);
    if payload.is_empty() || payload.starts_with(':') || payload == "[DONE]" {
        return None;
    }
    Some(payload)
}

/// Parse one relay line; malformed lines yield `None`.
pub fn parse_event_line(line: &str) -> Option<StreamEvent> {
    let payload = sse_payload(line)?;
    match serde_json::from_str(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!(error = %e, line_len = payload.len(), "skipping malformed relay line");
            None
        }
    }
}

/// Incremental decoder from raw bytes to [`StreamEvent`]s.
#[derive(Debug, Default)]
pub struct LineDecoder {
    lines: LineBuffer,
    skipped: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let lines = self.lines.push(bytes);
        self.decode(lines)
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let rest: Vec<String> = self.lines.finish().into_iter().collect();
        self.decode(rest)
    }

    /// Number of non-blank lines that failed to parse.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn decode(&mut self, lines: Vec<String>) -> Vec<StreamEvent> {
        let mut events = Vec::with_capacity(lines.len());
        for line in lines {
            match parse_event_line(&line) {
                Some(event) => events.push(event),
                None if sse_payload(&line).is_some() => self.skipped += 1,
                None => {}
            }
        }
        events
    }
}

// ── Client side ───────────────────────────────────────────────────────────────

/// Drive a byte stream to its terminal record.
///
/// `on_chunk` sees every `chunk` payload in order. Reading stops at the
/// first `done` (→ `Ok(lesson)`) or `error` (→ [`RelayError::Remote`]);
/// anything after it is not read. A stream that ends first is
/// [`RelayError::Truncated`].
pub async fn read_lesson_stream<S, E>(
    mut stream: S,
    mut on_chunk: impl FnMut(&str),
) -> Result<StructuredLesson, RelayError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let mut decoder = LineDecoder::new();

    while let Some(item) = stream.next().await {
        let bytes = item.map_err(|e| RelayError::Transport(e.to_string()))?;
        for event in decoder.push(&bytes) {
            if let Some(result) = handle_event(event, &mut on_chunk) {
                return result;
            }
        }
    }

    for event in decoder.finish() {
        if let Some(result) = handle_event(event, &mut on_chunk) {
            return result;
        }
    }

    if decoder.skipped() > 0 {
        warn!(skipped = decoder.skipped(), "relay stream ended after malformed lines");
    }
    Err(RelayError::Truncated)
}

fn handle_event(
    event: StreamEvent,
    on_chunk: &mut impl FnMut(&str),
) -> Option<Result<StructuredLesson, RelayError>> {
    match event {
        StreamEvent::Chunk { content } => {
            on_chunk(&content);
            None
        }
        StreamEvent::Done { lesson } => Some(Ok(lesson)),
        StreamEvent::Error { message } => Some(Err(RelayError::Remote(message))),
    }
}

// ── Server side ───────────────────────────────────────────────────────────────

/// Wrap an event stream as a chunked NDJSON response body.
pub fn ndjson_body<S>(events: S) -> Body
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    Body::from_stream(events.map(|event| Ok::<_, std::convert::Infallible>(event.to_line())))
}
