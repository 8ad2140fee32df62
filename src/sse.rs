//! Incremental `text/event-stream` parser.
//!
//! The session channel is a long-lived server-push stream of named events.
//! Chunks arrive at arbitrary boundaries, so the parser keeps a byte buffer
//! and only emits events once a terminating blank line has been seen.
//!
//! Supported fields: `event`, `data` (multi-line, joined with `\n`). Comment
//! lines (leading `:`) and unknown fields (`id`, `retry`) are ignored. CRLF
//! and bare CR line endings are tolerated.

/// A single named event from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; `message` when the server sent no `event:` field.
    pub event: String,
    pub data: String,
}

#[derive(Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
    // Previous chunk ended on a bare '\r'; a leading '\n' in the next chunk
    // is the second half of that CRLF, not a new line terminator.
    pending_cr: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and collect every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut chunk = chunk;
        if self.pending_cr {
            self.pending_cr = false;
            if chunk.first() == Some(&b'\n') {
                chunk = &chunk[1..];
            }
        }
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        // Consume complete lines; leave any trailing partial line buffered.
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n' || b == b'\r') {
            let line: Vec<u8> = self.buf.drain(..pos).collect();
            let sep = self.buf.remove(0);
            // CRLF counts as a single terminator, even split across chunks.
            if sep == b'\r' {
                if self.buf.first() == Some(&b'\n') {
                    self.buf.remove(0);
                } else if self.buf.is_empty() {
                    self.pending_cr = true;
                }
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.take_line(&line) {
                events.push(event);
            }
        }

        events
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None; // comment / keep-alive
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            _ => {} // id, retry, anything unknown
        }
        None
    }

    fn flush(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let data_lines = std::mem::take(&mut self.data_lines);
        // A blank line with no accumulated fields dispatches nothing.
        if event.is_none() && data_lines.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: data_lines.join("\n"),
        })
    }
}
