//! Incremental Server-Sent-Events framing.
//!
//! Every streaming platform wraps its payloads in the same framing: `data:`
//! lines terminated by a `[DONE]` sentinel. The framing is parsed here, once;
//! adapters only ever see the inner payload text.
//!
//! The reader is fed raw byte chunks as they arrive off the socket — lines
//! split across chunk boundaries are reassembled before processing. Splitting
//! happens on the newline byte, which never occurs inside a multi-byte UTF-8
//! sequence, so CJK payloads survive arbitrary chunk boundaries.

/// One framing-level event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// The text after `data:`, with the optional single leading space removed.
    Payload(String),
    /// The `[DONE]` sentinel. Nothing after it is parsed.
    Done,
}

/// Reassembles SSE lines from raw byte chunks.
#[derive(Debug, Default)]
pub struct SseFrameReader {
    pending: Vec<u8>,
    done: bool,
}

impl SseFrameReader {
    /// Fresh reader for one response body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte chunk; returns the framing events it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.pending.extend_from_slice(chunk);

        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            self.process_line(line.trim_end_matches(['\n', '\r']), &mut events);
            if self.done {
                break;
            }
        }
        events
    }

    /// Flush a trailing line that arrived without a final newline.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if self.done || self.pending.is_empty() {
            return events;
        }
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest);
        self.process_line(line.trim_end_matches(['\n', '\r']), &mut events);
        events
    }

    /// Handle one complete line.
    ///
    /// Blank separator lines, `:` comments (keepalives), and non-`data`
    /// fields (`event:`, `id:`, `retry:`) carry no payload and are dropped.
    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let payload = data.strip_prefix(' ').unwrap_or(data);
        if payload == "[DONE]" {
            self.done = true;
            events.push(SseEvent::Done);
            return;
        }
        events.push(SseEvent::Payload(payload.to_owned()));
    }
}
