//! Server-sent-event frame splitting for the HTTP transport.
//!
//! Upstream streaming replies arrive as `text/event-stream` chunks that do
//! not align with event boundaries. The splitter buffers bytes and yields
//! each complete frame's `data:` payload so the relay can log it while the
//! raw bytes stream through to the caller untouched.

/// Incremental splitter over SSE bytes.
#[derive(Debug, Default)]
pub struct SseFrameSplitter {
    buffer: String,
}

impl SseFrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the `data:` payloads of every frame completed
    /// by it. Multi-line data fields are joined with `\n` per the SSE spec.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        while let Some(boundary) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..boundary + 2).collect();
            if let Some(payload) = data_payload(&frame) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Payload of a trailing unterminated frame, if any. Called once the
    /// upstream closes so a final frame without a blank line still gets
    /// logged.
    pub fn finish(self) -> Option<String> {
        data_payload(&self.buffer)
    }
}

/// Join the `data:` lines of one frame; `None` if the frame carries none
/// (comments, keep-alives).
fn data_payload(frame: &str) -> Option<String> {
    let lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| {
            line.strip_prefix("data:")
                .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        })
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
