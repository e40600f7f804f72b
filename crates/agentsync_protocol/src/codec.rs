use serde::{Deserialize, Serialize};

use crate::errors::CodecError;
use crate::event::Event;

/// Frame layout of an ordered event stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// One JSON event per `\n`-terminated line.
    #[default]
    Ndjson,
    /// Server-sent events: `data: <json>` lines closed by a blank line.
    Sse,
}

impl Framing {
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type
            .trim()
            .to_ascii_lowercase()
            .starts_with("text/event-stream")
        {
            Self::Sse
        } else {
            Self::Ndjson
        }
    }

    pub fn encode(self, event: &Event) -> Result<String, CodecError> {
        match self {
            Self::Ndjson => encode_line(event),
            Self::Sse => encode_sse(event),
        }
    }
}

/// Encode one event as a newline-terminated JSON line.
/// Allocation: one String. Complexity: O(n), n = serialized bytes.
pub fn encode_line(event: &Event) -> Result<String, CodecError> {
    let mut line =
        serde_json::to_string(event).map_err(|err| CodecError::Serialize(err.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Encode one event as a single SSE `data:` frame.
pub fn encode_sse(event: &Event) -> Result<String, CodecError> {
    let json =
        serde_json::to_string(event).map_err(|err| CodecError::Serialize(err.to_string()))?;
    Ok(format!("data: {json}\n\n"))
}

pub fn decode_line(line: &str) -> Result<Event, CodecError> {
    serde_json::from_str(line.trim()).map_err(|err| CodecError::Malformed {
        reason: err.to_string(),
        frame: line.to_owned(),
    })
}

/// Incremental decoder over a chunked byte stream.
/// Chunks may split frames (and UTF-8 sequences) at any byte; incomplete
/// lines are buffered until their terminator arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    framing: Framing,
    buf: Vec<u8>,
    sse_data: Vec<String>,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buf: Vec::new(),
            sse_data: Vec::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Feed one chunk and return every event it completes.
    /// Complexity: O(c + l), c = chunk bytes, l = completed line bytes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Event>, CodecError> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = std::str::from_utf8(&raw[..raw.len() - 1])
                .map_err(|_| CodecError::InvalidUtf8)?;
            let line = line.strip_suffix('\r').unwrap_or(line);
            if let Some(event) = self.accept_line(line)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Flush a trailing unterminated frame at end of stream.
    pub fn finish(&mut self) -> Result<Vec<Event>, CodecError> {
        let mut events = Vec::new();
        if !self.buf.is_empty() {
            let raw = std::mem::take(&mut self.buf);
            let line = std::str::from_utf8(&raw).map_err(|_| CodecError::InvalidUtf8)?;
            let line = line.strip_suffix('\r').unwrap_or(line);
            if let Some(event) = self.accept_line(line)? {
                events.push(event);
            }
        }
        if let Some(event) = self.dispatch_sse()? {
            events.push(event);
        }
        Ok(events)
    }

    fn accept_line(&mut self, line: &str) -> Result<Option<Event>, CodecError> {
        match self.framing {
            Framing::Ndjson => {
                if line.trim().is_empty() {
                    return Ok(None);
                }
                decode_line(line).map(Some)
            }
            Framing::Sse => {
                if line.is_empty() {
                    return self.dispatch_sse();
                }
                if line.starts_with(':') {
                    return Ok(None);
                }
                let (field, value) = match line.split_once(':') {
                    Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                    None => (line, ""),
                };
                // `event:`, `id:` and `retry:` carry nothing the event JSON lacks.
                if field == "data" {
                    self.sse_data.push(value.to_owned());
                }
                Ok(None)
            }
        }
    }

    fn dispatch_sse(&mut self) -> Result<Option<Event>, CodecError> {
        if self.sse_data.is_empty() {
            return Ok(None);
        }
        let data = self.sse_data.join("\n");
        self.sse_data.clear();
        decode_line(&data).map(Some)
    }
}
