//! Decoding of streamed chat responses
//!
//! The chat endpoint answers either with the line-oriented data stream
//! (`0:"text"`, `3:"error"`, `d:{...}`), announced by the
//! `x-vercel-ai-data-stream` header, or with bare text chunks.

/// Header announcing the line-oriented data stream framing
pub const DATA_STREAM_HEADER: &str = "x-vercel-ai-data-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPart {
    Text(String),
    Error(String),
    Finish,
}

/// Incremental parser for the data stream framing.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across network chunks survive intact. Some backends
/// announce the framing but send bare text; the first line without a
/// `<code>:` prefix switches the parser to passing lines through verbatim.
#[derive(Debug, Default)]
pub struct DataStreamParser {
    buffer: Vec<u8>,
    unframed: bool,
}

impl DataStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the body turned out to be bare text
    pub fn is_unframed(&self) -> bool {
        self.unframed
    }

    /// Feed raw bytes; returns the parts completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamPart> {
        self.buffer.extend_from_slice(bytes);
        let mut parts = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(part) = self.parse_line(&String::from_utf8_lossy(&line)) {
                parts.push(part);
            }
        }

        parts
    }

    /// Parse a trailing line that had no newline
    pub fn finish(&mut self) -> Vec<StreamPart> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        self.parse_line(&String::from_utf8_lossy(&line))
            .into_iter()
            .collect()
    }

    fn parse_line(&mut self, line: &str) -> Option<StreamPart> {
        if self.unframed {
            return Some(StreamPart::Text(line.to_string()));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return None;
        }

        match frame_code(trimmed) {
            Some((code, payload)) => parse_part(code, payload),
            None => {
                tracing::warn!("data stream body is not framed, reading it as plain text");
                self.unframed = true;
                Some(StreamPart::Text(line.to_string()))
            }
        }
    }
}

/// Split `<code>:<payload>` where the code is a single ASCII alphanumeric
fn frame_code(line: &str) -> Option<(char, &str)> {
    let (code, payload) = line.split_once(':')?;
    let mut chars = code.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphanumeric() => Some((c, payload)),
        _ => None,
    }
}

fn parse_part(code: char, payload: &str) -> Option<StreamPart> {
    match code {
        '0' | '3' => match serde_json::from_str::<String>(payload) {
            Ok(text) if code == '0' => Some(StreamPart::Text(text)),
            Ok(message) => Some(StreamPart::Error(message)),
            Err(e) => {
                tracing::warn!(%code, error = %e, "skipping malformed stream part");
                None
            }
        },
        'd' | 'e' => Some(StreamPart::Finish),
        _ => {
            tracing::trace!(%code, "ignoring stream part");
            None
        }
    }
}

/// Decoder for bare text streams that keeps incomplete UTF-8 sequences
/// until the rest of the bytes arrive
#[derive(Debug, Default)]
pub struct RawTextDecoder {
    pending: Vec<u8>,
}

impl RawTextDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned(),
        }
    }

    pub fn finish(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned()
    }
}
