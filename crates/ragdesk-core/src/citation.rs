//! Citation payload decoding for assistant messages
//!
//! Assistant turns arrive framed as
//! `<base64(JSON{context:[{page_content, metadata}]})>__LLM_RESPONSE__<answer>`.
//! The prefix carries the retrieved passages; the suffix is the answer text,
//! which may reference passages with `[[citation:N]]` style markers.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;

use crate::types::Citation;

/// Separates the retrieval payload from the answer text
pub const SENTINEL: &str = "__LLM_RESPONSE__";

/// Standard alphabet; padding may be present or not
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

static CITATION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\[citation:\s*(\d+)\]\]|\[citation:\s*(\d+)\]")
        .expect("citation marker pattern")
});

/// One retrieved passage as it appears in the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub page_content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContextPayload {
    context: Vec<ContextEntry>,
}

/// Display text plus the citations it may reference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedMessage {
    pub content: String,
    pub citations: Vec<Citation>,
}

impl DecodedMessage {
    fn plain(raw: &str) -> Self {
        Self {
            content: raw.to_string(),
            citations: Vec::new(),
        }
    }
}

/// Split a raw assistant message into display content and citations.
///
/// Never fails: a missing sentinel or an undecodable payload yields the raw
/// text with no citations.
pub fn decode(raw: &str) -> DecodedMessage {
    let Some((prefix, answer)) = raw.split_once(SENTINEL) else {
        return DecodedMessage::plain(raw);
    };

    match decode_payload(prefix) {
        Ok(payload) => DecodedMessage {
            content: normalize_citation_markers(answer),
            citations: payload
                .context
                .into_iter()
                .enumerate()
                .map(|(index, entry)| Citation {
                    id: index + 1,
                    text: entry.page_content,
                    metadata: entry.metadata,
                })
                .collect(),
        },
        Err(reason) => {
            tracing::debug!(%reason, "citation payload not decodable, showing raw text");
            DecodedMessage::plain(raw)
        }
    }
}

fn decode_payload(prefix: &str) -> Result<ContextPayload, String> {
    let compact: String = prefix.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = PAYLOAD_ENGINE
        .decode(compact.as_bytes())
        .map_err(|e| format!("base64: {}", e))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("json: {}", e))
}

/// Rewrite every accepted citation marker form into `[citation](N)`.
///
/// The output form is not matched by the pattern, so applying this twice is
/// the same as applying it once.
pub fn normalize_citation_markers(text: &str) -> String {
    CITATION_MARKER
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let ordinal = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            format!("[citation]({})", ordinal)
        })
        .into_owned()
}

/// Produce the wire framing for a context list and an answer
pub fn encode_context(context: &[ContextEntry], answer: &str) -> String {
    let payload = serde_json::json!({ "context": context });
    format!(
        "{}{}{}",
        PAYLOAD_ENGINE.encode(payload.to_string()),
        SENTINEL,
        answer
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitMode {
    Detecting,
    Answer,
    Plain,
}

/// Incremental splitter for a streamed assistant message.
///
/// Holds text back while it could still be the base64 payload, then passes
/// through only the answer. Streams that turn out to be unframed are passed
/// through whole.
#[derive(Debug)]
pub struct StreamSplitter {
    buffer: String,
    mode: SplitMode,
}

impl Default for StreamSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSplitter {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            mode: SplitMode::Detecting,
        }
    }

    /// Feed a delta; returns the displayable part of it, if any
    pub fn push(&mut self, delta: &str) -> Option<String> {
        if self.mode != SplitMode::Detecting {
            return non_empty(delta.to_string());
        }

        self.buffer.push_str(delta);

        if let Some(pos) = self.buffer.find(SENTINEL) {
            self.mode = SplitMode::Answer;
            let answer = self.buffer[pos + SENTINEL.len()..].to_string();
            self.buffer.clear();
            return non_empty(answer);
        }

        let Some(pos) = self.buffer.find(|c: char| !is_payload_char(c)) else {
            return None;
        };

        if SENTINEL.starts_with(&self.buffer[pos..]) {
            return None;
        }

        self.mode = SplitMode::Plain;
        non_empty(std::mem::take(&mut self.buffer))
    }

    /// Flush whatever is still held back once the stream has ended
    pub fn finish(&mut self) -> Option<String> {
        if self.mode == SplitMode::Detecting {
            self.mode = SplitMode::Plain;
            return non_empty(std::mem::take(&mut self.buffer));
        }
        None
    }
}

fn is_payload_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}
