//! Incremental decoder for streamed model responses.
//!
//! Accepts raw bytes in arbitrarily sized chunks (SSE frames or bare
//! NDJSON), assembles complete lines, classifies each line into a
//! [`StreamEvent`], and folds the events into a final [`Message`].
//! Malformed lines are discarded silently; best-effort decoding means a
//! line-level parse failure shows up as missing data, not a stream error.

use serde::Deserialize;

use crate::types::{ContentBlock, Message};
use crate::usage::TokenUsage;

const STREAM_END_SENTINEL: &str = "[DONE]";

/// One decoded wire event, keyed by its announced stage
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        #[serde(default)]
        message: Option<MessageHeader>,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        delta: Option<MessageDeltaBody>,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    MessageStop,
    Error {
        error: ErrorBody,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageHeader {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
}

/// Kinds of per-block delta payloads
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
}

/// Incremental stream decoder. Single-use per logical exchange;
/// call [`StreamDecoder::reset`] to reuse.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    blocks: Vec<ContentBlock>,
    partial_json: Vec<String>,
    model: Option<String>,
    usage: TokenUsage,
    stop_reason: Option<String>,
    message: Option<Message>,
    complete: bool,
    error: Option<String>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes. Chunks may split lines (and UTF-8 sequences)
    /// at any boundary. Returns the events completed by this chunk.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing unterminated line
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let line = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
        self.process_line(&line).into_iter().collect()
    }

    /// Clear all state for reuse on a new exchange
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    pub fn into_message(self) -> Option<Message> {
        self.message
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    fn process_line(&mut self, raw: &str) -> Option<StreamEvent> {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.is_empty() {
            return None;
        }

        // SSE framing: event-name lines carry no payload, data lines are
        // unwrapped. Anything else is treated as a bare NDJSON line.
        if line.starts_with("event:") {
            return None;
        }
        let payload = match line.strip_prefix("data:") {
            Some(rest) => rest.trim_start_matches([' ', '\t']),
            None => line,
        };
        if payload.is_empty() || payload == STREAM_END_SENTINEL {
            return None;
        }

        match serde_json::from_str::<StreamEvent>(payload) {
            Ok(event) => {
                self.apply(&event);
                Some(event)
            }
            Err(_) => {
                log::debug!("discarding undecodable stream line ({} bytes)", payload.len());
                None
            }
        }
    }

    fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::MessageStart { message } => {
                self.blocks.clear();
                self.partial_json.clear();
                self.message = None;
                self.complete = false;
                if let Some(header) = message {
                    self.model = header.model.clone();
                    if let Some(usage) = header.usage {
                        self.merge_usage(usage);
                    }
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                self.grow_to(*index);
                self.blocks[*index] = content_block.clone();
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                self.grow_to(*index);
                match delta {
                    Delta::TextDelta { text } => {
                        if let ContentBlock::Text { text: existing } = &mut self.blocks[*index] {
                            existing.push_str(text);
                        }
                    }
                    Delta::ThinkingDelta { thinking } => {
                        if let ContentBlock::Thinking { thinking: existing } =
                            &mut self.blocks[*index]
                        {
                            existing.push_str(thinking);
                        }
                    }
                    Delta::InputJsonDelta { partial_json } => {
                        self.partial_json[*index].push_str(partial_json);
                    }
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                if *index < self.blocks.len() {
                    let fragment = std::mem::take(&mut self.partial_json[*index]);
                    if let ContentBlock::ToolUse { input, .. } = &mut self.blocks[*index] {
                        if !fragment.is_empty() {
                            // Raw fragment is retained verbatim when it
                            // does not parse as JSON.
                            *input = serde_json::from_str(&fragment)
                                .unwrap_or(serde_json::Value::String(fragment));
                        }
                    }
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(body) = delta {
                    if body.stop_reason.is_some() {
                        self.stop_reason = body.stop_reason.clone();
                    }
                }
                if let Some(usage) = usage {
                    self.merge_usage(*usage);
                }
            }
            StreamEvent::MessageStop => {
                self.message = Some(Message::assistant(self.blocks.clone()));
                self.complete = true;
            }
            StreamEvent::Error { error } => {
                self.error = Some(if error.message.is_empty() {
                    "unknown streaming error".to_string()
                } else {
                    error.message.clone()
                });
            }
        }
    }

    fn grow_to(&mut self, index: usize) {
        while self.blocks.len() <= index {
            self.blocks.push(ContentBlock::empty_text());
            self.partial_json.push(String::new());
        }
    }

    // Later counters overwrite earlier ones; the wire reports cumulative
    // values, never decrements.
    fn merge_usage(&mut self, incoming: TokenUsage) {
        if incoming.input_tokens > 0 {
            self.usage.input_tokens = incoming.input_tokens;
        }
        if incoming.output_tokens > 0 {
            self.usage.output_tokens = incoming.output_tokens;
        }
        if incoming.cache_read_tokens > 0 {
            self.usage.cache_read_tokens = incoming.cache_read_tokens;
        }
        if incoming.cache_creation_tokens > 0 {
            self.usage.cache_creation_tokens = incoming.cache_creation_tokens;
        }
    }
}
