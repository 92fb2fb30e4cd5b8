use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Role of a message in the conversation transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One message in a transcript. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
        }
    }

    /// Concatenated text of all text blocks
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

/// Smallest addressable unit of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        thinking: String,
    },
}

impl ContentBlock {
    pub fn empty_text() -> Self {
        ContentBlock::Text {
            text: String::new(),
        }
    }
}

/// Credentials supplied by the caller. Which field is set selects the
/// transport: an API key selects the direct streaming API, otherwise the
/// agent CLI binary is used (resolved from `cli_path` or discovered).
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub cli_path: Option<PathBuf>,
}

impl Credentials {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            cli_path: None,
        }
    }

    pub fn cli() -> Self {
        Self::default()
    }
}

/// Orchestrator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Disconnected,
    Connecting,
    Idle,
    Processing,
    Cancelled,
}

/// Outcome record returned to callers for every processed input.
/// No errors cross the orchestrator boundary; failures arrive here
/// as a string message.
#[derive(Debug, Clone, Default)]
pub struct ProcessResult {
    pub success: bool,
    pub response: String,
    pub turns_used: u32,
    pub cost: Option<f64>,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl ProcessResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Result of one script execution by the external collaborator
#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub duration: Duration,
}

impl ScriptOutcome {
    pub fn ok(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
            duration,
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
            duration,
        }
    }
}
