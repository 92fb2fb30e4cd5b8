//! Direct streaming transport: one HTTPS request per exchange, response
//! body fed chunk-by-chunk into the stream decoder.

use futures_util::StreamExt;
use serde::Serialize;

use crate::config::AgentConfig;
use crate::error::TransportError;
use crate::stream_decoder::StreamDecoder;
use crate::transport::{CancelFlag, SendOutcome, Transport};
use crate::types::{Message, MessageRole};

const API_VERSION: &str = "2023-06-01";
const MESSAGES_PATH: &str = "/v1/messages";

/// Tool surface advertised to the model
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// The script-execution tool offered on every direct exchange
pub fn run_script_tool() -> ToolDefinition {
    ToolDefinition {
        name: "run_script".to_string(),
        description: "Execute a script in the host's sandboxed scripting environment. \
                      Output is captured and returned; print values you want to see."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Script source to execute"
                }
            },
            "required": ["code"]
        }),
    }
}

#[derive(Debug, Serialize)]
struct ThinkingConfig {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinition>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
}

/// Synchronous-per-exchange streaming HTTP transport. Owns its own
/// transcript; there is no resumable session id on this path.
pub struct DirectTransport {
    config: AgentConfig,
    api_key: String,
    cancel: CancelFlag,
    client: Option<reqwest::Client>,
    transcript: Vec<Message>,
}

impl DirectTransport {
    pub fn new(config: AgentConfig, api_key: String, cancel: CancelFlag) -> Self {
        Self {
            config,
            api_key,
            cancel,
            client: None,
            transcript: Vec::new(),
        }
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    fn build_body(&self) -> Result<serde_json::Value, TransportError> {
        let request = CreateMessageRequest {
            model: &self.config.model,
            messages: &self.transcript,
            system: &self.config.system_prompt,
            tools: vec![run_script_tool()],
            max_tokens: self.config.max_tokens,
            stream: true,
            thinking: self.config.enable_thinking.then(|| ThinkingConfig {
                kind: "enabled",
                budget_tokens: self.config.thinking_budget,
            }),
        };
        serde_json::to_value(&request)
            .map_err(|e| TransportError::Api(format!("request serialization failed: {e}")))
    }

    async fn exchange(&self, body: serde_json::Value) -> Result<SendOutcome, TransportError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| TransportError::Connection("not connected".to_string()))?;

        let url = format!("{}{}", self.config.api_base_url, MESSAGES_PATH);
        let response = client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(TransportError::Api(format!("HTTP {status}: {detail}")));
        }

        let mut decoder = StreamDecoder::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            // Checked on every data arrival; a set flag aborts the
            // transfer immediately.
            if self.cancel.is_set() {
                return Err(TransportError::Cancelled);
            }
            decoder.feed(&chunk?);
        }
        decoder.finish();

        if let Some(error) = decoder.error() {
            return Err(TransportError::Api(error.to_string()));
        }

        let usage = decoder.usage();
        let message = decoder.into_message().ok_or(TransportError::NoResponse)?;
        if message.content.is_empty() {
            return Err(TransportError::NoResponse);
        }

        Ok(SendOutcome {
            text: message.text(),
            content: message.content,
            session_id: None,
            usage,
            cost: None,
            num_turns: 1,
        })
    }
}

#[async_trait::async_trait]
impl Transport for DirectTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.api_key.is_empty() {
            return Err(TransportError::Connection("no API key provided".to_string()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .build()?;
        self.client = Some(client);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn send(&mut self, input: &str) -> Result<SendOutcome, TransportError> {
        if self.cancel.is_set() {
            return Err(TransportError::Cancelled);
        }

        self.transcript.push(Message::user(input));
        let body = self.build_body()?;

        let result = match tokio::time::timeout(self.config.exchange_timeout, self.exchange(body))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match result {
            Ok(outcome) => {
                self.transcript.push(Message {
                    role: MessageRole::Assistant,
                    content: outcome.content.clone(),
                });
                Ok(outcome)
            }
            Err(e) => {
                // The failed turn never happened as far as the
                // transcript is concerned.
                self.transcript.pop();
                Err(e)
            }
        }
    }

    fn cancel(&self) {
        self.cancel.set();
    }

    fn session_id(&self) -> Option<String> {
        None
    }

    fn reset_session(&mut self) {
        self.transcript.clear();
    }

    async fn disconnect(&mut self) {
        self.client = None;
    }
}
