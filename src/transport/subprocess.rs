//! Subprocess transport: spawns the agent CLI binary and exchanges
//! newline-delimited JSON over its standard streams.

use std::path::PathBuf;
use std::time::Instant;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::error::TransportError;
use crate::transport::{find_cli, CancelFlag, SendOutcome, Transport};
use crate::types::ContentBlock;
use crate::usage::TokenUsage;

const ERROR_MARKER: &str = "Error";

/// Inbound wire messages from the agent CLI, one JSON object per line
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum CliEvent {
    #[serde(rename = "system")]
    System {
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        data: Option<SystemData>,
    },
    #[serde(rename = "assistant")]
    Assistant {
        message: CliAssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename = "user")]
    User {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: String,
        session_id: String,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        num_turns: Option<u32>,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Default, Deserialize)]
struct SystemData {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct CliAssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

/// Build the outbound user-turn frame. The session id is the empty string
/// until the agent process has reported one.
fn user_frame(content: &str, session_id: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": content,
        },
        "parent_tool_use_id": null,
        "session_id": session_id,
    })
}

/// Line-oriented reader over the child's stdout with a short per-read
/// poll and an overall deadline. On deadline with a non-empty partial
/// buffer, the partial is emitted as a final line rather than discarded.
struct LineReader {
    stdout: ChildStdout,
    buffer: Vec<u8>,
}

impl LineReader {
    fn new(stdout: ChildStdout) -> Self {
        Self {
            stdout,
            buffer: Vec::new(),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=pos).collect();
        let mut line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    async fn next_line(
        &mut self,
        config: &AgentConfig,
        deadline: Instant,
        cancel: &CancelFlag,
    ) -> Result<Option<String>, TransportError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }
            if cancel.is_set() {
                return Err(TransportError::Cancelled);
            }
            if Instant::now() >= deadline {
                if self.buffer.is_empty() {
                    return Err(TransportError::Timeout);
                }
                // Defensive flush of a partial final line
                let line = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
                return Ok(Some(line));
            }

            match tokio::time::timeout(config.read_timeout, self.stdout.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    let line =
                        String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
                    return Ok(Some(line));
                }
                Ok(Ok(n)) => self.buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
                // Per-read poll expired; loop to re-check cancellation
                // and the overall deadline
                Err(_) => continue,
            }
        }
    }
}

/// Transport over a spawned agent CLI process. The first exchange carries
/// no session id; the one reported back is supplied on every subsequent
/// send of the same conversation.
pub struct SubprocessTransport {
    config: AgentConfig,
    cancel: CancelFlag,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    reader: Option<LineReader>,
    stderr_task: Option<JoinHandle<()>>,
    session_id: Option<String>,
    last_error_line: Option<String>,
}

impl SubprocessTransport {
    pub fn new(config: AgentConfig, cancel: CancelFlag) -> Self {
        Self {
            config,
            cancel,
            child: None,
            stdin: None,
            reader: None,
            stderr_task: None,
            session_id: None,
            last_error_line: None,
        }
    }

    fn resolve_cli(&self) -> Option<PathBuf> {
        self.config.cli_path.clone().or_else(find_cli)
    }

    fn build_command_args(&self) -> Vec<String> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if !self.config.system_prompt.is_empty() {
            args.push("--append-system-prompt".to_string());
            args.push(self.config.system_prompt.clone());
        }

        args.push("--permission-mode".to_string());
        args.push(self.config.permission_mode.clone());

        args.push("--max-turns".to_string());
        args.push(self.config.max_turns.to_string());

        if !self.config.model.is_empty() {
            args.push("--model".to_string());
            args.push(self.config.model.clone());
        }

        // Isolate the child from external settings files
        args.push("--setting-sources".to_string());
        args.push(String::new());

        args
    }

    fn spawn_stderr_drain(stderr: tokio::process::ChildStderr) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Draining is mandatory: an unread diagnostic pipe can block
            // the child.
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    log::debug!("agent stderr: {line}");
                }
            }
        })
    }

    fn capture_session(&mut self, session_id: Option<String>) {
        if let Some(id) = session_id {
            if !id.is_empty() {
                if self.session_id.as_deref() != Some(id.as_str()) {
                    log::debug!("captured agent session id {id}");
                }
                self.session_id = Some(id);
            }
        }
    }

    async fn read_response(
        &mut self,
        reader: &mut LineReader,
        deadline: Instant,
    ) -> Result<SendOutcome, TransportError> {
        let mut outcome = SendOutcome::default();

        loop {
            let line = match reader.next_line(&self.config, deadline, &self.cancel).await {
                Ok(Some(line)) => line,
                Ok(None) => break, // stream closed
                Err(TransportError::Timeout) if outcome.has_content() => break,
                Err(e) => return Err(e),
            };
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<CliEvent>(&line) {
                Ok(CliEvent::System {
                    subtype,
                    session_id,
                    data,
                }) => {
                    self.capture_session(session_id);
                    if subtype == "error" {
                        let message = data.unwrap_or_default().message;
                        return Err(TransportError::Api(if message.is_empty() {
                            "agent reported a system error".to_string()
                        } else {
                            message
                        }));
                    }
                }
                Ok(CliEvent::Assistant {
                    message,
                    session_id,
                }) => {
                    self.capture_session(session_id);
                    for block in message.content {
                        if let ContentBlock::Text { text } = &block {
                            outcome.text.push_str(text);
                        }
                        outcome.content.push(block);
                    }
                }
                Ok(CliEvent::User { session_id }) => {
                    self.capture_session(session_id);
                }
                Ok(CliEvent::Result {
                    is_error,
                    result,
                    session_id,
                    total_cost_usd,
                    num_turns,
                    usage,
                }) => {
                    self.capture_session(Some(session_id));
                    if is_error {
                        return Err(TransportError::Api(if result.is_empty() {
                            "agent reported an error result".to_string()
                        } else {
                            result
                        }));
                    }
                    outcome.cost = total_cost_usd;
                    outcome.num_turns = num_turns.unwrap_or(1);
                    if let Some(usage) = usage {
                        outcome.usage = usage;
                    }
                    break; // terminal per-exchange marker
                }
                Err(_) => {
                    // Unstructured output: approximate safety net for
                    // failures that never made it into the JSON grammar
                    if line.contains(ERROR_MARKER) {
                        log::warn!("agent emitted non-JSON error line: {line}");
                        self.last_error_line = Some(line);
                    }
                }
            }
        }

        if !outcome.has_content() {
            if let Some(line) = self.last_error_line.take() {
                return Err(TransportError::Api(line));
            }
            return Err(TransportError::NoResponse);
        }

        outcome.session_id = self.session_id.clone();
        Ok(outcome)
    }
}

#[async_trait::async_trait]
impl Transport for SubprocessTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.child.is_some() {
            return Ok(());
        }

        let cli = self.resolve_cli().ok_or_else(|| {
            TransportError::Connection("agent CLI not found on this system".to_string())
        })?;
        let args = self.build_command_args();
        log::info!("spawning agent CLI: {} {:?}", cli.display(), args);

        let mut child = Command::new(&cli)
            .args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransportError::Connection(format!(
                    "failed to spawn agent CLI {}: {e}",
                    cli.display()
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Connection("child stdin unavailable".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Connection("child stdout unavailable".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::Connection("child stderr unavailable".to_string())
        })?;

        self.stderr_task = Some(Self::spawn_stderr_drain(stderr));
        self.stdin = Some(stdin);
        self.reader = Some(LineReader::new(stdout));
        self.child = Some(child);
        self.cancel.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.child.is_some()
    }

    async fn send(&mut self, input: &str) -> Result<SendOutcome, TransportError> {
        if self.cancel.is_set() {
            return Err(TransportError::Cancelled);
        }

        let frame = user_frame(input, self.session_id.as_deref().unwrap_or(""));
        let mut line = frame.to_string();
        line.push('\n');

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| TransportError::Connection("not connected".to_string()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        let deadline = Instant::now() + self.config.exchange_timeout;
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| TransportError::Connection("not connected".to_string()))?;
        let result = self.read_response(&mut reader, deadline).await;
        self.reader = Some(reader);
        result
    }

    fn cancel(&self) {
        self.cancel.set();
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    fn requires_session_resume(&self) -> bool {
        true
    }

    fn reset_session(&mut self) {
        self.session_id = None;
    }

    async fn disconnect(&mut self) {
        // Closing stdin signals the child to finish
        self.stdin = None;
        self.reader = None;

        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        // The drain ends at pipe EOF once the child is gone
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }

        self.session_id = None;
        self.last_error_line = None;
    }
}
