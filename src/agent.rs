//! Agent orchestration: a public handle posting commands to one worker
//! task that owns the transport, history log, and usage accumulator.
//!
//! The worker runs the multi-turn loop: send input, extract script
//! blocks from the reply, execute them, feed the outputs back as the
//! next turn's input, until a reply carries no blocks or the turn
//! budget runs out. Failures never cross the boundary as errors; every
//! processed input yields a [`ProcessResult`].

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::config::AgentConfig;
use crate::error::TransportError;
use crate::history::HistoryLog;
use crate::script_blocks::{extract_blocks, strip_blocks};
use crate::transport::{
    find_cli, CancelFlag, DirectTransport, SubprocessTransport, Transport,
};
use crate::types::{ChatState, Credentials, ProcessResult, ScriptOutcome};
use crate::usage::UsageAccumulator;

/// Hooks for streaming progress out of the worker. All default to no-ops.
pub trait AgentObserver: Send + Sync {
    fn on_turn_start(&self, _turn: u32) {}
    fn on_thinking(&self, _thinking: &str) {}
    fn on_thinking_done(&self) {}
    /// Display text for a turn, script tags already stripped
    fn on_text(&self, _text: &str) {}
    fn on_script_code(&self, _code: &str) {}
    fn on_script_output(&self, _output: &str, _is_error: bool) {}
    fn on_tool_use(&self, _name: &str) {}
    fn on_error(&self, _error: &str) {}
    fn on_result(&self, _result: &ProcessResult) {}
}

/// Observer that ignores everything
pub struct NullObserver;

impl AgentObserver for NullObserver {}

/// Synchronous script execution collaborator. Invoked on the worker
/// task; an in-flight execution cannot be preempted by cancel.
pub trait ScriptExecutor: Send + Sync {
    fn execute(&self, code: &str) -> ScriptOutcome;
}

/// Builds a transport for the supplied credentials. Injectable so tests
/// can drive the turn loop with a scripted transport.
pub type TransportFactory = Box<
    dyn Fn(&Credentials, &AgentConfig, CancelFlag) -> Result<Box<dyn Transport>, TransportError>
        + Send,
>;

/// API key selects the direct streaming API; otherwise the agent CLI is
/// resolved (configured path, well-known locations, PATH) and run as a
/// subprocess.
pub fn default_transport_factory() -> TransportFactory {
    Box::new(|credentials, config, cancel| {
        if let Some(api_key) = &credentials.api_key {
            log::info!("Using direct API transport");
            return Ok(Box::new(DirectTransport::new(
                config.clone(),
                api_key.clone(),
                cancel,
            )));
        }
        let cli_path = credentials
            .cli_path
            .clone()
            .or_else(|| config.cli_path.clone())
            .or_else(find_cli)
            .ok_or_else(|| {
                TransportError::Connection("agent CLI binary not found".to_string())
            })?;
        log::info!("Using CLI transport: {}", cli_path.display());
        let mut config = config.clone();
        config.cli_path = Some(cli_path);
        Ok(Box::new(SubprocessTransport::new(config, cancel)))
    })
}

enum Command {
    Connect(Credentials, oneshot::Sender<Result<(), String>>),
    Process(String, oneshot::Sender<ProcessResult>),
    NewSession(oneshot::Sender<Result<String, String>>),
    Disconnect(oneshot::Sender<()>),
    Shutdown,
}

/// Handle to the agent worker. Cheap to use from any task; all real
/// work happens on the worker it spawned.
pub struct Agent {
    commands: mpsc::Sender<Command>,
    cancel: CancelFlag,
    state: Arc<Mutex<ChatState>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        history: HistoryLog,
        executor: Arc<dyn ScriptExecutor>,
        observer: Arc<dyn AgentObserver>,
    ) -> Self {
        Self::with_factory(config, history, executor, observer, default_transport_factory())
    }

    pub fn with_factory(
        config: AgentConfig,
        history: HistoryLog,
        executor: Arc<dyn ScriptExecutor>,
        observer: Arc<dyn AgentObserver>,
        factory: TransportFactory,
    ) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let cancel = CancelFlag::new();
        let state = Arc::new(Mutex::new(ChatState::Disconnected));

        let worker = Worker {
            config,
            history,
            executor,
            observer,
            factory,
            cancel: cancel.clone(),
            state: state.clone(),
            transport: None,
            usage: UsageAccumulator::new(),
        };
        tokio::spawn(worker.run(rx));

        Self {
            commands: tx,
            cancel,
            state,
        }
    }

    pub fn state(&self) -> ChatState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Takes effect while a process() is in flight: aborts the current
    /// transfer at the next data arrival and stops the loop at the next
    /// turn boundary.
    pub fn cancel(&self) {
        self.cancel.set();
    }

    pub async fn connect(&self, credentials: Credentials) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Connect(credentials, tx))
            .await
            .is_err()
        {
            return Err("agent worker unavailable".to_string());
        }
        rx.await.unwrap_or_else(|_| Err("agent worker unavailable".to_string()))
    }

    /// Run the full turn loop for one operator input
    pub async fn process(&self, input: impl Into<String>) -> ProcessResult {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Process(input.into(), tx))
            .await
            .is_err()
        {
            return ProcessResult::failed("agent worker unavailable");
        }
        rx.await
            .unwrap_or_else(|_| ProcessResult::failed("agent worker unavailable"))
    }

    /// Start a fresh history session and drop transport conversation state
    pub async fn new_session(&self) -> Result<String, String> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::NewSession(tx)).await.is_err() {
            return Err("agent worker unavailable".to_string());
        }
        rx.await.unwrap_or_else(|_| Err("agent worker unavailable".to_string()))
    }

    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the worker. Pending commands are dropped.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

struct Worker {
    config: AgentConfig,
    history: HistoryLog,
    executor: Arc<dyn ScriptExecutor>,
    observer: Arc<dyn AgentObserver>,
    factory: TransportFactory,
    cancel: CancelFlag,
    state: Arc<Mutex<ChatState>>,
    transport: Option<Box<dyn Transport>>,
    usage: UsageAccumulator,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Connect(credentials, reply) => {
                    let _ = reply.send(self.connect(credentials).await);
                }
                Command::Process(input, reply) => {
                    let result = self.process(&input).await;
                    self.observer.on_result(&result);
                    let _ = reply.send(result);
                }
                Command::NewSession(reply) => {
                    let _ = reply.send(self.new_session());
                }
                Command::Disconnect(reply) => {
                    self.disconnect().await;
                    let _ = reply.send(());
                }
                Command::Shutdown => break,
            }
        }
        self.disconnect().await;
    }

    fn set_state(&self, state: ChatState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    async fn connect(&mut self, credentials: Credentials) -> Result<(), String> {
        self.set_state(ChatState::Connecting);
        self.cancel.clear();

        let mut transport = match (self.factory)(&credentials, &self.config, self.cancel.clone()) {
            Ok(transport) => transport,
            Err(e) => {
                self.set_state(ChatState::Disconnected);
                return Err(e.to_string());
            }
        };
        if let Err(e) = transport.connect().await {
            log::warn!("Transport connect failed: {e}");
            self.set_state(ChatState::Disconnected);
            return Err(e.to_string());
        }
        self.transport = Some(transport);

        if self.history.current_session_id().is_none() {
            if let Err(e) = self.history.start_new_session() {
                log::warn!("Failed to start history session: {e}");
            }
        }

        self.set_state(ChatState::Idle);
        Ok(())
    }

    fn new_session(&mut self) -> Result<String, String> {
        if let Some(transport) = &mut self.transport {
            transport.reset_session();
        }
        self.usage.reset();
        self.history.start_new_session().map_err(|e| e.to_string())
    }

    async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect().await;
        }
        self.set_state(ChatState::Disconnected);
    }

    async fn process(&mut self, input: &str) -> ProcessResult {
        let Some(mut transport) = self.transport.take() else {
            return ProcessResult::failed("not connected");
        };
        let result = self.run_turns(transport.as_mut(), input).await;
        self.transport = Some(transport);
        result
    }

    async fn run_turns(&mut self, transport: &mut dyn Transport, input: &str) -> ProcessResult {
        self.set_state(ChatState::Processing);
        self.cancel.clear();

        if let Err(e) = self.history.append_user_message(input) {
            log::warn!("History append failed: {e}");
        }

        let mut next_input = input.to_string();
        let mut response = String::new();
        let mut turns_used = 0u32;
        let mut reported_cost: Option<f64> = None;
        let mut error: Option<String> = None;
        let mut cancelled = false;

        for turn in 1..=self.config.max_turns {
            // Turn boundary: a flag set during the previous turn's
            // script execution stops the loop here.
            if self.cancel.is_set() {
                cancelled = true;
                break;
            }
            self.observer.on_turn_start(turn);

            let outcome = match transport.send(&next_input).await {
                Ok(outcome) => outcome,
                Err(TransportError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    log::warn!("Turn {turn} failed: {e}");
                    self.observer.on_error(&e.to_string());
                    error = Some(e.to_string());
                    break;
                }
            };
            turns_used += 1;

            // Usage is folded in whatever happens next.
            self.usage.add(&outcome.usage);
            if let Some(cost) = outcome.cost {
                reported_cost = Some(reported_cost.unwrap_or(0.0) + cost);
            }

            if !outcome.has_content() {
                error = Some("empty response from transport".to_string());
                break;
            }

            for block in &outcome.content {
                if let crate::types::ContentBlock::Thinking { thinking } = block {
                    self.observer.on_thinking(thinking);
                    self.observer.on_thinking_done();
                    if let Err(e) = self.history.append_thinking(thinking) {
                        log::warn!("History append failed: {e}");
                    }
                }
            }

            let display = strip_blocks(&outcome.text);
            if !display.is_empty() {
                self.observer.on_text(&display);
                if !response.is_empty() {
                    response.push_str("\n\n");
                }
                response.push_str(&display);
            }

            let blocks = extract_blocks(&outcome.text);
            let blocks: Vec<_> = blocks.into_iter().filter(|b| !b.code.is_empty()).collect();
            if blocks.is_empty() {
                break;
            }

            if turn == self.config.max_turns {
                // The outputs could never be sent back, so the blocks
                // are not run at all.
                log::warn!("Turn budget exhausted with script blocks pending");
                break;
            }

            if transport.requires_session_resume() && transport.session_id().is_none() {
                // Without a session id the feedback turn would start a
                // fresh conversation instead of continuing this one.
                log::warn!("Script blocks present but no session id captured; stopping turn loop");
                if let Err(e) = self.history.append_system_message(
                    "script execution skipped: no resumable session",
                    "warning",
                ) {
                    log::warn!("History append failed: {e}");
                }
                break;
            }

            next_input = self.execute_blocks(&blocks);
        }

        if !response.is_empty() {
            let total_usage = self.usage.total();
            if let Err(e) = self.history.append_assistant_message(
                &response,
                &self.config.model,
                Some(&total_usage),
            ) {
                log::warn!("History append failed: {e}");
            }
        }

        let cost = reported_cost.or_else(|| {
            let estimate = self.usage.estimate_cost();
            (estimate > 0.0).then_some(estimate)
        });

        self.set_state(if cancelled {
            ChatState::Cancelled
        } else {
            ChatState::Idle
        });

        ProcessResult {
            success: !cancelled && error.is_none(),
            response,
            turns_used,
            cost,
            error,
            cancelled,
        }
    }

    /// Run every block synchronously and fold the outputs into the next
    /// turn's input. Execution failures become feedback, never errors.
    fn execute_blocks(&mut self, blocks: &[crate::script_blocks::ScriptBlock]) -> String {
        let mut outputs = Vec::with_capacity(blocks.len());
        for block in blocks {
            self.observer.on_script_code(&block.code);
            log::debug!("Executing script block ({} bytes)", block.code.len());

            let outcome = self.executor.execute(&block.code);
            let output = if outcome.success {
                outcome.output.clone()
            } else {
                outcome.error.clone()
            };
            self.observer.on_script_output(&output, !outcome.success);

            if let Err(e) =
                self.history
                    .append_script_execution(&block.code, &output, !outcome.success)
            {
                log::warn!("History append failed: {e}");
            }
            outputs.push(output);
        }
        feedback_message(&outputs)
    }
}

/// Synthetic user message carrying script outputs back to the model
pub fn feedback_message(outputs: &[String]) -> String {
    let mut message = String::from("Script execution results:\n\n");
    for output in outputs {
        message.push_str("```\n");
        message.push_str(output);
        if !output.ends_with('\n') {
            message.push('\n');
        }
        message.push_str("```\n\n");
    }
    message
}
