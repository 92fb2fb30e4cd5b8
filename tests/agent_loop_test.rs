//! Turn-loop behavior driven through a scripted transport and a mock
//! script executor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use script_agent::{
    feedback_message, Agent, AgentConfig, CancelFlag, ContentBlock, Credentials, HistoryLog,
    NullObserver, ScriptExecutor, ScriptOutcome, SendOutcome, Transport, TransportError,
};

struct ScriptedTransport {
    responses: VecDeque<String>,
    inputs: Arc<Mutex<Vec<String>>>,
    cancel: CancelFlag,
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn send(&mut self, input: &str) -> Result<SendOutcome, TransportError> {
        if self.cancel.is_set() {
            return Err(TransportError::Cancelled);
        }
        self.inputs
            .lock()
            .unwrap()
            .push(input.to_string());
        let text = self.responses.pop_front().unwrap_or_default();
        Ok(SendOutcome {
            text: text.clone(),
            content: vec![ContentBlock::Text { text }],
            session_id: None,
            usage: Default::default(),
            cost: None,
            num_turns: 1,
        })
    }

    fn cancel(&self) {
        self.cancel.set();
    }

    fn session_id(&self) -> Option<String> {
        None
    }

    fn reset_session(&mut self) {}

    async fn disconnect(&mut self) {}
}

struct RecordingExecutor {
    codes: Arc<Mutex<Vec<String>>>,
    output: String,
    /// Set during execute(), emulating an operator pressing cancel while
    /// a script runs
    cancel_on_execute: Arc<Mutex<Option<CancelFlag>>>,
}

impl RecordingExecutor {
    fn new(output: &str) -> Self {
        Self {
            codes: Arc::new(Mutex::new(Vec::new())),
            output: output.to_string(),
            cancel_on_execute: Arc::new(Mutex::new(None)),
        }
    }
}

impl ScriptExecutor for RecordingExecutor {
    fn execute(&self, code: &str) -> ScriptOutcome {
        self.codes.lock().unwrap().push(code.to_string());
        if let Some(flag) = self.cancel_on_execute.lock().unwrap().as_ref() {
            flag.set();
        }
        ScriptOutcome::ok(self.output.clone(), Duration::from_millis(1))
    }
}

fn temp_history() -> HistoryLog {
    let root = std::env::temp_dir().join(format!("agent-test-{}", uuid::Uuid::new_v4()));
    HistoryLog::new(root, "tester").unwrap()
}

struct Harness {
    agent: Agent,
    inputs: Arc<Mutex<Vec<String>>>,
    /// Cancel flag the worker handed to its transport
    flag: Arc<Mutex<Option<CancelFlag>>>,
}

fn harness(responses: Vec<&str>, max_turns: u32, executor: Arc<RecordingExecutor>) -> Harness {
    let inputs = Arc::new(Mutex::new(Vec::new()));
    let flag = Arc::new(Mutex::new(None));
    let responses: VecDeque<String> = responses.into_iter().map(String::from).collect();

    let factory_inputs = inputs.clone();
    let factory_flag = flag.clone();
    let factory = Box::new(
        move |_creds: &Credentials, _config: &AgentConfig, cancel: CancelFlag| {
            *factory_flag.lock().unwrap() = Some(cancel.clone());
            Ok(Box::new(ScriptedTransport {
                responses: responses.clone(),
                inputs: factory_inputs.clone(),
                cancel,
            }) as Box<dyn Transport>)
        },
    );

    let config = AgentConfig {
        max_turns,
        ..Default::default()
    };
    let agent = Agent::with_factory(
        config,
        temp_history(),
        executor,
        Arc::new(NullObserver),
        factory,
    );
    Harness {
        agent,
        inputs,
        flag,
    }
}

#[tokio::test]
async fn test_single_turn_without_script_tags() {
    let executor = Arc::new(RecordingExecutor::new(""));
    let h = harness(vec!["Hello there."], 10, executor.clone());
    h.agent.connect(Credentials::cli()).await.unwrap();

    let result = h.agent.process("hi").await;
    assert!(result.success);
    assert!(!result.cancelled);
    assert_eq!(result.turns_used, 1);
    assert_eq!(result.response, "Hello there.");
    assert_eq!(h.inputs.lock().unwrap().as_slice(), ["hi"]);
    assert!(executor.codes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_two_turns_with_script_feedback() {
    let executor = Arc::new(RecordingExecutor::new("42\n"));
    let h = harness(
        vec![
            "Let me compute it. <code>print(6 * 7)</code>",
            "The answer is 42.",
        ],
        10,
        executor.clone(),
    );
    h.agent.connect(Credentials::cli()).await.unwrap();

    let result = h.agent.process("what is six times seven?").await;
    assert!(result.success);
    assert_eq!(result.turns_used, 2);

    let inputs = h.inputs.lock().unwrap();
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[0], "what is six times seven?");
    // The second input is exactly the synthetic feedback message
    assert_eq!(inputs[1], feedback_message(&["42\n".to_string()]));

    assert_eq!(executor.codes.lock().unwrap().as_slice(), ["print(6 * 7)"]);

    // Display text carries no script tags
    assert!(!result.response.contains("<code>"));
    assert!(result.response.contains("Let me compute it."));
    assert!(result.response.contains("The answer is 42."));
}

#[tokio::test]
async fn test_turn_budget_stops_loop() {
    let executor = Arc::new(RecordingExecutor::new("output"));
    let h = harness(
        vec!["first <code>a()</code>", "second <code>b()</code>"],
        1,
        executor.clone(),
    );
    h.agent.connect(Credentials::cli()).await.unwrap();

    let result = h.agent.process("go").await;
    assert!(result.success);
    assert_eq!(result.turns_used, 1);
    assert_eq!(h.inputs.lock().unwrap().len(), 1);
    // Pending blocks on the final turn are not run: their output could
    // never be sent back
    assert!(executor.codes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_between_turns() {
    let executor = Arc::new(RecordingExecutor::new("partial"));
    let h = harness(
        vec!["step one <code>run()</code>", "never reached"],
        10,
        executor.clone(),
    );
    h.agent.connect(Credentials::cli()).await.unwrap();
    // Arm the executor to set the shared cancel flag mid-execution
    *executor.cancel_on_execute.lock().unwrap() = h.flag.lock().unwrap().clone();

    let result = h.agent.process("go").await;
    assert!(result.cancelled);
    assert!(!result.success);
    assert!(result.error.is_none());
    // The turn that ran still counts; no further transport call happened
    assert_eq!(result.turns_used, 1);
    assert_eq!(h.inputs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_resume_transport_without_session_stops_loop() {
    struct NoSessionTransport {
        inputs: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Transport for NoSessionTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn send(&mut self, input: &str) -> Result<SendOutcome, TransportError> {
            self.inputs.lock().unwrap().push(input.to_string());
            let text = "on it <code>run()</code>".to_string();
            Ok(SendOutcome {
                text: text.clone(),
                content: vec![ContentBlock::Text { text }],
                session_id: None,
                usage: Default::default(),
                cost: None,
                num_turns: 1,
            })
        }
        fn cancel(&self) {}
        // Never reports a session id, so a feedback turn could not
        // continue this conversation
        fn session_id(&self) -> Option<String> {
            None
        }
        fn requires_session_resume(&self) -> bool {
            true
        }
        fn reset_session(&mut self) {}
        async fn disconnect(&mut self) {}
    }

    let root = std::env::temp_dir().join(format!("agent-test-{}", uuid::Uuid::new_v4()));
    let mut history = HistoryLog::new(&root, "tester").unwrap();
    history.start_new_session().unwrap();
    let session_file = history.current_session_file().unwrap().to_path_buf();

    let inputs = Arc::new(Mutex::new(Vec::new()));
    let factory_inputs = inputs.clone();
    let factory = Box::new(
        move |_: &Credentials, _: &AgentConfig, _: CancelFlag| {
            Ok(Box::new(NoSessionTransport {
                inputs: factory_inputs.clone(),
            }) as Box<dyn Transport>)
        },
    );
    let executor = Arc::new(RecordingExecutor::new("output"));
    let agent = Agent::with_factory(
        AgentConfig::default(),
        history,
        executor.clone(),
        Arc::new(NullObserver),
        factory,
    );
    agent.connect(Credentials::cli()).await.unwrap();

    let result = agent.process("go").await;
    // Recoverable stop: one turn, no feedback turn, no error
    assert!(result.success);
    assert!(result.error.is_none());
    assert!(!result.cancelled);
    assert_eq!(result.turns_used, 1);
    assert_eq!(inputs.lock().unwrap().len(), 1);
    assert!(executor.codes.lock().unwrap().is_empty());

    // The skip is recorded as a system history line
    let contents = std::fs::read_to_string(&session_file).unwrap();
    let system = contents
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .find(|r| r["type"] == "system")
        .expect("system record in session file");
    assert_eq!(system["level"], "warning");

    std::fs::remove_dir_all(&root).unwrap();
}

#[tokio::test]
async fn test_process_without_connect_fails() {
    let executor = Arc::new(RecordingExecutor::new(""));
    let h = harness(vec![], 10, executor);

    let result = h.agent.process("hi").await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("not connected"));
    assert_eq!(result.turns_used, 0);
}

#[tokio::test]
async fn test_transport_error_becomes_result_string() {
    struct FailingTransport;

    #[async_trait::async_trait]
    impl Transport for FailingTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn send(&mut self, _input: &str) -> Result<SendOutcome, TransportError> {
            Err(TransportError::Timeout)
        }
        fn cancel(&self) {}
        fn session_id(&self) -> Option<String> {
            None
        }
        fn reset_session(&mut self) {}
        async fn disconnect(&mut self) {}
    }

    let factory = Box::new(
        |_: &Credentials, _: &AgentConfig, _: CancelFlag| {
            Ok(Box::new(FailingTransport) as Box<dyn Transport>)
        },
    );
    let agent = Agent::with_factory(
        AgentConfig::default(),
        temp_history(),
        Arc::new(RecordingExecutor::new("")),
        Arc::new(NullObserver),
        factory,
    );
    agent.connect(Credentials::cli()).await.unwrap();

    let result = agent.process("hi").await;
    assert!(!result.success);
    assert!(!result.cancelled);
    assert!(result.error.is_some());
    assert_eq!(result.turns_used, 0);
}
