//! Conversation mediation between an operator, a remote model service,
//! and a sandboxed script-execution capability, with durable per-session
//! history.
//!
//! The crate exposes an [`Agent`] handle backed by a single worker task.
//! The worker drives a multi-turn loop over a [`Transport`] (streaming
//! HTTPS or an agent-CLI subprocess), extracts embedded script blocks
//! from replies, runs them through a [`ScriptExecutor`], and feeds the
//! outputs back to the model. Every exchange is appended to a
//! uuid-chained JSONL [`HistoryLog`].

pub mod agent;
pub mod config;
pub mod error;
pub mod history;
pub mod script_blocks;
pub mod stream_decoder;
pub mod transport;
pub mod types;
pub mod usage;

pub use agent::{
    default_transport_factory, feedback_message, Agent, AgentObserver, NullObserver,
    ScriptExecutor, TransportFactory,
};
pub use config::{load_system_prompt_dir, AgentConfig};
pub use error::TransportError;
pub use history::{decode_owner_dir, encode_owner_dir, HistoryLog, HistoryMessage, SessionSummary};
pub use script_blocks::{extract_blocks, has_blocks, strip_blocks, ScriptBlock};
pub use stream_decoder::{StreamDecoder, StreamEvent};
pub use transport::{
    find_cli, CancelFlag, DirectTransport, SendOutcome, SubprocessTransport, Transport,
};
pub use types::{
    ChatState, ContentBlock, Credentials, Message, MessageRole, ProcessResult, ScriptOutcome,
};
pub use usage::{TokenUsage, UsageAccumulator};
