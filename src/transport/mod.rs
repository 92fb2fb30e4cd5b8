use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::types::ContentBlock;
use crate::usage::TokenUsage;

pub mod direct;
pub mod subprocess;

pub use direct::DirectTransport;
pub use subprocess::SubprocessTransport;

/// Cooperative cancellation flag shared between the agent worker and its
/// transport. Setting it aborts in-flight transfers at the next data
/// arrival and stops the turn loop at the next turn boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one completed exchange over a transport
#[derive(Debug, Clone, Default)]
pub struct SendOutcome {
    /// Concatenated assistant text for the exchange
    pub text: String,
    /// Assembled content blocks, when the wire carries them
    pub content: Vec<ContentBlock>,
    /// Session identifier reported by the remote side, if any
    pub session_id: Option<String>,
    pub usage: TokenUsage,
    /// Cost as reported by the remote side (subprocess transport only)
    pub cost: Option<f64>,
    /// Turns the remote side consumed for this exchange
    pub num_turns: u32,
}

impl SendOutcome {
    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || !self.content.is_empty()
    }
}

/// Common contract for the two ways of reaching the model service.
///
/// Resumption state is transport-private: a subprocess conversation cannot
/// be resumed over the direct API or vice versa.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Run one exchange: submit `input`, stream the reply, return the
    /// assembled outcome. Cancellation surfaces as
    /// [`TransportError::Cancelled`].
    async fn send(&mut self, input: &str) -> Result<SendOutcome, TransportError>;

    /// Idempotent; safe before, during, or after a send
    fn cancel(&self);

    fn session_id(&self) -> Option<String>;

    /// Whether multi-turn continuation needs a captured session id
    fn requires_session_resume(&self) -> bool {
        false
    }

    /// Drop any per-conversation state (transcript or session id)
    fn reset_session(&mut self);

    async fn disconnect(&mut self);
}

/// Locate the agent CLI binary: well-known install locations first, then
/// a scan of `PATH`.
pub fn find_cli() -> Option<PathBuf> {
    let home = std::env::var("HOME").unwrap_or_default();
    let candidates = [
        format!("{home}/.local/bin/claude"),
        "/usr/local/bin/claude".to_string(),
        format!("{home}/.npm-global/bin/claude"),
        format!("{home}/node_modules/.bin/claude"),
        format!("{home}/.yarn/bin/claude"),
        format!("{home}/.claude/local/claude"),
    ];

    for candidate in &candidates {
        let path = PathBuf::from(candidate);
        if is_executable(&path) {
            return Some(path);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let path = dir.join("claude");
            if is_executable(&path) {
                return Some(path);
            }
        }
    }

    None
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}
