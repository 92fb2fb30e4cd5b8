//! Append-only per-session conversation history.
//!
//! One directory per owner identity (reversible base64 encoding of the
//! owner id), one `{session-id}.jsonl` file per session, one JSON object
//! per line chained by uuid/parentUuid. The log is advisory: appends are
//! not followed by a durability barrier, and corrupt lines are skipped on
//! load.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use uuid::Uuid;

use crate::usage::TokenUsage;

const FORMAT_VERSION: u32 = 1;
const FIRST_MESSAGE_PREVIEW_LEN: usize = 100;

/// One record loaded back from a session file
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub uuid: String,
    pub parent_uuid: String,
    pub kind: String,
    pub timestamp: i64,
    pub raw: serde_json::Value,
}

/// Cheap per-session summary; built from at most the first three lines
/// of the file
#[derive(Debug, Clone, Default)]
pub struct SessionSummary {
    pub session_id: String,
    pub path: PathBuf,
    pub timestamp: i64,
    pub first_message: String,
    pub message_count: usize,
}

/// Derive the directory name for an owner identity. Reversible.
pub fn encode_owner_dir(owner_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(owner_id.as_bytes())
}

/// Recover the owner identity from a directory name
pub fn decode_owner_dir(name: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(name).ok()?;
    String::from_utf8(bytes).ok()
}

/// Append-only session record store with uuid parent-chaining.
/// Single-writer by construction: owned by one agent worker.
#[derive(Debug)]
pub struct HistoryLog {
    owner_id: String,
    sessions_dir: PathBuf,
    session_id: Option<String>,
    session_file: Option<PathBuf>,
    last_uuid: String,
}

impl HistoryLog {
    /// Open (or create) the session directory for `owner_id` under `root`
    pub fn new(root: impl Into<PathBuf>, owner_id: &str) -> std::io::Result<Self> {
        let sessions_dir = root.into().join(encode_owner_dir(owner_id));
        std::fs::create_dir_all(&sessions_dir)?;
        Ok(Self {
            owner_id: owner_id.to_string(),
            sessions_dir,
            session_id: None,
            session_file: None,
            last_uuid: String::new(),
        })
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn current_session_file(&self) -> Option<&Path> {
        self.session_file.as_deref()
    }

    /// Mint a fresh session: new id, empty file, reset uuid chain, one
    /// leading summary record
    pub fn start_new_session(&mut self) -> std::io::Result<String> {
        let session_id = Uuid::new_v4().to_string();
        self.session_file = Some(self.sessions_dir.join(format!("{session_id}.jsonl")));
        self.session_id = Some(session_id.clone());
        self.last_uuid = String::new();

        self.write_record(serde_json::json!({
            "type": "summary",
            "version": FORMAT_VERSION,
            "sessionId": session_id,
            "ownerId": self.owner_id,
        }))?;

        Ok(session_id)
    }

    pub fn append_user_message(&mut self, content: &str) -> std::io::Result<String> {
        self.write_record(serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": content },
        }))
    }

    pub fn append_assistant_message(
        &mut self,
        content: &str,
        model: &str,
        usage: Option<&TokenUsage>,
    ) -> std::io::Result<String> {
        let mut record = serde_json::json!({
            "type": "assistant",
            "message": { "role": "assistant", "content": content },
            "model": model,
        });
        if let Some(usage) = usage {
            record["usage"] = serde_json::json!({
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens,
            });
        }
        self.write_record(record)
    }

    pub fn append_tool_use(
        &mut self,
        tool_name: &str,
        tool_input: &serde_json::Value,
        tool_use_id: &str,
    ) -> std::io::Result<String> {
        self.write_record(serde_json::json!({
            "type": "tool_use",
            "toolUseId": tool_use_id,
            "toolName": tool_name,
            "toolInput": tool_input,
        }))
    }

    pub fn append_tool_result(
        &mut self,
        tool_use_id: &str,
        content: &str,
        is_error: bool,
    ) -> std::io::Result<String> {
        self.write_record(serde_json::json!({
            "type": "tool_result",
            "toolUseId": tool_use_id,
            "content": content,
            "isError": is_error,
        }))
    }

    pub fn append_thinking(&mut self, thinking: &str) -> std::io::Result<String> {
        self.write_record(serde_json::json!({
            "type": "thinking",
            "thinking": thinking,
        }))
    }

    pub fn append_system_message(&mut self, content: &str, level: &str) -> std::io::Result<String> {
        self.write_record(serde_json::json!({
            "type": "system",
            "content": content,
            "level": level,
        }))
    }

    /// Record one script execution as a tool_use/tool_result pair sharing
    /// a fresh tool id. Returns the tool id.
    pub fn append_script_execution(
        &mut self,
        code: &str,
        output: &str,
        is_error: bool,
    ) -> std::io::Result<String> {
        let tool_id = Uuid::new_v4().to_string();
        self.append_tool_use("run_script", &serde_json::json!({ "code": code }), &tool_id)?;
        self.append_tool_result(&tool_id, output, is_error)?;
        Ok(tool_id)
    }

    /// Load every parseable record of a session, skipping corrupt lines
    pub fn load_session(&self, session_id: &str) -> std::io::Result<Vec<HistoryMessage>> {
        let path = self.sessions_dir.join(format!("{session_id}.jsonl"));
        let file = File::open(path)?;

        let mut messages = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let Ok(raw) = serde_json::from_str::<serde_json::Value>(&line) else {
                // Forward/corruption tolerance
                continue;
            };
            messages.push(HistoryMessage {
                uuid: raw["uuid"].as_str().unwrap_or_default().to_string(),
                parent_uuid: raw["parentUuid"].as_str().unwrap_or_default().to_string(),
                kind: raw["type"].as_str().unwrap_or_default().to_string(),
                timestamp: raw["timestamp"].as_i64().unwrap_or_default(),
                raw,
            });
        }
        Ok(messages)
    }

    /// Summaries of every session, parsing only the first three lines of
    /// each file and counting the rest
    pub fn list_sessions(&self) -> std::io::Result<Vec<SessionSummary>> {
        let mut sessions = Vec::new();

        for entry in std::fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let session_id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();

            let mut summary = SessionSummary {
                session_id,
                path: path.clone(),
                ..Default::default()
            };

            if let Ok(file) = File::open(&path) {
                for (count, line) in BufReader::new(file).lines().enumerate() {
                    let Ok(line) = line else { break };
                    summary.message_count = count + 1;
                    if count >= 3 || line.is_empty() {
                        continue;
                    }
                    let Ok(json) = serde_json::from_str::<serde_json::Value>(&line) else {
                        continue;
                    };
                    if count == 0 {
                        summary.timestamp = json["timestamp"].as_i64().unwrap_or_default();
                    }
                    if json["type"] == "user" && summary.first_message.is_empty() {
                        if let Some(content) = json["message"]["content"].as_str() {
                            summary.first_message = truncate_preview(content);
                        }
                    }
                }
            }

            sessions.push(summary);
        }

        Ok(sessions)
    }

    /// All user inputs across every session, oldest session first
    pub fn all_user_messages(&self) -> std::io::Result<Vec<String>> {
        let mut sessions = self.list_sessions()?;
        sessions.sort_by_key(|s| s.timestamp);

        let mut messages = Vec::new();
        for session in &sessions {
            for record in self.load_session(&session.session_id)? {
                if record.kind == "user" {
                    if let Some(content) = record.raw["message"]["content"].as_str() {
                        messages.push(content.to_string());
                    }
                }
            }
        }
        Ok(messages)
    }

    fn write_record(&mut self, mut record: serde_json::Value) -> std::io::Result<String> {
        let path = self.session_file.clone().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no active session")
        })?;

        let uuid = Uuid::new_v4().to_string();
        record["uuid"] = serde_json::Value::String(uuid.clone());
        record["parentUuid"] = serde_json::Value::String(self.last_uuid.clone());
        record["timestamp"] = serde_json::Value::from(Utc::now().timestamp_millis());

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut line = record.to_string();
        line.push('\n');
        file.write_all(line.as_bytes())?;

        self.last_uuid = uuid.clone();
        Ok(uuid)
    }
}

fn truncate_preview(content: &str) -> String {
    if content.chars().count() > FIRST_MESSAGE_PREVIEW_LEN {
        let head: String = content.chars().take(FIRST_MESSAGE_PREVIEW_LEN - 3).collect();
        format!("{head}...")
    } else {
        content.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("history-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn test_owner_dir_encoding_roundtrip() {
        let owner = "/home/user/projects/target.bin";
        let encoded = encode_owner_dir(owner);
        assert!(!encoded.contains('/'));
        assert_eq!(decode_owner_dir(&encoded).as_deref(), Some(owner));
    }

    #[test]
    fn test_uuid_chain_matches_append_order() {
        let root = temp_root();
        let mut log = HistoryLog::new(&root, "owner").unwrap();
        let id = log.start_new_session().unwrap();
        log.append_user_message("one").unwrap();
        log.append_user_message("two").unwrap();

        let messages = log.load_session(&id).unwrap();
        assert!(messages.len() >= 3);
        assert_eq!(messages[0].parent_uuid, "");
        for pair in messages.windows(2) {
            assert_eq!(pair[1].parent_uuid, pair[0].uuid);
        }

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_append_without_session_fails() {
        let root = temp_root();
        let mut log = HistoryLog::new(&root, "owner").unwrap();
        assert!(log.append_user_message("orphan").is_err());
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_preview_truncation() {
        let long = "x".repeat(250);
        let preview = truncate_preview(&long);
        assert_eq!(preview.chars().count(), FIRST_MESSAGE_PREVIEW_LEN);
        assert!(preview.ends_with("..."));
        assert_eq!(truncate_preview("short"), "short");
    }
}
