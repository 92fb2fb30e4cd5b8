//! Session history: uuid chaining, round trips, cheap listing, and
//! corruption tolerance.

use std::io::Write;

use script_agent::{decode_owner_dir, encode_owner_dir, HistoryLog};

fn temp_root() -> std::path::PathBuf {
    let root = std::env::temp_dir().join(format!("history-it-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&root).unwrap();
    root
}

#[test]
fn test_append_then_load_round_trip() {
    let root = temp_root();
    let mut log = HistoryLog::new(&root, "owner-1").unwrap();
    let session = log.start_new_session().unwrap();

    log.append_user_message("hello").unwrap();
    log.append_assistant_message("hi back", "claude-sonnet-4", None)
        .unwrap();
    log.append_script_execution("print(1)", "1\n", false).unwrap();
    log.append_system_message("note", "info").unwrap();

    let records = log.load_session(&session).unwrap();
    let kinds: Vec<&str> = records.iter().map(|r| r.kind.as_str()).collect();
    assert_eq!(
        kinds,
        ["summary", "user", "assistant", "tool_use", "tool_result", "system"]
    );
    assert_eq!(records[1].raw["message"]["content"], "hello");
    assert_eq!(records[3].raw["toolName"], "run_script");
    assert_eq!(records[4].raw["content"], "1\n");
    assert_eq!(records[4].raw["isError"], false);

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_uuid_chain_is_strict() {
    let root = temp_root();
    let mut log = HistoryLog::new(&root, "owner-1").unwrap();
    let session = log.start_new_session().unwrap();
    for i in 0..5 {
        log.append_user_message(&format!("msg {i}")).unwrap();
    }

    let records = log.load_session(&session).unwrap();
    assert_eq!(records[0].parent_uuid, "");
    for pair in records.windows(2) {
        assert_eq!(pair[1].parent_uuid, pair[0].uuid);
        assert!(pair[1].timestamp >= pair[0].timestamp);
    }

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_new_session_resets_the_chain() {
    let root = temp_root();
    let mut log = HistoryLog::new(&root, "owner-1").unwrap();
    let first = log.start_new_session().unwrap();
    log.append_user_message("in first").unwrap();

    let second = log.start_new_session().unwrap();
    assert_ne!(first, second);
    log.append_user_message("in second").unwrap();

    let records = log.load_session(&second).unwrap();
    assert_eq!(records[0].parent_uuid, "");
    assert_eq!(records[0].kind, "summary");

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_corrupt_lines_are_skipped_on_load() {
    let root = temp_root();
    let mut log = HistoryLog::new(&root, "owner-1").unwrap();
    let session = log.start_new_session().unwrap();
    log.append_user_message("before").unwrap();

    // Inject garbage mid-file
    let path = log.current_session_file().unwrap().to_path_buf();
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(file, "{{not json at all").unwrap();
    drop(file);

    log.append_user_message("after").unwrap();

    let records = log.load_session(&session).unwrap();
    let kinds: Vec<&str> = records.iter().map(|r| r.kind.as_str()).collect();
    assert_eq!(kinds, ["summary", "user", "user"]);

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_list_sessions_reads_only_three_lines() {
    let root = temp_root();
    let mut log = HistoryLog::new(&root, "owner-1").unwrap();
    log.start_new_session().unwrap();
    log.append_user_message("the first question asked").unwrap();
    for i in 0..20 {
        log.append_user_message(&format!("filler {i}")).unwrap();
    }

    let sessions = log.list_sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    let summary = &sessions[0];
    assert_eq!(summary.first_message, "the first question asked");
    assert!(summary.timestamp > 0);
    // 1 summary + 21 user lines
    assert_eq!(summary.message_count, 22);

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_owner_dir_encoding_is_reversible_and_safe() {
    for owner in ["simple", "/abs/path/app.bin", "name with spaces", "日本語"] {
        let dir = encode_owner_dir(owner);
        assert!(!dir.contains('/'));
        assert!(!dir.contains('='));
        assert_eq!(decode_owner_dir(&dir).as_deref(), Some(owner));
    }
    assert_eq!(decode_owner_dir("!!not base64!!"), None);
}

#[test]
fn test_all_user_messages_spans_sessions() {
    let root = temp_root();
    let mut log = HistoryLog::new(&root, "owner-1").unwrap();

    log.start_new_session().unwrap();
    log.append_user_message("first session question").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    log.start_new_session().unwrap();
    log.append_user_message("second session question").unwrap();

    let messages = log.all_user_messages().unwrap();
    assert_eq!(
        messages,
        ["first session question", "second session question"]
    );

    std::fs::remove_dir_all(&root).unwrap();
}
