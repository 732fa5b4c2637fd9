//! Container protocol types shared across the orchestrator.
//!
//! Defines the wire format for communication with agent containers:
//! - `ContainerInput`: JSON written to the container's stdin as a single
//!   atomic payload (the only place secrets ever travel).
//! - `AgentRecord`: one JSON object per newline read from container stdout.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::runtime::RuntimeKind;

/// Input payload written to container stdin as JSON, once, before the
/// container's own stdin is closed or kept open for follow-up turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_scheduled_task: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Secrets injected via stdin, never written to disk, never passed as
    /// an environment variable or argv. Dropped from memory once the
    /// container process has consumed them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<HashMap<String, String>>,
}

/// One line of newline-delimited JSON emitted by the agent container on
/// stdout. Each line is a complete, independently-parseable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRecord {
    /// Final textual result of the current turn.
    Result {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// Run-level status. `Success` signals the container is done with this
    /// turn and idle (the runner should call `notify_idle`); `Error`
    /// signals the turn failed and the caller should roll back its cursor.
    Status {
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Best-effort typing indicator toggle; failures to deliver it are
    /// swallowed by the caller.
    Typing { on: bool },
    /// Session identifier to persist for conversational continuity across
    /// turns within the same group.
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingState {
    On,
    Off,
}

/// Volume mount specification for container execution.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
    /// Subdirectory names to hide via tmpfs overlay.
    pub exclude: Vec<String>,
}

/// Container image names keyed by runtime.
pub fn container_image(runtime: RuntimeKind) -> &'static str {
    match runtime {
        RuntimeKind::Claude => "intercom-agent:latest",
        RuntimeKind::Gemini => "intercom-agent-gemini:latest",
        RuntimeKind::Codex => "intercom-agent-codex:latest",
    }
}

/// Runner source directory name for each runtime.
pub fn runner_dir_name(runtime: RuntimeKind) -> &'static str {
    match runtime {
        RuntimeKind::Claude => "agent-runner",
        RuntimeKind::Gemini => "gemini-runner",
        RuntimeKind::Codex => "codex-runner",
    }
}

/// Container mount path for runner source code.
/// Claude uses flat layout at `/app/src`, others use nested layout.
pub fn runner_container_path(runtime: RuntimeKind) -> String {
    match runtime {
        RuntimeKind::Claude => "/app/src".to_string(),
        _ => format!("/app/{}/src", runner_dir_name(runtime)),
    }
}

/// Parses complete newline-delimited JSON records from a byte buffer.
///
/// Returns the parsed records and the number of bytes consumed (up to and
/// including the last complete line's newline). Unconsumed bytes — a
/// partial final line — remain in the caller's buffer for the next read.
/// A line that fails to parse as an `AgentRecord` is skipped rather than
/// treated as fatal, since container stdout may interleave stray logging.
pub fn parse_agent_records(buf: &str) -> (Vec<AgentRecord>, usize) {
    let mut results = Vec::new();
    let mut consumed = 0;

    for line in buf.split_inclusive('\n') {
        if !line.ends_with('\n') {
            break; // partial line, wait for more bytes
        }
        consumed += line.len();
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str::<AgentRecord>(trimmed) {
            results.push(record);
        }
    }

    (results, consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_input_serializes_camel_case() {
        let input = ContainerInput {
            prompt: "hello".to_string(),
            session_id: Some("sess-123".to_string()),
            group_folder: "main".to_string(),
            chat_jid: "tg:123".to_string(),
            is_main: true,
            is_scheduled_task: None,
            assistant_name: Some("Andy".to_string()),
            model: None,
            secrets: None,
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"chatJid\""));
        assert!(json.contains("\"groupFolder\""));
        assert!(json.contains("\"isMain\""));
        assert!(json.contains("\"sessionId\""));
        assert!(!json.contains("\"model\""));
        assert!(!json.contains("\"secrets\""));
    }

    #[test]
    fn agent_record_result_roundtrip() {
        let json = r#"{"type":"result","text":"Hello!"}"#;
        let record: AgentRecord = serde_json::from_str(json).unwrap();
        match record {
            AgentRecord::Result { text, model } => {
                assert_eq!(text, "Hello!");
                assert!(model.is_none());
            }
            _ => panic!("expected Result"),
        }
    }

    #[test]
    fn agent_record_status_success() {
        let json = r#"{"type":"status","status":"success"}"#;
        let record: AgentRecord = serde_json::from_str(json).unwrap();
        assert_eq!(
            record,
            AgentRecord::Status {
                status: RunStatus::Success,
                error: None
            }
        );
    }

    #[test]
    fn agent_record_status_error_carries_message() {
        let json = r#"{"type":"status","status":"error","error":"tool failed"}"#;
        let record: AgentRecord = serde_json::from_str(json).unwrap();
        match record {
            AgentRecord::Status { status, error } => {
                assert_eq!(status, RunStatus::Error);
                assert_eq!(error.as_deref(), Some("tool failed"));
            }
            _ => panic!("expected Status"),
        }
    }

    #[test]
    fn agent_record_typing_on_off() {
        let on: AgentRecord = serde_json::from_str(r#"{"type":"typing","on":true}"#).unwrap();
        let off: AgentRecord = serde_json::from_str(r#"{"type":"typing","on":false}"#).unwrap();
        assert_eq!(on, AgentRecord::Typing { on: true });
        assert_eq!(off, AgentRecord::Typing { on: false });
    }

    #[test]
    fn agent_record_session() {
        let json = r#"{"type":"session","sessionId":"sess-789"}"#;
        let record: AgentRecord = serde_json::from_str(json).unwrap();
        assert_eq!(
            record,
            AgentRecord::Session {
                session_id: "sess-789".to_string()
            }
        );
    }

    #[test]
    fn parse_records_multiple_lines() {
        let buf = "{\"type\":\"typing\",\"on\":true}\n{\"type\":\"result\",\"text\":\"done\"}\n{\"type\":\"status\",\"status\":\"success\"}\n";
        let (records, consumed) = parse_agent_records(buf);
        assert_eq!(records.len(), 3);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn parse_records_leaves_partial_line_unconsumed() {
        let buf = "{\"type\":\"result\",\"text\":\"done\"}\n{\"type\":\"status\"";
        let (records, consumed) = parse_agent_records(buf);
        assert_eq!(records.len(), 1);
        assert_eq!(&buf[consumed..], "{\"type\":\"status\"");
    }

    #[test]
    fn parse_records_skips_unparseable_lines() {
        let buf = "not json at all\n{\"type\":\"result\",\"text\":\"ok\"}\n";
        let (records, consumed) = parse_agent_records(buf);
        assert_eq!(records.len(), 1);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn parse_records_empty_buffer() {
        let (results, consumed) = parse_agent_records("");
        assert_eq!(results.len(), 0);
        assert_eq!(consumed, 0);
    }

    #[test]
    fn container_image_names() {
        assert_eq!(container_image(RuntimeKind::Claude), "intercom-agent:latest");
        assert_eq!(container_image(RuntimeKind::Gemini), "intercom-agent-gemini:latest");
        assert_eq!(container_image(RuntimeKind::Codex), "intercom-agent-codex:latest");
    }

    #[test]
    fn runner_container_paths() {
        assert_eq!(runner_container_path(RuntimeKind::Claude), "/app/src");
        assert_eq!(runner_container_path(RuntimeKind::Gemini), "/app/gemini-runner/src");
        assert_eq!(runner_container_path(RuntimeKind::Codex), "/app/codex-runner/src");
    }

    #[test]
    fn volume_mount_builder() {
        let mount = VolumeMount {
            host_path: "/home/user/projects".to_string(),
            container_path: "/workspace/project".to_string(),
            readonly: true,
            exclude: vec!["node_modules".to_string()],
        };
        assert!(mount.readonly);
        assert_eq!(mount.exclude.len(), 1);
    }
}
