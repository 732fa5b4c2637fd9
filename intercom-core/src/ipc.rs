//! IPC types for the task/group registration channel.
//!
//! Agent containers write JSON files into `./data/ipc/<groupFolder>/tasks/`.
//! The host daemon polls these directories and dispatches each file as an
//! `IpcTask` command against the scheduler and the registered-group table.

use serde::{Deserialize, Serialize};

/// Task management command from a container agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcTask {
    ScheduleTask {
        prompt: String,
        schedule_type: String,
        schedule_value: String,
        #[serde(default = "default_context_mode")]
        context_mode: String,
        #[serde(rename = "targetJid")]
        target_jid: Option<String>,
        #[serde(rename = "createdBy")]
        created_by: Option<String>,
        timestamp: Option<String>,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "groupFolder")]
        group_folder: Option<String>,
        timestamp: Option<String>,
    },
    RefreshGroups {
        timestamp: Option<String>,
    },
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        trigger: String,
        timestamp: Option<String>,
    },
}

fn default_context_mode() -> String {
    "isolated".to_string()
}

/// Context for authorization decisions — derived from the IPC directory path.
#[derive(Debug, Clone)]
pub struct IpcGroupContext {
    /// Group folder name (e.g., "main", "team-eng").
    pub group_folder: String,
    /// Whether this is the main group (has elevated privileges).
    pub is_main: bool,
}

impl IpcGroupContext {
    pub fn new(group_folder: impl Into<String>, main_group_name: &str) -> Self {
        let group_folder = group_folder.into();
        let is_main = group_folder == main_group_name;
        Self {
            group_folder,
            is_main,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_task_parses_from_camel_case_json() {
        let json = r#"{"type":"schedule_task","prompt":"check in","schedule_type":"interval","schedule_value":"3600","targetJid":"main","createdBy":"agent","timestamp":"2024-01-01T00:00:00Z"}"#;
        let task: IpcTask = serde_json::from_str(json).unwrap();
        match task {
            IpcTask::ScheduleTask {
                prompt,
                context_mode,
                target_jid,
                ..
            } => {
                assert_eq!(prompt, "check in");
                assert_eq!(context_mode, "isolated");
                assert_eq!(target_jid.as_deref(), Some("main"));
            }
            _ => panic!("expected ScheduleTask"),
        }
    }

    #[test]
    fn group_context_detects_main() {
        let ctx = IpcGroupContext::new("main", "main");
        assert!(ctx.is_main);
        let ctx = IpcGroupContext::new("team-eng", "main");
        assert!(!ctx.is_main);
    }
}
