//! Filesystem-based IPC watcher for intercomd.
//!
//! Polls `{ipc_base}/{group}/tasks/` directories for container-initiated
//! task and group registration commands. Processes files atomically
//! (read → act → unlink), moving failures to an `errors/` directory for
//! debugging.
//!
//! Authorization model:
//! - The main group may register/cancel tasks for any group.
//! - Non-main groups may only act on themselves.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use intercom_core::{IpcGroupContext, IpcTask, RegisteredGroup, ScheduledTask, Store, TaskUpdate};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

const MAIN_GROUP_FOLDER: &str = "main";

/// Configuration for the IPC watcher.
#[derive(Debug, Clone)]
pub struct IpcWatcherConfig {
    /// Base directory for IPC files (e.g., `data/ipc`).
    pub ipc_base_dir: PathBuf,
    /// Poll interval.
    pub poll_interval: Duration,
    /// Name of the main group folder, exempt from self-only authorization.
    pub main_group_folder: String,
}

impl Default for IpcWatcherConfig {
    fn default() -> Self {
        Self {
            ipc_base_dir: PathBuf::from("data/ipc"),
            poll_interval: Duration::from_secs(1),
            main_group_folder: MAIN_GROUP_FOLDER.to_string(),
        }
    }
}

/// The IPC watcher. Owns polling state and dispatches tasks against the
/// store and the shared in-memory registered-groups map.
pub struct IpcWatcher {
    config: IpcWatcherConfig,
    store: Store,
    groups: Arc<RwLock<HashMap<String, RegisteredGroup>>>,
}

impl IpcWatcher {
    pub fn new(
        config: IpcWatcherConfig,
        store: Store,
        groups: Arc<RwLock<HashMap<String, RegisteredGroup>>>,
    ) -> Self {
        Self {
            config,
            store,
            groups,
        }
    }

    /// Run the IPC polling loop. Call from a tokio::spawn.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        fs::create_dir_all(&self.config.ipc_base_dir).ok();
        info!(dir = %self.config.ipc_base_dir.display(), "IPC watcher started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("IPC watcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Process one polling cycle across all group directories.
    async fn poll_once(&self) {
        let group_folders = match fs::read_dir(&self.config.ipc_base_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|entry| {
                    entry.file_type().is_ok_and(|ft| ft.is_dir())
                        && entry.file_name() != "errors"
                })
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            Err(err) => {
                debug!(err = %err, "IPC base directory not readable");
                return;
            }
        };

        for group_folder in group_folders {
            let ctx = IpcGroupContext::new(&group_folder, &self.config.main_group_folder);
            let group_dir = self.config.ipc_base_dir.join(&group_folder);
            self.process_tasks(&group_dir, &ctx).await;
        }
    }

    /// Process task/group-registration commands from `{group}/tasks/`.
    async fn process_tasks(&self, group_dir: &Path, ctx: &IpcGroupContext) {
        let tasks_dir = group_dir.join("tasks");
        let files = match read_json_files(&tasks_dir) {
            Some(files) => files,
            None => return,
        };

        for file_path in files {
            match read_and_parse::<IpcTask>(&file_path) {
                Ok(task) => {
                    if let Err(err) = self.handle_task(task, ctx).await {
                        error!(
                            path = %file_path.display(),
                            err = %err,
                            "Failed to apply IPC task"
                        );
                        move_to_errors(&self.config.ipc_base_dir, &file_path, &ctx.group_folder);
                        continue;
                    }
                    remove_file(&file_path);
                }
                Err(err) => {
                    error!(path = %file_path.display(), err = %err, "Failed to parse IPC task");
                    move_to_errors(&self.config.ipc_base_dir, &file_path, &ctx.group_folder);
                }
            }
        }
    }

    /// Apply a single task command against the store and registered-groups map.
    async fn handle_task(&self, task: IpcTask, ctx: &IpcGroupContext) -> anyhow::Result<()> {
        match task {
            IpcTask::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                target_jid,
                created_by,
                ..
            } => {
                let target_folder = target_jid.as_deref().unwrap_or(&ctx.group_folder);
                if !self.is_authorized(ctx, target_folder) {
                    warn!(
                        group = %ctx.group_folder,
                        target = target_folder,
                        "Unauthorized schedule_task blocked"
                    );
                    return Ok(());
                }
                let chat_jid = self.jid_for_folder(target_folder).await.unwrap_or_default();
                let _ = created_by;
                let task = ScheduledTask {
                    id: format!("task-{}", chrono::Utc::now().timestamp_millis()),
                    group_folder: target_folder.to_string(),
                    chat_jid,
                    prompt,
                    schedule_type,
                    schedule_value,
                    context_mode,
                    next_run: None,
                    last_run: None,
                    last_result: None,
                    status: "active".to_string(),
                    created_at: chrono::Utc::now().to_rfc3339(),
                };
                self.store.create_task(&task).await?;
                info!(group = %ctx.group_folder, target_folder, "scheduled task registered");
                Ok(())
            }
            IpcTask::PauseTask { task_id, .. } => {
                self.store
                    .update_task(
                        &task_id,
                        &TaskUpdate {
                            prompt: None,
                            schedule_type: None,
                            schedule_value: None,
                            next_run: None,
                            status: Some("paused".to_string()),
                        },
                    )
                    .await?;
                info!(task_id, "task paused");
                Ok(())
            }
            IpcTask::ResumeTask { task_id, .. } => {
                self.store
                    .update_task(
                        &task_id,
                        &TaskUpdate {
                            prompt: None,
                            schedule_type: None,
                            schedule_value: None,
                            next_run: None,
                            status: Some("active".to_string()),
                        },
                    )
                    .await?;
                info!(task_id, "task resumed");
                Ok(())
            }
            IpcTask::CancelTask { task_id, .. } => {
                self.store.delete_task(&task_id).await?;
                info!(task_id, "task cancelled");
                Ok(())
            }
            IpcTask::RefreshGroups { .. } => {
                let fresh = self.store.get_all_registered_groups().await?;
                *self.groups.write().await = fresh;
                info!("registered-groups map refreshed from store");
                Ok(())
            }
            IpcTask::RegisterGroup {
                jid,
                name,
                folder,
                trigger,
                ..
            } => {
                if !ctx.is_main {
                    warn!(group = %ctx.group_folder, "non-main group attempted RegisterGroup, blocked");
                    return Ok(());
                }
                let group = RegisteredGroup {
                    jid: jid.clone(),
                    name,
                    folder,
                    trigger,
                    added_at: chrono::Utc::now().to_rfc3339(),
                    container_config: None,
                    requires_trigger: None,
                    runtime: None,
                    model: None,
                };
                self.store.set_registered_group(&group).await?;
                self.groups.write().await.insert(jid, group);
                info!(group = %ctx.group_folder, "group registered");
                Ok(())
            }
        }
    }

    /// Main folder may act on any group; non-main folders only on themselves.
    fn is_authorized(&self, ctx: &IpcGroupContext, target_folder: &str) -> bool {
        ctx.is_main || ctx.group_folder == target_folder
    }

    async fn jid_for_folder(&self, folder: &str) -> Option<String> {
        let g = self.groups.read().await;
        g.values()
            .find(|group| group.folder == folder)
            .map(|group| group.jid.clone())
    }
}

// ── Filesystem helpers ─────────────────────────────────────────────

/// Read sorted `.json` filenames from a directory. Returns None if dir doesn't exist.
fn read_json_files(dir: &Path) -> Option<Vec<PathBuf>> {
    if !dir.exists() {
        return None;
    }

    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut files: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            files.sort();
            Some(files)
        }
        Err(err) => {
            error!(dir = %dir.display(), err = %err, "Failed to read IPC directory");
            None
        }
    }
}

/// Read and parse a JSON file.
fn read_and_parse<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = fs::read_to_string(path)?;
    let parsed = serde_json::from_str(&content)?;
    Ok(parsed)
}

/// Move a failed file to the errors directory for debugging.
fn move_to_errors(ipc_base: &Path, file_path: &Path, group_folder: &str) {
    let error_dir = ipc_base.join("errors");
    fs::create_dir_all(&error_dir).ok();

    if let Some(filename) = file_path.file_name() {
        let dest = error_dir.join(format!("{group_folder}-{}", filename.to_string_lossy()));
        if let Err(err) = fs::rename(file_path, &dest) {
            error!(
                path = %file_path.display(),
                err = %err,
                "Failed to move error file"
            );
        }
    }
}

/// Remove a processed file, ignoring errors.
fn remove_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        debug!(path = %path.display(), err = %err, "Failed to remove processed IPC file");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn group(jid: &str, folder: &str) -> RegisteredGroup {
        RegisteredGroup {
            jid: jid.to_string(),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger: String::new(),
            added_at: "2026-01-01T00:00:00Z".to_string(),
            container_config: None,
            requires_trigger: None,
            runtime: None,
            model: None,
        }
    }

    #[test]
    fn ipc_group_context_detects_main() {
        let ctx = IpcGroupContext::new("main", "main");
        assert!(ctx.is_main);

        let ctx = IpcGroupContext::new("team-eng", "main");
        assert!(!ctx.is_main);
    }

    #[test]
    fn read_json_files_returns_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();

        fs::write(dir.join("003-xyz.json"), "{}").unwrap();
        fs::write(dir.join("001-abc.json"), "{}").unwrap();
        fs::write(dir.join("002-def.json"), "{}").unwrap();
        fs::write(dir.join("readme.txt"), "not json").unwrap();

        let files = read_json_files(dir).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[0].ends_with("001-abc.json"));
        assert!(files[1].ends_with("002-def.json"));
        assert!(files[2].ends_with("003-xyz.json"));
    }

    #[test]
    fn read_json_files_nonexistent_dir_returns_none() {
        assert!(read_json_files(Path::new("/nonexistent/path")).is_none());
    }

    #[test]
    fn parse_ipc_task_schedule() {
        let json = r#"{
            "type": "schedule_task",
            "prompt": "Check build status",
            "schedule_type": "cron",
            "schedule_value": "0 9 * * *",
            "context_mode": "group",
            "targetJid": "team-eng",
            "timestamp": "2026-02-25T12:00:00Z"
        }"#;
        let task: IpcTask = serde_json::from_str(json).unwrap();
        match task {
            IpcTask::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                ..
            } => {
                assert_eq!(prompt, "Check build status");
                assert_eq!(schedule_type, "cron");
                assert_eq!(schedule_value, "0 9 * * *");
                assert_eq!(context_mode, "group");
            }
            _ => panic!("Expected ScheduleTask"),
        }
    }

    #[test]
    fn parse_ipc_task_cancel() {
        let json = r#"{"type": "cancel_task", "taskId": "task-12345"}"#;
        let task: IpcTask = serde_json::from_str(json).unwrap();
        match task {
            IpcTask::CancelTask { task_id, .. } => {
                assert_eq!(task_id, "task-12345");
            }
            _ => panic!("Expected CancelTask"),
        }
    }

    #[tokio::test]
    async fn poll_once_registers_task_for_main_group() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();

        let tasks_dir = ipc_base.join("main/tasks");
        fs::create_dir_all(&tasks_dir).unwrap();
        let task = serde_json::json!({
            "type": "schedule_task",
            "prompt": "Say hello",
            "schedule_type": "interval",
            "schedule_value": "3600",
            "context_mode": "isolated",
            "targetJid": "main",
        });
        fs::write(
            tasks_dir.join("001-task.json"),
            serde_json::to_string(&task).unwrap(),
        )
        .unwrap();

        let store = Store::open_in_memory().unwrap();
        let groups = Arc::new(RwLock::new(HashMap::from([(
            "tg:1".to_string(),
            group("tg:1", "main"),
        )])));
        let watcher = IpcWatcher::new(
            IpcWatcherConfig {
                ipc_base_dir: ipc_base.clone(),
                ..Default::default()
            },
            store.clone(),
            groups,
        );

        watcher.poll_once().await;

        assert!(!tasks_dir.join("001-task.json").exists());
        let tasks = store.get_all_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].prompt, "Say hello");
    }

    #[tokio::test]
    async fn poll_once_blocks_unauthorized_cross_group_schedule() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();

        let tasks_dir = ipc_base.join("team-eng/tasks");
        fs::create_dir_all(&tasks_dir).unwrap();
        let task = serde_json::json!({
            "type": "schedule_task",
            "prompt": "Should be blocked",
            "schedule_type": "once",
            "schedule_value": "2026-01-01T00:00:00Z",
            "context_mode": "isolated",
            "targetJid": "main",
        });
        fs::write(
            tasks_dir.join("001-task.json"),
            serde_json::to_string(&task).unwrap(),
        )
        .unwrap();

        let store = Store::open_in_memory().unwrap();
        let groups = Arc::new(RwLock::new(HashMap::new()));
        let watcher = IpcWatcher::new(
            IpcWatcherConfig {
                ipc_base_dir: ipc_base.clone(),
                ..Default::default()
            },
            store.clone(),
            groups,
        );

        watcher.poll_once().await;

        assert!(!tasks_dir.join("001-task.json").exists());
        let tasks = store.get_all_tasks().await.unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn poll_once_moves_bad_json_to_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let ipc_base = tmp.path().to_path_buf();

        let tasks_dir = ipc_base.join("main/tasks");
        fs::create_dir_all(&tasks_dir).unwrap();
        fs::write(tasks_dir.join("bad.json"), "not valid json {{{").unwrap();

        let store = Store::open_in_memory().unwrap();
        let groups = Arc::new(RwLock::new(HashMap::new()));
        let watcher = IpcWatcher::new(
            IpcWatcherConfig {
                ipc_base_dir: ipc_base.clone(),
                ..Default::default()
            },
            store,
            groups,
        );

        watcher.poll_once().await;

        assert!(!tasks_dir.join("bad.json").exists());
        assert!(ipc_base.join("errors/main-bad.json").exists());
    }
}
