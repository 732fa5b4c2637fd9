//! Per-group serialization queue with global concurrency cap.
//!
//! Ensures only one container runs per group at a time, with a global
//! limit on total concurrent containers.
//!
//! Key semantics:
//! - Tasks drain before messages (priority ordering)
//! - Follow-up messages piped to active containers via IPC `input/` directory
//! - Exponential retry backoff on message processing failure
//! - Graceful shutdown: containers are detached (not killed)

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const MAX_RETRIES: u32 = 5;
/// Cumulative retry schedule, measured from the first attempt of an episode:
/// retry n lands at CUMULATIVE_RETRY_MS[n] ms after the original enqueue.
const CUMULATIVE_RETRY_MS: [u64; 6] = [0, 5_000, 15_000, 35_000, 75_000, 155_000];

/// Callback for processing messages for a group. Returns true on success.
pub type ProcessMessagesFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Callback for running a queued task.
pub type TaskFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// A queued task waiting for execution.
struct QueuedTask {
    id: String,
    #[allow(dead_code)]
    group_jid: String,
    task_fn: TaskFn,
}

/// What to run next for a group once a slot is available.
enum Work {
    Messages,
    Task(QueuedTask),
}

/// Outcome of attempting to admit a task into the queue.
enum TaskAdmission {
    Duplicate,
    /// Queued behind an active container; carries the group folder to write
    /// a close sentinel to when the container is idle-waiting (preemption).
    Queued { close_folder: Option<String> },
    RunNow(QueuedTask),
}

/// Per-group state tracked by the queue.
#[derive(Default)]
struct GroupState {
    active: bool,
    idle_waiting: bool,
    is_task_container: bool,
    pending_messages: bool,
    pending_tasks: VecDeque<QueuedTask>,
    container_name: Option<String>,
    group_folder: Option<String>,
    retry_count: u32,
    /// When the current retry episode started. Reset on success or after
    /// exhausting MAX_RETRIES, so the backoff schedule is cumulative from the
    /// original enqueue rather than from the last failure.
    first_attempt_at: Option<Instant>,
}

/// Shared inner state behind a mutex.
struct Inner {
    groups: HashMap<String, GroupState>,
    active_count: usize,
    max_concurrent: usize,
    waiting_groups: VecDeque<String>,
    process_messages_fn: Option<ProcessMessagesFn>,
    shutting_down: bool,
    data_dir: PathBuf,
}

impl Inner {
    fn get_or_insert(&mut self, jid: &str) -> &mut GroupState {
        self.groups
            .entry(jid.to_string())
            .or_insert_with(GroupState::default)
    }

    fn reset_group(&mut self, jid: &str) {
        if let Some(state) = self.groups.get_mut(jid) {
            state.active = false;
            state.is_task_container = false;
            state.container_name = None;
            state.group_folder = None;
        }
        self.active_count = self.active_count.saturating_sub(1);
    }

    /// Admit a message check for `jid` if a slot is free, mirroring
    /// `enqueue_message_check`'s admission rule. Returns true when the
    /// caller should spawn `run_for_group` for `jid` right away; otherwise
    /// the intent is recorded (`pending_messages` / `waiting_groups`) for a
    /// later drain to pick up.
    fn try_admit_message(&mut self, jid: &str) -> bool {
        if self.shutting_down {
            return false;
        }
        if self.active_count >= self.max_concurrent {
            let state = self.get_or_insert(jid);
            if state.active {
                state.pending_messages = true;
                return false;
            }
            state.pending_messages = true;
            let jid_owned = jid.to_string();
            if !self.waiting_groups.contains(&jid_owned) {
                self.waiting_groups.push_back(jid_owned);
            }
            return false;
        }
        let state = self.get_or_insert(jid);
        if state.active {
            state.pending_messages = true;
            return false;
        }
        state.active = true;
        state.idle_waiting = false;
        state.is_task_container = false;
        state.pending_messages = false;
        self.active_count += 1;
        true
    }

    /// Drain order on slot release: the group's own pending tasks run
    /// before its pending messages; if neither is pending, the slot is
    /// freed and the next waiting group (if any) is admitted in its place.
    fn advance_after_completion(&mut self, jid: &str) -> Option<(String, Work)> {
        if let Some(state) = self.groups.get_mut(jid) {
            if let Some(task) = state.pending_tasks.pop_front() {
                state.is_task_container = true;
                state.idle_waiting = false;
                return Some((jid.to_string(), Work::Task(task)));
            }
            if state.pending_messages {
                state.pending_messages = false;
                state.is_task_container = false;
                state.idle_waiting = false;
                return Some((jid.to_string(), Work::Messages));
            }
        }

        self.reset_group(jid);

        while let Some(next_jid) = self.waiting_groups.pop_front() {
            if self.active_count >= self.max_concurrent {
                self.waiting_groups.push_front(next_jid);
                break;
            }
            let Some(state) = self.groups.get_mut(&next_jid) else {
                continue;
            };
            if let Some(task) = state.pending_tasks.pop_front() {
                state.active = true;
                state.is_task_container = true;
                state.idle_waiting = false;
                self.active_count += 1;
                return Some((next_jid, Work::Task(task)));
            }
            if state.pending_messages {
                state.pending_messages = false;
                state.active = true;
                state.is_task_container = false;
                state.idle_waiting = false;
                self.active_count += 1;
                return Some((next_jid, Work::Messages));
            }
            // Nothing actually pending for this waiting JID; drop it and
            // keep looking rather than admitting an idle slot for nothing.
        }

        None
    }

    /// Admit a task for `jid`, deduplicating by task id and preempting an
    /// idle-waiting container via close sentinel, mirroring the pre-refactor
    /// inline logic in `enqueue_task`.
    fn try_admit_task(&mut self, jid: &str, task_id: &str, task_fn: TaskFn) -> TaskAdmission {
        let state = self.get_or_insert(jid);

        if state.pending_tasks.iter().any(|t| t.id == task_id) {
            return TaskAdmission::Duplicate;
        }

        if state.active {
            let close_folder = if state.idle_waiting {
                state.group_folder.clone()
            } else {
                None
            };
            state.pending_tasks.push_back(QueuedTask {
                id: task_id.to_string(),
                group_jid: jid.to_string(),
                task_fn,
            });
            return TaskAdmission::Queued { close_folder };
        }

        if self.active_count >= self.max_concurrent {
            let state = self.get_or_insert(jid);
            state.pending_tasks.push_back(QueuedTask {
                id: task_id.to_string(),
                group_jid: jid.to_string(),
                task_fn,
            });
            let jid_owned = jid.to_string();
            if !self.waiting_groups.contains(&jid_owned) {
                self.waiting_groups.push_back(jid_owned);
            }
            return TaskAdmission::Queued { close_folder: None };
        }

        let state = self.get_or_insert(jid);
        state.active = true;
        state.idle_waiting = false;
        state.is_task_container = true;
        self.active_count += 1;

        TaskAdmission::RunNow(QueuedTask {
            id: task_id.to_string(),
            group_jid: jid.to_string(),
            task_fn,
        })
    }
}

/// Group queue managing per-group serialization and global concurrency.
pub struct GroupQueue {
    inner: Arc<Mutex<Inner>>,
}

impl GroupQueue {
    pub fn new(max_concurrent: usize, data_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                groups: HashMap::new(),
                active_count: 0,
                max_concurrent,
                waiting_groups: VecDeque::new(),
                process_messages_fn: None,
                shutting_down: false,
                data_dir,
            })),
        }
    }

    /// Set the callback invoked to process messages for a group.
    pub async fn set_process_messages_fn(&self, f: ProcessMessagesFn) {
        self.inner.lock().await.process_messages_fn = Some(f);
    }

    /// Enqueue a message check for a group.
    pub async fn enqueue_message_check(&self, group_jid: &str) {
        let should_spawn = {
            let mut inner = self.inner.lock().await;
            inner.try_admit_message(group_jid)
        };

        if should_spawn {
            let queue = self.inner.clone();
            let jid = group_jid.to_string();
            tokio::spawn(async move {
                run_for_group(queue, jid).await;
            });
        } else {
            debug!(group_jid, "message check queued, not admitted yet");
        }
    }

    /// Enqueue a task for a group. Tasks have priority over messages.
    pub async fn enqueue_task(&self, group_jid: &str, task_id: &str, task_fn: TaskFn) {
        let (admission, data_dir) = {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return;
            }
            let data_dir = inner.data_dir.clone();
            let admission = inner.try_admit_task(group_jid, task_id, task_fn);
            (admission, data_dir)
        };

        match admission {
            TaskAdmission::Duplicate => {
                debug!(group_jid, task_id, "task already queued, skipping");
            }
            TaskAdmission::Queued { close_folder } => {
                if let Some(ref folder) = close_folder {
                    write_close_sentinel(&data_dir, folder);
                }
                debug!(group_jid, task_id, "task queued");
            }
            TaskAdmission::RunNow(task) => {
                let queue = self.inner.clone();
                let jid = group_jid.to_string();
                tokio::spawn(async move {
                    run_task(queue, jid, task).await;
                });
            }
        }
    }

    /// Register a container process for a group.
    pub async fn register_process(
        &self,
        group_jid: &str,
        container_name: &str,
        group_folder: Option<&str>,
    ) {
        let mut inner = self.inner.lock().await;
        let state = inner.get_or_insert(group_jid);
        state.container_name = Some(container_name.to_string());
        if let Some(folder) = group_folder {
            state.group_folder = Some(folder.to_string());
        }
    }

    /// Mark the container as idle-waiting. Preempts if tasks are pending.
    pub async fn notify_idle(&self, group_jid: &str) {
        let mut inner = self.inner.lock().await;
        let has_tasks;
        let folder;
        {
            let state = inner.get_or_insert(group_jid);
            state.idle_waiting = true;
            has_tasks = !state.pending_tasks.is_empty();
            folder = state.group_folder.clone();
        }
        if has_tasks {
            if let Some(ref f) = folder {
                write_close_sentinel(&inner.data_dir, f);
            }
        }
    }

    /// Send a follow-up message to the active container via IPC input file.
    pub async fn send_message(&self, group_jid: &str, text: &str) -> bool {
        let input_dir = {
            let inner = self.inner.lock().await;
            let state = match inner.groups.get(group_jid) {
                Some(s) => s,
                None => return false,
            };
            if !state.active || state.group_folder.is_none() || state.is_task_container {
                return false;
            }
            let folder = state.group_folder.as_ref().unwrap();
            inner.data_dir.join("ipc").join(folder).join("input")
        };

        write_ipc_message(&input_dir, text)
    }

    /// Signal the active container to wind down via close sentinel.
    pub async fn close_stdin(&self, group_jid: &str) {
        let inner = self.inner.lock().await;
        if let Some(state) = inner.groups.get(group_jid) {
            if state.active {
                if let Some(ref folder) = state.group_folder {
                    write_close_sentinel(&inner.data_dir, folder);
                }
            }
        }
    }

    /// Check if a group has an active container.
    pub async fn is_active(&self, group_jid: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .groups
            .get(group_jid)
            .map(|s| s.active)
            .unwrap_or(false)
    }

    /// Stop an active container via `docker stop`.
    pub async fn kill_group(&self, group_jid: &str) -> bool {
        let container_name = {
            let inner = self.inner.lock().await;
            match inner.groups.get(group_jid) {
                Some(s) if s.active && s.container_name.is_some() => {
                    s.container_name.clone().unwrap()
                }
                _ => return false,
            }
        };

        match tokio::process::Command::new("docker")
            .args(["stop", &container_name])
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                info!(
                    group_jid,
                    container = container_name.as_str(),
                    "container stopped via kill_group"
                );
                true
            }
            Ok(_) => {
                warn!(
                    group_jid,
                    container = container_name.as_str(),
                    "failed to stop container"
                );
                false
            }
            Err(e) => {
                error!(group_jid, container = container_name.as_str(), err = %e, "docker stop error");
                false
            }
        }
    }

    /// Graceful shutdown: stop accepting new work, wait up to `deadline_ms`
    /// for active slots to drain on their own, then forcibly kill whatever
    /// containers are still running so the process can exit.
    pub async fn shutdown(&self, deadline_ms: u64) {
        {
            let mut inner = self.inner.lock().await;
            inner.shutting_down = true;
            info!(active_count = inner.active_count, deadline_ms, "GroupQueue shutdown: waiting for active slots to drain");
        }

        let start = Instant::now();
        let deadline = Duration::from_millis(deadline_ms);
        loop {
            if self.active_count().await == 0 {
                break;
            }
            if start.elapsed() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100).min(deadline)).await;
        }

        let abandoned: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .groups
                .values()
                .filter(|s| s.active)
                .filter_map(|s| s.container_name.clone())
                .collect()
        };

        if abandoned.is_empty() {
            info!("GroupQueue shutdown complete, all slots drained");
            return;
        }

        warn!(count = abandoned.len(), containers = ?abandoned, "deadline exceeded, force-killing abandoned containers");
        for container_name in &abandoned {
            let _ = tokio::process::Command::new("docker")
                .args(["kill", container_name])
                .output()
                .await;
        }
    }

    /// Get the current active container count.
    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active_count
    }
}

// ---------------------------------------------------------------------------
// Internal execution functions
// ---------------------------------------------------------------------------

async fn run_for_group(queue: Arc<Mutex<Inner>>, group_jid: String) {
    debug!(
        group_jid = group_jid.as_str(),
        "starting message processing for group"
    );

    let process_fn = {
        let mut inner = queue.lock().await;
        let state = inner.get_or_insert(&group_jid);
        if state.retry_count == 0 {
            state.first_attempt_at = Some(Instant::now());
        }
        inner.process_messages_fn.clone()
    };

    let success = if let Some(ref f) = process_fn {
        f(group_jid.clone()).await
    } else {
        warn!(
            group_jid = group_jid.as_str(),
            "no process_messages_fn set, skipping"
        );
        false
    };

    let mut retry_delay_ms = None;

    let next = {
        let mut inner = queue.lock().await;

        if success {
            if let Some(state) = inner.groups.get_mut(&group_jid) {
                state.retry_count = 0;
                state.first_attempt_at = None;
            }
        } else {
            let (retry_count, first_attempt_at) = {
                let state = inner.get_or_insert(&group_jid);
                state.retry_count += 1;
                (state.retry_count, state.first_attempt_at)
            };

            if retry_count <= MAX_RETRIES {
                let elapsed_ms = first_attempt_at
                    .map(|t| t.elapsed().as_millis() as u64)
                    .unwrap_or(0);
                let target_ms = CUMULATIVE_RETRY_MS[retry_count as usize];
                let delay_ms = target_ms.saturating_sub(elapsed_ms);
                info!(
                    group_jid = group_jid.as_str(),
                    retry_count,
                    delay_ms,
                    "scheduling retry with backoff"
                );
                retry_delay_ms = Some(delay_ms);
            } else {
                error!(
                    group_jid = group_jid.as_str(),
                    retry_count,
                    "max retries exceeded, dropping (will retry on next incoming message)"
                );
                if let Some(state) = inner.groups.get_mut(&group_jid) {
                    state.retry_count = 0;
                    state.first_attempt_at = None;
                }
            }
        }

        inner.advance_after_completion(&group_jid)
    };

    // If the drain already handed this same jid straight back out (a message
    // arrived and was admitted while we were finishing up), the retry timer
    // below would be redundant — that work already owns the next attempt.
    let reclaimed_immediately = matches!(&next, Some((jid, _)) if jid == &group_jid);

    dispatch_next(queue.clone(), next).await;

    if let Some(delay_ms) = retry_delay_ms {
        if reclaimed_immediately {
            debug!(
                group_jid = group_jid.as_str(),
                "pending work already reclaimed the slot, skipping retry timer"
            );
        } else {
            let queue_clone = queue.clone();
            let jid_clone = group_jid.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                let should_spawn = {
                    let mut inner = queue_clone.lock().await;
                    if inner.shutting_down {
                        false
                    } else {
                        inner.try_admit_message(&jid_clone)
                    }
                };
                if should_spawn {
                    run_for_group(queue_clone, jid_clone).await;
                }
            });
        }
    }
}

async fn run_task(queue: Arc<Mutex<Inner>>, group_jid: String, task: QueuedTask) {
    debug!(
        group_jid = group_jid.as_str(),
        task_id = task.id.as_str(),
        "running queued task"
    );

    // Execute the task
    (task.task_fn)().await;

    let next = {
        let mut inner = queue.lock().await;
        inner.advance_after_completion(&group_jid)
    };
    dispatch_next(queue, next).await;
}

/// Dispatch the next unit of work for a group, if the drain produced one.
async fn dispatch_next(queue: Arc<Mutex<Inner>>, next: Option<(String, Work)>) {
    match next {
        Some((jid, Work::Messages)) => {
            tokio::spawn(async move {
                run_for_group(queue, jid).await;
            });
        }
        Some((jid, Work::Task(task))) => {
            tokio::spawn(async move {
                run_task(queue, jid, task).await;
            });
        }
        None => {}
    }
}

// ---------------------------------------------------------------------------
// IPC helpers
// ---------------------------------------------------------------------------

fn write_ipc_message(input_dir: &Path, text: &str) -> bool {
    if let Err(e) = std::fs::create_dir_all(input_dir) {
        error!(err = %e, "failed to create IPC input dir");
        return false;
    }
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let filename = format!("{ts}-{:04x}.json", rand_u16());
    let filepath = input_dir.join(&filename);
    let temp_path = input_dir.join(format!("{filename}.tmp"));

    let content = serde_json::json!({"type": "message", "text": text});
    match std::fs::write(&temp_path, content.to_string()) {
        Ok(()) => match std::fs::rename(&temp_path, &filepath) {
            Ok(()) => true,
            Err(e) => {
                error!(err = %e, "failed to rename IPC message file");
                false
            }
        },
        Err(e) => {
            error!(err = %e, "failed to write IPC message file");
            false
        }
    }
}

fn write_close_sentinel(data_dir: &Path, group_folder: &str) {
    let input_dir = data_dir.join("ipc").join(group_folder).join("input");
    let _ = std::fs::create_dir_all(&input_dir);
    let _ = std::fs::write(input_dir.join("_close"), "");
}

/// Simple pseudo-random u16 for file name uniqueness.
fn rand_u16() -> u16 {
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    (t.subsec_nanos() ^ (t.as_secs() as u32).wrapping_mul(2654435761)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_queue_has_zero_active() {
        let q = GroupQueue::new(3, PathBuf::from("/tmp/test-queue"));
        assert_eq!(q.active_count().await, 0);
    }

    #[tokio::test]
    async fn is_active_returns_false_for_unknown_group() {
        let q = GroupQueue::new(3, PathBuf::from("/tmp/test-queue"));
        assert!(!q.is_active("tg:unknown").await);
    }

    #[tokio::test]
    async fn shutdown_sets_flag() {
        let q = GroupQueue::new(3, PathBuf::from("/tmp/test-queue"));
        q.shutdown(1000).await;
        // After shutdown, enqueue should be a no-op
        q.enqueue_message_check("tg:12345").await;
        assert!(!q.is_active("tg:12345").await);
    }

    #[tokio::test]
    async fn shutdown_returns_immediately_when_idle() {
        let q = GroupQueue::new(3, PathBuf::from("/tmp/test-queue"));
        let start = std::time::Instant::now();
        q.shutdown(5000).await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn rand_u16_produces_values() {
        let a = rand_u16();
        assert!(a <= u16::MAX);
    }

    #[test]
    fn write_close_sentinel_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        write_close_sentinel(dir.path(), "test-group");
        let sentinel = dir
            .path()
            .join("ipc")
            .join("test-group")
            .join("input")
            .join("_close");
        assert!(sentinel.exists());
    }

    #[test]
    fn write_ipc_message_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let input_dir = dir.path().join("input");
        let result = write_ipc_message(&input_dir, "hello");
        assert!(result);
        let files: Vec<_> = std::fs::read_dir(&input_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext == "json")
            })
            .collect();
        assert_eq!(files.len(), 1);
    }
}
