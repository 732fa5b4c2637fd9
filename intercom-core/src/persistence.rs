use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::info;

// ---------------------------------------------------------------------------
// Core data model types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub is_from_me: bool,
    #[serde(default)]
    pub is_bot_message: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub jid: String,
    pub name: String,
    pub last_message_time: String,
    pub channel: Option<String>,
    pub is_group: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
    pub is_bot_message: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    #[serde(default = "default_context_mode")]
    pub context_mode: String,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
    pub created_at: String,
}

fn default_context_mode() -> String {
    "isolated".to_string()
}

fn default_status() -> String {
    "active".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRunLog {
    pub task_id: String,
    pub run_at: String,
    pub duration_ms: i64,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredGroup {
    pub jid: String,
    pub name: String,
    pub folder: String,
    pub trigger: String,
    pub added_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_config: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_trigger: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Store — embedded rusqlite connection behind a mutex
// ---------------------------------------------------------------------------

/// The embedded relational store under `./store/`. Chats, messages,
/// registered groups, scheduled tasks, and task runs all live in one
/// sqlite file; writers are serialized by the mutex, readers wait behind
/// the same lock (sqlite itself does not support concurrent writers, so
/// there is no benefit to a finer-grained scheme here).
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if absent) the sqlite database at `<data_dir>/store/intercom.db`
    /// and ensure its schema exists.
    pub fn open(data_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = data_dir.as_ref().join("store");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create store directory: {}", dir.display()))?;
        Self::open_path(dir.join("intercom.db"))
    }

    /// Open a store at an explicit path. Used directly by tests; `":memory:"`
    /// opens a private in-memory database.
    pub fn open_path(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open sqlite database: {}", path.display()))?;
        ensure_schema(&conn)?;
        info!(path = %path.display(), "store opened and schema ensured");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("store connection mutex poisoned"))
    }
}

fn ensure_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "\
        CREATE TABLE IF NOT EXISTS chats (
          jid TEXT PRIMARY KEY,
          name TEXT,
          last_message_time TEXT,
          channel TEXT,
          is_group INTEGER DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS messages (
          id TEXT NOT NULL,
          chat_jid TEXT NOT NULL,
          sender TEXT,
          sender_name TEXT,
          content TEXT,
          timestamp TEXT NOT NULL,
          is_from_me INTEGER DEFAULT 0,
          is_bot_message INTEGER DEFAULT 0,
          PRIMARY KEY (id, chat_jid)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
          id TEXT PRIMARY KEY,
          group_folder TEXT NOT NULL,
          chat_jid TEXT NOT NULL,
          prompt TEXT NOT NULL,
          schedule_type TEXT NOT NULL,
          schedule_value TEXT NOT NULL,
          context_mode TEXT DEFAULT 'isolated',
          next_run TEXT,
          last_run TEXT,
          last_result TEXT,
          status TEXT DEFAULT 'active',
          created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON scheduled_tasks(next_run);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON scheduled_tasks(status);

        CREATE TABLE IF NOT EXISTS task_run_logs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          task_id TEXT NOT NULL REFERENCES scheduled_tasks(id) ON DELETE CASCADE,
          run_at TEXT NOT NULL,
          duration_ms INTEGER NOT NULL,
          status TEXT NOT NULL,
          result TEXT,
          error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_task_run_logs_task ON task_run_logs(task_id, run_at);

        CREATE TABLE IF NOT EXISTS router_state (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
          group_folder TEXT PRIMARY KEY,
          session_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS registered_groups (
          jid TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          folder TEXT NOT NULL UNIQUE,
          trigger_pattern TEXT NOT NULL,
          added_at TEXT NOT NULL,
          container_config TEXT,
          requires_trigger INTEGER DEFAULT 1,
          runtime TEXT,
          model TEXT
        );
        ",
    )
    .context("failed to create sqlite schema")
}

// ---------------------------------------------------------------------------
// Chat operations
// ---------------------------------------------------------------------------

impl Store {
    pub async fn store_chat_metadata(
        &self,
        jid: &str,
        timestamp: &str,
        name: Option<&str>,
        channel: Option<&str>,
        is_group: Option<bool>,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        let display_name = name.unwrap_or(jid);
        conn.execute(
            "\
            INSERT INTO chats (jid, name, last_message_time, channel, is_group)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(jid) DO UPDATE SET
              name = COALESCE(NULLIF(excluded.name, excluded.jid), chats.name),
              last_message_time = MAX(chats.last_message_time, excluded.last_message_time),
              channel = COALESCE(excluded.channel, chats.channel),
              is_group = COALESCE(excluded.is_group, chats.is_group)
            ",
            params![jid, display_name, timestamp, channel, is_group],
        )
        .context("store_chat_metadata")?;
        Ok(())
    }

    pub async fn update_chat_name(&self, jid: &str, name: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        let now = chrono_now();
        conn.execute(
            "\
            INSERT INTO chats (jid, name, last_message_time)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(jid) DO UPDATE SET name = excluded.name
            ",
            params![jid, name, now],
        )
        .context("update_chat_name")?;
        Ok(())
    }

    pub async fn get_all_chats(&self) -> anyhow::Result<Vec<ChatInfo>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT jid, name, last_message_time, channel, is_group \
             FROM chats ORDER BY last_message_time DESC",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(ChatInfo {
                    jid: r.get(0)?,
                    name: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    last_message_time: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    channel: r.get(3)?,
                    is_group: r.get::<_, Option<bool>>(4)?.unwrap_or(false),
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("get_all_chats")?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Message operations
    // -----------------------------------------------------------------------

    pub async fn store_message(&self, msg: &NewMessage) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "\
            INSERT INTO messages (id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id, chat_jid) DO UPDATE SET
              content = excluded.content,
              is_bot_message = excluded.is_bot_message
            ",
            params![
                msg.id,
                msg.chat_jid,
                msg.sender,
                msg.sender_name,
                msg.content,
                msg.timestamp,
                msg.is_from_me,
                msg.is_bot_message,
            ],
        )
        .context("store_message")?;
        Ok(())
    }

    pub async fn get_recent_conversation(
        &self,
        chat_jid: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<ConversationMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "\
            SELECT sender_name, content, timestamp, is_bot_message
            FROM messages
            WHERE chat_jid = ?1 AND content != '' AND content IS NOT NULL
            ORDER BY timestamp DESC
            LIMIT ?2
            ",
        )?;
        let mut rows: Vec<ConversationMessage> = stmt
            .query_map(params![chat_jid, limit], |r| {
                Ok(ConversationMessage {
                    sender_name: r.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    content: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    timestamp: r.get(2)?,
                    is_bot_message: r.get::<_, Option<bool>>(3)?.unwrap_or(false),
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("get_recent_conversation")?;
        rows.reverse(); // chronological order
        Ok(rows)
    }

    /// Union of `get_messages_since` over a set of JIDs; `new_timestamp` is
    /// the max timestamp observed across returned rows (unchanged if none).
    pub async fn get_new_messages(
        &self,
        jids: &[String],
        last_timestamp: &str,
        assistant_name: &str,
    ) -> anyhow::Result<(Vec<NewMessage>, String)> {
        if jids.is_empty() {
            return Ok((vec![], last_timestamp.to_string()));
        }
        let conn = self.lock()?;
        let bot_prefix = format!("{assistant_name}:%");
        let placeholders: Vec<String> = (0..jids.len()).map(|i| format!("?{}", i + 3)).collect();
        let sql = format!(
            "SELECT id, chat_jid, sender, sender_name, content, timestamp \
             FROM messages \
             WHERE timestamp > ?1 AND chat_jid IN ({}) \
               AND is_bot_message = 0 AND content NOT LIKE ?2 \
               AND content != '' AND content IS NOT NULL \
             ORDER BY timestamp",
            placeholders.join(", "),
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut params_vec: Vec<&dyn rusqlite::ToSql> =
            vec![&last_timestamp, &bot_prefix];
        for jid in jids {
            params_vec.push(jid);
        }
        let mut new_timestamp = last_timestamp.to_string();
        let rows = stmt
            .query_map(params_vec.as_slice(), |r| {
                Ok(NewMessage {
                    id: r.get(0)?,
                    chat_jid: r.get(1)?,
                    sender: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    sender_name: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    content: r.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    timestamp: r.get(5)?,
                    is_from_me: false,
                    is_bot_message: false,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("get_new_messages")?;
        for m in &rows {
            if m.timestamp.as_str() > new_timestamp.as_str() {
                new_timestamp = m.timestamp.clone();
            }
        }
        Ok((rows, new_timestamp))
    }

    /// Messages with `timestamp > since_timestamp`, excluding bot-authored
    /// rows and the `"<assistant_name>: "` migration-backstop prefix.
    pub async fn get_messages_since(
        &self,
        chat_jid: &str,
        since_timestamp: &str,
        assistant_name: &str,
    ) -> anyhow::Result<Vec<NewMessage>> {
        let conn = self.lock()?;
        let bot_prefix = format!("{assistant_name}:%");
        let mut stmt = conn.prepare(
            "\
            SELECT id, chat_jid, sender, sender_name, content, timestamp
            FROM messages
            WHERE chat_jid = ?1 AND timestamp > ?2
              AND is_bot_message = 0 AND content NOT LIKE ?3
              AND content != '' AND content IS NOT NULL
            ORDER BY timestamp
            ",
        )?;
        let rows = stmt
            .query_map(params![chat_jid, since_timestamp, bot_prefix], |r| {
                Ok(NewMessage {
                    id: r.get(0)?,
                    chat_jid: r.get(1)?,
                    sender: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    sender_name: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    content: r.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    timestamp: r.get(5)?,
                    is_from_me: false,
                    is_bot_message: false,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("get_messages_since")?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Scheduled task operations
    // -----------------------------------------------------------------------

    pub async fn create_task(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "\
            INSERT INTO scheduled_tasks
              (id, group_folder, chat_jid, prompt, schedule_type, schedule_value, context_mode, next_run, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                task.id,
                task.group_folder,
                task.chat_jid,
                task.prompt,
                task.schedule_type,
                task.schedule_value,
                task.context_mode,
                task.next_run,
                task.status,
                task.created_at,
            ],
        )
        .context("create_task")?;
        Ok(())
    }

    pub async fn get_task_by_id(&self, id: &str) -> anyhow::Result<Option<ScheduledTask>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM scheduled_tasks WHERE id = ?1")?;
        let task = stmt
            .query_row(params![id], row_to_task)
            .optional()
            .context("get_task_by_id")?;
        Ok(task)
    }

    pub async fn get_tasks_for_group(
        &self,
        group_folder: &str,
    ) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM scheduled_tasks WHERE group_folder = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![group_folder], row_to_task)?
            .collect::<Result<Vec<_>, _>>()
            .context("get_tasks_for_group")?;
        Ok(rows)
    }

    pub async fn get_all_tasks(&self) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM scheduled_tasks ORDER BY created_at DESC")?;
        let rows = stmt
            .query_map([], row_to_task)?
            .collect::<Result<Vec<_>, _>>()
            .context("get_all_tasks")?;
        Ok(rows)
    }

    pub async fn update_task(&self, id: &str, updates: &TaskUpdate) -> anyhow::Result<()> {
        let mut fields = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref prompt) = updates.prompt {
            fields.push("prompt = ?".to_string());
            values.push(Box::new(prompt.clone()));
        }
        if let Some(ref schedule_type) = updates.schedule_type {
            fields.push("schedule_type = ?".to_string());
            values.push(Box::new(schedule_type.clone()));
        }
        if let Some(ref schedule_value) = updates.schedule_value {
            fields.push("schedule_value = ?".to_string());
            values.push(Box::new(schedule_value.clone()));
        }
        if let Some(ref next_run) = updates.next_run {
            fields.push("next_run = ?".to_string());
            values.push(Box::new(next_run.clone()));
        }
        if let Some(ref status) = updates.status {
            fields.push("status = ?".to_string());
            values.push(Box::new(status.clone()));
        }

        if fields.is_empty() {
            return Ok(());
        }

        values.push(Box::new(id.to_string()));
        let sql = format!("UPDATE scheduled_tasks SET {} WHERE id = ?", fields.join(", "));

        let conn = self.lock()?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        conn.execute(&sql, param_refs.as_slice())
            .context("update_task")?;
        Ok(())
    }

    pub async fn delete_task(&self, id: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM task_run_logs WHERE task_id = ?1", params![id])
            .context("delete_task_logs")?;
        conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])
            .context("delete_task")?;
        Ok(())
    }

    pub async fn get_due_tasks(&self) -> anyhow::Result<Vec<ScheduledTask>> {
        let conn = self.lock()?;
        let now = chrono_now();
        let mut stmt = conn.prepare(
            "\
            SELECT * FROM scheduled_tasks
            WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
            ORDER BY next_run
            ",
        )?;
        let rows = stmt
            .query_map(params![now], row_to_task)?
            .collect::<Result<Vec<_>, _>>()
            .context("get_due_tasks")?;
        Ok(rows)
    }

    pub async fn update_task_after_run(
        &self,
        id: &str,
        next_run: Option<&str>,
        last_result: &str,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        let now = chrono_now();
        conn.execute(
            "\
            UPDATE scheduled_tasks
            SET next_run = ?1, last_run = ?2, last_result = ?3,
                status = CASE WHEN ?1 IS NULL THEN 'completed' ELSE status END
            WHERE id = ?4
            ",
            params![next_run, now, last_result, id],
        )
        .context("update_task_after_run")?;
        Ok(())
    }

    pub async fn log_task_run(&self, log: &TaskRunLog) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "\
            INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                log.task_id,
                log.run_at,
                log.duration_ms,
                log.status,
                log.result,
                log.error,
            ],
        )
        .context("log_task_run")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Router state (cursor persistence)
    // -----------------------------------------------------------------------

    pub async fn get_router_state(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT value FROM router_state WHERE key = ?1")?;
        let value = stmt
            .query_row(params![key], |r| r.get(0))
            .optional()
            .context("get_router_state")?;
        Ok(value)
    }

    pub async fn set_router_state(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "\
            INSERT INTO router_state (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
            params![key, value],
        )
        .context("set_router_state")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Session operations
    // -----------------------------------------------------------------------

    pub async fn get_session(&self, group_folder: &str) -> anyhow::Result<Option<String>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT session_id FROM sessions WHERE group_folder = ?1")?;
        let value = stmt
            .query_row(params![group_folder], |r| r.get(0))
            .optional()
            .context("get_session")?;
        Ok(value)
    }

    pub async fn set_session(&self, group_folder: &str, session_id: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "\
            INSERT INTO sessions (group_folder, session_id) VALUES (?1, ?2)
            ON CONFLICT(group_folder) DO UPDATE SET session_id = excluded.session_id
            ",
            params![group_folder, session_id],
        )
        .context("set_session")?;
        Ok(())
    }

    pub async fn get_all_sessions(&self) -> anyhow::Result<HashMap<String, String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT group_folder, session_id FROM sessions")?;
        let mut result = HashMap::new();
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (folder, session) = row.context("get_all_sessions")?;
            result.insert(folder, session);
        }
        Ok(result)
    }

    pub async fn delete_session(&self, group_folder: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM sessions WHERE group_folder = ?1",
            params![group_folder],
        )
        .context("delete_session")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Registered group operations
    // -----------------------------------------------------------------------

    pub async fn get_registered_group(&self, jid: &str) -> anyhow::Result<Option<RegisteredGroup>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM registered_groups WHERE jid = ?1")?;
        let group = stmt
            .query_row(params![jid], row_to_registered_group)
            .optional()
            .context("get_registered_group")?;
        Ok(group)
    }

    pub async fn set_registered_group(&self, group: &RegisteredGroup) -> anyhow::Result<()> {
        let conn = self.lock()?;
        let config_json = group
            .container_config
            .as_ref()
            .map(|v| v.to_string());
        let requires_trigger = group.requires_trigger.unwrap_or(true);
        conn.execute(
            "\
            INSERT INTO registered_groups
              (jid, name, folder, trigger_pattern, added_at, container_config, requires_trigger, runtime, model)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(jid) DO UPDATE SET
              name = excluded.name,
              folder = excluded.folder,
              trigger_pattern = excluded.trigger_pattern,
              container_config = excluded.container_config,
              requires_trigger = excluded.requires_trigger,
              runtime = excluded.runtime,
              model = excluded.model
            ",
            params![
                group.jid,
                group.name,
                group.folder,
                group.trigger,
                group.added_at,
                config_json,
                requires_trigger,
                group.runtime,
                group.model,
            ],
        )
        .context("set_registered_group")?;
        Ok(())
    }

    pub async fn get_all_registered_groups(
        &self,
    ) -> anyhow::Result<HashMap<String, RegisteredGroup>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM registered_groups")?;
        let mut result = HashMap::new();
        let rows = stmt.query_map([], row_to_registered_group)?;
        for row in rows {
            let group = row.context("get_all_registered_groups")?;
            result.insert(group.jid.clone(), group);
        }
        Ok(result)
    }

    pub async fn delete_registered_group(&self, jid: &str) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM registered_groups WHERE jid = ?1",
            params![jid],
        )
        .context("delete_registered_group")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Current time as an ISO-8601 UTC string, matching the format stored
/// alongside every other timestamp in this database.
fn chrono_now() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    time_from_epoch(now.as_secs(), (now.as_millis() % 1000) as u32)
}

fn time_from_epoch(secs: u64, millis: u32) -> String {
    let days = secs / 86400;
    let rem = secs % 86400;
    let hours = rem / 3600;
    let minutes = (rem % 3600) / 60;
    let seconds = rem % 60;
    let (year, month, day) = days_to_date(days);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        year, month, day, hours, minutes, seconds, millis
    )
}

fn days_to_date(days: u64) -> (u64, u64, u64) {
    // Algorithm from http://howardhinnant.github.io/date_algorithms.html
    let z = days + 719468;
    let era = z / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

fn row_to_task(r: &rusqlite::Row) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: r.get("id")?,
        group_folder: r.get("group_folder")?,
        chat_jid: r.get("chat_jid")?,
        prompt: r.get("prompt")?,
        schedule_type: r.get("schedule_type")?,
        schedule_value: r.get("schedule_value")?,
        context_mode: r
            .get::<_, Option<String>>("context_mode")?
            .unwrap_or_else(|| "isolated".to_string()),
        next_run: r.get("next_run")?,
        last_run: r.get("last_run")?,
        last_result: r.get("last_result")?,
        status: r
            .get::<_, Option<String>>("status")?
            .unwrap_or_else(|| "active".to_string()),
        created_at: r.get("created_at")?,
    })
}

fn row_to_registered_group(r: &rusqlite::Row) -> rusqlite::Result<RegisteredGroup> {
    let config_text: Option<String> = r.get("container_config")?;
    Ok(RegisteredGroup {
        jid: r.get("jid")?,
        name: r.get("name")?,
        folder: r.get("folder")?,
        trigger: r.get("trigger_pattern")?,
        added_at: r.get("added_at")?,
        container_config: config_text.and_then(|s| serde_json::from_str(&s).ok()),
        requires_trigger: r.get::<_, Option<bool>>("requires_trigger")?,
        runtime: r.get("runtime")?,
        model: r.get("model")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrono_now_format() {
        let ts = chrono_now();
        assert!(ts.ends_with('Z'), "timestamp should end with Z: {ts}");
        assert!(ts.contains('T'), "timestamp should contain T: {ts}");
        assert_eq!(ts.len(), 24, "expected YYYY-MM-DDTHH:MM:SS.mmmZ format: {ts}");
    }

    #[test]
    fn time_from_epoch_known_date() {
        let ts = time_from_epoch(1705321845, 123);
        assert_eq!(ts, "2024-01-15T12:30:45.123Z");
    }

    #[test]
    fn days_to_date_epoch() {
        assert_eq!(days_to_date(0), (1970, 1, 1));
    }

    #[test]
    fn days_to_date_known() {
        assert_eq!(days_to_date(19737), (2024, 1, 15));
    }

    #[test]
    fn default_serde_values() {
        let json = r#"{"id":"t1","group_folder":"g1","chat_jid":"j1","prompt":"p","schedule_type":"once","schedule_value":"2024-01-01","created_at":"2024-01-01T00:00:00Z"}"#;
        let task: ScheduledTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.context_mode, "isolated");
        assert_eq!(task.status, "active");
        assert!(task.next_run.is_none());
    }

    #[test]
    fn registered_group_serde_roundtrip() {
        let group = RegisteredGroup {
            jid: "tg:12345".to_string(),
            name: "Test Group".to_string(),
            folder: "test-group".to_string(),
            trigger: "@Andy".to_string(),
            added_at: "2024-01-01T00:00:00.000Z".to_string(),
            container_config: Some(serde_json::json!({"additionalMounts": []})),
            requires_trigger: Some(true),
            runtime: Some("claude".to_string()),
            model: None,
        };
        let json = serde_json::to_string(&group).unwrap();
        let parsed: RegisteredGroup = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.jid, "tg:12345");
        assert_eq!(parsed.runtime, Some("claude".to_string()));
        assert!(!json.contains("\"model\""));
    }

    #[tokio::test]
    async fn store_message_is_idempotent_under_retry() {
        let store = Store::open_in_memory().unwrap();
        let msg = NewMessage {
            id: "m1".to_string(),
            chat_jid: "g1@g.us".to_string(),
            sender: "alice".to_string(),
            sender_name: "Alice".to_string(),
            content: "hello".to_string(),
            timestamp: "2024-01-01T00:00:01.000Z".to_string(),
            is_from_me: false,
            is_bot_message: false,
        };
        store.store_message(&msg).await.unwrap();
        store.store_message(&msg).await.unwrap();

        let rows = store
            .get_messages_since("g1@g.us", "2024-01-01T00:00:00.000Z", "Andy")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn store_message_upsert_is_last_writer_wins() {
        let store = Store::open_in_memory().unwrap();
        let mut msg = NewMessage {
            id: "m1".to_string(),
            chat_jid: "g1@g.us".to_string(),
            sender: "alice".to_string(),
            sender_name: "Alice".to_string(),
            content: "first".to_string(),
            timestamp: "2024-01-01T00:00:01.000Z".to_string(),
            is_from_me: false,
            is_bot_message: false,
        };
        store.store_message(&msg).await.unwrap();
        msg.content = "edited".to_string();
        store.store_message(&msg).await.unwrap();

        let rows = store
            .get_messages_since("g1@g.us", "2024-01-01T00:00:00.000Z", "Andy")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "edited");
    }

    #[tokio::test]
    async fn get_messages_since_excludes_bot_messages_and_prefix_backstop() {
        let store = Store::open_in_memory().unwrap();
        let base = NewMessage {
            id: "m1".to_string(),
            chat_jid: "g1@g.us".to_string(),
            sender: "alice".to_string(),
            sender_name: "Alice".to_string(),
            content: "hi".to_string(),
            timestamp: "2024-01-01T00:00:01.000Z".to_string(),
            is_from_me: false,
            is_bot_message: false,
        };
        let bot_flagged = NewMessage {
            id: "m2".to_string(),
            is_bot_message: true,
            timestamp: "2024-01-01T00:00:02.000Z".to_string(),
            ..base.clone()
        };
        let legacy_prefix = NewMessage {
            id: "m3".to_string(),
            content: "Andy: legacy reply".to_string(),
            timestamp: "2024-01-01T00:00:03.000Z".to_string(),
            ..base.clone()
        };
        store.store_message(&base).await.unwrap();
        store.store_message(&bot_flagged).await.unwrap();
        store.store_message(&legacy_prefix).await.unwrap();

        let rows = store
            .get_messages_since("g1@g.us", "2024-01-01T00:00:00.000Z", "Andy")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "m1");
    }

    #[tokio::test]
    async fn get_new_messages_unions_multiple_jids_and_tracks_max_timestamp() {
        let store = Store::open_in_memory().unwrap();
        store
            .store_message(&NewMessage {
                id: "m1".to_string(),
                chat_jid: "a@g.us".to_string(),
                sender: "a".to_string(),
                sender_name: "A".to_string(),
                content: "hi".to_string(),
                timestamp: "2024-01-01T00:00:01.000Z".to_string(),
                is_from_me: false,
                is_bot_message: false,
            })
            .await
            .unwrap();
        store
            .store_message(&NewMessage {
                id: "m2".to_string(),
                chat_jid: "b@g.us".to_string(),
                sender: "b".to_string(),
                sender_name: "B".to_string(),
                content: "hey".to_string(),
                timestamp: "2024-01-01T00:00:05.000Z".to_string(),
                is_from_me: false,
                is_bot_message: false,
            })
            .await
            .unwrap();

        let (msgs, new_ts) = store
            .get_new_messages(
                &["a@g.us".to_string(), "b@g.us".to_string()],
                "2024-01-01T00:00:00.000Z",
                "Andy",
            )
            .await
            .unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(new_ts, "2024-01-01T00:00:05.000Z");
    }

    #[tokio::test]
    async fn due_tasks_respect_status_and_next_run() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_task(&ScheduledTask {
                id: "t1".to_string(),
                group_folder: "main".to_string(),
                chat_jid: "main".to_string(),
                prompt: "check in".to_string(),
                schedule_type: "once".to_string(),
                schedule_value: String::new(),
                context_mode: "isolated".to_string(),
                next_run: Some("2000-01-01T00:00:00.000Z".to_string()),
                last_run: None,
                last_result: None,
                status: "active".to_string(),
                created_at: "1999-01-01T00:00:00.000Z".to_string(),
            })
            .await
            .unwrap();
        store
            .create_task(&ScheduledTask {
                id: "t2".to_string(),
                group_folder: "main".to_string(),
                chat_jid: "main".to_string(),
                prompt: "paused".to_string(),
                schedule_type: "once".to_string(),
                schedule_value: String::new(),
                context_mode: "isolated".to_string(),
                next_run: Some("2000-01-01T00:00:00.000Z".to_string()),
                last_run: None,
                last_result: None,
                status: "paused".to_string(),
                created_at: "1999-01-01T00:00:00.000Z".to_string(),
            })
            .await
            .unwrap();

        let due = store.get_due_tasks().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "t1");
    }

    #[tokio::test]
    async fn registered_group_round_trips_every_field() {
        let store = Store::open_in_memory().unwrap();
        let group = RegisteredGroup {
            jid: "tg:1".to_string(),
            name: "Team".to_string(),
            folder: "team".to_string(),
            trigger: "@Andy".to_string(),
            added_at: "2024-01-01T00:00:00.000Z".to_string(),
            container_config: Some(serde_json::json!({"timeout": 60})),
            requires_trigger: Some(false),
            runtime: Some("gemini".to_string()),
            model: Some("gemini-3.1-pro".to_string()),
        };
        store.set_registered_group(&group).await.unwrap();
        let fetched = store.get_registered_group("tg:1").await.unwrap().unwrap();
        assert_eq!(fetched.jid, group.jid);
        assert_eq!(fetched.name, group.name);
        assert_eq!(fetched.folder, group.folder);
        assert_eq!(fetched.trigger, group.trigger);
        assert_eq!(fetched.requires_trigger, group.requires_trigger);
        assert_eq!(fetched.runtime, group.runtime);
        assert_eq!(fetched.model, group.model);
        assert_eq!(fetched.container_config, group.container_config);
    }
}
