//! ChannelSet (C2): concrete channel adapters.
//!
//! `TelegramChannel` is long-lived and reqwest-backed, generalized from the
//! reference crate's `telegram.rs`. `MailPollChannel` is poll-based, reading
//! dropped message files from a directory and routing every inbound item
//! into the `main` registered group rather than a per-JID group.
//!
//! Both implement the common contract: an outgoing queue flushed on
//! (re)connect, length-bounded outbound splitting, a best-effort typing
//! indicator, and a non-overlapping `owns_jid` predicate. Credentials are
//! read via `read_env_file` from `./data/env/env`, never from `std::env`.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use intercom_core::{NewMessage, Store, TypingState};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::container::secrets::read_env_file;

pub const TELEGRAM_MAX_TEXT_CHARS: usize = 4096;
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// The fixed JID every `MailPollChannel` inbound item is filed under,
/// regardless of the original sender — mail is routed into the `main`
/// registered group, not a per-sender conversation.
pub const MAIL_MAIN_JID: &str = "mail:inbox";

#[derive(Debug, Deserialize)]
struct TelegramApiEnvelope {
    ok: bool,
    result: Option<serde_json::Value>,
    description: Option<String>,
}

struct QueuedSend {
    jid: String,
    text: String,
}

/// Long-lived Telegram bot channel. "Connected" means the bot token is
/// present and Telegram's `getMe` accepted it, not a persistent socket.
pub struct TelegramChannel {
    client: Client,
    env_path: PathBuf,
    bot_token: Mutex<Option<String>>,
    outgoing: Mutex<VecDeque<QueuedSend>>,
}

impl TelegramChannel {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            client: Client::new(),
            env_path: data_dir.join("env").join("env"),
            bot_token: Mutex::new(None),
            outgoing: Mutex::new(VecDeque::new()),
        }
    }

    pub fn owns_jid(jid: &str) -> bool {
        jid.starts_with("tg:")
    }

    /// Verifies the bot token via `getMe` and flushes anything queued while
    /// disconnected. Returns an error when no usable token is found or
    /// Telegram rejects it.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let token = read_env_file(&self.env_path, &["TELEGRAM_BOT_TOKEN"])
            .remove("TELEGRAM_BOT_TOKEN")
            .ok_or_else(|| anyhow!("TELEGRAM_BOT_TOKEN not present in {}", self.env_path.display()))?;

        let endpoint = format!("{TELEGRAM_API_BASE}/bot{token}/getMe");
        let response = self
            .client
            .get(&endpoint)
            .send()
            .await
            .context("failed to call Telegram getMe")?;
        let body: TelegramApiEnvelope = response
            .json()
            .await
            .context("failed to parse Telegram getMe response")?;
        if !body.ok {
            return Err(anyhow!(body.description.unwrap_or_else(|| {
                "Telegram getMe returned ok=false".to_string()
            })));
        }

        *self.bot_token.lock().await = Some(token);
        info!("Telegram channel connected");
        self.flush_outgoing().await;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.bot_token.lock().await.is_some()
    }

    /// Best-effort typing indicator via `sendChatAction`. Telegram has no
    /// "stop typing" call — the indicator expires on its own, so `Off` is a
    /// no-op here.
    pub async fn set_typing(&self, jid: &str, typing: TypingState) -> anyhow::Result<()> {
        if typing == TypingState::Off {
            return Ok(());
        }
        let Some(token) = self.bot_token.lock().await.clone() else {
            return Ok(());
        };
        let chat_id = normalize_chat_id(jid);
        let endpoint = format!("{TELEGRAM_API_BASE}/bot{token}/sendChatAction");
        let _ = self
            .client
            .post(&endpoint)
            .json(&serde_json::json!({ "chat_id": chat_id, "action": "typing" }))
            .send()
            .await;
        Ok(())
    }

    /// Send text to a JID, splitting at `TELEGRAM_MAX_TEXT_CHARS`. Queues the
    /// message for later delivery (rather than dropping it) when
    /// disconnected or when the send itself fails.
    pub async fn send_text_to_jid(&self, jid: &str, text: &str) -> anyhow::Result<()> {
        if text.trim().is_empty() {
            return Err(anyhow!("cannot send an empty Telegram message"));
        }
        if !self.is_connected().await {
            self.outgoing.lock().await.push_back(QueuedSend {
                jid: jid.to_string(),
                text: text.to_string(),
            });
            return Err(anyhow!("Telegram channel disconnected, message queued"));
        }

        if let Err(e) = self.deliver(jid, text).await {
            warn!(jid, err = %e, "Telegram send failed, queueing for retry on reconnect");
            self.outgoing.lock().await.push_back(QueuedSend {
                jid: jid.to_string(),
                text: text.to_string(),
            });
            return Err(e);
        }
        Ok(())
    }

    async fn deliver(&self, jid: &str, text: &str) -> anyhow::Result<()> {
        let token = self
            .bot_token
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("Telegram channel disconnected"))?;

        let chat_id = normalize_chat_id(jid);
        let endpoint = format!("{TELEGRAM_API_BASE}/bot{token}/sendMessage");

        for chunk in split_for_length(text, TELEGRAM_MAX_TEXT_CHARS) {
            let response = self
                .client
                .post(&endpoint)
                .json(&serde_json::json!({ "chat_id": chat_id, "text": chunk }))
                .send()
                .await
                .context("failed to call Telegram sendMessage")?;

            let body: TelegramApiEnvelope = response
                .json()
                .await
                .context("failed to parse Telegram sendMessage response")?;
            if !body.ok {
                return Err(anyhow!(body.description.unwrap_or_else(|| {
                    "Telegram sendMessage returned ok=false".to_string()
                })));
            }
        }
        Ok(())
    }

    async fn flush_outgoing(&self) {
        let pending: Vec<QueuedSend> = self.outgoing.lock().await.drain(..).collect();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "flushing queued Telegram messages");
        for item in pending {
            if let Err(e) = self.deliver(&item.jid, &item.text).await {
                warn!(jid = item.jid.as_str(), err = %e, "failed to flush queued message, re-queueing");
                self.outgoing.lock().await.push_back(item);
            }
        }
    }
}

fn normalize_chat_id(jid: &str) -> &str {
    jid.strip_prefix("tg:").unwrap_or(jid)
}

fn split_for_length(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut chars_in_current = 0_usize;

    for ch in text.chars() {
        if chars_in_current >= max_chars {
            chunks.push(current);
            current = String::new();
            chars_in_current = 0;
        }
        current.push(ch);
        chars_in_current += 1;
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

// ---------------------------------------------------------------------------
// MailPollChannel
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MailDropMessage {
    id: String,
    sender: String,
    #[serde(default)]
    sender_name: Option<String>,
    content: String,
    timestamp: String,
}

/// Bounded dedup set of processed item ids. Caps at `CAP`, compacting to the
/// newest `COMPACT_TO` (dropping the oldest half) on overflow rather than
/// growing without bound.
struct ProcessedIdSet {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl ProcessedIdSet {
    const CAP: usize = 5000;
    const COMPACT_TO: usize = 2500;

    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.seen.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > Self::CAP {
            let drop_count = self.order.len() - Self::COMPACT_TO;
            for _ in 0..drop_count {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }
}

const MAX_BACKOFF_MS: u64 = 30 * 60 * 1000;
const BASE_BACKOFF_MS: u64 = 5_000;

/// Poll-based channel standing in for an IMAP/mbox source: lists a directory
/// of dropped message files, dedups, and files every inbound item under
/// `MAIL_MAIN_JID` in the `main` registered group.
pub struct MailPollChannel {
    inbox_dir: PathBuf,
    processed_dir: PathBuf,
    errors_dir: PathBuf,
    processed_ids: Mutex<ProcessedIdSet>,
    consecutive_errors: Mutex<u32>,
}

impl MailPollChannel {
    pub fn new(data_dir: &Path) -> Self {
        let mail_dir = data_dir.join("mail");
        Self {
            inbox_dir: mail_dir.join("inbox"),
            processed_dir: mail_dir.join("processed"),
            errors_dir: mail_dir.join("errors"),
            processed_ids: Mutex::new(ProcessedIdSet::new()),
            consecutive_errors: Mutex::new(0),
        }
    }

    pub fn owns_jid(jid: &str) -> bool {
        jid.starts_with("mail:")
    }

    /// There is no real connection to establish; the directories are
    /// created lazily so the poll loop has somewhere to read and archive.
    pub async fn connect(&self) -> anyhow::Result<()> {
        for dir in [&self.inbox_dir, &self.processed_dir, &self.errors_dir] {
            tokio::fs::create_dir_all(dir).await.with_context(|| {
                format!("failed to create mail channel directory {}", dir.display())
            })?;
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.inbox_dir.exists()
    }

    /// No-op: there is no typing concept for a poll-based channel.
    pub async fn set_typing(&self, _jid: &str, _typing: TypingState) -> anyhow::Result<()> {
        Ok(())
    }

    /// The mail channel has no outbound delivery path of its own; replies
    /// routed to `MAIL_MAIN_JID` are logged rather than dropped silently.
    pub async fn send_text_to_jid(&self, jid: &str, text: &str) -> anyhow::Result<()> {
        debug!(jid, len = text.len(), "mail channel has no outbound delivery, dropping");
        Ok(())
    }

    /// The backoff delay to wait before the next poll, based on the current
    /// consecutive-error count. Zero when healthy.
    pub async fn backoff_delay_ms(&self) -> u64 {
        let errors = *self.consecutive_errors.lock().await;
        if errors == 0 {
            return 0;
        }
        let shift = errors.saturating_sub(1).min(10);
        (BASE_BACKOFF_MS.saturating_mul(1u64 << shift)).min(MAX_BACKOFF_MS)
    }

    /// List-then-fetch one poll iteration: reads every file under the
    /// inbox directory, skips anything already processed, stores new items
    /// under `MAIL_MAIN_JID`, and archives the file either way.
    pub async fn poll_once(&self, store: &Store) -> anyhow::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.inbox_dir).await {
            Ok(e) => e,
            Err(e) => {
                self.note_error().await;
                return Err(e).context("failed to read mail inbox directory");
            }
        };

        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                        paths.push(entry.path());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.note_error().await;
                    return Err(e).context("failed to iterate mail inbox directory");
                }
            }
        }
        paths.sort();

        let mut ingested = 0;
        for path in paths {
            match self.ingest_one(store, &path).await {
                Ok(true) => ingested += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "failed to ingest mail drop file, moving to errors/");
                    self.archive(&path, &self.errors_dir).await;
                }
            }
        }

        *self.consecutive_errors.lock().await = 0;
        Ok(ingested)
    }

    async fn ingest_one(&self, store: &Store, path: &Path) -> anyhow::Result<bool> {
        let content = tokio::fs::read_to_string(path)
            .await
            .context("failed to read mail drop file")?;
        let msg: MailDropMessage =
            serde_json::from_str(&content).context("failed to parse mail drop file")?;

        {
            let ids = self.processed_ids.lock().await;
            if ids.contains(&msg.id) {
                self.archive(path, &self.processed_dir).await;
                return Ok(false);
            }
        }

        store
            .store_chat_metadata(MAIL_MAIN_JID, &msg.timestamp, Some("Mail"), Some("mail"), Some(false))
            .await
            .ok();

        let sender_name = msg.sender_name.clone().unwrap_or_else(|| msg.sender.clone());
        let new_msg = NewMessage {
            id: msg.id.clone(),
            chat_jid: MAIL_MAIN_JID.to_string(),
            sender: msg.sender,
            sender_name,
            content: msg.content,
            timestamp: msg.timestamp,
            is_from_me: false,
            is_bot_message: false,
        };
        store.store_message(&new_msg).await?;

        self.processed_ids.lock().await.insert(msg.id);
        self.archive(path, &self.processed_dir).await;
        Ok(true)
    }

    async fn note_error(&self) {
        let mut errors = self.consecutive_errors.lock().await;
        *errors = errors.saturating_add(1);
        error!(consecutive_errors = *errors, "mail channel poll failed");
    }

    async fn archive(&self, path: &Path, dest_dir: &Path) {
        let Some(file_name) = path.file_name() else {
            return;
        };
        if let Err(e) = tokio::fs::rename(path, dest_dir.join(file_name)).await {
            warn!(path = %path.display(), err = %e, "failed to archive mail drop file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn split_for_length_keeps_chunks_within_limit() {
        let text = "a".repeat(9005);
        let chunks = split_for_length(&text, TELEGRAM_MAX_TEXT_CHARS);
        assert_eq!(chunks.len(), 3);
        assert!(
            chunks
                .iter()
                .all(|chunk| chunk.chars().count() <= TELEGRAM_MAX_TEXT_CHARS)
        );
        assert_eq!(
            chunks.iter().map(|c| c.chars().count()).sum::<usize>(),
            text.chars().count()
        );
    }

    #[test]
    fn telegram_owns_jid_by_prefix() {
        assert!(TelegramChannel::owns_jid("tg:123"));
        assert!(!TelegramChannel::owns_jid("mail:inbox"));
    }

    #[test]
    fn mail_owns_jid_by_prefix() {
        assert!(MailPollChannel::owns_jid("mail:inbox"));
        assert!(!MailPollChannel::owns_jid("tg:123"));
    }

    #[test]
    fn processed_id_set_compacts_on_overflow() {
        let mut set = ProcessedIdSet::new();
        for i in 0..(ProcessedIdSet::CAP + 10) {
            set.insert(format!("id-{i}"));
        }
        assert_eq!(set.order.len(), ProcessedIdSet::COMPACT_TO);
        // The oldest ids should have been dropped; the newest retained.
        assert!(!set.contains("id-0"));
        assert!(set.contains(&format!("id-{}", ProcessedIdSet::CAP + 9)));
    }

    #[tokio::test]
    async fn mail_poll_channel_ingests_and_dedups() {
        let tmp = TempDir::new().unwrap();
        let channel = MailPollChannel::new(tmp.path());
        channel.connect().await.unwrap();
        let store = Store::open_in_memory().unwrap();

        let drop_file = channel.inbox_dir.join("msg-1.json");
        tokio::fs::write(
            &drop_file,
            serde_json::json!({
                "id": "msg-1",
                "sender": "alice@example.com",
                "sender_name": "Alice",
                "content": "hello",
                "timestamp": "2026-01-01T00:00:00Z",
            })
            .to_string(),
        )
        .await
        .unwrap();

        let count = channel.poll_once(&store).await.unwrap();
        assert_eq!(count, 1);
        assert!(!drop_file.exists());
        assert!(channel.processed_dir.join("msg-1.json").exists());

        let recent = store.get_recent_conversation(MAIL_MAIN_JID, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].sender_name, "Alice");

        // Second poll with nothing new should ingest nothing.
        let count = channel.poll_once(&store).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn mail_poll_channel_quarantines_unparseable_file() {
        let tmp = TempDir::new().unwrap();
        let channel = MailPollChannel::new(tmp.path());
        channel.connect().await.unwrap();
        let store = Store::open_in_memory().unwrap();

        let bad_file = channel.inbox_dir.join("bad.json");
        tokio::fs::write(&bad_file, b"not json").await.unwrap();

        let count = channel.poll_once(&store).await.unwrap();
        assert_eq!(count, 0);
        assert!(channel.errors_dir.join("bad.json").exists());
    }

    #[tokio::test]
    async fn backoff_delay_grows_and_caps() {
        let tmp = TempDir::new().unwrap();
        let channel = MailPollChannel::new(tmp.path());
        assert_eq!(channel.backoff_delay_ms().await, 0);

        channel.note_error().await;
        assert_eq!(channel.backoff_delay_ms().await, BASE_BACKOFF_MS);

        for _ in 0..20 {
            channel.note_error().await;
        }
        assert_eq!(channel.backoff_delay_ms().await, MAX_BACKOFF_MS);
    }
}
