use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IntercomConfig {
    pub storage: StorageConfig,
    pub runtimes: RuntimeConfig,
    pub orchestrator: OrchestratorConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `store/`, `groups/`, and `data/`.
    pub data_dir: String,
    pub groups_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: ".".to_string(),
            groups_dir: "groups".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub default_runtime: String,
    pub container_image: Option<String>,
    pub profiles: BTreeMap<String, RuntimeProfile>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "claude".to_string(),
            RuntimeProfile {
                provider: "anthropic".to_string(),
                default_model: "claude-opus-4-6".to_string(),
                required_env: vec!["CLAUDE_CODE_OAUTH_TOKEN".to_string()],
            },
        );
        profiles.insert(
            "gemini".to_string(),
            RuntimeProfile {
                provider: "code-assist".to_string(),
                default_model: "gemini-3.1-pro".to_string(),
                required_env: vec![
                    "GEMINI_REFRESH_TOKEN".to_string(),
                    "GEMINI_OAUTH_CLIENT_ID".to_string(),
                    "GEMINI_OAUTH_CLIENT_SECRET".to_string(),
                ],
            },
        );
        profiles.insert(
            "codex".to_string(),
            RuntimeProfile {
                provider: "openai".to_string(),
                default_model: "gpt-5.3-codex".to_string(),
                required_env: vec![
                    "CODEX_OAUTH_ACCESS_TOKEN".to_string(),
                    "CODEX_OAUTH_REFRESH_TOKEN".to_string(),
                    "CODEX_OAUTH_ID_TOKEN".to_string(),
                    "CODEX_OAUTH_ACCOUNT_ID".to_string(),
                ],
            },
        );

        Self {
            default_runtime: "claude".to_string(),
            container_image: None,
            profiles,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeProfile {
    pub provider: String,
    pub default_model: String,
    pub required_env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum concurrent containers across all groups.
    pub max_concurrent_containers: usize,
    /// Poll interval for the message loop (milliseconds).
    pub poll_interval_ms: u64,
    /// Idle timeout before closing container stdin (milliseconds); also
    /// serves as the watchdog backstop against a stalled container.
    pub idle_timeout_ms: u64,
    /// Folder name for the main group.
    pub main_group_folder: String,
    /// Display name the bot uses to prefix outgoing messages and to
    /// recognize its own messages in the backstop content filter.
    pub assistant_name: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_containers: 2,
            poll_interval_ms: 1000,
            idle_timeout_ms: 1_800_000,
            main_group_folder: "main".to_string(),
            assistant_name: "Andy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Poll interval for due tasks (milliseconds).
    pub poll_interval_ms: u64,
    /// IANA timezone for cron expressions.
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            timezone: "UTC".to_string(),
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<IntercomConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(IntercomConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let parsed: IntercomConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed.with_env_overrides())
}

impl IntercomConfig {
    /// Applies the enumerated environment variable overrides. Each one is
    /// optional; an unset or blank variable leaves the TOML-or-default
    /// value untouched.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(name) = std::env::var("ASSISTANT_NAME") {
            if !name.trim().is_empty() {
                self.orchestrator.assistant_name = name;
            }
        }
        if let Some(ms) = env_millis("POLL_INTERVAL") {
            self.orchestrator.poll_interval_ms = ms;
        }
        if let Some(ms) = env_millis("SCHEDULER_POLL_INTERVAL") {
            self.scheduler.poll_interval_ms = ms;
        }
        if let Ok(n) = std::env::var("MAX_CONCURRENT_CONTAINERS") {
            if let Ok(n) = n.trim().parse() {
                self.orchestrator.max_concurrent_containers = n;
            }
        }
        if let Ok(image) = std::env::var("CONTAINER_IMAGE") {
            if !image.trim().is_empty() {
                self.runtimes.container_image = Some(image);
            }
        }
        if let Ok(tz) = std::env::var("TIMEZONE") {
            if !tz.trim().is_empty() {
                self.scheduler.timezone = tz;
            }
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            if !dir.trim().is_empty() {
                self.storage.data_dir = dir;
            }
        }

        self
    }
}

fn env_millis(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_three_runtime_profiles() {
        let cfg = IntercomConfig::default();
        assert!(cfg.runtimes.profiles.contains_key("claude"));
        assert!(cfg.runtimes.profiles.contains_key("gemini"));
        assert!(cfg.runtimes.profiles.contains_key("codex"));
    }

    #[test]
    fn default_assistant_name_is_andy() {
        let cfg = IntercomConfig::default();
        assert_eq!(cfg.orchestrator.assistant_name, "Andy");
    }

    #[test]
    fn parse_toml_uses_defaults_for_missing_fields() {
        let parsed: IntercomConfig = toml::from_str(
            r#"
            [orchestrator]
            max_concurrent_containers = 5
            "#,
        )
        .expect("parse toml");

        assert_eq!(parsed.orchestrator.max_concurrent_containers, 5);
        assert_eq!(parsed.orchestrator.poll_interval_ms, 1000);
        assert!(parsed.runtimes.profiles.contains_key("claude"));
    }
}
