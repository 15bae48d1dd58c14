//! Configuration loader and validator for the broadcast bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    pub broadcast: Broadcast,
    #[serde(default)]
    pub topics: Topics,
    #[serde(default)]
    pub reaper: Reaper,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    /// Operators allowed to talk to the bot. Everyone else is ignored.
    pub allowed_users: Vec<i64>,
}

/// Where broadcasts go and how albums are collected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Broadcast {
    pub group_chat_id: i64,
    #[serde(default = "default_media_group_delay_ms")]
    pub media_group_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topics {
    pub cache_ttl_seconds: u64,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 300,
        }
    }
}

/// Stale media group cleanup schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaper {
    pub interval_seconds: u64,
    pub retention_seconds: u64,
    pub retry_seconds: u64,
}

impl Default for Reaper {
    fn default() -> Self {
        Self {
            interval_seconds: 30 * 60,
            retention_seconds: 60 * 60,
            retry_seconds: 60,
        }
    }
}

fn default_media_group_delay_ms() -> u64 {
    2000
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/broadcastbot.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }

    pub fn media_group_delay(&self) -> Duration {
        Duration::from_millis(self.broadcast.media_group_delay_ms)
    }

    pub fn topic_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.topics.cache_ttl_seconds)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    if cfg.telegram.allowed_users.is_empty() {
        return Err(ConfigError::Invalid(
            "telegram.allowed_users must list at least one operator",
        ));
    }
    if cfg.broadcast.group_chat_id == 0 {
        return Err(ConfigError::Invalid("broadcast.group_chat_id must be set"));
    }
    if cfg.broadcast.media_group_delay_ms == 0 {
        return Err(ConfigError::Invalid(
            "broadcast.media_group_delay_ms must be > 0",
        ));
    }
    if cfg.topics.cache_ttl_seconds == 0 {
        return Err(ConfigError::Invalid("topics.cache_ttl_seconds must be > 0"));
    }
    if cfg.reaper.interval_seconds == 0 {
        return Err(ConfigError::Invalid("reaper.interval_seconds must be > 0"));
    }
    if cfg.reaper.retry_seconds == 0 {
        return Err(ConfigError::Invalid("reaper.retry_seconds must be > 0"));
    }
    if Duration::from_secs(cfg.reaper.retention_seconds) <= cfg.media_group_delay() {
        return Err(ConfigError::Invalid(
            "reaper.retention_seconds must exceed the media group delay",
        ));
    }
    Ok(())
}

/// Example configuration, also used as the test fixture.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  allowed_users:
    - 123456789

broadcast:
  group_chat_id: -1001234567890
  media_group_delay_ms: 2000

topics:
  cache_ttl_seconds: 300

reaper:
  interval_seconds: 1800
  retention_seconds: 3600
  retry_seconds: 60
"#
}
