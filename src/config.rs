//! Configuration loaded from a TOML file
//!
//! The file path comes from `CONFIG_PATH` (default `config.toml`). A missing
//! file is written out with defaults so the operator has something to edit.
//! `DATABASE_PATH` overrides `[database] path`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Minimum normalized similarity for a fuzzy catalog match
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rss: RssConfig,
    pub openlist: OpenListConfig,
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    pub tmdb: TmdbConfig,
    pub pipeline: PipelineConfig,
    pub notification: NotificationConfig,
    pub database: DatabaseConfig,
    pub log: LogConfig,
    pub proxy: ProxyConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RssConfig {
    pub urls: Vec<String>,
    /// Seconds between pipeline cycles
    pub interval_secs: u64,
}

impl Default for RssConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflineDownloadTool {
    Aria2,
    #[serde(rename = "qBittorrent")]
    QBittorrent,
    PikPak,
}

impl OfflineDownloadTool {
    /// Name the OpenList API expects in the `tool` field
    pub fn as_str(&self) -> &'static str {
        match self {
            OfflineDownloadTool::Aria2 => "aria2",
            OfflineDownloadTool::QBittorrent => "qBittorrent",
            OfflineDownloadTool::PikPak => "PikPak",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenListConfig {
    pub url: String,
    pub token: String,
    /// Root under which each download gets its own staging directory
    pub download_path: String,
    /// Root of the media library. Empty means the same as `download_path`.
    pub library_path: String,
    pub offline_download_tool: OfflineDownloadTool,
}

impl Default for OpenListConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5244".to_string(),
            token: String::new(),
            download_path: "/".to_string(),
            library_path: String::new(),
            offline_download_tool: OfflineDownloadTool::QBittorrent,
        }
    }
}

impl OpenListConfig {
    pub fn library_root(&self) -> &str {
        if self.library_path.is_empty() {
            &self.download_path
        } else {
            &self.library_path
        }
    }
}

/// Which backend moves finished files into the library
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Rename and move through the OpenList API
    #[default]
    OpenList,
    /// Move files directly on a filesystem where the OpenList storage is mounted
    Local,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageKind,
    /// Host directory that OpenList paths are resolved against, e.g. `/mnt/openlist`
    pub local_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Attempts per title within one cycle before giving up until the next
    pub max_retries: u32,
    pub retry_initial_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            retry_initial_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TmdbConfig {
    pub api_key: String,
    pub language: String,
}

impl Default for TmdbConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            language: "en-US".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker pool size shared by all cycles
    pub max_concurrent: usize,
    pub poll_interval_secs: u64,
    pub download_timeout_secs: u64,
    /// Attempts per state across cycles before an entry is failed
    pub max_attempts: u32,
    pub similarity_threshold: f64,
    /// Consecutive fetch failures before a feed is paused
    pub feed_failure_limit: u32,
    pub retention_days: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            poll_interval_secs: 30,
            download_timeout_secs: 6 * 60 * 60,
            max_attempts: 5,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            feed_failure_limit: 5,
            retention_days: 180,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotKind {
    Telegram,
    PushPlus,
}

/// One notification channel
///
/// Telegram needs `bot_token` and `user_id`; PushPlus needs `user_token`
/// and optionally `channel` (wechat, webhook, cp, mail).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(rename = "type")]
    pub kind: BotKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_token: String,
    #[serde(default)]
    pub channel: String,
}

fn default_true() -> bool {
    true
}

pub const PUSHPLUS_CHANNELS: [&str; 4] = ["wechat", "webhook", "cp", "mail"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub bots: Vec<BotConfig>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            retry_backoff_ms: 2000,
            bots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/anifeed.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub http: String,
    pub https: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Get the config file path from environment or use default
pub fn config_path() -> PathBuf {
    PathBuf::from(std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string()))
}

/// Outcome of [`Config::load_or_create`]
pub enum Loaded {
    Existing(Config),
    /// No file was found; defaults were written to the given path
    Created(Config),
}

impl Config {
    /// Load settings from file, or write the defaults if the file doesn't exist
    pub async fn load_or_create(path: &Path) -> Result<Loaded> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let config: Config = toml::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", path.display()))?;
                Ok(Loaded::Existing(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .context("Failed to create config directory")?;
                    }
                }

                let default = Config::default();
                let toml_str =
                    toml::to_string_pretty(&default).context("Failed to serialize default config")?;

                // write-then-rename so a crash never leaves a half-written file
                let tmp_path = path.with_extension("toml.tmp");
                tokio::fs::write(&tmp_path, toml_str)
                    .await
                    .context("Failed to write default config")?;
                tokio::fs::rename(&tmp_path, path)
                    .await
                    .context("Failed to move default config into place")?;

                Ok(Loaded::Created(default))
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read config file {}", path.display()))
            }
        }
    }

    /// Database location, `DATABASE_PATH` taking precedence over the file
    pub fn database_path(&self) -> String {
        std::env::var("DATABASE_PATH").unwrap_or_else(|_| self.database.path.clone())
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.rss.urls.is_empty() {
            errors.push("No RSS URLs configured in [rss] urls".to_string());
        }
        for url in &self.rss.urls {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!("[rss] urls: '{}' is not an http(s) URL", url));
            }
        }
        if self.rss.interval_secs == 0 {
            errors.push("[rss] interval_secs must be greater than 0".to_string());
        }

        if self.openlist.url.is_empty() {
            errors.push("OpenList URL is not configured in [openlist] url".to_string());
        }
        if self.openlist.token.is_empty() {
            errors.push("OpenList token is not configured in [openlist] token".to_string());
        }

        if self.storage.backend == StorageKind::Local && self.storage.local_root.is_empty() {
            errors.push("[storage] local_root is required when backend = \"local\"".to_string());
        }

        if self.llm.api_key.is_empty() {
            errors.push("LLM API key is missing in [llm] api_key".to_string());
        }
        if self.llm.max_retries == 0 {
            errors.push("[llm] max_retries must be at least 1".to_string());
        }

        let threshold = self.pipeline.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            errors.push(format!(
                "[pipeline] similarity_threshold must be in (0, 1], got {}",
                threshold
            ));
        }
        if self.pipeline.max_concurrent == 0 {
            errors.push("[pipeline] max_concurrent must be at least 1".to_string());
        }
        if self.pipeline.max_attempts == 0 {
            errors.push("[pipeline] max_attempts must be at least 1".to_string());
        }
        if self.pipeline.poll_interval_secs == 0 {
            errors.push("[pipeline] poll_interval_secs must be greater than 0".to_string());
        }

        if self.notification.enabled {
            let enabled_bots: Vec<_> = self
                .notification
                .bots
                .iter()
                .enumerate()
                .filter(|(_, bot)| bot.enabled)
                .collect();
            if enabled_bots.is_empty() {
                errors.push(
                    "Notification is enabled but no bots are configured in [[notification.bots]]"
                        .to_string(),
                );
            }
            for (i, bot) in enabled_bots {
                let label = format!("notification.bots[{}]", i);
                match bot.kind {
                    BotKind::Telegram => {
                        if bot.bot_token.is_empty() {
                            errors.push(format!("{}: 'bot_token' is required for Telegram", label));
                        }
                        if bot.user_id.is_empty() {
                            errors.push(format!("{}: 'user_id' is required for Telegram", label));
                        }
                    }
                    BotKind::PushPlus => {
                        if bot.user_token.is_empty() {
                            errors.push(format!("{}: 'user_token' is required for PushPlus", label));
                        }
                        if !bot.channel.is_empty() && !PUSHPLUS_CHANNELS.contains(&bot.channel.as_str()) {
                            errors.push(format!(
                                "{}: unknown PushPlus channel '{}' (expected one of {})",
                                label,
                                bot.channel,
                                PUSHPLUS_CHANNELS.join(", ")
                            ));
                        }
                    }
                }
            }
        }

        errors
    }

    /// Validate and fold all problems into a single fatal error
    pub fn ensure_valid(&self) -> std::result::Result<(), PipelineError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::FatalConfig(errors.join("; ")))
        }
    }
}
