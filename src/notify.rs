//! Notifier: pushes human-readable summaries to Telegram / PushPlus
//!
//! Delivery is best-effort. Each channel is retried on its own and a channel
//! that keeps failing is logged and skipped; nothing here reaches back into
//! pipeline state.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::clients::http_client;
use crate::config::{BotConfig, BotKind, NotificationConfig};
use crate::pipeline::state::FailureReason;
use crate::retry::{RetryConfig, retry_async};

const TELEGRAM_API: &str = "https://api.telegram.org";
const PUSHPLUS_API: &str = "https://www.pushplus.plus/send";

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    EpisodeReady {
        series_title: String,
        season: u32,
        episode: u32,
        raw_title: String,
    },
    EntryFailed {
        raw_title: String,
        reason: FailureReason,
        detail: String,
    },
    FeedPaused {
        url: String,
        error: String,
    },
}

impl Notification {
    pub fn title(&self) -> String {
        match self {
            Notification::EpisodeReady {
                series_title,
                season,
                episode,
                ..
            } => format!("{} S{:02}E{:02} is ready", series_title, season, episode),
            Notification::EntryFailed { reason, .. } => format!("Needs attention: {}", reason),
            Notification::FeedPaused { .. } => "Feed paused".to_string(),
        }
    }

    pub fn body(&self) -> String {
        match self {
            Notification::EpisodeReady { raw_title, .. } => format!("Release: {}", raw_title),
            Notification::EntryFailed {
                raw_title, detail, ..
            } => format!("Release: {}\n{}", raw_title, detail),
            Notification::FeedPaused { url, error } => format!(
                "{} was paused after repeated failures.\nLast error: {}\nFix the configuration and restart to resume.",
                url, error
            ),
        }
    }
}

/// Anything that can take a notification; never fails from the caller's view
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification);
}

/// One delivery channel
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, title: &str, body: &str) -> Result<()>;
}

pub struct TelegramChannel {
    bot_token: String,
    chat_id: String,
}

impl TelegramChannel {
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        Self {
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

#[async_trait]
impl NotifyChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, title: &str, body: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", TELEGRAM_API, self.bot_token);
        let response: TelegramResponse = http_client()
            .post(&url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": format!("{}\n\n{}", title, body),
            }))
            .send()
            .await
            .context("Failed to reach Telegram")?
            .json()
            .await
            .context("Failed to parse Telegram response")?;

        if !response.ok {
            bail!(
                "Telegram rejected message: {}",
                response.description.unwrap_or_default()
            );
        }
        Ok(())
    }
}

pub struct PushPlusChannel {
    token: String,
    channel: String,
}

impl PushPlusChannel {
    pub fn new(token: &str, channel: &str) -> Self {
        Self {
            token: token.to_string(),
            channel: if channel.is_empty() {
                "wechat".to_string()
            } else {
                channel.to_string()
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct PushPlusResponse {
    code: i64,
    #[serde(default)]
    msg: String,
}

#[async_trait]
impl NotifyChannel for PushPlusChannel {
    fn name(&self) -> &str {
        "pushplus"
    }

    async fn send(&self, title: &str, body: &str) -> Result<()> {
        let response: PushPlusResponse = http_client()
            .post(PUSHPLUS_API)
            .json(&json!({
                "token": self.token,
                "title": title,
                "content": body,
                "template": "txt",
                "channel": self.channel,
            }))
            .send()
            .await
            .context("Failed to reach PushPlus")?
            .json()
            .await
            .context("Failed to parse PushPlus response")?;

        if response.code != 200 {
            bail!("PushPlus rejected message ({}): {}", response.code, response.msg);
        }
        Ok(())
    }
}

/// Fans a notification out to every configured channel
pub struct NotificationManager {
    channels: Vec<Box<dyn NotifyChannel>>,
    retry: RetryConfig,
}

impl NotificationManager {
    pub fn new(channels: Vec<Box<dyn NotifyChannel>>, retry: RetryConfig) -> Self {
        Self { channels, retry }
    }

    /// Build channels from config; disabled notification means no channels
    pub fn from_config(config: &NotificationConfig) -> Self {
        let channels = if config.enabled {
            config
                .bots
                .iter()
                .filter(|bot| bot.enabled)
                .map(channel_from_config)
                .collect()
        } else {
            Vec::new()
        };

        Self::new(
            channels,
            RetryConfig::new(
                config.max_retries.max(1),
                Duration::from_millis(config.retry_backoff_ms),
            ),
        )
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

fn channel_from_config(bot: &BotConfig) -> Box<dyn NotifyChannel> {
    match bot.kind {
        BotKind::Telegram => Box::new(TelegramChannel::new(&bot.bot_token, &bot.user_id)),
        BotKind::PushPlus => Box::new(PushPlusChannel::new(&bot.user_token, &bot.channel)),
    }
}

#[async_trait]
impl Notifier for NotificationManager {
    async fn notify(&self, notification: &Notification) {
        let title = notification.title();
        let body = notification.body();

        for channel in &self.channels {
            let result = retry_async(
                || channel.send(&title, &body),
                |_| true,
                &self.retry,
                channel.name(),
            )
            .await;

            match result {
                Ok(()) => tracing::debug!("Sent '{}' via {}", title, channel.name()),
                Err(e) => tracing::error!("Giving up on {} for '{}': {:?}", channel.name(), title, e),
            }
        }
    }
}
