//! OpenAI-compatible chat client for release-title extraction
//!
//! One request per title with its own timeout. Network trouble, 408, 429 and
//! 5xx are reported as [`LlmError::Transient`]; other 4xx answers as
//! [`LlmError::Rejected`]; output that doesn't fit the schema as
//! [`LlmError::Schema`]. Retrying is left to the caller.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;

use super::http_client;
use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::pipeline::traits::{LlmExtraction, TitleExtractor};

const SYSTEM_PROMPT: &str = r#"You are an anime release-title parser.
Extract the series, season and episode from the RSS entry title you are given.
Ignore release group tags, resolution, codecs, subtitle languages, checksums and file extensions.
Answer with a single JSON object and nothing else:
{"series_title": "string", "season": int or null, "episode": int}
- series_title: the series name as written, without season markers like "S2" or "2nd Season".
- season: the season number if the title states one, 0 for specials, otherwise null.
- episode: the episode number within the season."#;

static JSON_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid regex"));

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Shape the model is asked to produce
#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default, alias = "anime_name")]
    series_title: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    season: Option<u32>,
    #[serde(default, deserialize_with = "lenient_number")]
    episode: Option<u32>,
}

/// Accepts `5`, `"05"` and `null`
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("not a whole number: {}", n))),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("not a whole number: {}", s))),
        Some(other) => Err(serde::de::Error::custom(format!("unexpected value: {}", other))),
    }
}

/// Pull a JSON object out of a model reply
///
/// Looks for a fenced ```json block first, then falls back to the span
/// between the first `{` and the last `}`.
pub fn parse_json_from_markdown(text: &str) -> Option<&str> {
    if let Some(caps) = JSON_BLOCK.captures(text) {
        return caps.get(1).map(|m| m.as_str().trim());
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Validate a model reply against the extraction schema
pub fn parse_extraction(content: &str) -> Result<LlmExtraction, LlmError> {
    let json_str = parse_json_from_markdown(content)
        .ok_or_else(|| LlmError::Schema(format!("no JSON object in reply: {}", content)))?;

    let raw: RawExtraction = serde_json::from_str(json_str)
        .map_err(|e| LlmError::Schema(format!("{} in {}", e, json_str)))?;

    let series_title = raw
        .series_title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| LlmError::Schema("missing series_title".to_string()))?;
    let episode = raw
        .episode
        .ok_or_else(|| LlmError::Schema("missing episode".to_string()))?;

    Ok(LlmExtraction {
        series_title,
        season: raw.season,
        episode,
    })
}

pub struct OpenAiExtractor {
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiExtractor {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Map a non-success status to an error; only timeouts, rate limits and
/// server errors can succeed on a later attempt
fn classify_status(status: StatusCode, body: &str) -> LlmError {
    let detail = format!("HTTP {}: {}", status, body);
    let retryable = !status.is_client_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if retryable {
        LlmError::Transient(detail)
    } else {
        LlmError::Rejected(detail)
    }
}

#[async_trait]
impl TitleExtractor for OpenAiExtractor {
    async fn extract(&self, raw_title: &str) -> Result<LlmExtraction, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: format!("Feed Title: {}", raw_title),
                },
            ],
            temperature: 0.0,
            response_format: json!({ "type": "json_object" }),
        };

        let response = http_client()
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Transient(format!("unreadable response body: {}", e)))?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Schema("reply has no content".to_string()))?;

        tracing::debug!("LLM reply for '{}': {}", raw_title, content);
        parse_extraction(&content)
    }
}
