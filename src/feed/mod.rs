//! Feed Fetcher
//!
//! Fetches RSS/Atom documents over HTTP(S) and turns them into [`FeedEntry`]
//! values. A failure here only skips the feed for the current cycle.

pub mod rss;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clients::http_client;
use crate::error::FeedError;
use crate::pipeline::traits::FeedSource;

/// One announced release, immutable once fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    /// guid/id when present, otherwise the link
    pub id: String,
    pub raw_title: String,
    /// Torrent enclosure or magnet when available, otherwise the item link
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Fetches feeds with the shared HTTP client
#[derive(Debug, Default, Clone)]
pub struct HttpFeedSource;

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, url: &str) -> Result<Vec<FeedEntry>, FeedError> {
        let unreachable = |reason: String| FeedError::Unreachable {
            url: url.to_string(),
            reason,
        };

        tracing::debug!("Fetching feed: {}", url);

        let response = http_client()
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| unreachable(e.to_string()))?;

        let xml = response
            .text()
            .await
            .map_err(|e| unreachable(format!("Failed to read response body: {}", e)))?;

        let entries = rss::parse_feed(&xml).map_err(|e| unreachable(e.to_string()))?;
        tracing::debug!("Feed {} returned {} entries", url, entries.len());

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[ignore]
    #[tokio::test]
    async fn test_fetch_feed_live() {
        // Integration test - requires network access
        let entries = HttpFeedSource
            .fetch("https://nyaa.si/?page=rss&q=subsplease&c=1_2&f=0")
            .await
            .unwrap();
        println!("Fetched {} entries", entries.len());
        for entry in entries.iter().take(3) {
            println!("  - {} ({})", entry.raw_title, entry.id);
        }
    }

    #[tokio::test]
    async fn test_unreachable_feed() {
        let result = HttpFeedSource.fetch("http://127.0.0.1:9/rss").await;
        assert!(matches!(result, Err(FeedError::Unreachable { .. })));
    }
}
