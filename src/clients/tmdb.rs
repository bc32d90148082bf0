//! TMDB lookup used as the series catalog
//!
//! `search/tv` gives candidates, which are ranked by title similarity; the
//! details call for the top few adds the season count and alternative titles
//! used as aliases.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use strsim::normalized_levenshtein;

use super::http_client;
use crate::config::TmdbConfig;
use crate::pipeline::resolver::normalize_title;
use crate::pipeline::traits::{SeriesCatalog, SeriesCatalogEntry};

const TMDB_BASE_URL: &str = "https://api.tmdb.org/3";

/// Only the closest few search hits are expanded with a details call
const MAX_CANDIDATES: usize = 3;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    id: u64,
    name: String,
    #[serde(default)]
    original_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TvDetails {
    name: String,
    #[serde(default)]
    original_name: Option<String>,
    #[serde(default)]
    number_of_seasons: u32,
    #[serde(default)]
    alternative_titles: Option<AlternativeTitles>,
}

#[derive(Debug, Deserialize)]
struct AlternativeTitles {
    #[serde(default)]
    results: Vec<AlternativeTitle>,
}

#[derive(Debug, Deserialize)]
struct AlternativeTitle {
    title: String,
}

pub struct TmdbCatalog {
    api_key: String,
    language: String,
    base_url: String,
}

impl TmdbCatalog {
    pub fn new(config: &TmdbConfig) -> Self {
        Self::with_base_url(config, TMDB_BASE_URL)
    }

    pub fn with_base_url(config: &TmdbConfig, base_url: &str) -> Self {
        Self {
            api_key: config.api_key.clone(),
            language: config.language.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// GET a TMDB endpoint; the api key is a query parameter, so errors
    /// carry no URL
    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        http_client()
            .get(format!("{}{}", self.base_url, path))
            .query(&[("api_key", self.api_key.as_str()), ("language", self.language.as_str())])
            .query(query)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("TMDB request {} failed", path))?
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Failed to parse TMDB response for {}", path))
    }

    async fn search_tv(&self, query: &str) -> Result<Vec<SearchResult>> {
        let response: SearchResponse = self
            .get_json("/search/tv", &[("query", query), ("include_adult", "true")])
            .await
            .with_context(|| format!("Failed to search TMDB for '{}'", query))?;
        Ok(response.results)
    }

    async fn details(&self, id: u64) -> Result<TvDetails> {
        self.get_json(&format!("/tv/{}", id), &[("append_to_response", "alternative_titles")])
            .await
    }
}

/// Closest similarity between the query and any of the given names
fn similarity<'a>(query: &str, names: impl IntoIterator<Item = &'a String>) -> f64 {
    let query = normalize_title(query);
    names
        .into_iter()
        .map(|name| normalized_levenshtein(&query, &normalize_title(name)))
        .fold(0.0, f64::max)
}

/// Order search hits by title similarity to the query, best first
fn rank_hits(query: &str, hits: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut scored: Vec<(f64, SearchResult)> = hits
        .into_iter()
        .map(|hit| (similarity(query, std::iter::once(&hit.name).chain(&hit.original_name)), hit))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.into_iter().map(|(_, hit)| hit).collect()
}

fn catalog_entry(details: TvDetails) -> SeriesCatalogEntry {
    let mut known_aliases = vec![details.name.clone()];
    let others = details.original_name.into_iter().chain(
        details
            .alternative_titles
            .map(|a| a.results)
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.title),
    );
    for alias in others {
        if !alias.is_empty() && !known_aliases.contains(&alias) {
            known_aliases.push(alias);
        }
    }

    SeriesCatalogEntry {
        canonical_title: details.name,
        known_aliases,
        season_count: details.number_of_seasons,
    }
}

#[async_trait]
impl SeriesCatalog for TmdbCatalog {
    async fn search(&self, title: &str) -> Result<Vec<SeriesCatalogEntry>> {
        if self.api_key.is_empty() {
            tracing::debug!("TMDB API key not set, skipping catalog lookup");
            return Ok(Vec::new());
        }

        let results = rank_hits(title, self.search_tv(title).await?);
        let mut entries = Vec::new();

        for result in results.into_iter().take(MAX_CANDIDATES) {
            match self.details(result.id).await {
                Ok(details) => entries.push(catalog_entry(details)),
                Err(e) => {
                    // fall back to what the search hit told us
                    tracing::warn!("TMDB details for {} unavailable: {:?}", result.id, e);
                    entries.push(catalog_entry(TvDetails {
                        name: result.name,
                        original_name: result.original_name,
                        number_of_seasons: 0,
                        alternative_titles: None,
                    }));
                }
            }
        }

        // aliases from the details call can change the order
        entries.sort_by(|a, b| {
            let score = |e: &SeriesCatalogEntry| {
                similarity(title, std::iter::once(&e.canonical_title).chain(&e.known_aliases))
            };
            score(b).total_cmp(&score(a))
        });
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_entry_aliases() {
        let details: TvDetails = serde_json::from_str(
            r#"{
                "name": "Frieren: Beyond Journey's End",
                "original_name": "葬送のフリーレン",
                "number_of_seasons": 2,
                "alternative_titles": { "results": [
                    { "iso_3166_1": "JP", "title": "Sousou no Frieren", "type": "" },
                    { "iso_3166_1": "US", "title": "Frieren: Beyond Journey's End", "type": "" }
                ] }
            }"#,
        )
        .unwrap();

        let entry = catalog_entry(details);
        assert_eq!(entry.canonical_title, "Frieren: Beyond Journey's End");
        assert_eq!(entry.season_count, 2);
        assert_eq!(
            entry.known_aliases,
            vec![
                "Frieren: Beyond Journey's End".to_string(),
                "葬送のフリーレン".to_string(),
                "Sousou no Frieren".to_string(),
            ]
        );
    }

    fn hit(id: u64, name: &str, original_name: Option<&str>) -> SearchResult {
        SearchResult {
            id,
            name: name.to_string(),
            original_name: original_name.map(str::to_string),
        }
    }

    #[test]
    fn test_hits_ranked_by_similarity() {
        // TMDB returns hits by popularity; the exact title comes last here
        let hits = vec![
            hit(1, "Great Pretender", None),
            hit(2, "The Great Showdown", None),
            hit(3, "Greatest Showman Stories", None),
            hit(4, "Show by Rock!!", None),
            hit(5, "Gureito Shou", Some("Great Show")),
        ];

        let ranked = rank_hits("Great Show", hits);
        let ids: Vec<u64> = ranked.iter().map(|h| h.id).collect();
        assert_eq!(ids[0], 5);
        assert!(ids.iter().take(MAX_CANDIDATES).any(|id| *id == 5));
        assert_eq!(ranked.len(), 5);
    }

    #[tokio::test]
    async fn test_errors_do_not_leak_api_key() {
        let config = TmdbConfig {
            api_key: "super-secret-key".to_string(),
            language: "en-US".to_string(),
        };
        // nothing listens on port 9 locally
        let catalog = TmdbCatalog::with_base_url(&config, "http://127.0.0.1:9/3");

        let err = catalog.search("Great Show").await.unwrap_err();
        let logged = format!("{:?} {:#}", err, err);
        assert!(!logged.contains("super-secret-key"), "{}", logged);
        assert!(logged.contains("Great Show"));
    }

    #[tokio::test]
    async fn test_search_without_key_is_empty() {
        let catalog = TmdbCatalog::new(&TmdbConfig::default());
        assert!(catalog.search("Great Show").await.unwrap().is_empty());
    }

    #[ignore]
    #[tokio::test]
    async fn test_search_live() {
        // Integration test - requires TMDB_API_KEY
        let config = TmdbConfig {
            api_key: std::env::var("TMDB_API_KEY").unwrap_or_default(),
            language: "en-US".to_string(),
        };
        let entries = TmdbCatalog::new(&config).search("Sousou no Frieren").await.unwrap();
        for entry in &entries {
            println!("  - {} ({} seasons)", entry.canonical_title, entry.season_count);
        }
        assert!(!entries.is_empty());
    }
}
