//! Metadata Resolver
//!
//! Asks the LLM for series/season/episode, then checks the series title
//! against the catalog. A close enough catalog match replaces the LLM title
//! with the canonical one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;

use super::traits::{LlmExtraction, SeriesCatalog, SeriesCatalogEntry, TitleExtractor};
use crate::config::DEFAULT_SIMILARITY_THRESHOLD;
use crate::error::{LlmError, PipelineError, ResolutionFailure, ResolutionReason};
use crate::retry::{RetryConfig, retry_async};

/// Season used when the title does not state one
pub const DEFAULT_SEASON: u32 = 1;

/// Two different catalog titles scoring within this margin are ambiguous
const AMBIGUITY_MARGIN: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceSource {
    LlmOnly,
    LlmConfirmedByDb,
}

impl ConfidenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceSource::LlmOnly => "llm_only",
            ConfidenceSource::LlmConfirmedByDb => "llm_confirmed_by_db",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "llm_only" => Some(ConfidenceSource::LlmOnly),
            "llm_confirmed_by_db" => Some(ConfidenceSource::LlmConfirmedByDb),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEpisode {
    pub series_title: String,
    pub season: u32,
    pub episode: u32,
    pub confidence: ConfidenceSource,
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub similarity_threshold: f64,
    /// Retries of transient LLM errors within one resolve call
    pub retry: RetryConfig,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            retry: RetryConfig::default(),
        }
    }
}

pub struct MetadataResolver {
    llm: Arc<dyn TitleExtractor>,
    catalog: Arc<dyn SeriesCatalog>,
    settings: ResolverSettings,
    /// Set once a rejection has been logged, cleared by the next good reply
    rejection_reported: AtomicBool,
}

/// Outcome of matching an LLM title against catalog candidates
#[derive(Debug, PartialEq)]
enum CatalogMatch {
    Confirmed(String),
    NoMatch,
    Ambiguous(Vec<String>),
}

impl MetadataResolver {
    pub fn new(
        llm: Arc<dyn TitleExtractor>,
        catalog: Arc<dyn SeriesCatalog>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            llm,
            catalog,
            settings,
            rejection_reported: AtomicBool::new(false),
        }
    }

    /// Resolve a raw release title
    ///
    /// # Example
    ///
    /// ```ignore
    /// let resolved = resolver.resolve("[Group] Great Show - 05 (1080p) [ABCDEF].mkv").await?;
    /// assert_eq!(resolved.series_title, "Great Show");
    /// assert_eq!((resolved.season, resolved.episode), (1, 5));
    /// ```
    pub async fn resolve(&self, raw_title: &str) -> Result<ResolvedEpisode, ResolutionFailure> {
        let extraction = self.extract(raw_title).await?;

        let candidates = match self.catalog.search(&extraction.series_title).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(
                    "Catalog lookup for '{}' failed, using LLM title: {:?}",
                    extraction.series_title,
                    e
                );
                Vec::new()
            }
        };

        let season = extraction.season.unwrap_or(DEFAULT_SEASON);
        let resolved = match match_catalog(
            &extraction.series_title,
            &candidates,
            self.settings.similarity_threshold,
        ) {
            CatalogMatch::Confirmed(canonical) => ResolvedEpisode {
                series_title: canonical,
                season,
                episode: extraction.episode,
                confidence: ConfidenceSource::LlmConfirmedByDb,
            },
            CatalogMatch::NoMatch => ResolvedEpisode {
                series_title: extraction.series_title,
                season,
                episode: extraction.episode,
                confidence: ConfidenceSource::LlmOnly,
            },
            CatalogMatch::Ambiguous(titles) => {
                return Err(ResolutionFailure::new(
                    ResolutionReason::AmbiguousCatalog,
                    format!(
                        "'{}' matches {} equally well",
                        extraction.series_title,
                        titles.join(", ")
                    ),
                ));
            }
        };

        tracing::debug!(
            "Resolved '{}' as {} S{:02}E{:02} ({})",
            raw_title,
            resolved.series_title,
            resolved.season,
            resolved.episode,
            resolved.confidence.as_str()
        );
        Ok(resolved)
    }

    async fn extract(&self, raw_title: &str) -> Result<LlmExtraction, ResolutionFailure> {
        let result = retry_async(
            || self.llm.extract(raw_title),
            |e| matches!(e, LlmError::Transient(_)),
            &self.settings.retry,
            "llm extract",
        )
        .await;

        match result {
            Ok(extraction) => {
                self.rejection_reported.store(false, Ordering::Relaxed);
                Ok(extraction)
            }
            Err(LlmError::Transient(detail)) => Err(ResolutionFailure::new(
                ResolutionReason::LlmUnavailable,
                detail,
            )),
            Err(LlmError::Schema(detail)) => {
                Err(ResolutionFailure::new(ResolutionReason::Unparsable, detail))
            }
            Err(LlmError::Rejected(detail)) => {
                if !self.rejection_reported.swap(true, Ordering::Relaxed) {
                    let err = PipelineError::FatalConfig(format!(
                        "LLM endpoint rejects requests, check the [llm] section: {}",
                        detail
                    ));
                    tracing::error!("{}", err);
                }
                Err(ResolutionFailure::new(ResolutionReason::LlmRejected, detail))
            }
        }
    }
}

/// Lowercase, turn separators into spaces, drop other punctuation
pub fn normalize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter_map(|c| match c {
            '_' | '.' | '-' => Some(' '),
            c if c.is_alphanumeric() || c.is_whitespace() => Some(c),
            _ => None,
        })
        .flat_map(char::to_lowercase)
        .collect();

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Best similarity between `title` and an entry's canonical title or aliases
fn entry_similarity(title: &str, entry: &SeriesCatalogEntry) -> f64 {
    std::iter::once(&entry.canonical_title)
        .chain(entry.known_aliases.iter())
        .map(|name| normalized_levenshtein(title, &normalize_title(name)))
        .fold(0.0, f64::max)
}

fn match_catalog(title: &str, candidates: &[SeriesCatalogEntry], threshold: f64) -> CatalogMatch {
    let wanted = normalize_title(title);
    if wanted.is_empty() {
        return CatalogMatch::NoMatch;
    }

    // every distinct series carrying the exact name, in catalog order
    let mut exact: Vec<String> = Vec::new();
    for entry in candidates {
        let matches = std::iter::once(&entry.canonical_title)
            .chain(entry.known_aliases.iter())
            .any(|name| normalize_title(name) == wanted);
        if matches && !exact.contains(&entry.canonical_title) {
            exact.push(entry.canonical_title.clone());
        }
    }
    match exact.len() {
        0 => {}
        1 => return CatalogMatch::Confirmed(exact.remove(0)),
        _ => return CatalogMatch::Ambiguous(exact),
    }

    let mut scored: Vec<(f64, &SeriesCatalogEntry)> = candidates
        .iter()
        .map(|entry| (entry_similarity(&wanted, entry), entry))
        .filter(|(score, _)| *score >= threshold)
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    let Some(&(best_score, best)) = scored.first() else {
        return CatalogMatch::NoMatch;
    };

    let rivals: Vec<String> = scored
        .iter()
        .skip(1)
        .filter(|(score, entry)| {
            best_score - score <= AMBIGUITY_MARGIN && entry.canonical_title != best.canonical_title
        })
        .map(|(_, entry)| entry.canonical_title.clone())
        .collect();

    if rivals.is_empty() {
        CatalogMatch::Confirmed(best.canonical_title.clone())
    } else {
        let mut titles = vec![best.canonical_title.clone()];
        titles.extend(rivals);
        CatalogMatch::Ambiguous(titles)
    }
}
