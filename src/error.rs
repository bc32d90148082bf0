//! Error taxonomy for the episode pipeline
//!
//! Plumbing code returns `anyhow::Result`; the types here classify failures
//! that the orchestrator has to act on (retry, park for review, pause a feed).

use thiserror::Error;

/// How a pipeline failure is handled
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network or timeout problems. Retried with backoff, bounded attempts.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Destination exists or the catalog match is ambiguous. Never auto-resolved.
    #[error("data conflict: {0}")]
    DataConflict(String),
    /// The LLM answered with something that does not fit the schema
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    /// Malformed configuration or a feed that keeps failing
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
}

/// Failure to fetch or parse a feed document
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed {url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },
}

impl From<FeedError> for PipelineError {
    fn from(e: FeedError) -> Self {
        PipelineError::Transient(e.to_string())
    }
}

/// Errors surfaced by the LLM collaborator
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Transient(String),
    #[error("LLM response did not match the expected schema: {0}")]
    Schema(String),
    /// A 4xx the endpoint will keep answering: bad key, unknown model, malformed request
    #[error("LLM rejected the request: {0}")]
    Rejected(String),
}

/// Why a raw title could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionReason {
    /// LLM kept erroring or timing out after the bounded retries
    LlmUnavailable,
    /// LLM output could not be parsed into series/season/episode
    Unparsable,
    /// More than one catalog entry matched equally well
    AmbiguousCatalog,
    /// The LLM endpoint refuses the request as configured
    LlmRejected,
}

impl ResolutionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionReason::LlmUnavailable => "llm_unavailable",
            ResolutionReason::Unparsable => "unparsable",
            ResolutionReason::AmbiguousCatalog => "ambiguous_catalog",
            ResolutionReason::LlmRejected => "llm_rejected",
        }
    }
}

#[derive(Debug, Error)]
#[error("could not resolve title ({}): {detail}", reason.as_str())]
pub struct ResolutionFailure {
    pub reason: ResolutionReason,
    pub detail: String,
}

impl ResolutionFailure {
    pub fn new(reason: ResolutionReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    /// Only an unavailable LLM is worth retrying on a later cycle
    pub fn is_retryable(&self) -> bool {
        self.reason == ResolutionReason::LlmUnavailable
    }
}

impl From<ResolutionFailure> for PipelineError {
    fn from(e: ResolutionFailure) -> Self {
        match e.reason {
            ResolutionReason::LlmUnavailable => PipelineError::Transient(e.to_string()),
            ResolutionReason::Unparsable => PipelineError::SchemaViolation(e.to_string()),
            ResolutionReason::AmbiguousCatalog => PipelineError::DataConflict(e.to_string()),
            ResolutionReason::LlmRejected => PipelineError::FatalConfig(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_failure_classification() {
        let unavailable = ResolutionFailure::new(ResolutionReason::LlmUnavailable, "timeout");
        assert!(unavailable.is_retryable());
        assert!(matches!(
            PipelineError::from(unavailable),
            PipelineError::Transient(_)
        ));

        let unparsable = ResolutionFailure::new(ResolutionReason::Unparsable, "no episode");
        assert!(!unparsable.is_retryable());
        assert!(matches!(
            PipelineError::from(unparsable),
            PipelineError::SchemaViolation(_)
        ));

        let ambiguous = ResolutionFailure::new(ResolutionReason::AmbiguousCatalog, "2 matches");
        assert!(matches!(
            PipelineError::from(ambiguous),
            PipelineError::DataConflict(_)
        ));

        let rejected = ResolutionFailure::new(ResolutionReason::LlmRejected, "HTTP 401");
        assert!(!rejected.is_retryable());
        assert!(matches!(
            PipelineError::from(rejected),
            PipelineError::FatalConfig(_)
        ));
    }

    #[test]
    fn test_feed_error_is_transient() {
        let err = FeedError::Unreachable {
            url: "https://example.com/rss".to_string(),
            reason: "connection refused".to_string(),
        };
        let pipeline: PipelineError = err.into();
        assert!(matches!(pipeline, PipelineError::Transient(_)));
        assert!(pipeline.to_string().contains("example.com"));
    }
}
