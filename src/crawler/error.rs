use thiserror::Error;

use crate::crawler::task::LogStatus;

/// Typed failures surfaced by platform extractors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// The product page no longer exists (404, delisted product).
    #[error("product page not found")]
    NotFound,

    /// Extraction exceeded the hard timeout imposed by the core.
    #[error("extraction timed out after {0}s")]
    Timeout(u64),

    /// The platform surfaced anti-bot detection.
    #[error("blocked by anti-bot detection")]
    Blocked,

    /// The page loaded but could not be interpreted.
    #[error("failed to parse product page: {0}")]
    ParseError(String),
}

/// Everything that can terminate a task's trip through the pipeline.
#[derive(Debug, Clone, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("no extractor registered for platform {0}")]
    UnsupportedPlatform(String),

    /// Price is the primary product of the system; its absence rejects
    /// the whole record.
    #[error("price missing from extraction")]
    MissingPrice,

    #[error("invalid price value: {0}")]
    InvalidPrice(String),

    /// Confidence fell below the persistence gate. Terminal: low
    /// confidence is not a transient condition.
    #[error("confidence score {score:.2} below persistence threshold {threshold:.2}")]
    LowConfidence { score: f64, threshold: f64 },

    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Shared infrastructure (queue, rate-limit state) was unavailable.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl CrawlError {
    /// True for transient causes worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrawlError::Extract(ExtractError::Timeout(_))
                | CrawlError::Extract(ExtractError::Blocked)
                | CrawlError::Persistence(_)
                | CrawlError::Infrastructure(_)
        )
    }

    /// Extra factor applied on top of exponential backoff. Blocked
    /// failures back off harder so retries don't compound detection risk.
    pub fn backoff_multiplier(&self) -> u32 {
        match self {
            CrawlError::Extract(ExtractError::Blocked) => 3,
            _ => 1,
        }
    }

    /// Stable code carried on failure events and dead-letter entries.
    pub fn error_code(&self) -> &'static str {
        match self {
            CrawlError::Extract(ExtractError::NotFound) => "PRODUCT_NOT_FOUND",
            CrawlError::Extract(ExtractError::Timeout(_)) => "TIMEOUT",
            CrawlError::Extract(ExtractError::Blocked) => "BLOCKED",
            CrawlError::Extract(ExtractError::ParseError(_)) => "PARSE_ERROR",
            CrawlError::UnsupportedPlatform(_) => "UNSUPPORTED_PLATFORM",
            // A page with no price did not yield a product
            CrawlError::MissingPrice => "PRODUCT_NOT_FOUND",
            CrawlError::InvalidPrice(_) => "PARSE_ERROR",
            CrawlError::LowConfidence { .. } => "LOW_CONFIDENCE",
            CrawlError::Persistence(_) => "PERSISTENCE_FAILURE",
            CrawlError::Infrastructure(_) => "INFRASTRUCTURE",
        }
    }

    /// Status written to the crawl log for an attempt that ended with
    /// this error. Low confidence means data was extracted but not good
    /// enough to keep, which the log distinguishes from outright failure.
    pub fn log_status(&self) -> LogStatus {
        match self {
            CrawlError::LowConfidence { .. } => LogStatus::Partial,
            _ => LogStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CrawlError::Extract(ExtractError::Timeout(30)).is_retryable());
        assert!(CrawlError::Extract(ExtractError::Blocked).is_retryable());
        assert!(CrawlError::Persistence("tx aborted".into()).is_retryable());
        assert!(CrawlError::Infrastructure("redis down".into()).is_retryable());

        assert!(!CrawlError::Extract(ExtractError::NotFound).is_retryable());
        assert!(!CrawlError::Extract(ExtractError::ParseError("bad html".into())).is_retryable());
        assert!(!CrawlError::MissingPrice.is_retryable());
        assert!(!CrawlError::LowConfidence { score: 0.45, threshold: 0.70 }.is_retryable());
        assert!(!CrawlError::UnsupportedPlatform("tmon".into()).is_retryable());
    }

    #[test]
    fn test_blocked_backs_off_harder() {
        assert_eq!(CrawlError::Extract(ExtractError::Blocked).backoff_multiplier(), 3);
        assert_eq!(CrawlError::Extract(ExtractError::Timeout(30)).backoff_multiplier(), 1);
        assert_eq!(CrawlError::Persistence("x".into()).backoff_multiplier(), 1);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(CrawlError::Extract(ExtractError::NotFound).error_code(), "PRODUCT_NOT_FOUND");
        assert_eq!(CrawlError::MissingPrice.error_code(), "PRODUCT_NOT_FOUND");
        assert_eq!(CrawlError::Extract(ExtractError::Timeout(30)).error_code(), "TIMEOUT");
        assert_eq!(CrawlError::Extract(ExtractError::Blocked).error_code(), "BLOCKED");
        assert_eq!(CrawlError::InvalidPrice("-3".into()).error_code(), "PARSE_ERROR");
        assert_eq!(CrawlError::Persistence("x".into()).error_code(), "PERSISTENCE_FAILURE");
    }

    #[test]
    fn test_log_status_for_low_confidence_is_partial() {
        let err = CrawlError::LowConfidence { score: 0.5, threshold: 0.7 };
        assert_eq!(err.log_status(), LogStatus::Partial);
        assert_eq!(CrawlError::MissingPrice.log_status(), LogStatus::Failed);
    }
}
