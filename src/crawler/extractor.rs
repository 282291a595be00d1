use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::crawler::error::ExtractError;
use crate::crawler::task::{Platform, RawExtraction};

/// Platform-specific extraction capability consumed by the core.
///
/// One implementation per platform, registered at startup. The core
/// treats every implementation identically and makes no assumptions
/// about how the fields were obtained (HTTP, headless browser, API).
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, url: &str) -> Result<RawExtraction, ExtractError>;
}

/// Registry mapping each platform to its extractor implementation.
/// Tasks for platforms without a registered extractor fail permanently.
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<Platform, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    pub fn register(&mut self, platform: Platform, extractor: Arc<dyn Extractor>) {
        if self.extractors.insert(platform, extractor).is_some() {
            warn!(%platform, "replacing previously registered extractor");
        }
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn Extractor>> {
        self.extractors.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.extractors.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

/// Run an extractor under the hard timeout imposed by the core. The
/// extractor itself is not trusted to enforce any deadline; an elapsed
/// timer surfaces as a retryable `Timeout` failure.
pub async fn extract_with_timeout(
    extractor: &dyn Extractor,
    url: &str,
    timeout: Duration,
) -> Result<RawExtraction, ExtractError> {
    match tokio::time::timeout(timeout, extractor.extract(url)).await {
        Ok(result) => result,
        Err(_) => Err(ExtractError::Timeout(timeout.as_secs())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StubExtractor {
        delay: Duration,
        result: Result<RawExtraction, ExtractError>,
    }

    #[async_trait]
    impl Extractor for StubExtractor {
        async fn extract(&self, _url: &str) -> Result<RawExtraction, ExtractError> {
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    fn priced_extraction() -> RawExtraction {
        RawExtraction {
            price: Some(json!(19900)),
            ..Default::default()
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ExtractorRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get(Platform::Coupang).is_none());

        registry.register(
            Platform::Coupang,
            Arc::new(StubExtractor {
                delay: Duration::ZERO,
                result: Ok(priced_extraction()),
            }),
        );

        assert!(registry.get(Platform::Coupang).is_some());
        assert!(registry.get(Platform::Gmarket).is_none());
        assert_eq!(registry.platforms(), vec![Platform::Coupang]);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_retryable_failure() {
        let slow = StubExtractor {
            delay: Duration::from_millis(100),
            result: Ok(priced_extraction()),
        };

        let err = extract_with_timeout(&slow, "https://example.com", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, ExtractError::Timeout(0));
    }

    #[tokio::test]
    async fn test_fast_extraction_passes_through() {
        let fast = StubExtractor {
            delay: Duration::ZERO,
            result: Ok(priced_extraction()),
        };

        let raw = extract_with_timeout(&fast, "https://example.com", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(raw.price.is_some());
    }

    #[tokio::test]
    async fn test_extractor_errors_pass_through_unchanged() {
        let blocked = StubExtractor {
            delay: Duration::ZERO,
            result: Err(ExtractError::Blocked),
        };

        let err = extract_with_timeout(&blocked, "https://example.com", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, ExtractError::Blocked);
    }
}
