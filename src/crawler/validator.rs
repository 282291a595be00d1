use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::crawler::error::CrawlError;
use crate::crawler::task::{Observation, RawExtraction, StockStatus};

// Fixed penalties per missing or suspect optional field. A record with
// every field present scores 1.0; price alone scores 0.45 and is gated.
const PENALTY_MISSING_NAME: f64 = 0.10;
const PENALTY_UNMAPPED_STOCK: f64 = 0.15;
const PENALTY_MISSING_IMAGE: f64 = 0.10;
const PENALTY_MISSING_QUANTITY: f64 = 0.05;
const PENALTY_MISSING_RATING: f64 = 0.05;
const PENALTY_MISSING_PROMOTION: f64 = 0.05;
const PENALTY_DROPPED_DISCOUNT: f64 = 0.05;

/// Turns raw extracted fields into a scored, typed observation or rejects
/// them. Rules are applied in order; each can zero out or cap the score.
pub struct Validator {
    min_confidence: f64,
    price_junk: Regex,
}

impl Validator {
    pub fn new(min_confidence: f64) -> Self {
        Self {
            min_confidence,
            // Everything that isn't a digit, comma or decimal point in a
            // price string is display chrome ("29,900원", "₩12,000")
            price_junk: Regex::new(r"[^\d.,]").expect("static regex"),
        }
    }

    /// Validate one extraction. `Ok` carries an observation at or above
    /// the persistence threshold; everything else is a terminal error.
    pub fn validate(
        &self,
        product_id: i64,
        raw: &RawExtraction,
        now: DateTime<Utc>,
    ) -> Result<Observation, CrawlError> {
        let price = match &raw.price {
            None => return Err(CrawlError::MissingPrice),
            Some(value) => self.coerce_price(value)?,
        };
        if price <= 0.0 {
            return Err(CrawlError::InvalidPrice(format!("non-positive price {}", price)));
        }

        let mut score: f64 = 1.0;

        let stock_status = match raw.stock_status.as_deref() {
            Some(s) => match StockStatus::from_raw(s) {
                Some(status) => status,
                None => {
                    debug!(product_id, raw_status = s, "unmapped stock status");
                    score -= PENALTY_UNMAPPED_STOCK;
                    StockStatus::Unknown
                }
            },
            None => {
                score -= PENALTY_UNMAPPED_STOCK;
                StockStatus::Unknown
            }
        };

        // Out-of-range discounts are dropped, not fatal
        let discount_rate = match raw.discount_rate {
            Some(rate) if (0.0..=100.0).contains(&rate) => Some(rate),
            Some(rate) => {
                debug!(product_id, rate, "discount rate out of range, dropping field");
                score -= PENALTY_DROPPED_DISCOUNT;
                None
            }
            None => None,
        };

        if raw.name.as_deref().map_or(true, |n| n.trim().is_empty()) {
            score -= PENALTY_MISSING_NAME;
        }
        if raw.image_url.is_none() {
            score -= PENALTY_MISSING_IMAGE;
        }
        if raw.stock_quantity.is_none() {
            score -= PENALTY_MISSING_QUANTITY;
        }
        if raw.rating.is_none() {
            score -= PENALTY_MISSING_RATING;
        }
        if raw.promotion_info.is_none() {
            score -= PENALTY_MISSING_PROMOTION;
        }

        let score = score.max(0.0);

        if score < self.min_confidence {
            return Err(CrawlError::LowConfidence {
                score,
                threshold: self.min_confidence,
            });
        }

        Ok(Observation {
            product_id,
            price,
            discount_rate,
            stock_status,
            stock_quantity: raw.stock_quantity,
            promotion_info: raw.promotion_info.clone(),
            image_url: raw.image_url.clone(),
            rating: raw.rating,
            confidence_score: score,
            recorded_at: now,
        })
    }

    /// Coerce a raw price value. Extractors return either a JSON number
    /// or display text; text is stripped of currency symbols and
    /// thousands separators before parsing.
    fn coerce_price(&self, value: &Value) -> Result<f64, CrawlError> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| CrawlError::InvalidPrice(n.to_string())),
            Value::String(s) => {
                let cleaned = self.price_junk.replace_all(s, "").replace(',', "");
                if cleaned.is_empty() {
                    return Err(CrawlError::InvalidPrice(s.clone()));
                }
                cleaned
                    .parse::<f64>()
                    .map_err(|_| CrawlError::InvalidPrice(s.clone()))
            }
            other => Err(CrawlError::InvalidPrice(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_extraction() -> RawExtraction {
        RawExtraction {
            name: Some("무선 이어폰 프로".to_string()),
            price: Some(json!(29900)),
            discount_rate: Some(15.5),
            stock_status: Some("available".to_string()),
            stock_quantity: Some(42),
            promotion_info: Some("카드 즉시할인".to_string()),
            image_url: Some("https://img.example.com/p/1.jpg".to_string()),
            rating: Some(4.6),
        }
    }

    #[test]
    fn test_complete_extraction_scores_full_confidence() {
        let validator = Validator::new(0.70);
        let observation = validator
            .validate(42, &full_extraction(), Utc::now())
            .unwrap();

        assert_eq!(observation.price, 29900.0);
        assert_eq!(observation.discount_rate, Some(15.5));
        assert_eq!(observation.stock_status, StockStatus::Available);
        assert!(observation.confidence_score >= 0.95);
        assert!(observation.confidence_score <= 1.0);
    }

    #[test]
    fn test_missing_price_is_hard_rejection() {
        let validator = Validator::new(0.70);
        let mut raw = full_extraction();
        raw.price = None;

        let err = validator.validate(42, &raw, Utc::now()).unwrap_err();
        assert!(matches!(err, CrawlError::MissingPrice));
    }

    #[test]
    fn test_non_positive_price_rejected() {
        let validator = Validator::new(0.70);
        for price in [json!(0), json!(-1500)] {
            let mut raw = full_extraction();
            raw.price = Some(price);
            let err = validator.validate(42, &raw, Utc::now()).unwrap_err();
            assert!(matches!(err, CrawlError::InvalidPrice(_)));
        }
    }

    #[test]
    fn test_price_coerced_from_display_text() {
        let validator = Validator::new(0.70);
        let mut raw = full_extraction();
        raw.price = Some(json!("29,900원"));

        let observation = validator.validate(42, &raw, Utc::now()).unwrap();
        assert_eq!(observation.price, 29900.0);
    }

    #[test]
    fn test_unparsable_price_text_rejected() {
        let validator = Validator::new(0.70);
        let mut raw = full_extraction();
        raw.price = Some(json!("품절"));

        let err = validator.validate(42, &raw, Utc::now()).unwrap_err();
        assert!(matches!(err, CrawlError::InvalidPrice(_)));
    }

    #[test]
    fn test_unmapped_stock_status_penalized_not_rejected() {
        let validator = Validator::new(0.70);
        let mut raw = full_extraction();
        raw.stock_status = Some("재고 문의".to_string());

        let observation = validator.validate(42, &raw, Utc::now()).unwrap();
        assert_eq!(observation.stock_status, StockStatus::Unknown);
        assert!(observation.confidence_score < 1.0);
        assert!(observation.confidence_score >= 0.70);
    }

    #[test]
    fn test_out_of_range_discount_dropped() {
        let validator = Validator::new(0.70);
        let mut raw = full_extraction();
        raw.discount_rate = Some(180.0);

        let observation = validator.validate(42, &raw, Utc::now()).unwrap();
        assert_eq!(observation.discount_rate, None);
        assert!(observation.confidence_score < 1.0);
    }

    #[test]
    fn test_sparse_extraction_gated_as_low_confidence() {
        let validator = Validator::new(0.70);
        let raw = RawExtraction {
            price: Some(json!(9900)),
            ..Default::default()
        };

        let err = validator.validate(42, &raw, Utc::now()).unwrap_err();
        match err {
            CrawlError::LowConfidence { score, threshold } => {
                assert!(score < threshold);
                assert!((0.0..=1.0).contains(&score));
            }
            other => panic!("expected LowConfidence, got {:?}", other),
        }
    }

    #[test]
    fn test_score_never_leaves_unit_interval() {
        let validator = Validator::new(0.0);
        let raw = RawExtraction {
            price: Some(json!(100)),
            discount_rate: Some(250.0),
            ..Default::default()
        };

        let observation = validator.validate(42, &raw, Utc::now()).unwrap();
        assert!((0.0..=1.0).contains(&observation.confidence_score));
    }
}
