use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// E-commerce platforms a task can target. Extraction is registered per
/// platform at startup; tasks for unregistered platforms fail permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Coupang,
    NaverShopping,
    ElevenSt,
    SmartStore,
    Gmarket,
    Ssg,
    Wemakeprice,
    Tmon,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Coupang => "coupang",
            Platform::NaverShopping => "naver_shopping",
            Platform::ElevenSt => "eleven_st",
            Platform::SmartStore => "smart_store",
            Platform::Gmarket => "gmarket",
            Platform::Ssg => "ssg",
            Platform::Wemakeprice => "wemakeprice",
            Platform::Tmon => "tmon",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coupang" => Ok(Platform::Coupang),
            "naver_shopping" => Ok(Platform::NaverShopping),
            "eleven_st" => Ok(Platform::ElevenSt),
            "smart_store" => Ok(Platform::SmartStore),
            "gmarket" => Ok(Platform::Gmarket),
            "ssg" => Ok(Platform::Ssg),
            "wemakeprice" => Ok(Platform::Wemakeprice),
            "tmon" => Ok(Platform::Tmon),
            _ => Err(format!("unknown platform: {}", s)),
        }
    }
}

/// Task priority. High-priority tasks are always dequeued before normal
/// ones; starvation of normal tasks under sustained high load is accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

/// Represents a crawling task pulled from the work queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlTask {
    /// Unique identifier for this task
    pub task_id: Uuid,

    /// Product the task observes
    pub product_id: i64,

    /// Product page URL to crawl
    pub url: String,

    /// Platform hosting the product page
    pub platform: Platform,

    /// Dequeue priority
    #[serde(default)]
    pub priority: Priority,

    /// Number of times this task has been requeued after a failure
    #[serde(default)]
    pub retry_count: u32,

    /// User that requested tracking for this product
    pub user_id: i64,

    /// Timestamp the task was first enqueued
    pub created_at: DateTime<Utc>,

    /// Error message from the most recent failed attempt, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Stock availability buckets used across platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    Available,
    Limited,
    Critical,
    OutOfStock,
    Preorder,
    Unknown,
}

impl StockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::Available => "available",
            StockStatus::Limited => "limited",
            StockStatus::Critical => "critical",
            StockStatus::OutOfStock => "out_of_stock",
            StockStatus::Preorder => "preorder",
            StockStatus::Unknown => "unknown",
        }
    }

    /// Map a raw extractor string onto the fixed enumeration. Returns `None`
    /// for unrecognized values; the validator turns those into `Unknown`
    /// with a confidence penalty rather than rejecting the record.
    pub fn from_raw(raw: &str) -> Option<StockStatus> {
        match raw.trim().to_lowercase().as_str() {
            "available" => Some(StockStatus::Available),
            "limited" => Some(StockStatus::Limited),
            "critical" => Some(StockStatus::Critical),
            "out_of_stock" => Some(StockStatus::OutOfStock),
            "preorder" => Some(StockStatus::Preorder),
            "unknown" => Some(StockStatus::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for StockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw fields handed back by a platform extractor. Nothing is guaranteed
/// to be present or well-formed; prices in particular may arrive as
/// numbers or as display text like "29,900원".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawExtraction {
    pub name: Option<String>,
    pub price: Option<Value>,
    pub discount_rate: Option<f64>,
    pub stock_status: Option<String>,
    pub stock_quantity: Option<i64>,
    pub promotion_info: Option<String>,
    pub image_url: Option<String>,
    pub rating: Option<f64>,
}

/// A validated price/stock record eligible for persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub product_id: i64,
    pub price: f64,
    pub discount_rate: Option<f64>,
    pub stock_status: StockStatus,
    pub stock_quantity: Option<i64>,
    pub promotion_info: Option<String>,
    pub image_url: Option<String>,
    pub rating: Option<f64>,

    /// Extraction reliability in [0, 1]; records below the persistence
    /// threshold are never handed to the batch writer
    pub confidence_score: f64,

    pub recorded_at: DateTime<Utc>,
}

/// Terminal status recorded for one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Failed,
    Partial,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Failed => "failed",
            LogStatus::Partial => "partial",
        }
    }
}

/// One row in the crawl log. Every task attempt writes exactly one of
/// these, regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlLogEntry {
    pub product_id: i64,
    pub platform: Platform,
    pub url: String,
    pub status: LogStatus,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Observation fields carried on a completion event.
#[derive(Debug, Clone, Serialize)]
pub struct ObservationData {
    pub price: f64,
    pub discount_rate: Option<f64>,
    pub stock_status: StockStatus,
    pub stock_quantity: Option<i64>,
    pub promotion_info: Option<String>,
    pub confidence_score: f64,
    pub image_url: Option<String>,
}

/// Event published to the result queue when a task completes successfully
#[derive(Debug, Clone, Serialize)]
pub struct CompletionEvent {
    pub task_id: Uuid,
    pub status: &'static str,
    pub data: ObservationData,

    /// True when the write was suppressed by the dedup window. The task
    /// still counts as a success; consumers that care can tell the cases
    /// apart with this flag.
    pub deduplicated: bool,

    pub execution_time_ms: u64,
    pub worker_id: String,
    pub platform: Platform,
    pub completed_at: DateTime<Utc>,
}

impl CompletionEvent {
    pub fn new(
        task: &CrawlTask,
        observation: &Observation,
        deduplicated: bool,
        execution_time_ms: u64,
        worker_id: &str,
    ) -> Self {
        Self {
            task_id: task.task_id,
            status: "success",
            data: ObservationData {
                price: observation.price,
                discount_rate: observation.discount_rate,
                stock_status: observation.stock_status,
                stock_quantity: observation.stock_quantity,
                promotion_info: observation.promotion_info.clone(),
                confidence_score: observation.confidence_score,
                image_url: observation.image_url.clone(),
            },
            deduplicated,
            execution_time_ms,
            worker_id: worker_id.to_string(),
            platform: task.platform,
            completed_at: Utc::now(),
        }
    }
}

/// Event published to the result queue when a task fails permanently
#[derive(Debug, Clone, Serialize)]
pub struct FailureEvent {
    pub task_id: Uuid,
    pub status: &'static str,
    pub error: String,
    pub error_code: &'static str,
    pub retry_count: u32,
    pub worker_id: String,
    pub platform: Platform,
    pub completed_at: DateTime<Utc>,
}

/// Task payload moved to the dead-letter queue after a permanent failure,
/// unmodified apart from the appended failure cause.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    #[serde(flatten)]
    pub task: CrawlTask,
    pub final_error: String,
    pub error_code: &'static str,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_wire_format() {
        let json = r#"{
            "task_id": "a9f1c2de-0b34-47a1-9c55-2f6b8d1e3a70",
            "product_id": 42,
            "url": "https://www.coupang.com/vp/products/123",
            "platform": "coupang",
            "priority": "high",
            "retry_count": 1,
            "user_id": 7,
            "created_at": "2024-03-01T09:30:00Z"
        }"#;

        let task: CrawlTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.product_id, 42);
        assert_eq!(task.platform, Platform::Coupang);
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.retry_count, 1);
        assert!(task.last_error.is_none());

        // Round-trip keeps the wire field names intact
        let value: Value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["platform"], "coupang");
        assert_eq!(value["priority"], "high");
    }

    #[test]
    fn test_priority_and_retry_count_default() {
        let json = r#"{
            "task_id": "a9f1c2de-0b34-47a1-9c55-2f6b8d1e3a70",
            "product_id": 1,
            "url": "https://smartstore.naver.com/p/1",
            "platform": "smart_store",
            "user_id": 1,
            "created_at": "2024-03-01T09:30:00Z"
        }"#;

        let task: CrawlTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.priority, Priority::Normal);
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn test_platform_roundtrip() {
        for platform in [
            Platform::Coupang,
            Platform::NaverShopping,
            Platform::ElevenSt,
            Platform::SmartStore,
            Platform::Gmarket,
            Platform::Ssg,
            Platform::Wemakeprice,
            Platform::Tmon,
        ] {
            let parsed: Platform = platform.as_str().parse().unwrap();
            assert_eq!(parsed, platform);
        }
    }

    #[test]
    fn test_stock_status_mapping() {
        assert_eq!(StockStatus::from_raw("available"), Some(StockStatus::Available));
        assert_eq!(StockStatus::from_raw("  Out_Of_Stock "), Some(StockStatus::OutOfStock));
        assert_eq!(StockStatus::from_raw("in stock soon"), None);
    }

    #[test]
    fn test_completion_event_shape() {
        let task = sample_task();
        let observation = Observation {
            product_id: task.product_id,
            price: 29900.0,
            discount_rate: Some(15.5),
            stock_status: StockStatus::Available,
            stock_quantity: Some(12),
            promotion_info: Some("카드 할인".to_string()),
            image_url: Some("https://img.example.com/1.jpg".to_string()),
            rating: Some(4.7),
            confidence_score: 1.0,
            recorded_at: Utc::now(),
        };

        let event = CompletionEvent::new(&task, &observation, false, 1843, "worker-1");
        let value: Value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["status"], "success");
        assert_eq!(value["data"]["price"], 29900.0);
        assert_eq!(value["data"]["stock_status"], "available");
        assert_eq!(value["deduplicated"], false);
        assert_eq!(value["execution_time_ms"], 1843);
        assert_eq!(value["worker_id"], "worker-1");
    }

    #[test]
    fn test_dead_letter_entry_flattens_task() {
        let task = sample_task();
        let entry = DeadLetterEntry {
            task: task.clone(),
            final_error: "blocked by anti-bot detection".to_string(),
            error_code: "BLOCKED",
            failed_at: Utc::now(),
        };

        let value: Value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["task_id"], task.task_id.to_string());
        assert_eq!(value["product_id"], 42);
        assert_eq!(value["error_code"], "BLOCKED");
        assert!(value.get("final_error").is_some());
    }

    fn sample_task() -> CrawlTask {
        CrawlTask {
            task_id: Uuid::new_v4(),
            product_id: 42,
            url: "https://www.coupang.com/vp/products/123".to_string(),
            platform: Platform::Coupang,
            priority: Priority::Normal,
            retry_count: 0,
            user_id: 7,
            created_at: Utc::now(),
            last_error: None,
        }
    }
}
