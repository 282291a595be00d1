use anyhow::{Result, Context};
use chrono::Utc;
use rand::Rng;
use redis::{Client, Script, aio::MultiplexedConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cli::config::RateLimitSettings;
use crate::crawler::task::Platform;

/// Platform courtesy limits are aggregate, so the spacing state has to be
/// visible to every worker in every process. A single Redis key per
/// platform holds `next_allowed_at` (epoch-ms); the script below advances
/// it atomically and returns how long the caller must wait for its slot.
const RESERVE_SLOT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local delay = tonumber(ARGV[2])
local next_allowed = tonumber(redis.call('GET', KEYS[1]) or '0')
local start = math.max(now, next_allowed)
local ttl = (start + delay) - now + 60000
redis.call('SET', KEYS[1], start + delay, 'PX', ttl)
return start - now
"#;

/// Never pace a platform faster than 1 request/second, whatever the
/// configuration says.
const MIN_DELAY_MS: u64 = 1000;

/// Enforces minimum inter-request spacing per platform across all workers.
pub struct RateLimiter {
    conn: Arc<Mutex<MultiplexedConnection>>,
    script: Script,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub async fn connect(redis_url: &str, settings: RateLimitSettings) -> Result<Self> {
        let client = Client::open(redis_url.to_string())
            .context(format!("Failed to connect to Redis at {}", redis_url))?;

        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            script: Script::new(RESERVE_SLOT_SCRIPT),
            settings,
        })
    }

    /// Reserve the next request slot for `platform` and sleep until it
    /// opens. Only the calling task waits; other platforms proceed
    /// unaffected.
    pub async fn acquire(&self, platform: Platform) -> Result<()> {
        let delay = select_delay(&self.settings, platform);
        let key = rate_key(platform);
        let now_ms = Utc::now().timestamp_millis();

        let wait_ms: i64 = {
            let mut conn = self.conn.lock().await;
            self.script
                .key(&key)
                .arg(now_ms)
                .arg(delay.as_millis() as i64)
                .invoke_async(&mut *conn)
                .await
                .context("Failed to reserve rate-limit slot")?
        };

        if wait_ms > 0 {
            debug!(
                platform = %platform,
                wait_ms,
                "waiting for rate-limit slot"
            );
            tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;
        }

        Ok(())
    }
}

/// Per-platform spacing: a configured fixed delay if one exists, otherwise
/// a random draw from the default band. Randomizing the interval keeps
/// request timing from looking machine-regular.
fn select_delay(settings: &RateLimitSettings, platform: Platform) -> Duration {
    let ms = match settings.per_platform_delay_ms.get(platform.as_str()) {
        Some(&fixed) => fixed,
        None => {
            let min = settings.default_min_delay_ms;
            let max = settings.default_max_delay_ms.max(min);
            rand::thread_rng().gen_range(min..=max)
        }
    };

    Duration::from_millis(ms.max(MIN_DELAY_MS))
}

fn rate_key(platform: Platform) -> String {
    format!("ratelimit:{}", platform.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_rate_key_per_platform() {
        assert_eq!(rate_key(Platform::Coupang), "ratelimit:coupang");
        assert_eq!(rate_key(Platform::SmartStore), "ratelimit:smart_store");
    }

    #[test]
    fn test_fixed_delay_overrides_band() {
        let settings = RateLimitSettings {
            default_min_delay_ms: 1000,
            default_max_delay_ms: 5000,
            per_platform_delay_ms: HashMap::from([("coupang".to_string(), 2500)]),
        };

        assert_eq!(
            select_delay(&settings, Platform::Coupang),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn test_band_draw_stays_within_bounds() {
        let settings = RateLimitSettings {
            default_min_delay_ms: 1000,
            default_max_delay_ms: 5000,
            per_platform_delay_ms: HashMap::new(),
        };

        for _ in 0..200 {
            let delay = select_delay(&settings, Platform::Gmarket);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(5000));
        }
    }

    #[test]
    fn test_courtesy_floor_applies_to_aggressive_config() {
        let settings = RateLimitSettings {
            default_min_delay_ms: 100,
            default_max_delay_ms: 200,
            per_platform_delay_ms: HashMap::from([("tmon".to_string(), 50)]),
        };

        // Neither a tight band nor a tight override may go below 1 req/sec
        assert!(select_delay(&settings, Platform::Tmon) >= Duration::from_millis(MIN_DELAY_MS));
        assert!(select_delay(&settings, Platform::Ssg) >= Duration::from_millis(MIN_DELAY_MS));
    }

    #[test]
    fn test_default_band_is_sane() {
        let settings = RateLimitSettings::default();
        assert!(settings.default_min_delay_ms >= MIN_DELAY_MS);
        assert!(settings.default_max_delay_ms >= settings.default_min_delay_ms);
    }
}
