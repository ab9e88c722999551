//! Global bucket plus per-user multi-window rate limiting

use super::plans::{plan_for, UserType};
use super::token_bucket::TokenBucket;
use super::window::{next_utc_midnight, DailyQuota, SlidingWindow};
use crate::cache::{Sweepable, TtlCache};
use crate::config::RateLimitConfig;
use crate::error::RuntimeError;
use crate::metrics::Metrics;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Idle users' counters are dropped after this long
const COUNTER_TTL: Duration = Duration::from_secs(48 * 3600);
const MAX_TRACKED_USERS: usize = 100_000;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub reset_time: Option<DateTime<Utc>>,
}

impl RateLimitDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            reset_time: None,
        }
    }

    fn deny(reason: String, reset_time: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            reset_time: Some(reset_time),
        }
    }

    /// Convert a denial into a `RateLimitExceeded` error
    pub fn into_result(self) -> crate::error::Result<()> {
        if self.allowed {
            return Ok(());
        }
        Err(RuntimeError::RateLimitExceeded {
            reason: self.reason.unwrap_or_else(|| "Rate limit exceeded".to_string()),
            reset_time: self.reset_time.unwrap_or_else(Utc::now),
        })
    }
}

/// Usage of one time window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowStatus {
    pub window: String,
    pub used: usize,
    pub limit: usize,
    pub remaining: usize,
    pub resets_in_ms: u64,
}

/// Daily entitlement usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyEntitlement {
    pub used: usize,
    pub limit: usize,
    pub remaining: usize,
    pub resets_at: DateTime<Utc>,
}

/// Snapshot of a user's limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub user_id: String,
    pub user_type: UserType,
    pub global_tokens_available: f64,
    pub windows: Vec<WindowStatus>,
    pub daily: DailyEntitlement,
}

#[derive(Debug)]
struct UserWindows {
    second: SlidingWindow,
    minute: SlidingWindow,
    hour: SlidingWindow,
    daily: DailyQuota,
}

impl UserWindows {
    fn new(config: &RateLimitConfig, now: DateTime<Utc>) -> Self {
        Self {
            second: SlidingWindow::new(SECOND, config.per_second),
            minute: SlidingWindow::new(MINUTE, config.per_minute),
            hour: SlidingWindow::new(HOUR, config.per_hour),
            daily: DailyQuota::new(now),
        }
    }
}

type SharedWindows = Arc<Mutex<UserWindows>>;

/// Rate limiter for chat requests
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: TokenBucket,
    counters: Arc<TtlCache<SharedWindows>>,
    metrics: Option<Arc<Metrics>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_counter_ttl(config, COUNTER_TTL)
    }

    /// Limiter whose per-user counters are dropped after `idle_ttl` without requests
    pub(crate) fn with_counter_ttl(config: RateLimitConfig, idle_ttl: Duration) -> Self {
        let bucket = TokenBucket::new(config.global_capacity, config.global_refill_per_sec);
        Self {
            config,
            bucket,
            counters: Arc::new(TtlCache::named("rate_limit", idle_ttl, MAX_TRACKED_USERS)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Counter storage, for registration with a sweeper
    pub fn sweep_target(&self) -> Arc<dyn Sweepable> {
        self.counters.clone()
    }

    fn windows_for(&self, user_id: &str, wall: DateTime<Utc>) -> SharedWindows {
        self.counters.get_or_insert_touched(user_id, || {
            Arc::new(Mutex::new(UserWindows::new(&self.config, wall)))
        })
    }

    /// Check and, when allowed, record one request for `user_id`
    pub fn check_rate_limit(&self, user_id: &str, user_type: UserType) -> RateLimitDecision {
        self.check_rate_limit_at(user_id, user_type, Instant::now(), Utc::now())
    }

    pub(crate) fn check_rate_limit_at(
        &self,
        user_id: &str,
        user_type: UserType,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> RateLimitDecision {
        let decision = self.evaluate(user_id, user_type, now, wall);

        if let Some(metrics) = &self.metrics {
            metrics.record_rate_limit(decision.allowed);
        }
        if let Some(reason) = &decision.reason {
            warn!(user_id, user_type = %user_type, reason = %reason, "Request rate limited");
        }
        decision
    }

    fn evaluate(
        &self,
        user_id: &str,
        user_type: UserType,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> RateLimitDecision {
        if !self.bucket.has_token_at(now) {
            return self.global_denial(wall);
        }

        let shared = self.windows_for(user_id, wall);
        let mut guard = lock(&shared);
        let windows = &mut *guard;

        let checks: [(&mut SlidingWindow, &str, Duration); 3] = [
            (&mut windows.second, "second", SECOND),
            (&mut windows.minute, "minute", MINUTE),
            (&mut windows.hour, "hour", HOUR),
        ];
        for (window, label, size) in checks {
            if window.is_full(now) {
                return RateLimitDecision::deny(
                    format!("Too many requests per {} (limit {})", label, window.limit()),
                    wall + to_chrono(size),
                );
            }
        }

        let plan = plan_for(user_type);
        if windows.daily.used(wall) >= plan.max_messages_per_day {
            return RateLimitDecision::deny(
                format!(
                    "Daily message limit of {} reached for {} plan",
                    plan.max_messages_per_day, user_type
                ),
                next_utc_midnight(wall),
            );
        }

        if !self.bucket.try_acquire_at(now) {
            return self.global_denial(wall);
        }

        windows.second.record(now);
        windows.minute.record(now);
        windows.hour.record(now);
        windows.daily.record(wall);

        debug!(user_id, used_today = windows.daily.used(wall), "Request admitted");
        RateLimitDecision::allow()
    }

    fn global_denial(&self, wall: DateTime<Utc>) -> RateLimitDecision {
        let wait = self.bucket.time_until_available().max(Duration::from_millis(1));
        RateLimitDecision::deny(
            "Service is busy: global request rate exceeded".to_string(),
            wall + to_chrono(wait),
        )
    }

    /// Current usage and remaining quota per window
    pub fn get_status(&self, user_id: &str, user_type: UserType) -> RateLimitStatus {
        let now = Instant::now();
        let wall = Utc::now();
        let plan = plan_for(user_type);

        let shared = self.windows_for(user_id, wall);
        let mut guard = lock(&shared);
        let windows = &mut *guard;

        let mut statuses = Vec::with_capacity(3);
        for (label, window) in [
            ("second", &mut windows.second),
            ("minute", &mut windows.minute),
            ("hour", &mut windows.hour),
        ] {
            statuses.push(WindowStatus {
                window: label.to_string(),
                used: window.count(now),
                limit: window.limit(),
                remaining: window.remaining(now),
                resets_in_ms: window.reset_after(now).as_millis() as u64,
            });
        }

        let used_today = windows.daily.used(wall);
        RateLimitStatus {
            user_id: user_id.to_string(),
            user_type,
            global_tokens_available: self.bucket.available(),
            windows: statuses,
            daily: DailyEntitlement {
                used: used_today,
                limit: plan.max_messages_per_day,
                remaining: plan.max_messages_per_day.saturating_sub(used_today),
                resets_at: next_utc_midnight(wall),
            },
        }
    }

    /// Drop every counter for a user
    pub fn clear_user_limits(&self, user_id: &str) -> bool {
        let removed = self.counters.delete(user_id);
        debug!(user_id, removed, "Cleared user rate limits");
        removed
    }

    /// Sweep counters of users idle past their TTL
    pub fn cleanup(&self) -> usize {
        self.counters.cleanup()
    }

    pub fn tracked_users(&self) -> usize {
        self.counters.len()
    }
}

fn lock(windows: &SharedWindows) -> MutexGuard<'_, UserWindows> {
    windows.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(1))
}
