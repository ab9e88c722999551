//! Usage quotas: a global token bucket, per-user time windows and daily
//! entitlements looked up from the user's plan.

pub mod limiter;
pub mod plans;
pub mod token_bucket;
pub mod window;

pub use limiter::{DailyEntitlement, RateLimitDecision, RateLimitStatus, RateLimiter, WindowStatus};
pub use plans::{plan_for, PlanLimits, UserType};
pub use token_bucket::TokenBucket;
pub use window::{DailyQuota, SlidingWindow};
