//! Per-user request counters

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding time window of request timestamps.
///
/// Timestamps are only recorded while the window has room, so the deque never
/// grows past `limit`, and pruning pops from the front.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    size: Duration,
    limit: usize,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(size: Duration, limit: usize) -> Self {
        Self {
            size,
            limit,
            hits: VecDeque::with_capacity(limit.min(1024)),
        }
    }

    pub fn size(&self) -> Duration {
        self.size
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= self.size {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Requests counted within the window ending at `now`
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.hits.len()
    }

    pub fn is_full(&mut self, now: Instant) -> bool {
        self.count(now) >= self.limit
    }

    pub fn remaining(&mut self, now: Instant) -> usize {
        self.limit.saturating_sub(self.count(now))
    }

    /// Record a request; returns false when the window has no room
    pub fn record(&mut self, now: Instant) -> bool {
        if self.is_full(now) {
            return false;
        }
        self.hits.push_back(now);
        true
    }

    /// Time until the oldest counted request leaves the window
    pub fn reset_after(&mut self, now: Instant) -> Duration {
        self.prune(now);
        self.hits
            .front()
            .map(|oldest| self.size.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(Duration::ZERO)
    }

    pub fn clear(&mut self) {
        self.hits.clear();
    }
}

/// Calendar-day (UTC) message counter
#[derive(Debug, Clone)]
pub struct DailyQuota {
    day: NaiveDate,
    used: usize,
}

impl DailyQuota {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            used: 0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.day {
            self.day = today;
            self.used = 0;
        }
    }

    pub fn used(&mut self, now: DateTime<Utc>) -> usize {
        self.roll(now);
        self.used
    }

    pub fn record(&mut self, now: DateTime<Utc>) {
        self.roll(now);
        self.used += 1;
    }

    pub fn clear(&mut self) {
        self.used = 0;
    }
}

/// Start of the next UTC day
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + ChronoDuration::days(1);
    tomorrow
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now + ChronoDuration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_rejects_past_limit() {
        let mut window = SlidingWindow::new(Duration::from_secs(1), 3);
        let now = Instant::now();
        assert!(window.record(now));
        assert!(window.record(now));
        assert!(window.record(now));
        assert!(!window.record(now));
        assert_eq!(window.count(now), 3);
        assert_eq!(window.remaining(now), 0);
    }

    #[test]
    fn test_window_slides() {
        let mut window = SlidingWindow::new(Duration::from_secs(1), 2);
        let start = Instant::now();
        window.record(start);
        window.record(start + Duration::from_millis(500));

        assert!(window.is_full(start + Duration::from_millis(900)));
        // the first hit has aged out
        assert_eq!(window.count(start + Duration::from_millis(1000)), 1);
        assert_eq!(
            window.reset_after(start + Duration::from_millis(1000)),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_daily_quota_rolls_over() {
        let mut quota = DailyQuota::new(Utc.with_ymd_and_hms(2024, 5, 1, 23, 0, 0).unwrap());
        quota.record(Utc.with_ymd_and_hms(2024, 5, 1, 23, 30, 0).unwrap());
        quota.record(Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 0).unwrap());
        assert_eq!(quota.used(Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 30).unwrap()), 2);
        assert_eq!(quota.used(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 1).unwrap()), 0);
    }

    #[test]
    fn test_next_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 15, 42, 0).unwrap();
        assert_eq!(
            next_utc_midnight(now),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
    }
}
