//! Queue records: concurrency, speed, schedule window, and daily quota.

use chrono::NaiveDate;

/// Name of the queue created when none exists. The first queue in order is
/// always the default; it can never be removed.
pub const DEFAULT_QUEUE_NAME: &str = "General";

/// A named scheduling group for downloads.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub name: String,
    /// Per-queue concurrent-download cap; 0 falls back to the global limit.
    pub max_concurrent: usize,
    /// Per-queue speed cap in bytes/sec; 0 means unlimited.
    pub max_speed: u64,
    pub schedule_enabled: bool,
    /// Start of the allowed window, minutes after midnight.
    pub start_minutes: u32,
    /// End of the allowed window, minutes after midnight. A window that ends
    /// before it starts wraps past midnight.
    pub end_minutes: u32,
    pub quota_enabled: bool,
    /// Daily byte budget; 0 disables the check even when enabled.
    pub quota_bytes: u64,
    pub downloaded_today: u64,
    pub last_reset_date: NaiveDate,
}

impl QueueInfo {
    pub fn new(name: impl Into<String>, max_concurrent: usize, today: NaiveDate) -> Self {
        Self {
            name: name.into(),
            max_concurrent,
            max_speed: 0,
            schedule_enabled: false,
            start_minutes: 0,
            end_minutes: 0,
            quota_enabled: false,
            quota_bytes: 0,
            downloaded_today: 0,
            last_reset_date: today,
        }
    }

    /// Whether `now_minutes` (minutes after midnight) falls inside the
    /// schedule window. Disabled schedules always allow; equal start and end
    /// means "all day"; `start > end` wraps around midnight.
    #[must_use]
    pub fn is_within_schedule(&self, now_minutes: u32) -> bool {
        if !self.schedule_enabled {
            return true;
        }
        let start = self.start_minutes;
        let end = self.end_minutes;
        if start == end {
            return true;
        }
        if start < end {
            now_minutes >= start && now_minutes < end
        } else {
            now_minutes >= start || now_minutes < end
        }
    }

    /// Whether the daily byte budget is exhausted.
    #[must_use]
    pub fn quota_exceeded(&self) -> bool {
        self.quota_enabled && self.quota_bytes > 0 && self.downloaded_today >= self.quota_bytes
    }

    /// Whether the queue may run downloads right now.
    #[must_use]
    pub fn is_allowed(&self, now_minutes: u32) -> bool {
        self.is_within_schedule(now_minutes) && !self.quota_exceeded()
    }

    /// Clears the daily counter when the date rolled over. Returns true when
    /// a reset happened.
    pub fn reset_quota_if_new_day(&mut self, today: NaiveDate) -> bool {
        if self.last_reset_date == today {
            return false;
        }
        self.last_reset_date = today;
        self.downloaded_today = 0;
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn queue() -> QueueInfo {
        QueueInfo::new("test", 3, NaiveDate::from_ymd_opt(2026, 8, 1).unwrap())
    }

    #[test]
    fn test_schedule_disabled_always_allows() {
        let q = queue();
        assert!(q.is_within_schedule(0));
        assert!(q.is_within_schedule(1439));
    }

    #[test]
    fn test_schedule_simple_window() {
        let mut q = queue();
        q.schedule_enabled = true;
        q.start_minutes = 9 * 60;
        q.end_minutes = 17 * 60;
        assert!(!q.is_within_schedule(8 * 60));
        assert!(q.is_within_schedule(9 * 60));
        assert!(q.is_within_schedule(16 * 60 + 59));
        assert!(!q.is_within_schedule(17 * 60));
    }

    #[test]
    fn test_schedule_wraps_past_midnight() {
        let mut q = queue();
        q.schedule_enabled = true;
        q.start_minutes = 22 * 60;
        q.end_minutes = 6 * 60;
        assert!(q.is_within_schedule(23 * 60));
        assert!(q.is_within_schedule(3 * 60));
        assert!(!q.is_within_schedule(12 * 60));
    }

    #[test]
    fn test_schedule_equal_bounds_means_all_day() {
        let mut q = queue();
        q.schedule_enabled = true;
        q.start_minutes = 300;
        q.end_minutes = 300;
        assert!(q.is_within_schedule(0));
        assert!(q.is_within_schedule(1000));
    }

    #[test]
    fn test_quota_boundary() {
        let mut q = queue();
        q.quota_enabled = true;
        q.quota_bytes = 1024;
        q.downloaded_today = 1023;
        assert!(!q.quota_exceeded());
        q.downloaded_today = 1024;
        assert!(q.quota_exceeded());
        // Zero budget disables the check.
        q.quota_bytes = 0;
        assert!(!q.quota_exceeded());
    }

    #[test]
    fn test_quota_resets_on_new_day() {
        let mut q = queue();
        q.quota_enabled = true;
        q.quota_bytes = 100;
        q.downloaded_today = 150;
        let same_day = q.last_reset_date;
        assert!(!q.reset_quota_if_new_day(same_day));
        assert_eq!(q.downloaded_today, 150);

        let next_day = same_day.succ_opt().unwrap();
        assert!(q.reset_quota_if_new_day(next_day));
        assert_eq!(q.downloaded_today, 0);
        assert_eq!(q.last_reset_date, next_day);
        assert!(!q.quota_exceeded());
    }
}
