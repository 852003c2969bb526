use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub within_limit: bool,
    pub current_count: usize,
    pub limit: usize,
    pub window_hours: u32,
    /// Whole hours until the oldest in-window request ages out. `None` when
    /// nothing is in the window.
    pub hours_until_reset: Option<u32>,
}

impl QuotaStatus {
    /// Used when the quota could not be checked; automation stays available.
    pub fn unchecked(limit: usize, window_hours: u32) -> Self {
        Self {
            within_limit: true,
            current_count: 0,
            limit,
            window_hours,
            hours_until_reset: None,
        }
    }
}

/// Sliding window anchored at `now - window_hours`. A request created exactly
/// on the boundary is already outside the window.
pub fn evaluate_quota(
    created: &[DateTime<Utc>],
    now: DateTime<Utc>,
    limit: usize,
    window_hours: u32,
) -> QuotaStatus {
    let window = Duration::hours(i64::from(window_hours));
    let start = now - window;
    let in_window: Vec<DateTime<Utc>> = created.iter().copied().filter(|t| *t > start).collect();
    let hours_until_reset = in_window.iter().min().map(|oldest| {
        let remaining = (*oldest + window - now).num_seconds().max(0);
        u32::try_from((remaining + 3599) / 3600).unwrap_or(u32::MAX)
    });
    QuotaStatus {
        within_limit: in_window.len() < limit,
        current_count: in_window.len(),
        limit,
        window_hours,
        hours_until_reset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hours_ago(now: DateTime<Utc>, h: i64) -> DateTime<Utc> {
        now - Duration::hours(h)
    }

    #[test]
    fn exactly_limit_prior_requests_is_over_quota() {
        let now = Utc::now();
        let prior: Vec<_> = (1..=5).map(|h| hours_ago(now, h)).collect();
        let status = evaluate_quota(&prior, now, 5, 24);
        assert!(!status.within_limit);
        assert_eq!(status.current_count, 5);
    }

    #[test]
    fn one_below_limit_is_accepted() {
        let now = Utc::now();
        let prior: Vec<_> = (1..=4).map(|h| hours_ago(now, h)).collect();
        assert!(evaluate_quota(&prior, now, 5, 24).within_limit);
    }

    #[test]
    fn boundary_request_is_excluded() {
        let now = Utc::now();
        let mut prior: Vec<_> = (1..=4).map(|h| hours_ago(now, h)).collect();
        prior.push(hours_ago(now, 24));
        let status = evaluate_quota(&prior, now, 5, 24);
        assert_eq!(status.current_count, 4);
        assert!(status.within_limit);
    }

    #[test]
    fn reset_is_measured_from_oldest_in_window() {
        let now = Utc::now();
        let prior = vec![hours_ago(now, 20), hours_ago(now, 2)];
        let status = evaluate_quota(&prior, now, 5, 24);
        assert_eq!(status.hours_until_reset, Some(4));
        assert_eq!(evaluate_quota(&[], now, 5, 24).hours_until_reset, None);
    }
}
