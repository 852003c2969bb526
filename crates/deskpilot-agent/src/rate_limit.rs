use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use deskpilot_contracts::Category;
use deskpilot_kernel::{evaluate_quota, QuotaStatus};

use crate::store::TicketStore;

/// Per-requester sliding window over automatable tickets, backed by the ticket
/// store itself so every worker sees the same count.
pub struct RateLimiter {
    store: Arc<dyn TicketStore>,
    enabled: bool,
    limit: usize,
    window_hours: u32,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn TicketStore>, enabled: bool, limit: usize, window_hours: u32) -> Self {
        Self {
            store,
            enabled,
            limit,
            window_hours,
        }
    }

    /// Counts the requester's other tickets in the window; `ticket_id` itself
    /// is not counted. Store errors fail open.
    pub async fn check(&self, requester: &str, ticket_id: i64, now: DateTime<Utc>) -> QuotaStatus {
        if !self.enabled {
            return QuotaStatus::unchecked(self.limit, self.window_hours);
        }
        let since = now - Duration::hours(i64::from(self.window_hours));
        let codes: Vec<i64> = Category::ALL.iter().map(|c| c.code()).collect();
        match self
            .store
            .created_since(requester, &codes, since, Some(ticket_id))
            .await
        {
            Ok(created) => {
                let status = evaluate_quota(&created, now, self.limit, self.window_hours);
                tracing::debug!(
                    ticket_id,
                    current = status.current_count,
                    limit = status.limit,
                    "rate limit evaluated"
                );
                status
            }
            Err(e) => {
                tracing::warn!(ticket_id, error = %e, "rate limit check failed, allowing request");
                QuotaStatus::unchecked(self.limit, self.window_hours)
            }
        }
    }
}
