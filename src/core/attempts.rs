use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::core::model::{AttemptOutcome, VerificationAttempt};

/// How many consecutive unsuccessful verifications an identity may make
/// before it is locked out, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptPolicy {
    pub max_attempts: u32,
    pub lockout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Allowed { remaining: u32 },
    LockedOut { until: DateTime<Utc> },
}

impl AttemptPolicy {
    /// Counts unsuccessful attempts since the last success that fall inside
    /// the lockout window. `history` may be in any order.
    pub fn evaluate(&self, history: &[VerificationAttempt], now: DateTime<Utc>) -> AttemptStatus {
        let window = chrono::Duration::from_std(self.lockout)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let window_start = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut recent: Vec<&VerificationAttempt> = history.iter()
            .filter(|a| a.recorded_at <= now)
            .collect();
        recent.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));

        let failures: Vec<DateTime<Utc>> = recent.iter()
            .take_while(|a| a.outcome != AttemptOutcome::Success)
            .filter(|a| a.recorded_at > window_start)
            .map(|a| a.recorded_at)
            .collect();

        let count = failures.len() as u32;
        if count >= self.max_attempts {
            let latest = failures.first().copied().unwrap_or(now);
            let until = latest.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC);
            AttemptStatus::LockedOut { until }
        } else {
            AttemptStatus::Allowed { remaining: self.max_attempts - count }
        }
    }
}
