//! Persisted sync-failure backoff.
//!
//! Failure counts live in the shared cache, keyed per subscription, so
//! backoff survives process restarts and is visible to every engine
//! instance. The delay doubles from five minutes up to a six-hour cap;
//! state expires after 24 quiet hours so an old failure streak does not
//! haunt a recovered subscription.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::CacheStore;

const BASE_DELAY_MINUTES: i64 = 5;
const MAX_DELAY_MINUTES: i64 = 360;
const STATE_TTL: StdDuration = StdDuration::from_secs(24 * 60 * 60);

/// Builds the cache key for one subscription's backoff state.
pub fn backoff_key(subscription_id: &str) -> String {
    format!("calendar-sync:backoff:{subscription_id}")
}

/// The persisted failure streak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffState {
    /// Consecutive failures so far.
    pub attempts: u32,
    /// Earliest instant the next sync may run.
    pub next_retry_at: DateTime<Utc>,
}

/// Computes the delay after `attempts` consecutive failures.
pub fn delay_for_attempts(attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    let minutes = (BASE_DELAY_MINUTES << exponent).min(MAX_DELAY_MINUTES);
    Duration::minutes(minutes)
}

/// When the scheduler may next consider the subscription due, given a
/// backoff retry time. The scheduler adds one refresh interval before
/// acting, so the stored deadline is pulled back by that much.
pub fn next_scheduled_sync_deadline(
    next_retry_at: DateTime<Utc>,
    refresh_interval: Duration,
) -> DateTime<Utc> {
    next_retry_at - refresh_interval
}

/// Cache-backed backoff bookkeeping.
#[derive(Clone)]
pub struct BackoffTracker {
    cache: Arc<dyn CacheStore>,
}

impl BackoffTracker {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Reads the current state, treating unreadable state as absent.
    pub async fn state(&self, subscription_id: &str) -> Option<BackoffState> {
        let raw = match self.cache.get(&backoff_key(subscription_id)).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(subscription_id, error = %err, "failed to read backoff state");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(subscription_id, error = %err, "discarding malformed backoff state");
                None
            }
        }
    }

    /// Returns the retry time if the subscription is still backing off at
    /// `now`.
    pub async fn blocked_until(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let state = self.state(subscription_id).await?;
        (state.next_retry_at > now).then_some(state.next_retry_at)
    }

    /// Records one more failure and returns the new state.
    pub async fn record_failure(&self, subscription_id: &str, now: DateTime<Utc>) -> BackoffState {
        let attempts = self
            .state(subscription_id)
            .await
            .map(|s| s.attempts)
            .unwrap_or(0)
            .saturating_add(1);
        let state = BackoffState {
            attempts,
            next_retry_at: now + delay_for_attempts(attempts),
        };
        match serde_json::to_string(&state) {
            Ok(json) => {
                if let Err(err) = self
                    .cache
                    .set(&backoff_key(subscription_id), &json, STATE_TTL)
                    .await
                {
                    warn!(subscription_id, error = %err, "failed to persist backoff state");
                }
            }
            Err(err) => {
                warn!(subscription_id, error = %err, "failed to encode backoff state");
            }
        }
        state
    }

    /// Clears the failure streak after a successful sync.
    pub async fn clear(&self, subscription_id: &str) {
        if let Err(err) = self.cache.remove(&backoff_key(subscription_id)).await {
            warn!(subscription_id, error = %err, "failed to clear backoff state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCache;

    #[test]
    fn delay_doubles_and_caps() {
        assert_eq!(delay_for_attempts(1), Duration::minutes(5));
        assert_eq!(delay_for_attempts(2), Duration::minutes(10));
        assert_eq!(delay_for_attempts(3), Duration::minutes(20));
        assert_eq!(delay_for_attempts(4), Duration::minutes(40));
        assert_eq!(delay_for_attempts(7), Duration::minutes(320));
        assert_eq!(delay_for_attempts(8), Duration::minutes(360));
        assert_eq!(delay_for_attempts(20), Duration::minutes(360));
    }

    #[test]
    fn scheduled_deadline_precedes_retry_by_one_interval() {
        let retry = Utc::now();
        let deadline = next_scheduled_sync_deadline(retry, Duration::minutes(15));
        assert_eq!(retry - deadline, Duration::minutes(15));
    }

    #[tokio::test]
    async fn records_and_clears_streak() {
        let tracker = BackoffTracker::new(Arc::new(MemoryCache::new()));
        let now = Utc::now();

        assert!(tracker.blocked_until("s1", now).await.is_none());

        let first = tracker.record_failure("s1", now).await;
        assert_eq!(first.attempts, 1);
        assert_eq!(first.next_retry_at, now + Duration::minutes(5));

        let second = tracker.record_failure("s1", now).await;
        assert_eq!(second.attempts, 2);
        assert_eq!(second.next_retry_at, now + Duration::minutes(10));

        assert_eq!(
            tracker.blocked_until("s1", now).await,
            Some(second.next_retry_at)
        );
        // After the retry time has passed the block lifts.
        assert!(tracker
            .blocked_until("s1", now + Duration::minutes(11))
            .await
            .is_none());

        tracker.clear("s1").await;
        assert!(tracker.state("s1").await.is_none());
    }

    #[tokio::test]
    async fn malformed_state_is_discarded() {
        let cache = Arc::new(MemoryCache::new());
        cache
            .set(&backoff_key("s1"), "not json", STATE_TTL)
            .await
            .unwrap();
        let tracker = BackoffTracker::new(cache);
        assert!(tracker.state("s1").await.is_none());
        // A fresh failure starts the streak at 1.
        assert_eq!(tracker.record_failure("s1", Utc::now()).await.attempts, 1);
    }
}
