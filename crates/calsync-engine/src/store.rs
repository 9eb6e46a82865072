//! Persistence contracts the orchestrator runs against.
//!
//! The engine never talks to a database directly; the embedding service
//! implements these traits over its own storage. [`crate::memory`] provides
//! in-memory implementations for tests and small deployments.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use calsync_core::{
    CalendarAccount, CalendarEvent, CalendarSubscription, Provider, SyncWindow, WorkspaceCalendar,
};

/// An error from the persistence layer.
#[derive(Debug, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Linked calendar accounts.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<Option<CalendarAccount>>;

    /// Finds an existing account by its external identity, for idempotent
    /// relinking.
    async fn find_by_identity(
        &self,
        user_id: &str,
        provider: Provider,
        provider_account_id: &str,
    ) -> StoreResult<Option<CalendarAccount>>;

    /// Inserts or fully replaces an account row.
    async fn save(&self, account: &CalendarAccount) -> StoreResult<()>;
}

/// Calendar-list subscriptions per account.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<Option<CalendarSubscription>>;

    async fn list_for_account(&self, account_id: &str) -> StoreResult<Vec<CalendarSubscription>>;

    /// Finds the subscription for one external calendar of an account.
    async fn find_by_external_id(
        &self,
        account_id: &str,
        external_calendar_id: &str,
    ) -> StoreResult<Option<CalendarSubscription>>;

    /// Finds the subscription owning a push-notification channel.
    async fn find_by_channel_id(
        &self,
        channel_id: &str,
    ) -> StoreResult<Option<CalendarSubscription>>;

    async fn save(&self, subscription: &CalendarSubscription) -> StoreResult<()>;
}

/// The local mirror of provider events.
///
/// Rows are keyed by `(subscription_id, external_event_id, recurrence_id)`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Inserts or replaces one event row.
    async fn upsert(&self, event: &CalendarEvent) -> StoreResult<()>;

    /// Deletes a single row, matching `recurrence_id` exactly (including
    /// `None` for the master row).
    async fn delete_one(
        &self,
        subscription_id: &str,
        external_event_id: &str,
        recurrence_id: Option<&str>,
    ) -> StoreResult<()>;

    /// Deletes every row for one external event: the master and all
    /// recurrence overrides. Used for whole-resource tombstones.
    async fn delete_for_external_id(
        &self,
        subscription_id: &str,
        external_event_id: &str,
    ) -> StoreResult<()>;

    /// Deletes every mirrored row of one subscription. Called when a
    /// subscription is disabled or its account invalidated.
    async fn delete_for_subscription(&self, subscription_id: &str) -> StoreResult<()>;

    /// Lists stored events for the given subscriptions overlapping `window`,
    /// ordered by start time.
    async fn list_window(
        &self,
        subscription_ids: &[String],
        window: SyncWindow,
    ) -> StoreResult<Vec<CalendarEvent>>;
}

/// Workspace calendar views.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<Option<WorkspaceCalendar>>;
}

/// A string key/value cache with TTL semantics, used for the persisted
/// sync-backoff state. Redis-shaped on purpose.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the value if present and not expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    async fn remove(&self, key: &str) -> StoreResult<()>;
}
