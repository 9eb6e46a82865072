//! In-memory store implementations.
//!
//! Used by the engine's own tests and suitable for single-process
//! deployments that do not need durable state. All locking is coarse; none
//! of these hold a mutex across an await point.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use calsync_core::{
    CalendarAccount, CalendarEvent, CalendarSubscription, Provider, SyncWindow, WorkspaceCalendar,
};

use crate::store::{
    AccountStore, CacheStore, EventStore, StoreResult, SubscriptionStore, WorkspaceStore,
};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // Poisoning cannot outlive a test run; treat it as unrecoverable.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<HashMap<String, CalendarAccount>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn get(&self, id: &str) -> StoreResult<Option<CalendarAccount>> {
        Ok(locked(&self.accounts).get(id).cloned())
    }

    async fn find_by_identity(
        &self,
        user_id: &str,
        provider: Provider,
        provider_account_id: &str,
    ) -> StoreResult<Option<CalendarAccount>> {
        Ok(locked(&self.accounts)
            .values()
            .find(|a| {
                a.user_id == user_id
                    && a.provider == provider
                    && a.provider_account_id == provider_account_id
            })
            .cloned())
    }

    async fn save(&self, account: &CalendarAccount) -> StoreResult<()> {
        locked(&self.accounts).insert(account.id.clone(), account.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscriptions: Mutex<HashMap<String, CalendarSubscription>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn get(&self, id: &str) -> StoreResult<Option<CalendarSubscription>> {
        Ok(locked(&self.subscriptions).get(id).cloned())
    }

    async fn list_for_account(&self, account_id: &str) -> StoreResult<Vec<CalendarSubscription>> {
        let mut subs: Vec<_> = locked(&self.subscriptions)
            .values()
            .filter(|s| s.account_id == account_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(subs)
    }

    async fn find_by_external_id(
        &self,
        account_id: &str,
        external_calendar_id: &str,
    ) -> StoreResult<Option<CalendarSubscription>> {
        Ok(locked(&self.subscriptions)
            .values()
            .find(|s| s.account_id == account_id && s.external_calendar_id == external_calendar_id)
            .cloned())
    }

    async fn find_by_channel_id(
        &self,
        channel_id: &str,
    ) -> StoreResult<Option<CalendarSubscription>> {
        Ok(locked(&self.subscriptions)
            .values()
            .find(|s| s.channel_id.as_deref() == Some(channel_id))
            .cloned())
    }

    async fn save(&self, subscription: &CalendarSubscription) -> StoreResult<()> {
        locked(&self.subscriptions).insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }
}

type EventKey = (String, String, Option<String>);

#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<HashMap<EventKey, CalendarEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows, for test assertions.
    pub fn len(&self) -> usize {
        locked(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn upsert(&self, event: &CalendarEvent) -> StoreResult<()> {
        let key = (
            event.subscription_id.clone(),
            event.external_event_id.clone(),
            event.recurrence_id.clone(),
        );
        locked(&self.events).insert(key, event.clone());
        Ok(())
    }

    async fn delete_one(
        &self,
        subscription_id: &str,
        external_event_id: &str,
        recurrence_id: Option<&str>,
    ) -> StoreResult<()> {
        let key = (
            subscription_id.to_string(),
            external_event_id.to_string(),
            recurrence_id.map(str::to_string),
        );
        locked(&self.events).remove(&key);
        Ok(())
    }

    async fn delete_for_external_id(
        &self,
        subscription_id: &str,
        external_event_id: &str,
    ) -> StoreResult<()> {
        locked(&self.events)
            .retain(|(sub, ext, _), _| !(sub == subscription_id && ext == external_event_id));
        Ok(())
    }

    async fn delete_for_subscription(&self, subscription_id: &str) -> StoreResult<()> {
        locked(&self.events).retain(|(sub, _, _), _| sub != subscription_id);
        Ok(())
    }

    async fn list_window(
        &self,
        subscription_ids: &[String],
        window: SyncWindow,
    ) -> StoreResult<Vec<CalendarEvent>> {
        let mut events: Vec<_> = locked(&self.events)
            .values()
            .filter(|e| subscription_ids.contains(&e.subscription_id))
            .filter(|e| e.start_at_utc < window.end && e.end_at_utc > window.start)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.start_at_utc);
        Ok(events)
    }
}

#[derive(Default)]
pub struct MemoryWorkspaceStore {
    calendars: Mutex<HashMap<String, WorkspaceCalendar>>,
}

impl MemoryWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, calendar: WorkspaceCalendar) {
        locked(&self.calendars).insert(calendar.id.clone(), calendar);
    }
}

#[async_trait]
impl WorkspaceStore for MemoryWorkspaceStore {
    async fn get(&self, id: &str) -> StoreResult<Option<WorkspaceCalendar>> {
        Ok(locked(&self.calendars).get(id).cloned())
    }
}

/// In-memory TTL cache backing the persisted backoff state.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = locked(&self.entries);
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Utc::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        locked(&self.entries).insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        locked(&self.entries).remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(sub: &str, ext: &str, rec: Option<&str>, start_hour: u32) -> CalendarEvent {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, start_hour, 0, 0).unwrap();
        CalendarEvent {
            subscription_id: sub.to_string(),
            external_event_id: ext.to_string(),
            recurrence_id: rec.map(str::to_string),
            etag: None,
            status: None,
            title: Some("test".into()),
            description: None,
            location: None,
            start_at_utc: start,
            end_at_utc: start + chrono::Duration::hours(1),
            original_timezone: None,
            all_day: false,
            provider_updated_at: None,
            raw: None,
        }
    }

    #[tokio::test]
    async fn delete_for_external_id_removes_overrides_too() {
        let store = MemoryEventStore::new();
        store.upsert(&event("s1", "e1", None, 9)).await.unwrap();
        store
            .upsert(&event("s1", "e1", Some("20250601T090000Z"), 10))
            .await
            .unwrap();
        store.upsert(&event("s1", "e2", None, 11)).await.unwrap();

        store.delete_for_external_id("s1", "e1").await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn delete_for_subscription_leaves_other_subscriptions_alone() {
        let store = MemoryEventStore::new();
        store.upsert(&event("s1", "e1", None, 9)).await.unwrap();
        store
            .upsert(&event("s1", "e1", Some("20250601T090000Z"), 10))
            .await
            .unwrap();
        store.upsert(&event("s2", "e2", None, 11)).await.unwrap();

        store.delete_for_subscription("s1").await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn delete_one_matches_recurrence_id_exactly() {
        let store = MemoryEventStore::new();
        store.upsert(&event("s1", "e1", None, 9)).await.unwrap();
        store
            .upsert(&event("s1", "e1", Some("20250601T090000Z"), 10))
            .await
            .unwrap();

        store
            .delete_one("s1", "e1", Some("20250601T090000Z"))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        // The master row is untouched.
        let window = SyncWindow::around(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(), 1, 1);
        let rows = store.list_window(&["s1".into()], window).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].recurrence_id.is_none());
    }

    #[tokio::test]
    async fn window_listing_filters_and_orders() {
        let store = MemoryEventStore::new();
        store.upsert(&event("s1", "later", None, 12)).await.unwrap();
        store.upsert(&event("s1", "early", None, 8)).await.unwrap();
        store.upsert(&event("s2", "other", None, 9)).await.unwrap();

        let window = SyncWindow::around(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(), 1, 1);
        let rows = store.list_window(&["s1".into()], window).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].external_event_id, "early");
        assert_eq!(rows[1].external_event_id, "later");
    }

    #[tokio::test]
    async fn cache_expires_entries() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        cache.set("gone", "v", Duration::ZERO).await.unwrap();
        assert_eq!(cache.get("gone").await.unwrap(), None);
    }
}
