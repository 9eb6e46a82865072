//! The sync orchestrator.
//!
//! One [`SyncEngine`] serves all accounts. Each subscription sync runs a
//! fixed sequence: cheap prechecks, the per-subscription lock (with a
//! post-lock recheck), token resolution, an incremental listing with one
//! full-query fallback when the provider rejects the cursor, event
//! application, and finally cursor, backoff, and channel bookkeeping.
//! Failures are classified: a missing calendar disables the subscription,
//! bad credentials invalidate the whole account, anything else backs off.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use calsync_core::{
    AccountStatus, CalendarAccount, CalendarEvent, CalendarSubscription, Provider, SyncConfig,
    SyncWindow,
};
use calsync_providers::{
    CalDavProvider, CalendarProvider, GoogleProvider, ListEventsOptions, ProviderError,
    ProviderErrorCode, ProviderEvent, RequestPolicy,
};

use crate::backoff::{next_scheduled_sync_deadline, BackoffTracker};
use crate::channels::ensure_channel;
use crate::error::{EngineError, EngineResult};
use crate::lock::{sync_lock_key, LockManager};
use crate::store::{AccountStore, CacheStore, EventStore, SubscriptionStore, WorkspaceStore};

/// Refresh margin before token expiry.
const TOKEN_REFRESH_SKEW_SECONDS: i64 = 60;

/// The persistence surfaces the engine runs against.
#[derive(Clone)]
pub struct EngineStores {
    pub accounts: Arc<dyn AccountStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub events: Arc<dyn EventStore>,
    pub workspaces: Arc<dyn WorkspaceStore>,
    pub cache: Arc<dyn CacheStore>,
    pub locks: Arc<dyn LockManager>,
}

/// How one subscription sync ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The sync ran to completion.
    Synced {
        upserted: usize,
        deleted: usize,
        incremental: bool,
    },
    /// Another sync holds the subscription lock; nothing was done.
    AlreadyRunning,
    /// The failure backoff has not elapsed yet.
    BackingOff { next_retry_at: DateTime<Utc> },
    /// The subscription or its account is disabled or invalid.
    Disabled,
    /// The account has neither a usable token nor a refresh path. The
    /// sync aborts without recording an error.
    MissingCredentials,
}

/// The calendar sync orchestrator.
pub struct SyncEngine {
    config: SyncConfig,
    stores: EngineStores,
    backoff: BackoffTracker,
    providers: HashMap<Provider, Arc<dyn CalendarProvider>>,
}

impl SyncEngine {
    /// Builds an engine with the default provider adapters: CalDAV behind
    /// the request policy guard, and Google when OAuth is configured.
    pub fn new(config: SyncConfig, stores: EngineStores) -> EngineResult<Self> {
        let mut providers: HashMap<Provider, Arc<dyn CalendarProvider>> = HashMap::new();
        providers.insert(
            Provider::CalDav,
            Arc::new(CalDavProvider::new(RequestPolicy::from_config(&config))),
        );
        if let Some(google) = config.google.clone() {
            providers.insert(
                Provider::Google,
                Arc::new(GoogleProvider::new(google, config.request_timeout())?),
            );
        }
        let backoff = BackoffTracker::new(Arc::clone(&stores.cache));
        Ok(Self {
            config,
            stores,
            backoff,
            providers,
        })
    }

    /// Replaces the adapter for one provider. Test seam.
    pub fn with_provider(
        mut self,
        provider: Provider,
        adapter: Arc<dyn CalendarProvider>,
    ) -> Self {
        self.providers.insert(provider, adapter);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub(crate) fn stores(&self) -> &EngineStores {
        &self.stores
    }

    pub(crate) fn provider_for(&self, provider: Provider) -> EngineResult<&dyn CalendarProvider> {
        self.providers
            .get(&provider)
            .map(|p| p.as_ref())
            .ok_or_else(|| {
                EngineError::config(
                    "provider_not_configured",
                    format!("no adapter registered for provider {provider}"),
                )
            })
    }

    pub(crate) fn assert_enabled(&self) -> EngineResult<()> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(EngineError::config(
                "calendar_integration_disabled",
                "calendar integration is disabled",
            ))
        }
    }

    /// Syncs one subscription now.
    pub async fn sync_subscription(&self, subscription_id: &str) -> EngineResult<SyncOutcome> {
        self.sync_subscription_at(subscription_id, Utc::now()).await
    }

    /// Syncs one subscription with an explicit clock, for deterministic
    /// window and backoff behavior.
    pub async fn sync_subscription_at(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<SyncOutcome> {
        self.run_sync(subscription_id, now, false).await
    }

    /// Syncs one subscription with a full time-window query, ignoring any
    /// stored cursor.
    pub async fn resync_subscription(&self, subscription_id: &str) -> EngineResult<SyncOutcome> {
        self.run_sync(subscription_id, Utc::now(), true).await
    }

    async fn run_sync(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
        force_full: bool,
    ) -> EngineResult<SyncOutcome> {
        self.assert_enabled()?;

        // Cheap precheck before taking the lock.
        let Some(subscription) = self.stores.subscriptions.get(subscription_id).await? else {
            return Err(EngineError::config(
                "subscription_not_found",
                format!("no subscription {subscription_id}"),
            ));
        };
        if !subscription.enabled {
            return Ok(SyncOutcome::Disabled);
        }
        if let Some(next_retry_at) = self.backoff.blocked_until(subscription_id, now).await {
            return Ok(SyncOutcome::BackingOff { next_retry_at });
        }

        // Held for the rest of the sync; drops on every exit path.
        let Some(_guard) = self.stores.locks.try_acquire(&sync_lock_key(subscription_id)) else {
            return Ok(SyncOutcome::AlreadyRunning);
        };

        // Recheck under the lock: a concurrent sync may have finished (and
        // failed) between the precheck and the acquisition.
        let Some(mut subscription) = self.stores.subscriptions.get(subscription_id).await? else {
            return Err(EngineError::config(
                "subscription_not_found",
                format!("no subscription {subscription_id}"),
            ));
        };
        if !subscription.enabled {
            return Ok(SyncOutcome::Disabled);
        }
        if let Some(next_retry_at) = self.backoff.blocked_until(subscription_id, now).await {
            return Ok(SyncOutcome::BackingOff { next_retry_at });
        }

        let Some(mut account) = self.stores.accounts.get(&subscription.account_id).await? else {
            return Err(EngineError::config(
                "account_not_found",
                format!("no account {}", subscription.account_id),
            ));
        };
        if !account.is_active() {
            info!(
                subscription_id,
                account_id = %account.id,
                "skipping sync for invalid account"
            );
            return Ok(SyncOutcome::Disabled);
        }

        let provider = self.provider_for(account.provider)?;
        let access_token = match self.ensure_access_token(provider, &mut account, now).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!(
                    subscription_id,
                    account_id = %account.id,
                    "no usable token and no refresh path, skipping sync"
                );
                return Ok(SyncOutcome::MissingCredentials);
            }
            Err(err) => {
                return Err(self
                    .handle_sync_failure(provider, &mut account, &mut subscription, None, err, now)
                    .await);
            }
        };

        let mut use_cursor = !force_full && subscription.sync_token.is_some();
        let mut batch = None;
        for attempt in 0..2u8 {
            let options = match subscription.sync_token.as_deref().filter(|_| use_cursor) {
                Some(token) => ListEventsOptions::incremental(token),
                None => {
                    let window = SyncWindow::around(
                        now,
                        self.config.lookbehind_days,
                        self.config.lookahead_days,
                    );
                    ListEventsOptions::full(window.start, window.end)
                }
            };
            match provider
                .list_events(
                    &account,
                    &access_token,
                    &subscription.external_calendar_id,
                    options,
                )
                .await
            {
                Ok(fetched) => {
                    batch = Some(fetched);
                    break;
                }
                Err(err)
                    if err.code() == ProviderErrorCode::SyncTokenInvalid
                        && attempt == 0
                        && use_cursor =>
                {
                    warn!(
                        subscription_id,
                        "sync token rejected, falling back to a full query"
                    );
                    subscription.sync_token = None;
                    use_cursor = false;
                    self.stores.subscriptions.save(&subscription).await?;
                }
                Err(err) => {
                    return Err(self
                        .handle_sync_failure(
                            provider,
                            &mut account,
                            &mut subscription,
                            Some(&access_token),
                            err.into(),
                            now,
                        )
                        .await);
                }
            }
        }
        let Some(batch) = batch else {
            // Unreachable: the fallback arm runs at most once.
            return Err(ProviderError::internal("listing retry loop exhausted").into());
        };

        let next_sync_token = batch.next_sync_token.clone();
        let (upserted, deleted) = self.apply_events(&subscription, batch.events).await;

        // Keep the old cursor when the provider issued none (a full query
        // against a server without sync-collection support).
        if next_sync_token.is_some() {
            subscription.sync_token = next_sync_token;
        }
        subscription.last_sync_at = Some(now);
        if let Some(webhooks) = provider.webhooks() {
            ensure_channel(
                webhooks,
                &self.config,
                &access_token,
                &mut subscription,
                now,
            )
            .await;
        }
        self.stores.subscriptions.save(&subscription).await?;
        self.backoff.clear(subscription_id).await;

        info!(
            subscription_id,
            upserted,
            deleted,
            incremental = use_cursor,
            "completed calendar sync"
        );
        Ok(SyncOutcome::Synced {
            upserted,
            deleted,
            incremental: use_cursor,
        })
    }

    /// Handles a push-notification delivery: verifies the shared webhook
    /// token and syncs the subscription owning the channel.
    pub async fn handle_channel_notification(
        &self,
        channel_id: &str,
        token: Option<&str>,
    ) -> EngineResult<SyncOutcome> {
        self.assert_enabled()?;
        if let Some(expected) = self.config.webhook_token.as_deref() {
            if token != Some(expected) {
                return Err(EngineError::config(
                    "webhook_token_mismatch",
                    "notification token does not match",
                ));
            }
        }
        let Some(subscription) = self.stores.subscriptions.find_by_channel_id(channel_id).await?
        else {
            return Err(EngineError::config(
                "unknown_channel",
                format!("no subscription for channel {channel_id}"),
            ));
        };
        debug!(
            channel_id,
            subscription_id = %subscription.id,
            "push notification received"
        );
        self.sync_subscription(&subscription.id).await
    }

    /// Syncs every enabled subscription of one account concurrently. One
    /// subscription's failure never blocks another's.
    pub async fn sync_account(
        &self,
        account_id: &str,
    ) -> EngineResult<Vec<(String, EngineResult<SyncOutcome>)>> {
        self.assert_enabled()?;
        let subscriptions = self.stores.subscriptions.list_for_account(account_id).await?;
        let jobs = subscriptions
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| async move {
                let outcome = self.sync_subscription(&s.id).await;
                (s.id, outcome)
            });
        Ok(join_all(jobs).await)
    }

    /// Returns a usable access token for the account, refreshing (and
    /// persisting) it when it expires within the skew margin. `Ok(None)`
    /// means the account has neither a token nor a refresh path.
    pub(crate) async fn ensure_access_token(
        &self,
        provider: &dyn CalendarProvider,
        account: &mut CalendarAccount,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<String>> {
        if account.token_valid_at(now, Duration::seconds(TOKEN_REFRESH_SKEW_SECONDS)) {
            return Ok(account.access_token.clone());
        }

        let (Some(oauth), Some(refresh_token)) =
            (provider.oauth(), account.refresh_token.clone())
        else {
            return Ok(None);
        };

        let tokens = oauth.refresh_tokens(&refresh_token).await?;
        account.access_token = Some(tokens.access_token.clone());
        if let Some(refreshed) = tokens.refresh_token {
            account.refresh_token = Some(refreshed);
        }
        account.expires_at = tokens.expires_at;
        if let Some(scope) = tokens.scope {
            account.scope = Some(scope);
        }
        account.last_error = None;
        self.stores.accounts.save(account).await?;
        info!(account_id = %account.id, "refreshed access token");
        Ok(Some(tokens.access_token))
    }

    /// Applies provider events to the local mirror. Tombstones without a
    /// recurrence id remove the whole external event, overrides included.
    /// Individual row failures are logged and skipped, never fatal.
    async fn apply_events(
        &self,
        subscription: &CalendarSubscription,
        events: Vec<ProviderEvent>,
    ) -> (usize, usize) {
        let mut upserted = 0;
        let mut deleted = 0;
        for event in events {
            if event.is_cancelled() {
                let result = match event.recurrence_id.as_deref() {
                    Some(recurrence_id) => {
                        self.stores
                            .events
                            .delete_one(&subscription.id, &event.id, Some(recurrence_id))
                            .await
                    }
                    None => {
                        self.stores
                            .events
                            .delete_for_external_id(&subscription.id, &event.id)
                            .await
                    }
                };
                match result {
                    Ok(()) => deleted += 1,
                    Err(err) => warn!(
                        subscription_id = %subscription.id,
                        event_id = %event.id,
                        error = %err,
                        "failed to delete cancelled event"
                    ),
                }
                continue;
            }
            let Some(row) = materialize_event(&subscription.id, event) else {
                continue;
            };
            match self.stores.events.upsert(&row).await {
                Ok(()) => upserted += 1,
                Err(err) => warn!(
                    subscription_id = %subscription.id,
                    event_id = %row.external_event_id,
                    error = %err,
                    "failed to upsert event"
                ),
            }
        }
        (upserted, deleted)
    }

    /// Classifies a sync failure and applies its consequences:
    ///
    /// - missing calendar (404): tear down the channel, disable the
    ///   subscription permanently, purge its mirrored events, clear backoff
    /// - bad credentials: invalidate the whole account (one bad refresh
    ///   token poisons every subscription under it), purge the mirrored
    ///   events of every subscription on the account, clear backoff
    /// - anything else: extend the backoff and back-date `last_sync_at` so
    ///   the scheduler's next attempt lands at the retry time
    async fn handle_sync_failure(
        &self,
        provider: &dyn CalendarProvider,
        account: &mut CalendarAccount,
        subscription: &mut CalendarSubscription,
        access_token: Option<&str>,
        err: EngineError,
        now: DateTime<Utc>,
    ) -> EngineError {
        let code = match &err {
            EngineError::Provider(provider_err) => provider_err.code(),
            _ => ProviderErrorCode::InternalError,
        };
        match code {
            ProviderErrorCode::NotFound => {
                warn!(
                    subscription_id = %subscription.id,
                    "calendar gone, disabling subscription"
                );
                self.teardown_channel(provider, subscription, access_token)
                    .await;
                subscription.enabled = false;
                if let Err(save_err) = self.stores.subscriptions.save(subscription).await {
                    warn!(
                        subscription_id = %subscription.id,
                        error = %save_err,
                        "failed to persist disabled subscription"
                    );
                }
                self.purge_events(&subscription.id).await;
                self.backoff.clear(&subscription.id).await;
            }
            ProviderErrorCode::AuthenticationFailed => {
                warn!(
                    account_id = %account.id,
                    subscription_id = %subscription.id,
                    "authentication failed, invalidating account"
                );
                self.teardown_channel(provider, subscription, access_token)
                    .await;
                account.status = AccountStatus::Invalid;
                account.last_error = Some(err.to_string());
                if let Err(save_err) = self.stores.accounts.save(account).await {
                    warn!(
                        account_id = %account.id,
                        error = %save_err,
                        "failed to persist invalid account status"
                    );
                }
                // Every subscription under the account loses its mirror, not
                // just the one that saw the failure.
                match self.stores.subscriptions.list_for_account(&account.id).await {
                    Ok(siblings) => {
                        for sibling in &siblings {
                            self.purge_events(&sibling.id).await;
                        }
                    }
                    Err(list_err) => {
                        warn!(
                            account_id = %account.id,
                            error = %list_err,
                            "failed to list subscriptions for purge"
                        );
                        self.purge_events(&subscription.id).await;
                    }
                }
                self.backoff.clear(&subscription.id).await;
            }
            _ => {
                let state = self.backoff.record_failure(&subscription.id, now).await;
                // The scheduler triggers on `now - last_sync_at >=
                // refresh_interval`, so a back-dated last_sync_at makes the
                // next scheduled attempt land exactly at next_retry_at.
                let interval =
                    Duration::minutes(i64::from(account.refresh_interval_minutes));
                subscription.last_sync_at =
                    Some(next_scheduled_sync_deadline(state.next_retry_at, interval));
                if let Err(save_err) = self.stores.subscriptions.save(subscription).await {
                    warn!(
                        subscription_id = %subscription.id,
                        error = %save_err,
                        "failed to persist backoff sync time"
                    );
                }
                warn!(
                    subscription_id = %subscription.id,
                    attempts = state.attempts,
                    next_retry_at = %state.next_retry_at,
                    error = %err,
                    "calendar sync failed"
                );
            }
        }
        err
    }

    /// Best-effort purge of a subscription's mirrored rows.
    async fn purge_events(&self, subscription_id: &str) {
        if let Err(err) = self.stores.events.delete_for_subscription(subscription_id).await {
            warn!(
                subscription_id = %subscription_id,
                error = %err,
                "failed to purge mirrored events"
            );
        }
    }

    /// Best-effort channel teardown on terminal failure paths.
    async fn teardown_channel(
        &self,
        provider: &dyn CalendarProvider,
        subscription: &mut CalendarSubscription,
        access_token: Option<&str>,
    ) {
        let Some(webhooks) = provider.webhooks() else {
            return;
        };
        if let (Some(channel_id), Some(resource_id), Some(token)) = (
            subscription.channel_id.take(),
            subscription.resource_id.take(),
            access_token,
        ) {
            if let Err(err) = webhooks.stop_channel(token, &channel_id, &resource_id).await {
                warn!(
                    subscription_id = %subscription.id,
                    channel_id = %channel_id,
                    error = %err,
                    "failed to stop channel during teardown"
                );
            }
        }
        subscription.channel_expiration = None;
    }
}

/// Converts a provider event into a stored row. Events without a start
/// time are dropped (cancellations never reach this point).
fn materialize_event(subscription_id: &str, event: ProviderEvent) -> Option<CalendarEvent> {
    let Some(start) = event.start else {
        warn!(event_id = %event.id, "dropping event without a start time");
        return None;
    };
    let end = event.end.unwrap_or(start);
    Some(CalendarEvent {
        subscription_id: subscription_id.to_string(),
        external_event_id: event.id,
        recurrence_id: event.recurrence_id,
        etag: event.etag,
        status: Some(event.status.as_str().to_string()),
        title: event.title,
        description: event.description,
        location: event.location,
        start_at_utc: start.to_utc(),
        end_at_utc: end.to_utc(),
        original_timezone: event.timezone,
        all_day: start.is_all_day(),
        provider_updated_at: event.updated,
        raw: event.raw,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use calsync_providers::{BoxFuture, CalendarInfo, EventBatch, ProviderResult};

    use super::*;
    use crate::lock::MemoryLockManager;
    use crate::memory::{
        MemoryAccountStore, MemoryCache, MemoryEventStore, MemorySubscriptionStore,
        MemoryWorkspaceStore,
    };

    /// A scripted provider: each `list_events` call pops the next queued
    /// response and records the sync token it was called with.
    pub struct StubProvider {
        responses: Mutex<VecDeque<ProviderResult<EventBatch>>>,
        pub seen_tokens: Mutex<Vec<Option<String>>>,
        pub calendars: Vec<CalendarInfo>,
    }

    impl StubProvider {
        pub fn new(responses: Vec<ProviderResult<EventBatch>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
                seen_tokens: Mutex::new(Vec::new()),
                calendars: Vec::new(),
            }
        }
    }

    impl CalendarProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn list_calendars<'a>(
            &'a self,
            _account: &'a CalendarAccount,
            _access_token: &'a str,
        ) -> BoxFuture<'a, ProviderResult<Vec<CalendarInfo>>> {
            Box::pin(async move { Ok(self.calendars.clone()) })
        }

        fn list_events<'a>(
            &'a self,
            _account: &'a CalendarAccount,
            _access_token: &'a str,
            _calendar_id: &'a str,
            options: ListEventsOptions,
        ) -> BoxFuture<'a, ProviderResult<EventBatch>> {
            Box::pin(async move {
                self.seen_tokens.lock().unwrap().push(options.sync_token);
                self.responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Ok(EventBatch::default()))
            })
        }
    }

    pub struct TestEngine {
        pub engine: SyncEngine,
        pub provider: Arc<StubProvider>,
        pub accounts: Arc<MemoryAccountStore>,
        pub subscriptions: Arc<MemorySubscriptionStore>,
        pub events: Arc<MemoryEventStore>,
        pub workspaces: Arc<MemoryWorkspaceStore>,
        pub locks: Arc<MemoryLockManager>,
    }

    /// Builds an engine over memory stores with a stubbed CalDAV adapter
    /// plus one linked account and subscription.
    pub async fn engine_with_stub(stub: StubProvider) -> TestEngine {
        let provider = Arc::new(stub);
        let accounts = Arc::new(MemoryAccountStore::new());
        let subscriptions = Arc::new(MemorySubscriptionStore::new());
        let events = Arc::new(MemoryEventStore::new());
        let workspaces = Arc::new(MemoryWorkspaceStore::new());
        let locks = Arc::new(MemoryLockManager::new());
        let stores = EngineStores {
            accounts: accounts.clone(),
            subscriptions: subscriptions.clone(),
            events: events.clone(),
            workspaces: workspaces.clone(),
            cache: Arc::new(MemoryCache::new()),
            locks: locks.clone(),
        };
        let engine = SyncEngine::new(SyncConfig::default(), stores)
            .unwrap()
            .with_provider(Provider::CalDav, provider.clone());

        let mut account =
            CalendarAccount::new("acct-1", "user-1", Provider::CalDav, "principal-1");
        account.access_token = Some("app-password".into());
        accounts.save(&account).await.unwrap();

        let subscription =
            CalendarSubscription::new("sub-1", "acct-1", "https://cal.example.com/work/");
        subscriptions.save(&subscription).await.unwrap();

        TestEngine {
            engine,
            provider,
            accounts,
            subscriptions,
            events,
            workspaces,
            locks,
        }
    }
}
