//! Workspace calendar reads.
//!
//! Reads always come from the local mirror so they stay fast and work
//! offline from the providers. Subscriptions past their refresh interval
//! get a background sync kicked off as a side effect; the caller never
//! waits on provider I/O.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use calsync_core::{CalendarEvent, CalendarSubscription, SyncWindow};

use crate::error::{EngineError, EngineResult};
use crate::sync::SyncEngine;

/// Stored events of one subscription within a workspace calendar.
#[derive(Debug, Clone)]
pub struct WorkspaceEventGroup {
    pub subscription_id: String,
    pub display_name: Option<String>,
    /// Workspace color override when set, otherwise the calendar's color.
    pub color: Option<String>,
    pub events: Vec<CalendarEvent>,
}

/// The composed read result for one workspace calendar.
#[derive(Debug, Clone)]
pub struct WorkspaceEvents {
    pub workspace_calendar_id: String,
    /// Groups in the workspace's configured item order.
    pub groups: Vec<WorkspaceEventGroup>,
}

impl SyncEngine {
    /// Lists stored events for a workspace calendar within `window`,
    /// grouped per subscription in item order. Stale subscriptions are
    /// synced in the background after the read returns.
    pub async fn list_workspace_events(
        self: &Arc<Self>,
        workspace_calendar_id: &str,
        window: SyncWindow,
    ) -> EngineResult<WorkspaceEvents> {
        self.assert_enabled()?;

        let Some(workspace) = self.stores().workspaces.get(workspace_calendar_id).await? else {
            return Err(EngineError::config(
                "workspace_calendar_not_found",
                format!("no workspace calendar {workspace_calendar_id}"),
            ));
        };
        let mut items = workspace.items;
        items.sort_by_key(|item| item.position);

        let mut subscriptions = Vec::with_capacity(items.len());
        for item in &items {
            match self.stores().subscriptions.get(&item.subscription_id).await? {
                Some(subscription) if subscription.enabled => subscriptions.push(subscription),
                Some(_) => {}
                None => {
                    debug!(
                        subscription_id = %item.subscription_id,
                        "workspace calendar references a missing subscription"
                    );
                }
            }
        }

        let subscription_ids: Vec<String> =
            subscriptions.iter().map(|s| s.id.clone()).collect();
        let events = self
            .stores()
            .events
            .list_window(&subscription_ids, window)
            .await?;

        let mut by_subscription: HashMap<String, Vec<CalendarEvent>> = HashMap::new();
        for event in events {
            by_subscription
                .entry(event.subscription_id.clone())
                .or_default()
                .push(event);
        }

        let mut groups = Vec::with_capacity(subscriptions.len());
        for subscription in &subscriptions {
            let item = items
                .iter()
                .find(|i| i.subscription_id == subscription.id);
            let color = item
                .and_then(|i| i.color_override.clone())
                .or_else(|| subscription.color.clone());
            groups.push(WorkspaceEventGroup {
                subscription_id: subscription.id.clone(),
                display_name: subscription.display_name.clone(),
                color,
                events: by_subscription.remove(&subscription.id).unwrap_or_default(),
            });
        }

        self.kick_stale_syncs(&subscriptions, Utc::now()).await;

        Ok(WorkspaceEvents {
            workspace_calendar_id: workspace_calendar_id.to_string(),
            groups,
        })
    }

    /// Spawns a background sync for every subscription past its account's
    /// refresh interval.
    async fn kick_stale_syncs(
        self: &Arc<Self>,
        subscriptions: &[CalendarSubscription],
        now: DateTime<Utc>,
    ) {
        for subscription in subscriptions {
            if !self.is_stale(subscription, now).await {
                continue;
            }
            let engine = Arc::clone(self);
            let subscription_id = subscription.id.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.sync_subscription(&subscription_id).await {
                    debug!(
                        subscription_id,
                        error = %err,
                        "background refresh failed"
                    );
                }
            });
        }
    }

    /// A subscription is stale when it never synced or its account's
    /// refresh interval has elapsed since the last sync.
    pub(crate) async fn is_stale(
        &self,
        subscription: &CalendarSubscription,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last_sync_at) = subscription.last_sync_at else {
            return true;
        };
        let interval_minutes = match self.stores().accounts.get(&subscription.account_id).await {
            Ok(Some(account)) => account.refresh_interval_minutes,
            _ => calsync_core::CalendarAccount::DEFAULT_REFRESH_INTERVAL_MINUTES,
        };
        last_sync_at + Duration::minutes(i64::from(interval_minutes)) <= now
    }
}
