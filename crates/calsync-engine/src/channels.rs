//! Push-notification channel upkeep.
//!
//! Runs at the end of each successful sync for providers with webhook
//! support. Channel trouble never fails the sync that triggered it; a
//! subscription without a working channel still syncs on the scheduler's
//! interval.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use calsync_core::{CalendarSubscription, SyncConfig};
use calsync_providers::WebhookCapable;

/// Channels expiring within this window are replaced early.
const RENEWAL_WINDOW_HOURS: i64 = 24;

/// Returns true if the subscription needs a new channel at `now`. A
/// channel without a recorded expiration is renewed as well.
fn needs_renewal(subscription: &CalendarSubscription, now: DateTime<Utc>) -> bool {
    match (&subscription.channel_id, subscription.channel_expiration) {
        (None, _) => true,
        (Some(_), None) => true,
        (Some(_), Some(expiration)) => {
            expiration <= now + Duration::hours(RENEWAL_WINDOW_HOURS)
        }
    }
}

/// Ensures the subscription has a live notification channel, creating or
/// renewing one when needed. Updates the subscription in place and returns
/// true if it changed.
pub async fn ensure_channel(
    webhooks: &dyn WebhookCapable,
    config: &SyncConfig,
    access_token: &str,
    subscription: &mut CalendarSubscription,
    now: DateTime<Utc>,
) -> bool {
    let Some(address) = config.webhook_url.as_deref() else {
        debug!(
            subscription_id = %subscription.id,
            "no webhook URL configured, skipping channel setup"
        );
        return false;
    };
    let token = config.webhook_token.as_deref().unwrap_or_default();

    if !needs_renewal(subscription, now) {
        return false;
    }

    // Tear down the expiring channel first. A failure here is harmless:
    // the old channel lapses on its own.
    if let (Some(channel_id), Some(resource_id)) =
        (subscription.channel_id.clone(), subscription.resource_id.clone())
    {
        if let Err(err) = webhooks
            .stop_channel(access_token, &channel_id, &resource_id)
            .await
        {
            warn!(
                subscription_id = %subscription.id,
                channel_id = %channel_id,
                error = %err,
                "failed to stop expiring channel"
            );
        }
    }

    match webhooks
        .watch_calendar(
            access_token,
            &subscription.external_calendar_id,
            address,
            token,
        )
        .await
    {
        Ok(watch) => {
            info!(
                subscription_id = %subscription.id,
                channel_id = %watch.channel_id,
                expiration = ?watch.expiration,
                "registered notification channel"
            );
            subscription.channel_id = Some(watch.channel_id);
            subscription.resource_id = Some(watch.resource_id);
            subscription.channel_expiration = watch.expiration;
            true
        }
        Err(err) => {
            // Polling still covers the calendar; just record what happened.
            warn!(
                subscription_id = %subscription.id,
                error = %err,
                "failed to register notification channel"
            );
            let changed = subscription.channel_id.is_some();
            subscription.channel_id = None;
            subscription.resource_id = None;
            subscription.channel_expiration = None;
            changed
        }
    }
}
