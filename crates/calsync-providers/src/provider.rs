//! The [`CalendarProvider`] trait and its optional capability traits.
//!
//! The core trait covers what every backend can do: list calendars and list
//! events (incremental via sync token, or full over a time range). OAuth
//! token handling and push-notification channels are optional capabilities
//! exposed through accessor methods returning `Option<&dyn ...>`; callers
//! check for the capability instead of calling nullable methods.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use calsync_core::model::CalendarAccount;

use crate::error::ProviderResult;
use crate::event::ProviderEvent;

/// A boxed future for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Information about one external calendar.
#[derive(Debug, Clone)]
pub struct CalendarInfo {
    /// Stable external id (calendar id for Google, collection URL for CalDAV).
    pub id: String,
    /// Human-readable name of the calendar.
    pub name: String,
    /// IANA timezone identifier, when reported.
    pub timezone: Option<String>,
    /// Display color, when reported.
    pub color: Option<String>,
    /// Whether this is the account's primary calendar.
    pub primary: bool,
}

impl CalendarInfo {
    /// Creates a new CalendarInfo with the given id and name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            timezone: None,
            color: None,
            primary: false,
        }
    }
}

/// Options for listing events.
#[derive(Debug, Clone, Default)]
pub struct ListEventsOptions {
    /// Incremental cursor from a previous listing; when set, the adapter
    /// fetches changes only and ignores the time bounds.
    pub sync_token: Option<String>,
    /// Lower time bound for a full query.
    pub time_min: Option<DateTime<Utc>>,
    /// Upper time bound for a full query.
    pub time_max: Option<DateTime<Utc>>,
}

impl ListEventsOptions {
    /// Incremental listing with a sync token.
    pub fn incremental(token: impl Into<String>) -> Self {
        Self {
            sync_token: Some(token.into()),
            ..Default::default()
        }
    }

    /// Full listing bounded by the given time range.
    pub fn full(time_min: DateTime<Utc>, time_max: DateTime<Utc>) -> Self {
        Self {
            sync_token: None,
            time_min: Some(time_min),
            time_max: Some(time_max),
        }
    }
}

/// Result of listing events.
#[derive(Debug, Default)]
pub struct EventBatch {
    /// Changed or fetched events, cancellation tombstones included.
    pub events: Vec<ProviderEvent>,
    /// Cursor for the next incremental listing, when the provider issued one.
    pub next_sync_token: Option<String>,
}

/// Result of an OAuth code exchange or token refresh.
#[derive(Debug, Clone)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

/// External account identity, fetched after an OAuth exchange.
#[derive(Debug, Clone)]
pub struct AccountProfile {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Result of registering a push-notification channel.
#[derive(Debug, Clone)]
pub struct WatchResponse {
    pub channel_id: String,
    pub resource_id: String,
    pub expiration: Option<DateTime<Utc>>,
}

/// The core abstraction for calendar backends.
///
/// Implementations are stateless with respect to accounts: every call
/// receives the account and a resolved access token (the app password, for
/// CalDAV), so a single provider value serves all linked accounts.
pub trait CalendarProvider: Send + Sync {
    /// Returns the name of this provider (`google`, `caldav`).
    fn name(&self) -> &str;

    /// Lists the calendars the account has access to.
    fn list_calendars<'a>(
        &'a self,
        account: &'a CalendarAccount,
        access_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Vec<CalendarInfo>>>;

    /// Lists events for one calendar, incrementally when a sync token is
    /// supplied, otherwise over the given time range.
    ///
    /// # Errors
    ///
    /// Returns an error with code `SyncTokenInvalid` when the provider
    /// rejected the incremental cursor; the caller must clear the stored
    /// token and retry as a full query.
    fn list_events<'a>(
        &'a self,
        account: &'a CalendarAccount,
        access_token: &'a str,
        calendar_id: &'a str,
        options: ListEventsOptions,
    ) -> BoxFuture<'a, ProviderResult<EventBatch>>;

    /// Returns the OAuth capability, for providers that exchange and
    /// refresh tokens. CalDAV returns `None`.
    fn oauth(&self) -> Option<&dyn OAuthCapable> {
        None
    }

    /// Returns the push-notification capability. CalDAV returns `None`.
    fn webhooks(&self) -> Option<&dyn WebhookCapable> {
        None
    }
}

/// OAuth token lifecycle, implemented by token-based providers.
pub trait OAuthCapable: Send + Sync {
    /// Builds the authorization URL the user is sent to.
    fn auth_url(&self, state: &str) -> ProviderResult<String>;

    /// Exchanges an authorization code for tokens.
    fn exchange_code<'a>(&'a self, code: &'a str)
        -> BoxFuture<'a, ProviderResult<TokenResponse>>;

    /// Obtains a fresh access token from a refresh token.
    fn refresh_tokens<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<TokenResponse>>;

    /// Fetches the external account identity for the given access token.
    fn account_profile<'a>(
        &'a self,
        access_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<AccountProfile>>;
}

/// Push-notification channel lifecycle, implemented by providers with
/// webhook support.
pub trait WebhookCapable: Send + Sync {
    /// Registers a channel delivering change notifications for `calendar_id`
    /// to `address`, carrying `token` for origin verification.
    fn watch_calendar<'a>(
        &'a self,
        access_token: &'a str,
        calendar_id: &'a str,
        address: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<WatchResponse>>;

    /// Stops an existing channel.
    fn stop_channel<'a>(
        &'a self,
        access_token: &'a str,
        channel_id: &'a str,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ProviderResult<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Minimal;

    impl CalendarProvider for Minimal {
        fn name(&self) -> &str {
            "minimal"
        }

        fn list_calendars<'a>(
            &'a self,
            _account: &'a CalendarAccount,
            _access_token: &'a str,
        ) -> BoxFuture<'a, ProviderResult<Vec<CalendarInfo>>> {
            Box::pin(async { Ok(vec![CalendarInfo::new("c1", "Calendar")]) })
        }

        fn list_events<'a>(
            &'a self,
            _account: &'a CalendarAccount,
            _access_token: &'a str,
            _calendar_id: &'a str,
            _options: ListEventsOptions,
        ) -> BoxFuture<'a, ProviderResult<EventBatch>> {
            Box::pin(async { Ok(EventBatch::default()) })
        }
    }

    #[test]
    fn capabilities_default_to_none() {
        let provider = Minimal;
        assert!(provider.oauth().is_none());
        assert!(provider.webhooks().is_none());
    }

    #[test]
    fn options_constructors() {
        let incremental = ListEventsOptions::incremental("tok");
        assert_eq!(incremental.sync_token.as_deref(), Some("tok"));
        assert!(incremental.time_min.is_none());

        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let full = ListEventsOptions::full(from, to);
        assert!(full.sync_token.is_none());
        assert_eq!(full.time_min, Some(from));
        assert_eq!(full.time_max, Some(to));
    }
}
