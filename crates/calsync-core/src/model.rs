//! Persisted data model for the calendar sync engine.
//!
//! These are the entities the orchestrator manipulates through the
//! persistence contracts. Encryption of stored tokens is the persistence
//! layer's concern; the model carries them as opaque strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The calendar backend an account is linked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Google Calendar (token-based REST API).
    Google,
    /// Generic CalDAV server (WebDAV/XML/iCalendar).
    CalDav,
}

impl Provider {
    /// Returns the stable wire name for this provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::CalDav => "caldav",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Account lifecycle status.
///
/// `Invalid` means sync is suspended until the account is relinked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Invalid,
}

/// HTTP authentication scheme for CalDAV accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// Probe on first request: digest if challenged, otherwise basic.
    #[default]
    Auto,
    Basic,
    Digest,
}

/// One external calendar identity linked by one local user.
///
/// Invariant: `(provider, provider_account_id)` is unique per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarAccount {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    /// Stable external identity: principal URL for CalDAV, profile id for Google.
    pub provider_account_id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    /// Access token for Google; app password for CalDAV.
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub status: AccountStatus,
    pub last_error: Option<String>,
    /// How often the scheduler considers this account due for sync.
    pub refresh_interval_minutes: u32,
    // CalDAV-only fields.
    pub provider_preset_id: Option<String>,
    pub server_url: Option<String>,
    pub principal_url: Option<String>,
    pub calendar_home_url: Option<String>,
    pub username: Option<String>,
    pub auth_type: AuthType,
}

impl CalendarAccount {
    /// Default scheduler interval for newly linked accounts.
    pub const DEFAULT_REFRESH_INTERVAL_MINUTES: u32 = 15;

    /// Creates a new account shell for the given user and provider identity.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        provider: Provider,
        provider_account_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            provider,
            provider_account_id: provider_account_id.into(),
            display_name: None,
            email: None,
            access_token: None,
            refresh_token: None,
            expires_at: None,
            scope: None,
            status: AccountStatus::Active,
            last_error: None,
            refresh_interval_minutes: Self::DEFAULT_REFRESH_INTERVAL_MINUTES,
            provider_preset_id: None,
            server_url: None,
            principal_url: None,
            calendar_home_url: None,
            username: None,
            auth_type: AuthType::Auto,
        }
    }

    /// Returns true if the account may be synced.
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Returns true if the cached access token is still usable at `now`,
    /// with the given refresh skew margin.
    pub fn token_valid_at(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        if self.access_token.is_none() {
            return false;
        }
        match self.expires_at {
            // No recorded expiry (CalDAV passwords): always usable.
            None => true,
            Some(expires_at) => now + skew < expires_at,
        }
    }
}

/// One external calendar (calendar-list entry) exposed by one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarSubscription {
    pub id: String,
    pub account_id: String,
    /// Calendar id for Google; resolved collection URL for CalDAV.
    pub external_calendar_id: String,
    pub display_name: Option<String>,
    pub timezone: Option<String>,
    pub color: Option<String>,
    pub enabled: bool,
    /// Opaque incremental cursor; absence forces a full time-window query.
    pub sync_token: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    // Push-notification channel state (Google only).
    pub channel_id: Option<String>,
    pub resource_id: Option<String>,
    pub channel_expiration: Option<DateTime<Utc>>,
}

impl CalendarSubscription {
    /// Creates an enabled subscription for one external calendar.
    pub fn new(
        id: impl Into<String>,
        account_id: impl Into<String>,
        external_calendar_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            external_calendar_id: external_calendar_id.into(),
            display_name: None,
            timezone: None,
            color: None,
            enabled: true,
            sync_token: None,
            last_sync_at: None,
            channel_id: None,
            resource_id: None,
            channel_expiration: None,
        }
    }
}

/// One occurrence (or recurrence override) of an external event.
///
/// `(subscription_id, external_event_id, recurrence_id)` uniquely identifies
/// a stored row. A `cancelled` status from the provider deletes the row
/// rather than storing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub subscription_id: String,
    pub external_event_id: String,
    /// Set for a recurring-instance override.
    pub recurrence_id: Option<String>,
    pub etag: Option<String>,
    pub status: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_at_utc: DateTime<Utc>,
    pub end_at_utc: DateTime<Utc>,
    pub original_timezone: Option<String>,
    pub all_day: bool,
    pub provider_updated_at: Option<DateTime<Utc>>,
    /// Opaque provider payload kept for debugging/replay.
    pub raw: Option<serde_json::Value>,
}

impl CalendarEvent {
    /// The unique key of this row within its subscription.
    pub fn key(&self) -> (String, Option<String>) {
        (self.external_event_id.clone(), self.recurrence_id.clone())
    }
}

/// A workspace-scoped view composing selected subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceCalendar {
    pub id: String,
    pub workspace_id: String,
    pub name: Option<String>,
    pub items: Vec<WorkspaceCalendarItem>,
}

/// Per-workspace ordering/color override for one subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceCalendarItem {
    pub subscription_id: String,
    pub position: u32,
    pub color_override: Option<String>,
}
