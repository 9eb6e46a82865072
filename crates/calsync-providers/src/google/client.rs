//! Google Calendar API v3 client.
//!
//! Handles calendar listing, incremental and full event listing with
//! pagination, and push-notification channels. A 410 response (or a body
//! naming `fullSyncRequired`) on an incremental listing is surfaced as
//! `SyncTokenInvalid` so the orchestrator can fall back to a full query.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::event::{EventStatus, EventTime, ProviderEvent};
use crate::provider::{CalendarInfo, EventBatch, ListEventsOptions, WatchResponse};

/// Base URL for Google Calendar API v3.
const CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3";

/// Events fetched per page; the API maximum.
const PAGE_SIZE: u32 = 2500;

/// Google Calendar API client.
#[derive(Debug)]
pub struct GoogleApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl GoogleApiClient {
    pub fn new(timeout: Duration) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: CALENDAR_API_BASE.to_string(),
        })
    }

    /// Points the client at a different API origin. Used by tests.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Lists the calendars on the account's calendar list.
    pub async fn list_calendars(&self, access_token: &str) -> ProviderResult<Vec<CalendarInfo>> {
        let url = format!("{}/users/me/calendarList", self.base_url);
        let mut calendars = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.http.get(&url).bearer_auth(access_token);
            if let Some(ref token) = page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let body = check_response(send(request).await?).await?;
            let page: CalendarListResponse = serde_json::from_str(&body)
                .map_err(|e| ProviderError::invalid_response(format!("calendar list: {e}")))?;

            calendars.extend(page.items.into_iter().map(|entry| CalendarInfo {
                id: entry.id,
                name: entry.summary.unwrap_or_default(),
                timezone: entry.time_zone,
                color: entry.background_color,
                primary: entry.primary.unwrap_or(false),
            }));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(count = calendars.len(), "listed Google calendars");
        Ok(calendars)
    }

    /// Lists events, incrementally with a sync token or fully over a time
    /// range, following pagination to the end so the `nextSyncToken` on
    /// the last page is captured.
    pub async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        options: &ListEventsOptions,
    ) -> ProviderResult<EventBatch> {
        let url = format!(
            "{}/calendars/{}/events",
            self.base_url,
            urlencoding::encode(calendar_id)
        );

        let mut events = Vec::new();
        let mut next_sync_token = None;
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(&url)
                .bearer_auth(access_token)
                .query(&[("maxResults", PAGE_SIZE.to_string())]);

            match options.sync_token {
                Some(ref token) => {
                    request = request.query(&[("syncToken", token.as_str())]);
                }
                None => {
                    // Recurring events are expanded server-side so each
                    // instance lands as its own row.
                    request = request.query(&[("singleEvents", "true")]);
                    if let Some(time_min) = options.time_min {
                        request = request.query(&[("timeMin", time_min.to_rfc3339())]);
                    }
                    if let Some(time_max) = options.time_max {
                        request = request.query(&[("timeMax", time_max.to_rfc3339())]);
                    }
                }
            }
            if let Some(ref token) = page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = send(request).await?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| ProviderError::network(format!("failed to read response: {e}")))?;

            if status.as_u16() == 410
                || (!status.is_success() && body.contains("fullSyncRequired"))
            {
                return Err(ProviderError::sync_token_invalid(
                    "server requires a full sync",
                )
                .with_http_status(status.as_u16()));
            }
            check_status(status, &body)?;

            let page: EventListResponse = serde_json::from_str(&body)
                .map_err(|e| ProviderError::invalid_response(format!("event list: {e}")))?;

            for item in page.items {
                match convert_event(item) {
                    Some(event) => events.push(event),
                    None => warn!("skipping Google event without usable identity"),
                }
            }

            if page.next_sync_token.is_some() {
                next_sync_token = page.next_sync_token;
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(
            calendar = %calendar_id,
            count = events.len(),
            incremental = options.sync_token.is_some(),
            "listed Google events"
        );
        Ok(EventBatch {
            events,
            next_sync_token,
        })
    }

    /// Registers a push-notification channel for a calendar.
    pub async fn watch_calendar(
        &self,
        access_token: &str,
        calendar_id: &str,
        address: &str,
        token: &str,
    ) -> ProviderResult<WatchResponse> {
        let url = format!(
            "{}/calendars/{}/events/watch",
            self.base_url,
            urlencoding::encode(calendar_id)
        );
        let channel_id = generate_channel_id();

        let request = self.http.post(&url).bearer_auth(access_token).json(&json!({
            "id": channel_id,
            "type": "web_hook",
            "address": address,
            "token": token,
        }));

        let body = check_response(send(request).await?).await?;
        let channel: ChannelResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::invalid_response(format!("watch response: {e}")))?;

        Ok(WatchResponse {
            channel_id: channel.id,
            resource_id: channel.resource_id,
            expiration: channel
                .expiration
                .and_then(|ms| ms.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        })
    }

    /// Stops an active push-notification channel.
    pub async fn stop_channel(
        &self,
        access_token: &str,
        channel_id: &str,
        resource_id: &str,
    ) -> ProviderResult<()> {
        let url = format!("{}/channels/stop", self.base_url);
        let request = self.http.post(&url).bearer_auth(access_token).json(&json!({
            "id": channel_id,
            "resourceId": resource_id,
        }));

        let response = send(request).await?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            // A channel already gone is a success for teardown.
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        check_status(status, &body)?;
        Ok(())
    }
}

async fn send(request: reqwest::RequestBuilder) -> ProviderResult<reqwest::Response> {
    request.send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::network("request timeout")
        } else {
            ProviderError::network(format!("request failed: {e}"))
        }
    })
}

async fn check_response(response: reqwest::Response) -> ProviderResult<String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ProviderError::network(format!("failed to read response: {e}")))?;
    check_status(status, &body)?;
    Ok(body)
}

fn check_status(status: reqwest::StatusCode, body: &str) -> ProviderResult<()> {
    match status.as_u16() {
        s if (200..300).contains(&s) => Ok(()),
        401 => Err(
            ProviderError::authentication("access token expired or invalid").with_http_status(401),
        ),
        403 if body.contains("RateLimitExceeded") => {
            Err(ProviderError::rate_limited("rate limit exceeded").with_http_status(403))
        }
        403 => Err(ProviderError::authorization("access denied").with_http_status(403)),
        404 => Err(ProviderError::not_found("calendar not found").with_http_status(404)),
        429 => Err(ProviderError::rate_limited("too many requests").with_http_status(429)),
        s if s >= 500 => {
            Err(ProviderError::server(format!("API error ({s}): {body}")).with_http_status(s))
        }
        s => Err(
            ProviderError::invalid_response(format!("unexpected status {s}: {body}"))
                .with_http_status(s),
        ),
    }
}

/// Converts an API event to a provider event. Cancelled events come back
/// as tombstones with no times; anything else without a start is dropped.
fn convert_event(event: ApiEvent) -> Option<ProviderEvent> {
    let id = event.id.clone()?;

    if event.status.as_deref() == Some("cancelled") {
        let mut tombstone = ProviderEvent::cancelled(id);
        tombstone.recurrence_id = event
            .original_start_time
            .as_ref()
            .and_then(api_time_to_string);
        return Some(tombstone);
    }

    let raw = serde_json::to_value(&event).ok();

    let mut parsed = ProviderEvent::new(id);
    parsed.recurrence_id = event
        .original_start_time
        .as_ref()
        .and_then(api_time_to_string);
    parsed.etag = event.etag.map(|e| e.trim_matches('"').to_string());
    parsed.status = event
        .status
        .as_deref()
        .map(EventStatus::parse)
        .unwrap_or_default();
    parsed.title = event.summary;
    parsed.description = event.description;
    parsed.location = event.location;
    parsed.timezone = event.start.as_ref().and_then(|t| t.time_zone.clone());
    parsed.start = event.start.as_ref().and_then(api_time_to_event_time);
    parsed.end = event.end.as_ref().and_then(api_time_to_event_time);
    parsed.updated = event
        .updated
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    parsed.raw = raw;

    if parsed.start.is_none() {
        warn!(id = %parsed.id, "event has no start time");
        return None;
    }
    Some(parsed)
}

fn api_time_to_event_time(time: &ApiEventTime) -> Option<EventTime> {
    if let Some(ref date_time) = time.date_time {
        let parsed = DateTime::parse_from_rfc3339(date_time).ok()?;
        return Some(EventTime::DateTime(parsed.with_timezone(&Utc)));
    }
    if let Some(ref date) = time.date {
        let parsed = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        return Some(EventTime::Date(parsed));
    }
    None
}

fn api_time_to_string(time: &ApiEventTime) -> Option<String> {
    time.date_time.clone().or_else(|| time.date.clone())
}

fn generate_channel_id() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Deserialize)]
struct CalendarListResponse {
    #[serde(default)]
    items: Vec<CalendarListEntry>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CalendarListEntry {
    id: String,
    summary: Option<String>,
    #[serde(rename = "timeZone")]
    time_zone: Option<String>,
    #[serde(rename = "backgroundColor")]
    background_color: Option<String>,
    primary: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct EventListResponse {
    #[serde(default)]
    items: Vec<ApiEvent>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "nextSyncToken")]
    next_sync_token: Option<String>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct ApiEvent {
    id: Option<String>,
    etag: Option<String>,
    status: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    start: Option<ApiEventTime>,
    end: Option<ApiEventTime>,
    updated: Option<String>,
    #[serde(rename = "recurringEventId")]
    recurring_event_id: Option<String>,
    #[serde(rename = "originalStartTime")]
    original_start_time: Option<ApiEventTime>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct ApiEventTime {
    date: Option<String>,
    #[serde(rename = "dateTime")]
    date_time: Option<String>,
    #[serde(rename = "timeZone")]
    time_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelResponse {
    id: String,
    #[serde(rename = "resourceId")]
    resource_id: String,
    expiration: Option<String>,
}
