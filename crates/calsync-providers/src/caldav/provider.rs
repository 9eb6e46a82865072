//! CalDAV calendar provider.
//!
//! Discovery walks the RFC 6764 pipeline: the configured server URL (with a
//! `/.well-known/caldav` fallback) yields the principal, the principal
//! yields the calendar home, and a Depth-1 PROPFIND on the home lists the
//! event-capable collections.
//!
//! Event listing is incremental when a sync token is available, falling
//! back to a full time-range calendar-query. Events are identified by
//! their resource href; a resource holding a recurrence master plus
//! overrides produces one event per VEVENT, distinguished by
//! `recurrence_id`.

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use calsync_core::model::{AuthType, CalendarAccount};

use crate::error::{ProviderError, ProviderResult};
use crate::event::{EventStatus, ProviderEvent};
use crate::policy::RequestPolicy;
use crate::provider::{BoxFuture, CalendarInfo, CalendarProvider, EventBatch, ListEventsOptions};

use super::client::DavClient;
use super::ics::parse_ics_events;
use super::xml::{
    DavResponse, calendar_multiget_body, calendar_query_body, parse_multistatus,
    propfind_collections_body, propfind_home_set_body, propfind_principal_body,
    propfind_sync_token_body, sync_collection_body,
};

const DEFAULT_LOOKBEHIND_DAYS: i64 = 90;
const DEFAULT_LOOKAHEAD_DAYS: i64 = 180;

/// Result of the discovery pipeline.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub principal_url: String,
    pub calendar_home_url: String,
    pub calendars: Vec<CalendarInfo>,
}

/// CalDAV provider. One instance serves all accounts; each call builds a
/// client from the account's credentials.
pub struct CalDavProvider {
    policy: RequestPolicy,
}

impl CalDavProvider {
    pub fn new(policy: RequestPolicy) -> Self {
        Self { policy }
    }

    fn client(&self, account: &CalendarAccount, password: &str) -> ProviderResult<DavClient> {
        let username = account.username.clone().unwrap_or_default();
        DavClient::new(self.policy.clone(), username, password, account.auth_type)
    }

    fn server_url<'a>(&self, account: &'a CalendarAccount) -> ProviderResult<&'a str> {
        account
            .server_url
            .as_deref()
            .ok_or_else(|| ProviderError::configuration("account has no CalDAV server URL"))
    }

    /// Runs the full discovery pipeline for an account.
    pub async fn discover(
        &self,
        account: &CalendarAccount,
        password: &str,
    ) -> ProviderResult<Discovery> {
        let mut client = self.client(account, password)?;
        let base = self.server_url(account)?;

        let principal_url = self.discover_principal(&mut client, base).await?;
        let home_url = self.discover_home(&mut client, base, &principal_url).await?;
        let calendars = self.discover_collections(&mut client, base, &home_url).await?;

        info!(
            principal = %principal_url,
            home = %home_url,
            calendars = calendars.len(),
            "completed CalDAV discovery"
        );

        Ok(Discovery {
            principal_url,
            calendar_home_url: home_url,
            calendars,
        })
    }

    async fn discover_principal(
        &self,
        client: &mut DavClient,
        base: &str,
    ) -> ProviderResult<String> {
        let body = propfind_principal_body();

        if let Some(href) = principal_from_propfind(client, base, &body).await {
            return Ok(resolve_href(base, &href));
        }

        // Servers rooted elsewhere advertise the service at the well-known
        // path on the same origin.
        let well_known = resolve_href(base, "/.well-known/caldav");
        debug!(url = %well_known, "principal not at base URL, trying well-known path");
        if let Some(href) = principal_from_propfind(client, &well_known, &body).await {
            return Ok(resolve_href(base, &href));
        }

        Err(ProviderError::not_found(
            "could not discover a CalDAV principal at this server URL",
        ))
    }

    async fn discover_home(
        &self,
        client: &mut DavClient,
        base: &str,
        principal_url: &str,
    ) -> ProviderResult<String> {
        let body = propfind_home_set_body();
        let response = client.propfind(principal_url, &body, 0).await?;
        let parsed = parse_multistatus(&response);

        parsed
            .responses
            .iter()
            .find_map(|r| r.props.calendar_home_set.clone())
            .map(|href| resolve_href(base, &href))
            .ok_or_else(|| {
                ProviderError::not_found("principal has no calendar home collection")
            })
    }

    async fn discover_collections(
        &self,
        client: &mut DavClient,
        base: &str,
        home_url: &str,
    ) -> ProviderResult<Vec<CalendarInfo>> {
        let body = propfind_collections_body();
        let response = client.propfind(home_url, &body, 1).await?;
        let parsed = parse_multistatus(&response);

        let calendars: Vec<CalendarInfo> = parsed
            .responses
            .into_iter()
            .filter(|r| r.props.is_calendar && r.props.vevent_capable())
            .map(|r| {
                let href = resolve_href(base, &r.href);
                CalendarInfo {
                    name: r.props.display_name.unwrap_or_else(|| href.clone()),
                    id: href,
                    timezone: None,
                    color: r.props.color,
                    primary: false,
                }
            })
            .collect();

        if calendars.is_empty() {
            return Err(ProviderError::not_found(
                "calendar home contains no event calendars",
            ));
        }
        Ok(calendars)
    }

    /// Incremental listing via a sync-collection REPORT.
    async fn list_incremental(
        &self,
        client: &mut DavClient,
        calendar_url: &str,
        sync_token: &str,
    ) -> ProviderResult<EventBatch> {
        let body = sync_collection_body(sync_token);
        let (status, response) = client.report_raw(calendar_url, &body).await?;

        match status {
            207 => {}
            // The token is no longer usable; caller falls back to a full
            // query. 501 covers servers without sync-collection at all.
            403 | 404 | 409 | 410 | 501 => {
                return Err(ProviderError::sync_token_invalid(format!(
                    "server rejected sync token with status {status}"
                ))
                .with_http_status(status));
            }
            401 => {
                return Err(ProviderError::authentication(
                    "authentication failed: invalid credentials",
                )
                .with_http_status(401));
            }
            429 => {
                return Err(ProviderError::rate_limited("too many requests").with_http_status(429));
            }
            s if s >= 500 => {
                return Err(
                    ProviderError::server(format!("server error ({s})")).with_http_status(s)
                );
            }
            s => {
                return Err(ProviderError::invalid_response(format!(
                    "unexpected sync-collection status {s}"
                ))
                .with_http_status(s));
            }
        }

        let parsed = parse_multistatus(&response);
        let next_sync_token = parsed.sync_token.clone();
        let mut events = Vec::new();
        let mut missing_data: Vec<String> = Vec::new();

        for member in &parsed.responses {
            if member.is_tombstone() {
                // Deleted resource; one cancelled event with no recurrence
                // id removes every row stored under this href.
                events.push(ProviderEvent::cancelled(member.href.clone()));
                continue;
            }
            match member.props.calendar_data {
                Some(ref ics) => events.extend(events_from_resource(member, ics)),
                // Some servers omit calendar-data from sync reports.
                None => missing_data.push(member.href.clone()),
            }
        }

        if !missing_data.is_empty() {
            debug!(
                count = missing_data.len(),
                "fetching members omitted from sync report via multiget"
            );
            let hrefs: Vec<&str> = missing_data.iter().map(String::as_str).collect();
            let body = calendar_multiget_body(&hrefs);
            let response = client.report(calendar_url, &body).await?;
            for member in parse_multistatus(&response).responses {
                if let Some(ref ics) = member.props.calendar_data {
                    events.extend(events_from_resource(&member, ics));
                }
            }
        }

        Ok(EventBatch {
            events,
            next_sync_token,
        })
    }

    /// Full listing via a time-range calendar-query, followed by a
    /// sync-token PROPFIND so the next cycle can be incremental.
    async fn list_full(
        &self,
        client: &mut DavClient,
        calendar_url: &str,
        options: &ListEventsOptions,
    ) -> ProviderResult<EventBatch> {
        let now = Utc::now();
        let start = options
            .time_min
            .unwrap_or_else(|| now - Duration::days(DEFAULT_LOOKBEHIND_DAYS));
        let end = options
            .time_max
            .unwrap_or_else(|| now + Duration::days(DEFAULT_LOOKAHEAD_DAYS));

        let body = calendar_query_body(start, end);
        let response = client.report(calendar_url, &body).await?;
        let parsed = parse_multistatus(&response);

        let mut events = Vec::new();
        for member in &parsed.responses {
            if let Some(ref ics) = member.props.calendar_data {
                events.extend(events_from_resource(member, ics));
            }
        }

        // Best effort: a server without sync-collection support just keeps
        // the subscription on full queries.
        let next_sync_token = match client
            .propfind(calendar_url, &propfind_sync_token_body(), 0)
            .await
        {
            Ok(response) => parse_multistatus(&response)
                .responses
                .iter()
                .find_map(|r| r.props.sync_token.clone()),
            Err(err) => {
                debug!(error = %err, "collection does not expose a sync token");
                None
            }
        };

        Ok(EventBatch {
            events,
            next_sync_token,
        })
    }
}

impl CalendarProvider for CalDavProvider {
    fn name(&self) -> &str {
        "caldav"
    }

    fn list_calendars<'a>(
        &'a self,
        account: &'a CalendarAccount,
        access_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Vec<CalendarInfo>>> {
        Box::pin(async move {
            // Reuse the cached home URL when linking already resolved it.
            if let Some(ref home_url) = account.calendar_home_url {
                let mut client = self.client(account, access_token)?;
                let base = self.server_url(account)?;
                return self.discover_collections(&mut client, base, home_url).await;
            }
            Ok(self.discover(account, access_token).await?.calendars)
        })
    }

    fn list_events<'a>(
        &'a self,
        account: &'a CalendarAccount,
        access_token: &'a str,
        calendar_id: &'a str,
        options: ListEventsOptions,
    ) -> BoxFuture<'a, ProviderResult<EventBatch>> {
        Box::pin(async move {
            let mut client = self.client(account, access_token)?;

            match options.sync_token {
                Some(ref token) => {
                    debug!(calendar = %calendar_id, "incremental CalDAV sync");
                    self.list_incremental(&mut client, calendar_id, token).await
                }
                None => {
                    debug!(calendar = %calendar_id, "full CalDAV query");
                    self.list_full(&mut client, calendar_id, &options).await
                }
            }
        })
    }
}

/// Expands a calendar resource into provider events. The resource href is
/// the event identity; VEVENT overrides carry their RECURRENCE-ID.
fn events_from_resource(member: &DavResponse, ics: &str) -> Vec<ProviderEvent> {
    let parsed = parse_ics_events(ics);
    if parsed.is_empty() {
        warn!(href = %member.href, "calendar resource contained no parsable VEVENT");
    }

    parsed
        .into_iter()
        .map(|mut event| {
            let uid = std::mem::replace(&mut event.id, member.href.clone());
            event.etag = member.props.etag.clone();
            event.raw = Some(json!({ "uid": uid, "href": member.href }));
            event
        })
        .collect()
}

/// Resolves a possibly relative href against the account's server URL.
fn resolve_href(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    url::Url::parse(base)
        .and_then(|b| b.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

async fn principal_from_propfind(client: &mut DavClient, url: &str, body: &str) -> Option<String> {
    match client.propfind(url, body, 0).await {
        Ok(response) => parse_multistatus(&response)
            .responses
            .iter()
            .find_map(|r| r.props.current_user_principal.clone()),
        Err(err) => {
            debug!(url, error = %err, "principal PROPFIND failed");
            None
        }
    }
}
