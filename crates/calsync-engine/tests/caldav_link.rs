//! End-to-end CalDAV flow against a mock server: link an account through
//! discovery, run a first sync, and exercise the sync-token fallback.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use calsync_core::{CalendarAccount, CalendarSubscription, Provider, SyncConfig, SyncWindow};
use calsync_engine::linking::CalDavLinkRequest;
use calsync_engine::memory::{
    MemoryAccountStore, MemoryCache, MemoryEventStore, MemorySubscriptionStore,
    MemoryWorkspaceStore,
};
use calsync_engine::store::{AccountStore, EventStore, SubscriptionStore};
use calsync_engine::{EngineStores, MemoryLockManager, SyncEngine, SyncOutcome};

struct Harness {
    engine: SyncEngine,
    accounts: Arc<MemoryAccountStore>,
    subscriptions: Arc<MemorySubscriptionStore>,
    events: Arc<MemoryEventStore>,
}

fn harness() -> Harness {
    let config = SyncConfig {
        allow_custom_provider: true,
        // The mock server listens on plain http on a loopback address.
        allow_insecure_http: true,
        block_private_network: false,
        ..SyncConfig::default()
    };
    let accounts = Arc::new(MemoryAccountStore::new());
    let subscriptions = Arc::new(MemorySubscriptionStore::new());
    let events = Arc::new(MemoryEventStore::new());
    let stores = EngineStores {
        accounts: accounts.clone(),
        subscriptions: subscriptions.clone(),
        events: events.clone(),
        workspaces: Arc::new(MemoryWorkspaceStore::new()),
        cache: Arc::new(MemoryCache::new()),
        locks: Arc::new(MemoryLockManager::new()),
    };
    let engine = SyncEngine::new(config, stores).unwrap();
    Harness {
        engine,
        accounts,
        subscriptions,
        events,
    }
}

async fn mount_discovery(server: &MockServer) {
    Mock::given(method("PROPFIND"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(207).set_body_string(
            r#"<multistatus xmlns="DAV:">
  <response>
    <href>/</href>
    <propstat>
      <prop>
        <current-user-principal><href>/principals/alice/</href></current-user-principal>
      </prop>
      <status>HTTP/1.1 200 OK</status>
    </propstat>
  </response>
</multistatus>"#,
        ))
        .mount(server)
        .await;
    Mock::given(method("PROPFIND"))
        .and(path("/principals/alice/"))
        .respond_with(ResponseTemplate::new(207).set_body_string(
            r#"<multistatus xmlns="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <response>
    <href>/principals/alice/</href>
    <propstat>
      <prop>
        <C:calendar-home-set><href>/calendars/alice/</href></C:calendar-home-set>
      </prop>
      <status>HTTP/1.1 200 OK</status>
    </propstat>
  </response>
</multistatus>"#,
        ))
        .mount(server)
        .await;
    Mock::given(method("PROPFIND"))
        .and(path("/calendars/alice/"))
        .respond_with(ResponseTemplate::new(207).set_body_string(
            r#"<multistatus xmlns="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <response>
    <href>/calendars/alice/default/</href>
    <propstat>
      <prop>
        <displayname>Default</displayname>
        <resourcetype><collection/><C:calendar/></resourcetype>
      </prop>
      <status>HTTP/1.1 200 OK</status>
    </propstat>
  </response>
</multistatus>"#,
        ))
        .mount(server)
        .await;
}

/// A full query result with three event rows across two resources: an
/// all-day event, and a timed recurring event with one moved instance.
const FULL_QUERY_BODY: &str = r#"<?xml version="1.0"?>
<multistatus xmlns="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <response>
    <href>/calendars/alice/default/offsite.ics</href>
    <propstat>
      <prop>
        <getetag>"etag-offsite"</getetag>
        <C:calendar-data>BEGIN:VCALENDAR
BEGIN:VEVENT
UID:offsite@example.com
DTSTART;VALUE=DATE:20250101
DTEND;VALUE=DATE:20250102
SUMMARY:Offsite
END:VEVENT
END:VCALENDAR</C:calendar-data>
      </prop>
      <status>HTTP/1.1 200 OK</status>
    </propstat>
  </response>
  <response>
    <href>/calendars/alice/default/standup.ics</href>
    <propstat>
      <prop>
        <getetag>"etag-standup"</getetag>
        <C:calendar-data>BEGIN:VCALENDAR
BEGIN:VEVENT
UID:standup@example.com
DTSTART;TZID=America/Los_Angeles:20250103T090000
DTEND;TZID=America/Los_Angeles:20250103T093000
SUMMARY:Standup
END:VEVENT
BEGIN:VEVENT
UID:standup@example.com
RECURRENCE-ID;TZID=America/Los_Angeles:20250110T090000
DTSTART;TZID=America/Los_Angeles:20250110T100000
DTEND;TZID=America/Los_Angeles:20250110T103000
SUMMARY:Standup (moved)
END:VEVENT
END:VCALENDAR</C:calendar-data>
      </prop>
      <status>HTTP/1.1 200 OK</status>
    </propstat>
  </response>
</multistatus>"#;

fn sync_token_body(token: &str) -> String {
    format!(
        r#"<multistatus xmlns="DAV:">
  <response>
    <href>/calendars/alice/default/</href>
    <propstat>
      <prop><sync-token>{token}</sync-token></prop>
      <status>HTTP/1.1 200 OK</status>
    </propstat>
  </response>
</multistatus>"#
    )
}

#[tokio::test]
async fn link_then_sync_mirrors_events() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("REPORT"))
        .and(path("/calendars/alice/default/"))
        .and(body_string_contains("calendar-query"))
        .respond_with(ResponseTemplate::new(207).set_body_string(FULL_QUERY_BODY))
        .mount(&server)
        .await;
    Mock::given(method("PROPFIND"))
        .and(path("/calendars/alice/default/"))
        .and(header("Depth", "0"))
        .respond_with(ResponseTemplate::new(207).set_body_string(sync_token_body("sync-1")))
        .mount(&server)
        .await;

    let h = harness();
    let account = h
        .engine
        .link_caldav_account(
            "user-1",
            CalDavLinkRequest {
                preset_id: None,
                server_url: Some(server.uri()),
                username: "alice".into(),
                password: "app-password".into(),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        account.provider_account_id,
        format!("{}/principals/alice/", server.uri())
    );
    assert_eq!(
        account.calendar_home_url.as_deref(),
        Some(format!("{}/calendars/alice/", server.uri()).as_str())
    );

    let subs = h.subscriptions.list_for_account(&account.id).await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].display_name.as_deref(), Some("Default"));

    let outcome = h.engine.sync_subscription(&subs[0].id).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Synced {
            upserted: 3,
            deleted: 0,
            incremental: false
        }
    );

    let window = SyncWindow::new(
        Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2025, 12, 31, 0, 0, 0).unwrap(),
    );
    let rows = h
        .events
        .list_window(&[subs[0].id.clone()], window)
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);

    // All-day events bound whole UTC days.
    let offsite = &rows[0];
    assert_eq!(offsite.title.as_deref(), Some("Offsite"));
    assert!(offsite.all_day);
    assert_eq!(offsite.start_at_utc.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    assert_eq!(offsite.end_at_utc.to_rfc3339(), "2025-01-02T00:00:00+00:00");

    // 09:00 Pacific standard time is 17:00 UTC.
    let standup = &rows[1];
    assert_eq!(standup.title.as_deref(), Some("Standup"));
    assert!(standup.recurrence_id.is_none());
    assert_eq!(standup.start_at_utc.to_rfc3339(), "2025-01-03T17:00:00+00:00");
    assert_eq!(
        standup.original_timezone.as_deref(),
        Some("America/Los_Angeles")
    );

    // The moved instance keeps the same resource href but carries the
    // recurrence id of the slot it overrides.
    let moved = &rows[2];
    assert_eq!(moved.title.as_deref(), Some("Standup (moved)"));
    assert_eq!(moved.external_event_id, standup.external_event_id);
    assert!(moved.recurrence_id.is_some());
    assert_eq!(moved.start_at_utc.to_rfc3339(), "2025-01-10T18:00:00+00:00");

    let sub = h.subscriptions.get(&subs[0].id).await.unwrap().unwrap();
    assert_eq!(sub.sync_token.as_deref(), Some("sync-1"));
}

#[tokio::test]
async fn rejected_sync_token_falls_back_to_full_query() {
    let server = MockServer::start().await;
    // The incremental report rejects the stale cursor outright.
    Mock::given(method("REPORT"))
        .and(path("/calendars/alice/default/"))
        .and(body_string_contains("sync-collection"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("REPORT"))
        .and(path("/calendars/alice/default/"))
        .and(body_string_contains("calendar-query"))
        .respond_with(ResponseTemplate::new(207).set_body_string(FULL_QUERY_BODY))
        .mount(&server)
        .await;
    Mock::given(method("PROPFIND"))
        .and(path("/calendars/alice/default/"))
        .and(header("Depth", "0"))
        .respond_with(ResponseTemplate::new(207).set_body_string(sync_token_body("sync-fresh")))
        .mount(&server)
        .await;

    let h = harness();
    let mut account = CalendarAccount::new("acct-1", "user-1", Provider::CalDav, "principal");
    account.server_url = Some(server.uri());
    account.username = Some("alice".into());
    account.access_token = Some("app-password".into());
    h.accounts.save(&account).await.unwrap();

    let calendar_url = format!("{}/calendars/alice/default/", server.uri());
    let mut subscription = CalendarSubscription::new("sub-1", "acct-1", calendar_url);
    subscription.sync_token = Some("stale".into());
    h.subscriptions.save(&subscription).await.unwrap();

    let outcome = h.engine.sync_subscription("sub-1").await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Synced {
            upserted: 3,
            deleted: 0,
            incremental: false
        }
    );

    let sub = h.subscriptions.get("sub-1").await.unwrap().unwrap();
    assert_eq!(sub.sync_token.as_deref(), Some("sync-fresh"));
    assert_eq!(h.events.len(), 3);
}
