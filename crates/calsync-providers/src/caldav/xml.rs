//! WebDAV XML bodies and multistatus parsing for CalDAV.
//!
//! Request bodies are built with quick-xml's writer so property names stay
//! correctly namespaced. Responses are parsed with a single multistatus
//! walker that honors propstat status codes: properties under a non-2xx
//! propstat are discarded when a 2xx propstat exists (falling back to the
//! first propstat otherwise), and a response-level status (as produced by
//! sync-collection for deleted members) is surfaced so callers can treat
//! the member as a tombstone.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

/// DAV namespace
pub const DAV_NS: &str = "DAV:";
/// CalDAV namespace
pub const CALDAV_NS: &str = "urn:ietf:params:xml:ns:caldav";
/// CalendarServer namespace (Apple extensions)
pub const CS_NS: &str = "http://calendarserver.org/ns/";
/// Apple iCal namespace (calendar-color)
pub const APPLE_NS: &str = "http://apple.com/ns/ical/";

/// A parsed `<multistatus>` document.
#[derive(Debug, Default)]
pub struct Multistatus {
    pub responses: Vec<DavResponse>,
    /// Top-level `<sync-token>` returned by sync-collection reports.
    pub sync_token: Option<String>,
}

/// One `<response>` element.
#[derive(Debug, Default)]
pub struct DavResponse {
    pub href: String,
    /// Response-level HTTP status, when present. sync-collection reports
    /// deleted members this way (404) with no propstat at all.
    pub status: Option<u16>,
    pub props: DavProps,
}

impl DavResponse {
    /// True when the server reported this member as gone.
    pub fn is_tombstone(&self) -> bool {
        self.status == Some(404)
    }
}

/// Properties extracted from the 2xx propstats of a response.
#[derive(Debug, Default, Clone)]
pub struct DavProps {
    pub display_name: Option<String>,
    pub is_calendar: bool,
    pub supports_vevent: bool,
    pub has_component_set: bool,
    pub etag: Option<String>,
    pub calendar_data: Option<String>,
    pub color: Option<String>,
    pub ctag: Option<String>,
    pub sync_token: Option<String>,
    pub current_user_principal: Option<String>,
    pub calendar_home_set: Option<String>,
}

impl DavProps {
    /// True when VEVENTs can live in this collection. Servers that omit
    /// the supported-calendar-component-set are assumed capable.
    pub fn vevent_capable(&self) -> bool {
        !self.has_component_set || self.supports_vevent
    }

    fn merge(&mut self, other: DavProps) {
        self.is_calendar |= other.is_calendar;
        self.supports_vevent |= other.supports_vevent;
        self.has_component_set |= other.has_component_set;
        merge_opt(&mut self.display_name, other.display_name);
        merge_opt(&mut self.etag, other.etag);
        merge_opt(&mut self.calendar_data, other.calendar_data);
        merge_opt(&mut self.color, other.color);
        merge_opt(&mut self.ctag, other.ctag);
        merge_opt(&mut self.sync_token, other.sync_token);
        merge_opt(&mut self.current_user_principal, other.current_user_principal);
        merge_opt(&mut self.calendar_home_set, other.calendar_home_set);
    }
}

fn merge_opt(target: &mut Option<String>, value: Option<String>) {
    if target.is_none() {
        *target = value;
    }
}

/// PROPFIND body requesting the authenticated principal.
pub fn propfind_principal_body() -> String {
    build_propfind(|writer| {
        write_empty_element(writer, "d:current-user-principal");
    })
}

/// PROPFIND body requesting the calendar home collection of a principal.
pub fn propfind_home_set_body() -> String {
    build_propfind(|writer| {
        write_empty_element(writer, "c:calendar-home-set");
    })
}

/// PROPFIND body requesting the properties used for calendar discovery.
pub fn propfind_collections_body() -> String {
    build_propfind(|writer| {
        write_empty_element(writer, "d:displayname");
        write_empty_element(writer, "d:resourcetype");
        write_empty_element(writer, "c:supported-calendar-component-set");
        write_empty_element(writer, "a:calendar-color");
        write_empty_element(writer, "cs:getctag");
    })
}

/// PROPFIND body requesting only the collection's sync token.
pub fn propfind_sync_token_body() -> String {
    build_propfind(|writer| {
        write_empty_element(writer, "d:sync-token");
    })
}

/// REPORT body for an incremental sync-collection query.
///
/// `sync_token` is the token from the previous cycle; pass an empty string
/// to request the server's initial state.
pub fn sync_collection_body(sync_token: &str) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    let mut root = BytesStart::new("d:sync-collection");
    root.push_attribute(("xmlns:d", DAV_NS));
    root.push_attribute(("xmlns:c", CALDAV_NS));
    write_start(&mut writer, root);

    write_text_element(&mut writer, "d:sync-token", sync_token);
    write_text_element(&mut writer, "d:sync-level", "1");

    write_start(&mut writer, BytesStart::new("d:prop"));
    write_empty_element(&mut writer, "d:getetag");
    write_empty_element(&mut writer, "c:calendar-data");
    write_end(&mut writer, "d:prop");

    write_end(&mut writer, "d:sync-collection");
    finish(writer)
}

/// REPORT body for a full calendar-query over a time range.
pub fn calendar_query_body(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    let mut root = BytesStart::new("c:calendar-query");
    root.push_attribute(("xmlns:d", DAV_NS));
    root.push_attribute(("xmlns:c", CALDAV_NS));
    write_start(&mut writer, root);

    write_start(&mut writer, BytesStart::new("d:prop"));
    write_empty_element(&mut writer, "d:getetag");
    write_empty_element(&mut writer, "c:calendar-data");
    write_end(&mut writer, "d:prop");

    write_start(&mut writer, BytesStart::new("c:filter"));
    let mut vcal = BytesStart::new("c:comp-filter");
    vcal.push_attribute(("name", "VCALENDAR"));
    write_start(&mut writer, vcal);
    let mut vevent = BytesStart::new("c:comp-filter");
    vevent.push_attribute(("name", "VEVENT"));
    write_start(&mut writer, vevent);

    let mut time_range = BytesStart::new("c:time-range");
    time_range.push_attribute(("start", format_caldav_datetime(start).as_str()));
    time_range.push_attribute(("end", format_caldav_datetime(end).as_str()));
    let _ = writer.write_event(Event::Empty(time_range));

    write_end(&mut writer, "c:comp-filter");
    write_end(&mut writer, "c:comp-filter");
    write_end(&mut writer, "c:filter");
    write_end(&mut writer, "c:calendar-query");
    finish(writer)
}

/// REPORT body fetching specific resources by href.
pub fn calendar_multiget_body(hrefs: &[&str]) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    let mut root = BytesStart::new("c:calendar-multiget");
    root.push_attribute(("xmlns:d", DAV_NS));
    root.push_attribute(("xmlns:c", CALDAV_NS));
    write_start(&mut writer, root);

    write_start(&mut writer, BytesStart::new("d:prop"));
    write_empty_element(&mut writer, "d:getetag");
    write_empty_element(&mut writer, "c:calendar-data");
    write_end(&mut writer, "d:prop");

    for href in hrefs {
        write_text_element(&mut writer, "d:href", href);
    }

    write_end(&mut writer, "c:calendar-multiget");
    finish(writer)
}

/// Parses a `<multistatus>` response body.
///
/// Namespace prefixes are ignored; elements are matched on local name,
/// which is how the WebDAV property set is unambiguous in practice.
pub fn parse_multistatus(xml: &str) -> Multistatus {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut result = Multistatus::default();
    let mut stack: Vec<String> = Vec::new();
    let mut response: Option<DavResponse> = None;
    // Properties and status of the propstat being read; committed on
    // </propstat> only when the status is 2xx (or absent). The first
    // non-2xx propstat is kept so a response where no propstat succeeded
    // still yields its properties.
    let mut pending_props = DavProps::default();
    let mut pending_status: Option<u16> = None;
    let mut fallback_props: Option<DavProps> = None;
    let mut committed = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let local = local_name_owned(e.name().as_ref());
                handle_open(&local, &e, &stack, &mut response, &mut pending_props);
                stack.push(local);
            }
            Ok(Event::Empty(e)) => {
                let local = local_name_owned(e.name().as_ref());
                handle_open(&local, &e, &stack, &mut response, &mut pending_props);
            }
            Ok(Event::End(e)) => {
                let local = local_name_owned(e.name().as_ref());
                stack.pop();
                match local.as_str() {
                    "propstat" => {
                        let ok = pending_status.is_none_or(|s| (200..300).contains(&s));
                        let props = std::mem::take(&mut pending_props);
                        if ok {
                            if let Some(ref mut resp) = response {
                                resp.props.merge(props);
                                committed = true;
                            }
                        } else if fallback_props.is_none() {
                            fallback_props = Some(props);
                        }
                        pending_status = None;
                    }
                    "response" => {
                        if let Some(mut resp) = response.take() {
                            if !committed {
                                if let Some(props) = fallback_props.take() {
                                    resp.props.merge(props);
                                }
                            }
                            if !resp.href.is_empty() {
                                result.responses.push(resp);
                            }
                        }
                        fallback_props = None;
                        committed = false;
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                handle_text(
                    text,
                    &stack,
                    &mut result,
                    &mut response,
                    &mut pending_props,
                    &mut pending_status,
                );
            }
            Ok(Event::CData(e)) => {
                let text = String::from_utf8_lossy(&e).to_string();
                handle_text(
                    text,
                    &stack,
                    &mut result,
                    &mut response,
                    &mut pending_props,
                    &mut pending_status,
                );
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    result
}

fn handle_open(
    local: &str,
    element: &BytesStart<'_>,
    stack: &[String],
    response: &mut Option<DavResponse>,
    pending_props: &mut DavProps,
) {
    match local {
        "response" => *response = Some(DavResponse::default()),
        "calendar" if in_element(stack, "resourcetype") => {
            pending_props.is_calendar = true;
        }
        "supported-calendar-component-set" => {
            pending_props.has_component_set = true;
        }
        "comp" if in_element(stack, "supported-calendar-component-set") => {
            let named_vevent = element.attributes().flatten().any(|attr| {
                attr.key.as_ref() == b"name" && attr.value.as_ref() == b"VEVENT"
            });
            pending_props.supports_vevent |= named_vevent;
        }
        _ => {}
    }
}

fn handle_text(
    text: String,
    stack: &[String],
    result: &mut Multistatus,
    response: &mut Option<DavResponse>,
    pending_props: &mut DavProps,
    pending_status: &mut Option<u16>,
) {
    let current = stack.last().map(String::as_str).unwrap_or("");
    let parent = stack
        .len()
        .checked_sub(2)
        .and_then(|i| stack.get(i))
        .map(String::as_str)
        .unwrap_or("");

    match current {
        "href" => match parent {
            "response" => {
                if let Some(resp) = response {
                    resp.href = text;
                }
            }
            "current-user-principal" => pending_props.current_user_principal = Some(text),
            "calendar-home-set" => pending_props.calendar_home_set = Some(text),
            _ => {}
        },
        "status" => {
            let code = parse_status_line(&text);
            match parent {
                "propstat" => *pending_status = code,
                "response" => {
                    if let Some(resp) = response {
                        resp.status = code;
                    }
                }
                _ => {}
            }
        }
        "displayname" => pending_props.display_name = Some(text),
        "getetag" => pending_props.etag = Some(text.trim_matches('"').to_string()),
        "calendar-data" => pending_props.calendar_data = Some(text),
        "calendar-color" => pending_props.color = Some(text),
        "getctag" => pending_props.ctag = Some(text),
        "sync-token" => {
            if parent == "multistatus" {
                result.sync_token = Some(text);
            } else {
                pending_props.sync_token = Some(text);
            }
        }
        _ => {}
    }
}

fn in_element(stack: &[String], name: &str) -> bool {
    stack.iter().any(|e| e == name)
}

/// Parses `HTTP/1.1 404 Not Found` into 404.
fn parse_status_line(line: &str) -> Option<u16> {
    line.split_whitespace().nth(1)?.parse().ok()
}

fn local_name_owned(name: &[u8]) -> String {
    let name = String::from_utf8_lossy(name);
    name.rsplit(':').next().unwrap_or(&name).to_string()
}

fn build_propfind(write_props: impl FnOnce(&mut Writer<Cursor<Vec<u8>>>)) -> String {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    let mut propfind = BytesStart::new("d:propfind");
    propfind.push_attribute(("xmlns:d", DAV_NS));
    propfind.push_attribute(("xmlns:c", CALDAV_NS));
    propfind.push_attribute(("xmlns:cs", CS_NS));
    propfind.push_attribute(("xmlns:a", APPLE_NS));
    write_start(&mut writer, propfind);

    write_start(&mut writer, BytesStart::new("d:prop"));
    write_props(&mut writer);
    write_end(&mut writer, "d:prop");

    write_end(&mut writer, "d:propfind");
    finish(writer)
}

fn write_start(writer: &mut Writer<Cursor<Vec<u8>>>, element: BytesStart<'_>) {
    let _ = writer.write_event(Event::Start(element));
}

fn write_end(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str) {
    let _ = writer.write_event(Event::End(BytesEnd::new(name)));
}

fn write_empty_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str) {
    let _ = writer.write_event(Event::Empty(BytesStart::new(name)));
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, text: &str) {
    write_start(writer, BytesStart::new(name));
    let _ = writer.write_event(Event::Text(BytesText::new(text)));
    write_end(writer, name);
}

fn finish(writer: Writer<Cursor<Vec<u8>>>) -> String {
    String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
}

/// Formats a datetime for CalDAV time-range filters (UTC basic format).
fn format_caldav_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}
