//! iCalendar (RFC 5545) parsing.
//!
//! Parses the VEVENT subset needed for synchronization: content-line
//! unfolding, property parameters, text escapes, and the three datetime
//! forms (date, UTC, and TZID-qualified local time resolved through the
//! IANA timezone database).

use chrono::{LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::event::{EventStatus, EventTime, ProviderEvent};

/// Parses ICS content and extracts its VEVENTs as provider events.
///
/// A resource can hold several VEVENTs sharing one UID (a recurrence master
/// plus overrides); each comes back as its own event, distinguished by
/// `recurrence_id`.
pub fn parse_ics_events(ics: &str) -> Vec<ProviderEvent> {
    let lines = unfold_lines(ics);

    let mut events = Vec::new();
    let mut current: Option<Vec<ContentLine>> = None;

    for line in &lines {
        if line.eq_ignore_ascii_case("BEGIN:VEVENT") {
            current = Some(Vec::new());
            continue;
        }
        if line.eq_ignore_ascii_case("END:VEVENT") {
            if let Some(props) = current.take() {
                match build_event(&props) {
                    Some(event) => events.push(event),
                    None => warn!("skipping VEVENT without a UID"),
                }
            }
            continue;
        }
        if let Some(ref mut props) = current {
            if let Some(parsed) = ContentLine::parse(line) {
                props.push(parsed);
            }
        }
    }

    debug!(count = events.len(), "parsed events from ICS");
    events
}

/// A parsed content line: `NAME;PARAM=value;PARAM="quoted":value`.
#[derive(Debug)]
struct ContentLine {
    name: String,
    params: Vec<(String, String)>,
    value: String,
}

impl ContentLine {
    fn parse(line: &str) -> Option<Self> {
        let mut name = String::new();
        let mut params = Vec::new();
        let mut chars = line.char_indices();
        let mut value_start = None;

        // Name runs to the first ';' or ':'.
        for (i, c) in chars.by_ref() {
            match c {
                ':' => {
                    value_start = Some(i + 1);
                    break;
                }
                ';' => break,
                _ => name.push(c),
            }
        }

        // Parameters, honoring quoted values which may contain ':' and ';'.
        while value_start.is_none() {
            let mut key = String::new();
            let mut val = String::new();
            let mut in_value = false;
            let mut quoted = false;
            let mut terminated = false;

            for (i, c) in chars.by_ref() {
                if quoted {
                    if c == '"' {
                        quoted = false;
                    } else {
                        val.push(c);
                    }
                    continue;
                }
                match c {
                    '"' if in_value => quoted = true,
                    '=' if !in_value => in_value = true,
                    ';' => {
                        terminated = true;
                        break;
                    }
                    ':' => {
                        value_start = Some(i + 1);
                        terminated = true;
                        break;
                    }
                    _ => {
                        if in_value {
                            val.push(c);
                        } else {
                            key.push(c);
                        }
                    }
                }
            }
            if !key.is_empty() {
                params.push((key.to_ascii_uppercase(), val));
            }
            if !terminated {
                // Ran off the end without a ':' separator.
                return None;
            }
        }

        let value_start = value_start?;
        Some(Self {
            name: name.trim().to_ascii_uppercase(),
            params,
            value: line[value_start..].to_string(),
        })
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn build_event(props: &[ContentLine]) -> Option<ProviderEvent> {
    let find = |name: &str| props.iter().find(|p| p.name == name);

    let uid = find("UID")?.value.trim().to_string();

    let mut event = ProviderEvent::new(uid);
    event.recurrence_id = find("RECURRENCE-ID").map(|p| p.value.trim().to_string());
    event.title = find("SUMMARY").map(|p| unescape_text(&p.value));
    event.description = find("DESCRIPTION").map(|p| unescape_text(&p.value));
    event.location = find("LOCATION").map(|p| unescape_text(&p.value));

    if let Some(status) = find("STATUS") {
        event.status = EventStatus::parse(&status.value);
    }

    let start = find("DTSTART").and_then(parse_time_property);
    let end = find("DTEND").and_then(parse_time_property).or_else(|| {
        // No DTEND: apply DURATION when present, else the RFC 5545 defaults
        // (one day for dates, zero length for datetimes).
        let start = start.as_ref()?;
        if let Some(duration) = find("DURATION").and_then(|p| parse_duration(&p.value)) {
            return Some(add_duration(start, duration));
        }
        Some(match start {
            EventTime::Date(date) => EventTime::Date(date.succ_opt()?),
            EventTime::DateTime(dt) => EventTime::DateTime(*dt),
        })
    });
    event.timezone = find("DTSTART")
        .and_then(|p| p.param("TZID"))
        .map(normalize_tzid_name);
    event.start = start;
    event.end = end;

    event.updated = find("LAST-MODIFIED")
        .or_else(|| find("DTSTAMP"))
        .and_then(|p| match parse_datetime_value(&p.value, None)? {
            EventTime::DateTime(dt) => Some(dt),
            EventTime::Date(_) => None,
        });

    Some(event)
}

fn parse_time_property(prop: &ContentLine) -> Option<EventTime> {
    if prop.param("VALUE") == Some("DATE") {
        let date = NaiveDate::parse_from_str(prop.value.trim(), "%Y%m%d").ok()?;
        return Some(EventTime::Date(date));
    }
    parse_datetime_value(&prop.value, prop.param("TZID"))
}

/// Parses an iCalendar date or datetime value.
///
/// - `20250210` becomes a date
/// - `20250205T100000Z` is UTC
/// - `20250205T100000+0200` carries a numeric offset, converted to UTC
/// - `20250205T100000` with a TZID is resolved through the IANA database;
///   without one it is a floating time, interpreted as UTC
pub fn parse_datetime_value(value: &str, tzid: Option<&str>) -> Option<EventTime> {
    let value = value.trim();

    if value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()) {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        return Some(EventTime::Date(date));
    }

    if let Some(stripped) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
        return Some(EventTime::DateTime(Utc.from_utc_datetime(&naive)));
    }

    // Some producers append a numeric UTC offset instead of a TZID.
    if let Ok(dt) = chrono::DateTime::parse_from_str(value, "%Y%m%dT%H%M%S%z") {
        return Some(EventTime::DateTime(dt.with_timezone(&Utc)));
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;

    if let Some(tzid) = tzid {
        if let Some(tz) = resolve_tzid(tzid) {
            let resolved = match tz.from_local_datetime(&naive) {
                LocalResult::Single(dt) => Some(dt),
                // DST fall-back repeats an hour; take the earlier mapping.
                LocalResult::Ambiguous(earliest, _) => Some(earliest),
                // Spring-forward gap; nudge past it.
                LocalResult::None => (naive + chrono::Duration::hours(1))
                    .and_local_timezone(tz)
                    .earliest(),
            };
            if let Some(dt) = resolved {
                return Some(EventTime::DateTime(dt.with_timezone(&Utc)));
            }
        }
        warn!(tzid, "unresolvable TZID, treating time as UTC");
    }

    Some(EventTime::DateTime(Utc.from_utc_datetime(&naive)))
}

/// Resolves a TZID parameter to an IANA timezone.
///
/// Some producers prefix the identifier with a path, as in
/// `/freeassociation.sourceforge.net/America/New_York`; suffixes are tried
/// segment by segment until one parses.
fn resolve_tzid(tzid: &str) -> Option<Tz> {
    let tzid = tzid.trim_matches('"');
    if let Ok(tz) = tzid.parse::<Tz>() {
        return Some(tz);
    }
    let segments: Vec<&str> = tzid.split('/').filter(|s| !s.is_empty()).collect();
    for start in 0..segments.len() {
        if let Ok(tz) = segments[start..].join("/").parse::<Tz>() {
            return Some(tz);
        }
    }
    None
}

fn normalize_tzid_name(tzid: &str) -> String {
    resolve_tzid(tzid)
        .map(|tz| tz.name().to_string())
        .unwrap_or_else(|| tzid.trim_matches('"').to_string())
}

/// Parses an RFC 5545 duration such as `P1D` or `PT1H30M`. Weeks, days,
/// hours, minutes, and seconds are supported; negative durations are not
/// meaningful for event lengths and are rejected.
fn parse_duration(value: &str) -> Option<chrono::Duration> {
    let value = value.trim();
    let rest = value.strip_prefix('P')?;

    let mut total = chrono::Duration::zero();
    let mut number = String::new();
    let mut in_time = false;

    for c in rest.chars() {
        match c {
            'T' => in_time = true,
            '0'..='9' => number.push(c),
            unit => {
                let n: i64 = number.parse().ok()?;
                number.clear();
                let span = match (unit, in_time) {
                    ('W', false) => chrono::Duration::weeks(n),
                    ('D', false) => chrono::Duration::days(n),
                    ('H', true) => chrono::Duration::hours(n),
                    ('M', true) => chrono::Duration::minutes(n),
                    ('S', true) => chrono::Duration::seconds(n),
                    _ => return None,
                };
                total += span;
            }
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(total)
}

fn add_duration(start: &EventTime, duration: chrono::Duration) -> EventTime {
    match start {
        EventTime::DateTime(dt) => EventTime::DateTime(*dt + duration),
        EventTime::Date(date) => {
            let days = duration.num_days().max(1);
            EventTime::Date(*date + chrono::Duration::days(days))
        }
    }
}

/// Unfolds content lines: a line starting with a space or tab continues
/// the previous line.
pub fn unfold_lines(ics: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in ics.lines() {
        if let Some(continuation) = raw.strip_prefix([' ', '\t']) {
            if let Some(last) = lines.last_mut() {
                last.push_str(continuation);
                continue;
            }
        }
        lines.push(raw.to_string());
    }
    lines
}

/// Reverses RFC 5545 text escaping: `\n` and `\N` become newlines, and
/// `\,` `\;` `\\` become the literal character.
pub fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(escaped) => out.push(escaped),
            None => out.push('\\'),
        }
    }
    out
}
