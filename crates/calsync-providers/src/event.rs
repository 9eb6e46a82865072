//! Provider-agnostic event data.
//!
//! Both adapters produce [`ProviderEvent`] values; the orchestrator converts
//! them into stored rows. Cancelled events act as deletion tombstones and
//! may carry no times at all.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The time specification of an event boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum EventTime {
    /// A specific instant, already resolved to UTC.
    DateTime(DateTime<Utc>),
    /// An all-day boundary (no wall-clock time).
    Date(NaiveDate),
}

impl EventTime {
    /// Returns true if this is an all-day boundary.
    pub fn is_all_day(&self) -> bool {
        matches!(self, Self::Date(_))
    }

    /// Resolves the boundary to a UTC instant. All-day dates map to UTC
    /// midnight, matching how DTSTART/DTEND date values bound a day.
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self {
            Self::DateTime(dt) => *dt,
            Self::Date(date) => Utc
                .from_utc_datetime(&date.and_time(NaiveTime::MIN)),
        }
    }
}

/// Event lifecycle status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    Confirmed,
    Tentative,
    /// The row must be deleted from the local mirror, never stored.
    Cancelled,
}

impl EventStatus {
    /// Parses a provider status string (`CONFIRMED`, `cancelled`, ...).
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "cancelled" | "canceled" => Self::Cancelled,
            "tentative" => Self::Tentative,
            _ => Self::Confirmed,
        }
    }

    /// Returns the stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Tentative => "tentative",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One event (or recurrence override, or cancellation tombstone) as returned
/// by a provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEvent {
    /// Stable external id: event id for Google, resource href for CalDAV.
    pub id: String,
    /// Set for a recurring-instance override.
    pub recurrence_id: Option<String>,
    pub etag: Option<String>,
    pub status: EventStatus,
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    /// Absent only on cancellation tombstones.
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
    /// Original IANA timezone, when the provider reported one.
    pub timezone: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    /// Opaque provider payload for debugging/replay.
    pub raw: Option<serde_json::Value>,
}

impl ProviderEvent {
    /// Creates an event with the given external id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            recurrence_id: None,
            etag: None,
            status: EventStatus::Confirmed,
            title: None,
            description: None,
            location: None,
            start: None,
            end: None,
            timezone: None,
            updated: None,
            raw: None,
        }
    }

    /// Creates a cancellation tombstone for the given external id.
    pub fn cancelled(id: impl Into<String>) -> Self {
        let mut event = Self::new(id);
        event.status = EventStatus::Cancelled;
        event
    }

    /// Returns true if this event deletes rather than stores a row.
    pub fn is_cancelled(&self) -> bool {
        self.status == EventStatus::Cancelled
    }

    /// Returns true if both boundaries are all-day dates.
    pub fn is_all_day(&self) -> bool {
        self.start.is_some_and(|t| t.is_all_day())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_day_maps_to_utc_midnight() {
        let time = EventTime::Date(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert!(time.is_all_day());
        assert_eq!(time.to_utc().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn status_parsing() {
        assert_eq!(EventStatus::parse("CANCELLED"), EventStatus::Cancelled);
        assert_eq!(EventStatus::parse("cancelled"), EventStatus::Cancelled);
        assert_eq!(EventStatus::parse("TENTATIVE"), EventStatus::Tentative);
        assert_eq!(EventStatus::parse("CONFIRMED"), EventStatus::Confirmed);
        assert_eq!(EventStatus::parse("anything"), EventStatus::Confirmed);
    }

    #[test]
    fn tombstone_has_no_times() {
        let event = ProviderEvent::cancelled("/cal/evt1.ics");
        assert!(event.is_cancelled());
        assert!(event.start.is_none());
        assert!(event.end.is_none());
    }
}
