//! Calendar provider abstraction and implementations.
//!
//! This crate provides everything between the sync orchestrator and the
//! network:
//!
//! - [`CalendarProvider`] - the core trait both backends implement, with
//!   optional [`OAuthCapable`]/[`WebhookCapable`] capability traits
//! - [`policy`] - the request policy guard validating every outbound URL
//!   (scheme, host allowlist, private-network exposure) and chasing
//!   redirects manually
//! - [`caldav`] - WebDAV/iCalendar adapter with Basic/Digest negotiation
//! - [`google`] - Google Calendar REST adapter with OAuth and push channels
//! - [`ProviderError`] - error taxonomy shared by all of the above
//!
//! # Architecture
//!
//! ```text
//! orchestrator
//!     │
//!     ▼
//! CalendarProvider ──► GoogleProvider ──► reqwest ──► Google APIs
//!     │
//!     └──────────────► CalDavProvider ──► PolicyClient ──► any server
//!                          │
//!                   xml / ics parsers
//! ```
//!
//! The CalDAV adapter talks to arbitrary user-supplied servers, so every
//! request goes through the policy guard. The Google adapter only ever
//! talks to fixed Google endpoints.

pub mod caldav;
pub mod error;
pub mod event;
pub mod google;
pub mod policy;
pub mod provider;

pub use caldav::CalDavProvider;
pub use error::{ProviderError, ProviderErrorCode, ProviderResult};
pub use google::GoogleProvider;
pub use event::{EventStatus, EventTime, ProviderEvent};
pub use policy::{PolicyClient, PolicyViolation, RequestPolicy, SsrfCheckOptions};
pub use provider::{
    AccountProfile, BoxFuture, CalendarInfo, CalendarProvider, EventBatch, ListEventsOptions,
    OAuthCapable, TokenResponse, WatchResponse, WebhookCapable,
};
