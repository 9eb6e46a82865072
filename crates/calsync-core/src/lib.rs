//! Core types for the calendar synchronization engine.
//!
//! This crate holds everything the provider adapters and the orchestrator
//! share without depending on each other:
//!
//! - [`model`] - the persisted data model (accounts, subscriptions, events,
//!   workspace calendars)
//! - [`config`] - the configuration surface consumed by the policy guard,
//!   the adapters, and the orchestrator
//! - [`time`] - sync time-window helpers
//! - [`tracing`] - unified tracing/logging setup

pub mod config;
pub mod model;
pub mod time;
pub mod tracing;

pub use config::{CalDavPreset, GoogleOAuthSettings, SyncConfig};
pub use model::{
    AccountStatus, AuthType, CalendarAccount, CalendarEvent, CalendarSubscription, Provider,
    WorkspaceCalendar, WorkspaceCalendarItem,
};
pub use time::SyncWindow;
pub use tracing::{init_tracing, TracingConfig, TracingError, TracingOutputFormat};
