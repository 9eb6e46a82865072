//! CalDAV provider: WebDAV discovery, iCalendar parsing, and incremental
//! synchronization via sync-collection reports.

pub mod auth;
pub mod client;
pub mod ics;
pub mod provider;
pub mod xml;

pub use client::DavClient;
pub use provider::{CalDavProvider, Discovery};
