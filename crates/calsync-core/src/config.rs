//! Configuration surface for the sync engine.
//!
//! Consumed by the request policy guard, the provider adapters, and the
//! orchestrator. Loading (files, env) is wired by the embedding service.

use serde::Deserialize;
use std::time::Duration;

use crate::model::AuthType;

/// A pre-registered CalDAV server users may link against.
#[derive(Debug, Clone, Deserialize)]
pub struct CalDavPreset {
    pub id: String,
    pub label: String,
    pub server_url: String,
    #[serde(default)]
    pub auth_type: AuthType,
    /// Whether the provider requires an app-specific password (e.g. iCloud).
    #[serde(default)]
    pub requires_app_password: bool,
    pub docs_url: Option<String>,
}

/// Google OAuth client settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GoogleOAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// Top-level configuration for the calendar sync engine.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Master switch; linking and syncing fail fast when disabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether users may enter an arbitrary CalDAV server URL.
    #[serde(default)]
    pub allow_custom_provider: bool,
    /// Known CalDAV servers offered in the link flow.
    #[serde(default)]
    pub providers: Vec<CalDavPreset>,
    /// Permit plain-http CalDAV servers (testing only).
    #[serde(default)]
    pub allow_insecure_http: bool,
    /// Host allowlist for outbound CalDAV requests; empty means any host.
    /// Entries support a leading `*.` wildcard.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Reject outbound requests resolving to private/reserved addresses.
    #[serde(default = "default_true")]
    pub block_private_network: bool,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Days of history covered by a full sync.
    #[serde(default = "default_lookbehind_days")]
    pub lookbehind_days: i64,
    /// Days of future covered by a full sync.
    #[serde(default = "default_lookahead_days")]
    pub lookahead_days: i64,
    /// Externally reachable address push notifications are delivered to.
    /// Webhook channels are skipped entirely when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Shared secret echoed back by provider push notifications.
    /// Computed once at startup and injected; never lazily created.
    #[serde(default)]
    pub webhook_token: Option<String>,
    #[serde(default)]
    pub google: Option<GoogleOAuthSettings>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_custom_provider: false,
            providers: Vec::new(),
            allow_insecure_http: false,
            allowed_hosts: Vec::new(),
            block_private_network: true,
            request_timeout_ms: default_request_timeout_ms(),
            max_redirects: default_max_redirects(),
            lookbehind_days: default_lookbehind_days(),
            lookahead_days: default_lookahead_days(),
            webhook_url: None,
            webhook_token: None,
            google: None,
        }
    }
}

impl SyncConfig {
    /// Looks up a CalDAV preset by id.
    pub fn preset(&self, id: &str) -> Option<&CalDavPreset> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_redirects() -> usize {
    5
}

fn default_lookbehind_days() -> i64 {
    90
}

fn default_lookahead_days() -> i64 {
    180
}
