//! Google Calendar provider: REST API client, OAuth token lifecycle, and
//! push-notification channels.

pub mod client;
pub mod oauth;
pub mod provider;

pub use client::GoogleApiClient;
pub use oauth::GoogleOAuth;
pub use provider::GoogleProvider;
