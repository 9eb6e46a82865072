//! Google Calendar provider, wiring the API client and OAuth flow into the
//! provider traits.

use std::time::Duration;

use calsync_core::config::GoogleOAuthSettings;
use calsync_core::model::CalendarAccount;

use crate::error::ProviderResult;
use crate::provider::{
    AccountProfile, BoxFuture, CalendarInfo, CalendarProvider, EventBatch, ListEventsOptions,
    OAuthCapable, TokenResponse, WatchResponse, WebhookCapable,
};

use super::client::GoogleApiClient;
use super::oauth::GoogleOAuth;

/// Google Calendar provider.
pub struct GoogleProvider {
    client: GoogleApiClient,
    oauth: GoogleOAuth,
}

impl GoogleProvider {
    pub fn new(settings: GoogleOAuthSettings, timeout: Duration) -> ProviderResult<Self> {
        Ok(Self {
            client: GoogleApiClient::new(timeout)?,
            oauth: GoogleOAuth::new(settings, timeout)?,
        })
    }

    /// Replaces the API client, pointing it at a test server.
    pub fn with_client(mut self, client: GoogleApiClient) -> Self {
        self.client = client;
        self
    }

    /// Replaces the OAuth client, pointing it at a test server.
    pub fn with_oauth(mut self, oauth: GoogleOAuth) -> Self {
        self.oauth = oauth;
        self
    }
}

impl CalendarProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    fn list_calendars<'a>(
        &'a self,
        _account: &'a CalendarAccount,
        access_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<Vec<CalendarInfo>>> {
        Box::pin(self.client.list_calendars(access_token))
    }

    fn list_events<'a>(
        &'a self,
        _account: &'a CalendarAccount,
        access_token: &'a str,
        calendar_id: &'a str,
        options: ListEventsOptions,
    ) -> BoxFuture<'a, ProviderResult<EventBatch>> {
        Box::pin(async move {
            self.client
                .list_events(access_token, calendar_id, &options)
                .await
        })
    }

    fn oauth(&self) -> Option<&dyn OAuthCapable> {
        Some(self)
    }

    fn webhooks(&self) -> Option<&dyn WebhookCapable> {
        Some(self)
    }
}

impl OAuthCapable for GoogleProvider {
    fn auth_url(&self, state: &str) -> ProviderResult<String> {
        self.oauth.auth_url(state)
    }

    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
    ) -> BoxFuture<'a, ProviderResult<TokenResponse>> {
        Box::pin(self.oauth.exchange_code(code))
    }

    fn refresh_tokens<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<TokenResponse>> {
        Box::pin(self.oauth.refresh_tokens(refresh_token))
    }

    fn account_profile<'a>(
        &'a self,
        access_token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<AccountProfile>> {
        Box::pin(self.oauth.account_profile(access_token))
    }
}

impl WebhookCapable for GoogleProvider {
    fn watch_calendar<'a>(
        &'a self,
        access_token: &'a str,
        calendar_id: &'a str,
        address: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, ProviderResult<WatchResponse>> {
        Box::pin(
            self.client
                .watch_calendar(access_token, calendar_id, address, token),
        )
    }

    fn stop_channel<'a>(
        &'a self,
        access_token: &'a str,
        channel_id: &'a str,
        resource_id: &'a str,
    ) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(
            self.client
                .stop_channel(access_token, channel_id, resource_id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertises_oauth_and_webhook_capabilities() {
        let provider =
            GoogleProvider::new(GoogleOAuthSettings::default(), Duration::from_secs(5)).unwrap();
        assert_eq!(provider.name(), "google");
        assert!(provider.oauth().is_some());
        assert!(provider.webhooks().is_some());
    }
}
