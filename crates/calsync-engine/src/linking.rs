//! Account linking flows.
//!
//! CalDAV accounts link by credential check plus discovery; Google accounts
//! link by OAuth code exchange. Both are idempotent per external identity:
//! relinking the same principal or profile updates the existing account
//! instead of creating a duplicate.

use std::collections::HashSet;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use calsync_core::{AccountStatus, CalendarAccount, CalendarSubscription, Provider};
use calsync_providers::{
    CalDavProvider, CalendarInfo, OAuthCapable, ProviderError, RequestPolicy,
};

use crate::error::{EngineError, EngineResult};
use crate::sync::SyncEngine;

/// Credentials and server selection for linking a CalDAV account.
#[derive(Debug, Clone)]
pub struct CalDavLinkRequest {
    /// A configured provider preset, when the user picked one.
    pub preset_id: Option<String>,
    /// Custom server URL; requires `allow_custom_provider`.
    pub server_url: Option<String>,
    pub username: String,
    pub password: String,
}

impl SyncEngine {
    /// Links a CalDAV account: resolves the server, verifies the
    /// credentials by running discovery, and persists the account and one
    /// subscription per discovered calendar.
    pub async fn link_caldav_account(
        &self,
        user_id: &str,
        request: CalDavLinkRequest,
    ) -> EngineResult<CalendarAccount> {
        self.assert_enabled()?;

        let (server_url, auth_type, preset_id, label) = match request.preset_id.as_deref() {
            Some(preset_id) => {
                let preset = self.config().preset(preset_id).ok_or_else(|| {
                    EngineError::config(
                        "unknown_provider_preset",
                        format!("no CalDAV preset {preset_id}"),
                    )
                })?;
                (
                    preset.server_url.clone(),
                    preset.auth_type,
                    Some(preset.id.clone()),
                    Some(preset.label.clone()),
                )
            }
            None => {
                if !self.config().allow_custom_provider {
                    return Err(EngineError::config(
                        "custom_provider_not_allowed",
                        "custom CalDAV servers are not allowed",
                    ));
                }
                let server_url = request.server_url.clone().ok_or_else(|| {
                    EngineError::config("server_url_required", "no CalDAV server URL given")
                })?;
                (server_url, Default::default(), None, None)
            }
        };

        // A throwaway account shell carries the connection parameters
        // through discovery; the real row is built from its results.
        let mut account = CalendarAccount::new("", user_id, Provider::CalDav, "");
        account.server_url = Some(server_url.clone());
        account.username = Some(request.username.clone());
        account.auth_type = auth_type;

        let caldav = CalDavProvider::new(RequestPolicy::from_config(self.config()));
        let discovery = caldav.discover(&account, &request.password).await?;

        let existing = self
            .stores()
            .accounts
            .find_by_identity(user_id, Provider::CalDav, &discovery.principal_url)
            .await?;
        let mut account = existing.unwrap_or_else(|| {
            CalendarAccount::new(
                Uuid::new_v4().to_string(),
                user_id,
                Provider::CalDav,
                discovery.principal_url.clone(),
            )
        });
        account.display_name = label.or(account.display_name.take());
        account.access_token = Some(request.password);
        account.status = AccountStatus::Active;
        account.last_error = None;
        account.provider_preset_id = preset_id;
        account.server_url = Some(server_url);
        account.principal_url = Some(discovery.principal_url.clone());
        account.calendar_home_url = Some(discovery.calendar_home_url.clone());
        account.username = Some(request.username);
        account.auth_type = auth_type;
        self.stores().accounts.save(&account).await?;

        let subscriptions = self
            .upsert_subscriptions(&account, &discovery.calendars)
            .await?;
        info!(
            account_id = %account.id,
            principal = %discovery.principal_url,
            calendars = subscriptions.len(),
            "linked CalDAV account"
        );
        Ok(account)
    }

    /// Builds the Google authorization URL the user is redirected to.
    pub fn google_auth_url(&self, state: &str) -> EngineResult<String> {
        self.assert_enabled()?;
        Ok(self.google_oauth()?.auth_url(state)?)
    }

    /// Completes a Google link: exchanges the authorization code, fetches
    /// the profile, and persists the account and its calendar list.
    pub async fn link_google_account(
        &self,
        user_id: &str,
        code: &str,
    ) -> EngineResult<CalendarAccount> {
        self.assert_enabled()?;
        let oauth = self.google_oauth()?;

        let tokens = oauth.exchange_code(code).await?;
        let profile = oauth.account_profile(&tokens.access_token).await?;

        let existing = self
            .stores()
            .accounts
            .find_by_identity(user_id, Provider::Google, &profile.id)
            .await?;
        let mut account = existing.unwrap_or_else(|| {
            CalendarAccount::new(
                Uuid::new_v4().to_string(),
                user_id,
                Provider::Google,
                profile.id.clone(),
            )
        });
        account.display_name = profile.name.or(account.display_name.take());
        account.email = profile.email.or(account.email.take());
        account.access_token = Some(tokens.access_token.clone());
        // Google omits the refresh token on re-consent; keep the old one.
        if tokens.refresh_token.is_some() {
            account.refresh_token = tokens.refresh_token;
        }
        account.expires_at = tokens.expires_at;
        account.scope = tokens.scope.or(account.scope.take());
        account.status = AccountStatus::Active;
        account.last_error = None;
        self.stores().accounts.save(&account).await?;

        let provider = self.provider_for(Provider::Google)?;
        let calendars = provider
            .list_calendars(&account, &tokens.access_token)
            .await?;
        let subscriptions = self.upsert_subscriptions(&account, &calendars).await?;
        info!(
            account_id = %account.id,
            calendars = subscriptions.len(),
            "linked Google account"
        );
        Ok(account)
    }

    /// Refetches the account's calendar list: upserts subscriptions for
    /// every reported calendar and disables the ones the provider no
    /// longer reports.
    pub async fn refresh_calendars(
        &self,
        account_id: &str,
    ) -> EngineResult<Vec<CalendarSubscription>> {
        self.assert_enabled()?;
        let Some(mut account) = self.stores().accounts.get(account_id).await? else {
            return Err(EngineError::config(
                "account_not_found",
                format!("no account {account_id}"),
            ));
        };
        let provider = self.provider_for(account.provider)?;
        let access_token = self
            .ensure_access_token(provider, &mut account, Utc::now())
            .await?
            .ok_or_else(|| ProviderError::authentication("account has no stored credential"))?;
        let calendars = provider.list_calendars(&account, &access_token).await?;
        let subscriptions = self.upsert_subscriptions(&account, &calendars).await?;

        let reported: HashSet<&str> = calendars.iter().map(|c| c.id.as_str()).collect();
        for mut subscription in self
            .stores()
            .subscriptions
            .list_for_account(account_id)
            .await?
        {
            if subscription.enabled && !reported.contains(subscription.external_calendar_id.as_str())
            {
                info!(
                    subscription_id = %subscription.id,
                    external_calendar_id = %subscription.external_calendar_id,
                    "calendar no longer reported, disabling subscription"
                );
                subscription.enabled = false;
                self.stores().subscriptions.save(&subscription).await?;
            }
        }
        Ok(subscriptions)
    }

    fn google_oauth(&self) -> EngineResult<&dyn OAuthCapable> {
        self.provider_for(Provider::Google)?.oauth().ok_or_else(|| {
            EngineError::config(
                "oauth_not_supported",
                "the configured provider has no OAuth support",
            )
        })
    }

    /// Creates or updates one subscription per external calendar, keeping
    /// existing sync state (cursor, channel) intact.
    async fn upsert_subscriptions(
        &self,
        account: &CalendarAccount,
        calendars: &[CalendarInfo],
    ) -> EngineResult<Vec<CalendarSubscription>> {
        let mut subscriptions = Vec::with_capacity(calendars.len());
        for calendar in calendars {
            let existing = self
                .stores()
                .subscriptions
                .find_by_external_id(&account.id, &calendar.id)
                .await?;
            let mut subscription = existing.unwrap_or_else(|| {
                CalendarSubscription::new(
                    Uuid::new_v4().to_string(),
                    account.id.as_str(),
                    calendar.id.as_str(),
                )
            });
            subscription.display_name = Some(calendar.name.clone());
            subscription.timezone = calendar.timezone.clone();
            subscription.color = calendar.color.clone();
            self.stores().subscriptions.save(&subscription).await?;
            subscriptions.push(subscription);
        }
        Ok(subscriptions)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use calsync_core::SyncConfig;
    use calsync_providers::{
        AccountProfile, BoxFuture, CalendarProvider, EventBatch, ListEventsOptions,
        ProviderResult, TokenResponse,
    };

    use super::*;
    use crate::store::SubscriptionStore;
    use crate::sync::test_support::{engine_with_stub, StubProvider};

    fn caldav_request(preset_id: Option<&str>, server_url: Option<&str>) -> CalDavLinkRequest {
        CalDavLinkRequest {
            preset_id: preset_id.map(str::to_string),
            server_url: server_url.map(str::to_string),
            username: "alice".into(),
            password: "secret".into(),
        }
    }

    #[tokio::test]
    async fn disabled_integration_rejects_linking() {
        let t = engine_with_stub(StubProvider::new(vec![])).await;
        let config = SyncConfig {
            enabled: false,
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(config, t.engine.stores().clone()).unwrap();

        let err = engine
            .link_caldav_account("user-1", caldav_request(Some("fastmail"), None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "calendar_integration_disabled");
    }

    #[tokio::test]
    async fn unknown_preset_is_rejected() {
        let t = engine_with_stub(StubProvider::new(vec![])).await;
        let err = t
            .engine
            .link_caldav_account("user-1", caldav_request(Some("nope"), None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_provider_preset");
    }

    #[tokio::test]
    async fn custom_server_needs_opt_in() {
        let t = engine_with_stub(StubProvider::new(vec![])).await;
        let err = t
            .engine
            .link_caldav_account(
                "user-1",
                caldav_request(None, Some("https://dav.example.com/")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "custom_provider_not_allowed");
    }

    #[tokio::test]
    async fn custom_server_requires_a_url() {
        let t = engine_with_stub(StubProvider::new(vec![])).await;
        let config = SyncConfig {
            allow_custom_provider: true,
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(config, t.engine.stores().clone()).unwrap();

        let err = engine
            .link_caldav_account("user-1", caldav_request(None, None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "server_url_required");
    }

    /// A provider whose OAuth flow is scripted, for Google link tests.
    struct StubOAuthProvider {
        calendars: Vec<CalendarInfo>,
    }

    impl CalendarProvider for StubOAuthProvider {
        fn name(&self) -> &str {
            "stub-google"
        }

        fn list_calendars<'a>(
            &'a self,
            _account: &'a CalendarAccount,
            _access_token: &'a str,
        ) -> BoxFuture<'a, ProviderResult<Vec<CalendarInfo>>> {
            Box::pin(async move { Ok(self.calendars.clone()) })
        }

        fn list_events<'a>(
            &'a self,
            _account: &'a CalendarAccount,
            _access_token: &'a str,
            _calendar_id: &'a str,
            _options: ListEventsOptions,
        ) -> BoxFuture<'a, ProviderResult<EventBatch>> {
            Box::pin(async move { Ok(EventBatch::default()) })
        }

        fn oauth(&self) -> Option<&dyn OAuthCapable> {
            Some(self)
        }
    }

    impl OAuthCapable for StubOAuthProvider {
        fn auth_url(&self, state: &str) -> ProviderResult<String> {
            Ok(format!("https://accounts.example.com/auth?state={state}"))
        }

        fn exchange_code<'a>(
            &'a self,
            _code: &'a str,
        ) -> BoxFuture<'a, ProviderResult<TokenResponse>> {
            Box::pin(async move {
                Ok(TokenResponse {
                    access_token: "access-1".into(),
                    refresh_token: Some("refresh-1".into()),
                    expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
                    scope: Some("calendar.readonly".into()),
                })
            })
        }

        fn refresh_tokens<'a>(
            &'a self,
            _refresh_token: &'a str,
        ) -> BoxFuture<'a, ProviderResult<TokenResponse>> {
            Box::pin(async move {
                Ok(TokenResponse {
                    access_token: "access-2".into(),
                    refresh_token: None,
                    expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
                    scope: None,
                })
            })
        }

        fn account_profile<'a>(
            &'a self,
            _access_token: &'a str,
        ) -> BoxFuture<'a, ProviderResult<AccountProfile>> {
            Box::pin(async move {
                Ok(AccountProfile {
                    id: "profile-42".into(),
                    email: Some("alice@example.com".into()),
                    name: Some("Alice".into()),
                })
            })
        }
    }

    fn stub_google() -> Arc<StubOAuthProvider> {
        Arc::new(StubOAuthProvider {
            calendars: vec![
                CalendarInfo::new("primary", "Alice"),
                CalendarInfo::new("team", "Team"),
            ],
        })
    }

    #[tokio::test]
    async fn google_link_creates_account_and_subscriptions() {
        let t = engine_with_stub(StubProvider::new(vec![])).await;
        let engine = SyncEngine::new(SyncConfig::default(), t.engine.stores().clone())
            .unwrap()
            .with_provider(Provider::Google, stub_google());

        let account = engine.link_google_account("user-1", "auth-code").await.unwrap();
        assert_eq!(account.provider_account_id, "profile-42");
        assert_eq!(account.email.as_deref(), Some("alice@example.com"));
        assert_eq!(account.access_token.as_deref(), Some("access-1"));
        assert_eq!(account.refresh_token.as_deref(), Some("refresh-1"));

        let subs = t
            .subscriptions
            .list_for_account(&account.id)
            .await
            .unwrap();
        assert_eq!(subs.len(), 2);
    }

    #[tokio::test]
    async fn google_relink_reuses_the_account() {
        let t = engine_with_stub(StubProvider::new(vec![])).await;
        let engine = SyncEngine::new(SyncConfig::default(), t.engine.stores().clone())
            .unwrap()
            .with_provider(Provider::Google, stub_google());

        let first = engine.link_google_account("user-1", "code-1").await.unwrap();
        let second = engine.link_google_account("user-1", "code-2").await.unwrap();
        assert_eq!(first.id, second.id);

        // Subscriptions were upserted, not duplicated.
        let subs = t.subscriptions.list_for_account(&first.id).await.unwrap();
        assert_eq!(subs.len(), 2);
    }

    #[tokio::test]
    async fn refresh_disables_unreported_calendars() {
        let t = engine_with_stub(StubProvider::new(vec![])).await;
        let engine = SyncEngine::new(SyncConfig::default(), t.engine.stores().clone())
            .unwrap()
            .with_provider(Provider::Google, stub_google());
        let account = engine.link_google_account("user-1", "code").await.unwrap();

        // The provider stops reporting the team calendar.
        let shrunk = Arc::new(StubOAuthProvider {
            calendars: vec![CalendarInfo::new("primary", "Alice")],
        });
        let engine = SyncEngine::new(SyncConfig::default(), t.engine.stores().clone())
            .unwrap()
            .with_provider(Provider::Google, shrunk);
        engine.refresh_calendars(&account.id).await.unwrap();

        let subs = t.subscriptions.list_for_account(&account.id).await.unwrap();
        assert_eq!(subs.len(), 2);
        let team = subs
            .iter()
            .find(|s| s.external_calendar_id == "team")
            .unwrap();
        assert!(!team.enabled);
        let primary = subs
            .iter()
            .find(|s| s.external_calendar_id == "primary")
            .unwrap();
        assert!(primary.enabled);
    }

    #[tokio::test]
    async fn auth_url_carries_state() {
        let t = engine_with_stub(StubProvider::new(vec![])).await;
        let engine = SyncEngine::new(SyncConfig::default(), t.engine.stores().clone())
            .unwrap()
            .with_provider(Provider::Google, stub_google());

        let url = engine.google_auth_url("csrf-token").unwrap();
        assert!(url.contains("state=csrf-token"));
    }
}
