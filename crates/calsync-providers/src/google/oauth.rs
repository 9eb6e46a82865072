//! Google OAuth 2.0 authorization-code flow for a server-side web app.
//!
//! The engine builds the consent URL, exchanges the callback code, and
//! refreshes access tokens. A refresh rejected with `invalid_grant` means
//! the user revoked access; it maps to an authentication failure so the
//! orchestrator can mark the account invalid rather than retry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use calsync_core::config::GoogleOAuthSettings;

use crate::error::{ProviderError, ProviderResult};
use crate::provider::{AccountProfile, TokenResponse};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Scopes requested at consent: read-only calendar access plus identity.
const SCOPES: &str = "https://www.googleapis.com/auth/calendar.readonly \
                      https://www.googleapis.com/auth/userinfo.email \
                      https://www.googleapis.com/auth/userinfo.profile";

/// OAuth client for Google accounts.
#[derive(Debug)]
pub struct GoogleOAuth {
    settings: GoogleOAuthSettings,
    http: reqwest::Client,
    token_url: String,
    userinfo_url: String,
}

impl GoogleOAuth {
    pub fn new(settings: GoogleOAuthSettings, timeout: Duration) -> ProviderResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::internal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            settings,
            http,
            token_url: GOOGLE_TOKEN_URL.to_string(),
            userinfo_url: GOOGLE_USERINFO_URL.to_string(),
        })
    }

    /// Points the token and userinfo endpoints at a different origin.
    /// Used by tests.
    pub fn with_endpoints(
        mut self,
        token_url: impl Into<String>,
        userinfo_url: impl Into<String>,
    ) -> Self {
        self.token_url = token_url.into();
        self.userinfo_url = userinfo_url.into();
        self
    }

    /// Builds the consent URL the user is redirected to.
    pub fn auth_url(&self, state: &str) -> ProviderResult<String> {
        if self.settings.client_id.is_empty() {
            return Err(ProviderError::configuration(
                "google oauth client is not configured",
            ));
        }
        Ok(format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&\
             access_type=offline&prompt=consent&state={}",
            GOOGLE_AUTH_URL,
            urlencoding::encode(&self.settings.client_id),
            urlencoding::encode(&self.settings.redirect_uri),
            urlencoding::encode(SCOPES),
            urlencoding::encode(state),
        ))
    }

    /// Exchanges an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str) -> ProviderResult<TokenResponse> {
        let params = [
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
        ];

        let tokens = self.token_request(&params, "token exchange").await?;
        info!("exchanged authorization code for tokens");
        Ok(tokens)
    }

    /// Obtains a fresh access token for a refresh token.
    pub async fn refresh_tokens(&self, refresh_token: &str) -> ProviderResult<TokenResponse> {
        let params = [
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let tokens = self.token_request(&params, "token refresh").await?;
        debug!("refreshed access token");
        Ok(tokens)
    }

    /// Fetches the account identity for an access token.
    pub async fn account_profile(&self, access_token: &str) -> ProviderResult<AccountProfile> {
        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("userinfo request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::network(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(ProviderError::authentication(format!(
                "userinfo request failed ({status})"
            ))
            .with_http_status(status.as_u16()));
        }

        let info: UserInfo = serde_json::from_str(&body)
            .map_err(|e| ProviderError::invalid_response(format!("userinfo: {e}")))?;

        Ok(AccountProfile {
            id: info.id,
            email: info.email,
            name: info.name,
        })
    }

    async fn token_request(
        &self,
        params: &[(&str, &str)],
        what: &str,
    ) -> ProviderResult<TokenResponse> {
        let response = self
            .http
            .post(&self.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("{what} request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::network(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            // invalid_grant means the refresh token was revoked or expired;
            // the account must be re-linked.
            if body.contains("invalid_grant") {
                return Err(ProviderError::authentication(
                    "grant revoked or expired (invalid_grant)",
                )
                .with_http_status(status.as_u16()));
            }
            return Err(
                ProviderError::authentication(format!("{what} failed ({status}): {body}"))
                    .with_http_status(status.as_u16()),
            );
        }

        let parsed: WireTokenResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::invalid_response(format!("token response: {e}")))?;

        Ok(TokenResponse {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: parsed.expires_in.map(expiry_from_now),
            scope: parsed.scope,
        })
    }
}

fn expiry_from_now(expires_in: i64) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(expires_in)
}

#[derive(Debug, Deserialize)]
struct WireTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    id: String,
    email: Option<String>,
    name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings() -> GoogleOAuthSettings {
        GoogleOAuthSettings {
            client_id: "client-id.apps.googleusercontent.com".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "https://app.example.com/oauth/callback".to_string(),
        }
    }

    fn oauth(server: &MockServer) -> GoogleOAuth {
        GoogleOAuth::new(settings(), Duration::from_secs(5))
            .unwrap()
            .with_endpoints(
                format!("{}/token", server.uri()),
                format!("{}/userinfo", server.uri()),
            )
    }

    #[test]
    fn auth_url_contains_required_params() {
        let oauth = GoogleOAuth::new(settings(), Duration::from_secs(5)).unwrap();
        let url = oauth.auth_url("csrf-state").unwrap();

        assert!(url.starts_with(GOOGLE_AUTH_URL));
        assert!(url.contains("client_id="));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("state=csrf-state"));
        assert!(url.contains("calendar.readonly"));
    }

    #[test]
    fn auth_url_requires_configuration() {
        let oauth =
            GoogleOAuth::new(GoogleOAuthSettings::default(), Duration::from_secs(5)).unwrap();
        assert!(oauth.auth_url("s").is_err());
    }

    #[tokio::test]
    async fn code_exchange_parses_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-1",
                "refresh_token": "rt-1",
                "expires_in": 3600,
                "scope": "calendar.readonly"
            })))
            .mount(&server)
            .await;

        let tokens = oauth(&server).exchange_code("auth-code").await.unwrap();
        assert_eq!(tokens.access_token, "at-1");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt-1"));
        let expires_at = tokens.expires_at.unwrap();
        assert!(expires_at > Utc::now() + chrono::Duration::minutes(55));
    }

    #[tokio::test]
    async fn invalid_grant_is_authentication_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .mount(&server)
            .await;

        let err = oauth(&server).refresh_tokens("revoked").await.unwrap_err();
        assert_eq!(
            err.code(),
            crate::error::ProviderErrorCode::AuthenticationFailed
        );
        assert!(err.message().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn fetches_account_profile() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "105000000000000000000",
                "email": "alice@example.com",
                "name": "Alice"
            })))
            .mount(&server)
            .await;

        let profile = oauth(&server).account_profile("at-1").await.unwrap();
        assert_eq!(profile.id, "105000000000000000000");
        assert_eq!(profile.email.as_deref(), Some("alice@example.com"));
    }
}
