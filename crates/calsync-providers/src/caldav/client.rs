//! HTTP client for WebDAV operations.
//!
//! Wraps the policy-guarded HTTP client with the DAV verbs (PROPFIND,
//! REPORT) and the Basic/Digest negotiation. The first 401 challenge
//! decides the mechanism; it is then pinned for the lifetime of the client
//! so a server cannot downgrade the exchange mid-session.

use reqwest::{Method, Response, StatusCode};
use tracing::{debug, trace, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::policy::{GuardedRequest, PolicyClient, RequestPolicy};

use calsync_core::model::AuthType;

use super::auth::{DigestAuth, basic_auth};

/// Authentication mechanism resolved from the server challenge.
enum ResolvedAuth {
    Basic,
    Digest(DigestAuth),
}

/// WebDAV HTTP client for one account.
pub struct DavClient {
    http: PolicyClient,
    username: String,
    password: String,
    auth_type: AuthType,
    resolved: Option<ResolvedAuth>,
}

impl DavClient {
    /// Creates a client with the given policy and credentials.
    pub fn new(
        policy: RequestPolicy,
        username: impl Into<String>,
        password: impl Into<String>,
        auth_type: AuthType,
    ) -> ProviderResult<Self> {
        Ok(Self {
            http: PolicyClient::new(policy)?,
            username: username.into(),
            password: password.into(),
            auth_type,
            resolved: None,
        })
    }

    /// Performs a PROPFIND request and returns the response body.
    pub async fn propfind(&mut self, url: &str, body: &str, depth: u8) -> ProviderResult<String> {
        let response = self.request("PROPFIND", url, Some(body), Some(depth)).await?;
        read_expected_body(response).await
    }

    /// Performs a REPORT request and returns the response body.
    pub async fn report(&mut self, url: &str, body: &str) -> ProviderResult<String> {
        let response = self.request("REPORT", url, Some(body), Some(1)).await?;
        read_expected_body(response).await
    }

    /// Performs a REPORT request, returning the status and body without
    /// mapping non-2xx statuses to errors. sync-collection reports need
    /// the raw status to distinguish an expired token from a failure.
    pub async fn report_raw(&mut self, url: &str, body: &str) -> ProviderResult<(u16, String)> {
        let response = self.request("REPORT", url, Some(body), Some(1)).await?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::network(format!("failed to read response: {e}")))?;
        Ok((status, text))
    }

    async fn request(
        &mut self,
        method: &str,
        url: &str,
        body: Option<&str>,
        depth: Option<u8>,
    ) -> ProviderResult<Response> {
        let response = self.send(method, url, body, depth).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        self.negotiate(challenge.as_deref())?;
        debug!(method, "retrying request with negotiated credentials");

        let retried = self.send(method, url, body, depth).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(
                ProviderError::authentication("authentication failed: invalid credentials")
                    .with_http_status(401),
            );
        }
        Ok(retried)
    }

    /// Picks the mechanism from the challenge, constrained by the account's
    /// configured auth type.
    fn negotiate(&mut self, challenge: Option<&str>) -> ProviderResult<()> {
        let challenge = challenge.unwrap_or("");
        let digest = DigestAuth::parse(challenge);

        let resolved = match self.auth_type {
            AuthType::Basic => ResolvedAuth::Basic,
            AuthType::Digest => match digest {
                Some(digest) => ResolvedAuth::Digest(digest),
                None => {
                    return Err(ProviderError::authentication(
                        "digest authentication required but server did not offer it",
                    ));
                }
            },
            AuthType::Auto => match digest {
                Some(digest) => ResolvedAuth::Digest(digest),
                None => ResolvedAuth::Basic,
            },
        };
        self.resolved = Some(resolved);
        Ok(())
    }

    async fn send(
        &mut self,
        method: &str,
        url: &str,
        body: Option<&str>,
        depth: Option<u8>,
    ) -> ProviderResult<Response> {
        let http_method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ProviderError::internal(format!("invalid HTTP method: {method}")))?;

        let mut request = GuardedRequest::new(http_method, url);

        if let Some(depth) = depth {
            request = request.header("Depth", depth.to_string());
        }
        if let Some(body) = body {
            request = request
                .header("Content-Type", "application/xml; charset=utf-8")
                .body(body);
        }

        if let Some(ref mut resolved) = self.resolved {
            let header = match resolved {
                ResolvedAuth::Basic => basic_auth(&self.username, &self.password),
                ResolvedAuth::Digest(digest) => {
                    let uri = url::Url::parse(url)
                        .map(|u| u.path().to_string())
                        .unwrap_or_else(|_| url.to_string());
                    digest.authorize(method, &uri, &self.username, &self.password)
                }
            };
            request = request.header("Authorization", header);
        }

        trace!(method, url, "sending DAV request");
        self.http.execute(request).await
    }
}

/// Maps a non-raw DAV response to its body, turning error statuses into
/// provider errors.
async fn read_expected_body(response: Response) -> ProviderResult<String> {
    let status = response.status();

    match status {
        StatusCode::OK | StatusCode::MULTI_STATUS => response
            .text()
            .await
            .map_err(|e| ProviderError::network(format!("failed to read response: {e}"))),
        StatusCode::UNAUTHORIZED => Err(ProviderError::authentication(
            "authentication failed: invalid credentials",
        )
        .with_http_status(401)),
        StatusCode::FORBIDDEN => {
            Err(ProviderError::authorization("access denied").with_http_status(403))
        }
        StatusCode::NOT_FOUND => {
            Err(ProviderError::not_found("resource not found").with_http_status(404))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            Err(ProviderError::rate_limited("too many requests").with_http_status(429))
        }
        s if s.is_server_error() => {
            let body = response.text().await.unwrap_or_default();
            Err(ProviderError::server(format!("server error ({s}): {body}"))
                .with_http_status(s.as_u16()))
        }
        s => {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %s, "unexpected DAV response status");
            Err(
                ProviderError::invalid_response(format!("unexpected status {s}: {body}"))
                    .with_http_status(s.as_u16()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_policy() -> RequestPolicy {
        RequestPolicy {
            allow_insecure_http: true,
            allowed_hosts: Vec::new(),
            block_private_network: false,
            timeout: Duration::from_secs(5),
            max_redirects: 5,
        }
    }

    #[tokio::test]
    async fn negotiates_basic_on_challenge() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .and(path("/dav/"))
            .and(header("Authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(207).set_body_string("<multistatus/>"))
            .mount(&server)
            .await;
        Mock::given(method("PROPFIND"))
            .and(path("/dav/"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("WWW-Authenticate", "Basic realm=\"dav\""),
            )
            .mount(&server)
            .await;

        let mut client =
            DavClient::new(test_policy(), "user", "pass", AuthType::Auto).unwrap();
        let body = client
            .propfind(&format!("{}/dav/", server.uri()), "<propfind/>", 0)
            .await
            .unwrap();
        assert_eq!(body, "<multistatus/>");
    }

    #[tokio::test]
    async fn negotiates_digest_on_challenge() {
        let server = MockServer::start().await;
        Mock::given(method("REPORT"))
            .and(path("/cal/"))
            .and(header_exists("Authorization"))
            .respond_with(ResponseTemplate::new(207).set_body_string("<multistatus/>"))
            .mount(&server)
            .await;
        Mock::given(method("REPORT"))
            .and(path("/cal/"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                r#"Digest realm="dav", nonce="abc", qop="auth""#,
            ))
            .mount(&server)
            .await;

        let mut client =
            DavClient::new(test_policy(), "user", "pass", AuthType::Auto).unwrap();
        let body = client
            .report(&format!("{}/cal/", server.uri()), "<query/>")
            .await
            .unwrap();
        assert_eq!(body, "<multistatus/>");
        assert!(matches!(client.resolved, Some(ResolvedAuth::Digest(_))));
    }

    #[tokio::test]
    async fn digest_required_but_not_offered() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("WWW-Authenticate", "Basic realm=\"dav\""),
            )
            .mount(&server)
            .await;

        let mut client =
            DavClient::new(test_policy(), "user", "pass", AuthType::Digest).unwrap();
        let err = client
            .propfind(&format!("{}/dav/", server.uri()), "<propfind/>", 0)
            .await
            .unwrap_err();
        assert_eq!(
            err.code(),
            crate::error::ProviderErrorCode::AuthenticationFailed
        );
    }

    #[tokio::test]
    async fn bad_credentials_fail_after_retry() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("WWW-Authenticate", "Basic realm=\"dav\""),
            )
            .mount(&server)
            .await;

        let mut client =
            DavClient::new(test_policy(), "user", "wrong", AuthType::Auto).unwrap();
        let err = client
            .propfind(&format!("{}/dav/", server.uri()), "<propfind/>", 0)
            .await
            .unwrap_err();
        assert_eq!(
            err.code(),
            crate::error::ProviderErrorCode::AuthenticationFailed
        );
        assert_eq!(err.http_status(), Some(401));
    }

    #[tokio::test]
    async fn raw_report_preserves_status() {
        let server = MockServer::start().await;
        Mock::given(method("REPORT"))
            .respond_with(ResponseTemplate::new(410).set_body_string("gone"))
            .mount(&server)
            .await;

        let mut client =
            DavClient::new(test_policy(), "user", "pass", AuthType::Auto).unwrap();
        let (status, body) = client
            .report_raw(&format!("{}/cal/", server.uri()), "<sync/>")
            .await
            .unwrap();
        assert_eq!(status, 410);
        assert_eq!(body, "gone");
    }
}
