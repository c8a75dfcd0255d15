//! API Client: stamps outbound requests with the Authenticator's token and
//! retries exactly once on a 401 (spec §4.3).
//!
//! spec.md's prose describes this as a callback pyramid (`with_token(cb1)`
//! nesting a header wrapper, a body wrapper, and `cb2`). Expressed as plain
//! `async`/`await` the same contract collapses to one straight-line
//! function: fetch a token, dispatch, and on 401 expire-and-retry once. No
//! callback nesting is needed because `.await` already suspends without
//! blocking the event loop.

use reqwest::{Method, StatusCode};

use crate::auth::Authenticator;
use crate::error::ApiError;

/// An outbound request against the server's device API. `set_address` is
/// deliberately absent: authority is always derived from the
/// Authenticator's `AuthData`, never set by the caller (spec §3).
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<Vec<u8>>,
    headers: Vec<(String, String)>,
}

impl ApiRequest {
    /// Start building a request to device-API `path` (e.g.
    /// `/api/devices/v2/deployments/device/deployments/next`).
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    /// Attach a request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attach an additional header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Wraps a plain HTTP client; every call goes through the shared
/// Authenticator for credentials.
pub struct ApiClient {
    authenticator: Authenticator,
    http: reqwest::Client,
}

impl ApiClient {
    /// Build a client over a shared [`Authenticator`]. The client holds a
    /// non-owning reference — multiple `ApiClient`s may share one
    /// Authenticator (spec §3 Ownership).
    #[must_use]
    pub fn new(authenticator: Authenticator, http: reqwest::Client) -> Self {
        Self { authenticator, http }
    }

    /// Perform `request`, stamping it with the current token and retrying
    /// exactly once if the first attempt comes back `401`.
    ///
    /// Non-goal (spec §4.3): no retry on transport errors, 5xx, or
    /// timeouts — those propagate to the caller untouched.
    pub async fn call(&self, request: &ApiRequest) -> std::result::Result<reqwest::Response, ApiError> {
        let auth_data = self.authenticator.get_token().await?;
        let response = self.dispatch(request, auth_data.token.as_str(), &auth_data.server_url).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.authenticator.expire_token();
        let auth_data = self.authenticator.get_token().await?;
        let retried = self
            .dispatch(request, auth_data.token.as_str(), &auth_data.server_url)
            .await?;

        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        Ok(retried)
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: &str,
        server_url: &str,
    ) -> std::result::Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", server_url.trim_end_matches('/'), request.path);
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .bearer_auth(token);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthenticatorConfig;
    use crate::identity::IdentityCollector;
    use crate::keystore::{KeyKind, Keystore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn authenticator_for(server: &MockServer) -> Authenticator {
        let mut ks = Keystore::new();
        ks.generate(KeyKind::Ed25519, 0).unwrap();
        Authenticator::spawn(
            AuthenticatorConfig {
                server_url: server.uri(),
                tenant_token: None,
            },
            reqwest::Client::new(),
            Arc::new(ks),
            Arc::new(IdentityCollector::new("/bin/echo")),
        )
    }

    #[tokio::test]
    async fn successful_call_passes_through_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/devices/v1/authentication/auth_requests"))
            .respond_with(ResponseTemplate::new(200).set_body_string("TOKEN"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/devices/v2/thing"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = ApiClient::new(authenticator_for(&server), reqwest::Client::new());
        let request = ApiRequest::new(Method::GET, "/api/devices/v2/thing");
        let response = client.call(&request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn a_401_triggers_exactly_one_retry_with_a_fresh_token() {
        let server = MockServer::start().await;
        let auth_hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&auth_hits);
        Mock::given(method("POST"))
            .and(path("/api/devices/v1/authentication/auth_requests"))
            .respond_with(move |_: &wiremock::Request| {
                let n = counted.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200).set_body_string(format!("TOKEN{n}"))
            })
            .mount(&server)
            .await;

        let call_count = Arc::new(AtomicUsize::new(0));
        let counted_calls = Arc::clone(&call_count);
        Mock::given(method("GET"))
            .and(path("/api/devices/v2/thing"))
            .respond_with(move |_: &wiremock::Request| {
                let n = counted_calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    ResponseTemplate::new(401)
                } else {
                    ResponseTemplate::new(200).set_body_string("second try")
                }
            })
            .mount(&server)
            .await;

        let client = ApiClient::new(authenticator_for(&server), reqwest::Client::new());
        let request = ApiRequest::new(Method::GET, "/api/devices/v2/thing");
        let response = client.call(&request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
        assert_eq!(auth_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_second_401_is_reported_without_a_further_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/devices/v1/authentication/auth_requests"))
            .respond_with(ResponseTemplate::new(200).set_body_string("TOKEN"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/devices/v2/thing"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = ApiClient::new(authenticator_for(&server), reqwest::Client::new());
        let request = ApiRequest::new(Method::GET, "/api/devices/v2/thing");
        let err = client.call(&request).await.unwrap_err();
        assert_eq!(err, ApiError::Unauthorized);
    }

    #[tokio::test]
    async fn other_statuses_are_forwarded_as_is() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/devices/v1/authentication/auth_requests"))
            .respond_with(ResponseTemplate::new(200).set_body_string("TOKEN"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/devices/v2/thing"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = ApiClient::new(authenticator_for(&server), reqwest::Client::new());
        let request = ApiRequest::new(Method::GET, "/api/devices/v2/thing");
        let response = client.call(&request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
