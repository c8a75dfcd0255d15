//! Authenticator: single source of truth for a valid JWT, serializing
//! concurrent demand (spec §4.2).
//!
//! Re-architected per spec §9's Design Notes: rather than a mutex-guarded
//! token cache mutated from arbitrary call sites, the Authenticator's state
//! lives inside one task (`Authenticator::spawn`) and is only ever mutated
//! by that task itself. Other tasks talk to it over an `mpsc` channel; a
//! cloneable [`AuthenticatorHandle`] is the only thing callers ever hold.
//! The "pending actions queue" of spec.md's prose becomes a `VecDeque` of
//! one-shot response channels, drained in FIFO order once a fetch completes.

use std::collections::VecDeque;
use std::sync::Arc;

use base64::Engine as _;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::identity::IdentityCollector;
use crate::keystore::Keystore;

const AUTH_REQUESTS_PATH: &str = "/api/devices/v1/authentication/auth_requests";

/// An opaque bearer token. Validity is discovered lazily through 401
/// responses; the client never inspects its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Borrow the raw token bytes for use in an `Authorization: Bearer`
    /// header.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// `{server_url, token}`, produced by the Authenticator and consumed to
/// stamp outbound requests.
#[derive(Debug, Clone)]
pub struct AuthData {
    /// Base URL of the server this token is valid for.
    pub server_url: String,
    /// The cached bearer token.
    pub token: Token,
}

/// Immutable configuration the Authenticator needs to fetch a token.
#[derive(Debug, Clone)]
pub struct AuthenticatorConfig {
    /// Base server URL, e.g. `https://device.example.com`.
    pub server_url: String,
    /// Optional tenant token included in the auth request body.
    pub tenant_token: Option<String>,
}

enum Msg {
    GetToken(oneshot::Sender<std::result::Result<AuthData, AuthError>>),
    Expire,
    FetchComplete(std::result::Result<Token, AuthError>),
}

/// A cloneable, cheap-to-share front for the single authenticator task.
#[derive(Clone)]
pub struct Authenticator {
    tx: mpsc::UnboundedSender<Msg>,
}

#[derive(Serialize)]
struct AuthRequestBody {
    id_data: serde_json::Value,
    pubkey: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_token: Option<String>,
}

impl Authenticator {
    /// Spawn the authenticator's owning task and return a handle to it.
    #[must_use]
    pub fn spawn(
        config: AuthenticatorConfig,
        http: reqwest::Client,
        keystore: Arc<Keystore>,
        identity: Arc<IdentityCollector>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor_tx = tx.clone();
        tokio::spawn(run(rx, actor_tx, config, http, keystore, identity));
        Self { tx }
    }

    /// Run `action`'s logical equivalent by returning a valid [`AuthData`]
    /// once a token exists — either the cached one, or a fresh one fetched
    /// by the owning task. Concurrent callers that arrive while a fetch is
    /// already in flight all observe the same outcome (spec §8 property 1).
    pub async fn get_token(&self) -> std::result::Result<AuthData, AuthError> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(Msg::GetToken(respond_to))
            .map_err(|_| AuthError::Request("authenticator task is gone".into()))?;
        rx.await
            .map_err(|_| AuthError::Request("authenticator task dropped the request".into()))?
    }

    /// Clear the cached token. Does not cancel any in-flight fetch; the
    /// next `get_token` call starts one if needed.
    pub fn expire_token(&self) {
        let _ = self.tx.send(Msg::Expire);
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Msg>,
    self_tx: mpsc::UnboundedSender<Msg>,
    config: AuthenticatorConfig,
    http: reqwest::Client,
    keystore: Arc<Keystore>,
    identity: Arc<IdentityCollector>,
) {
    let mut token: Option<Token> = None;
    let mut auth_in_progress = false;
    let mut pending: VecDeque<oneshot::Sender<std::result::Result<AuthData, AuthError>>> =
        VecDeque::new();

    while let Some(msg) = rx.recv().await {
        match msg {
            Msg::GetToken(respond_to) => {
                if let Some(tok) = token.clone() {
                    let auth_data = AuthData {
                        server_url: config.server_url.clone(),
                        token: tok,
                    };
                    // Never deliver synchronously from inside this loop —
                    // schedule delivery so callers can't re-enter the actor
                    // from within their own callback.
                    tokio::spawn(async move {
                        let _ = respond_to.send(Ok(auth_data));
                    });
                } else {
                    pending.push_back(respond_to);
                    if !auth_in_progress {
                        auth_in_progress = true;
                        let fetch_tx = self_tx.clone();
                        let config = config.clone();
                        let http = http.clone();
                        let keystore = Arc::clone(&keystore);
                        let identity = Arc::clone(&identity);
                        tokio::spawn(async move {
                            let result = fetch_token(&config, &http, &keystore, &identity).await;
                            let _ = fetch_tx.send(Msg::FetchComplete(result));
                        });
                    }
                }
            }
            Msg::Expire => {
                token = None;
            }
            Msg::FetchComplete(result) => {
                auth_in_progress = false;
                token = result.as_ref().ok().cloned();
                while let Some(respond_to) = pending.pop_front() {
                    let outcome = match &result {
                        Ok(tok) => Ok(AuthData {
                            server_url: config.server_url.clone(),
                            token: tok.clone(),
                        }),
                        Err(e) => Err(e.clone()),
                    };
                    tokio::spawn(async move {
                        let _ = respond_to.send(outcome);
                    });
                }
            }
        }
    }

    // Channel closed (all handles dropped): abort anything still pending.
    for respond_to in pending.drain(..) {
        let _ = respond_to.send(Err(AuthError::Request(
            "authenticator shut down with requests pending".into(),
        )));
    }
}

async fn fetch_token(
    config: &AuthenticatorConfig,
    http: &reqwest::Client,
    keystore: &Keystore,
    identity: &IdentityCollector,
) -> std::result::Result<Token, AuthError> {
    let id_map = identity
        .collect()
        .await
        .map_err(|e| AuthError::Setup(e.to_string()))?;

    let pubkey = keystore
        .public_pem()
        .map_err(|e| AuthError::Setup(e.to_string()))?;

    let body = AuthRequestBody {
        id_data: serde_json::Value::String(id_map.to_json().to_string()),
        pubkey,
        tenant_token: config.tenant_token.clone(),
    };
    let body_bytes =
        serde_json::to_vec(&body).map_err(|e| AuthError::Setup(format!("encoding body: {e}")))?;

    let signature = keystore
        .sign(&body_bytes)
        .map_err(|e| AuthError::Setup(format!("signing auth request: {e}")))?;
    let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature);

    let url = format!(
        "{}{AUTH_REQUESTS_PATH}",
        config.server_url.trim_end_matches('/')
    );

    let response = http
        .post(&url)
        .header("X-MEN-Signature", signature_b64)
        .header("Content-Type", "application/json")
        .body(body_bytes)
        .send()
        .await
        .map_err(|e| AuthError::Request(e.to_string()))?;

    let status = response.status();
    if status == reqwest::StatusCode::OK {
        let jwt = response
            .text()
            .await
            .map_err(|e| AuthError::Response(e.to_string()))?;
        debug!(server = %config.server_url, "authenticated successfully");
        Ok(Token(jwt))
    } else if status == reqwest::StatusCode::UNAUTHORIZED {
        warn!(server = %config.server_url, "authentication rejected");
        Err(AuthError::Unauthorized)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(AuthError::Api(format!("HTTP {status}: {body}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::KeyKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn keystore_with_ed25519() -> Arc<Keystore> {
        let mut ks = Keystore::new();
        ks.generate(KeyKind::Ed25519, 0).unwrap();
        Arc::new(ks)
    }

    fn script_identity() -> Arc<IdentityCollector> {
        Arc::new(IdentityCollector::new("/bin/echo"))
    }

    #[tokio::test]
    async fn single_outbound_request_for_concurrent_callers() {
        let server = MockServer::start().await;
        let hit_count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hit_count);
        Mock::given(method("POST"))
            .and(path("/api/devices/v1/authentication/auth_requests"))
            .respond_with(move |_: &wiremock::Request| {
                counted.fetch_add(1, Ordering::SeqCst);
                ResponseTemplate::new(200).set_body_string("FOOBARJWTTOKEN")
            })
            .mount(&server)
            .await;

        let auth = Authenticator::spawn(
            AuthenticatorConfig {
                server_url: server.uri(),
                tenant_token: None,
            },
            reqwest::Client::new(),
            keystore_with_ed25519(),
            script_identity(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let auth = auth.clone();
            handles.push(tokio::spawn(async move { auth.get_token().await }));
        }
        for h in handles {
            let data = h.await.unwrap().unwrap();
            assert_eq!(data.token.as_str(), "FOOBARJWTTOKEN");
        }
        assert_eq!(hit_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_token_skips_a_second_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("TOK1"))
            .expect(1)
            .mount(&server)
            .await;

        let auth = Authenticator::spawn(
            AuthenticatorConfig {
                server_url: server.uri(),
                tenant_token: None,
            },
            reqwest::Client::new(),
            keystore_with_ed25519(),
            script_identity(),
        );

        let first = auth.get_token().await.unwrap();
        let second = auth.get_token().await.unwrap();
        assert_eq!(first.token, second.token);
    }

    #[tokio::test]
    async fn expire_then_fetch_issues_a_new_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("TOK1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("TOK2"))
            .mount(&server)
            .await;

        let auth = Authenticator::spawn(
            AuthenticatorConfig {
                server_url: server.uri(),
                tenant_token: None,
            },
            reqwest::Client::new(),
            keystore_with_ed25519(),
            script_identity(),
        );

        let first = auth.get_token().await.unwrap();
        assert_eq!(first.token.as_str(), "TOK1");
        auth.expire_token();
        let second = auth.get_token().await.unwrap();
        assert_eq!(second.token.as_str(), "TOK2");
    }

    #[tokio::test]
    async fn server_rejecting_auth_reports_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let auth = Authenticator::spawn(
            AuthenticatorConfig {
                server_url: server.uri(),
                tenant_token: None,
            },
            reqwest::Client::new(),
            keystore_with_ed25519(),
            script_identity(),
        );

        let err = auth.get_token().await.unwrap_err();
        assert_eq!(err, AuthError::Unauthorized);
    }
}
